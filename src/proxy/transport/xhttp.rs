//! XHTTP 传输（HTTP/2）。
//!
//! `stream-one`：单条长活 POST 流，请求体与响应体各承载一个方向。
//! `packet-up`：上行按缓冲切成一连串短 POST，下行是一条长活 GET。
//! `auto` 在 h2 握手可用时取 stream-one，否则退到 packet-up。

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::common::ProxyStream;
use crate::config::{VlessConfig, XhttpMode};

use super::StreamTransport;

pub struct XhttpTransport {
    config: Arc<VlessConfig>,
}

impl XhttpTransport {
    pub fn new(config: Arc<VlessConfig>) -> Self {
        Self { config }
    }

    fn host(&self) -> &str {
        let x = &self.config.xhttp;
        if x.host.is_empty() {
            &self.config.server_address
        } else {
            &x.host
        }
    }

    fn apply_headers(
        &self,
        mut builder: http::request::Builder,
    ) -> http::request::Builder {
        builder = builder.header("host", self.host());
        if !self.config.xhttp.no_grpc_header {
            builder = builder.header("content-type", "application/grpc");
        }
        for (k, v) in &self.config.xhttp.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        builder
    }

    async fn open_h2(&self) -> Result<h2::client::SendRequest<Bytes>> {
        let stream = super::dial_secure(&self.config).await?;
        let (send_request, connection) = h2::client::handshake(stream)
            .await
            .map_err(|e| anyhow::anyhow!("h2 handshake failed: {}", e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "h2 connection terminated");
            }
        });
        Ok(send_request)
    }

    async fn connect_stream_one(&self) -> Result<ProxyStream> {
        let send_request = self.open_h2().await?;
        let path = self.config.xhttp.path.clone();

        let request = self
            .apply_headers(http::Request::builder().method("POST").uri(&path))
            .body(())
            .map_err(|e| anyhow::anyhow!("failed to build xhttp request: {}", e))?;

        let (response_future, send_stream) = send_request
            .ready()
            .await
            .map_err(|e| anyhow::anyhow!("h2 not ready: {}", e))?
            .send_request(request, false)
            .map_err(|e| anyhow::anyhow!("h2 send_request failed: {}", e))?;

        let response = response_future
            .await
            .map_err(|e| anyhow::anyhow!("xhttp stream-one response failed: {}", e))?;
        let recv_stream = response.into_body();

        debug!(path = path.as_str(), "xhttp stream-one established");
        Ok(Box::new(H2Stream::new(send_stream, recv_stream)))
    }

    async fn connect_packet_up(&self) -> Result<ProxyStream> {
        let send_request = self.open_h2().await?;
        let path = self.config.xhttp.path.clone();

        // 下行：一条长活 GET
        let request = self
            .apply_headers(http::Request::builder().method("GET").uri(&path))
            .body(())
            .map_err(|e| anyhow::anyhow!("failed to build xhttp request: {}", e))?;
        let (response_future, _) = send_request
            .clone()
            .ready()
            .await
            .map_err(|e| anyhow::anyhow!("h2 not ready: {}", e))?
            .send_request(request, true)
            .map_err(|e| anyhow::anyhow!("h2 send_request failed: {}", e))?;
        let response = response_future
            .await
            .map_err(|e| anyhow::anyhow!("xhttp packet-up downlink failed: {}", e))?;
        let recv_stream = response.into_body();

        debug!(path = path.as_str(), "xhttp packet-up established");
        Ok(Box::new(PacketUpStream {
            uplink: send_request,
            ctx: UplinkContext {
                transport: XhttpTransport {
                    config: self.config.clone(),
                },
                seq: AtomicU64::new(0),
            },
            recv: recv_stream,
            read_buf: Vec::new(),
            read_pos: 0,
            inflight: None,
        }))
    }
}

#[async_trait]
impl StreamTransport for XhttpTransport {
    async fn connect(&self) -> Result<ProxyStream> {
        match self.config.xhttp.mode {
            XhttpMode::StreamOne => self.connect_stream_one().await,
            XhttpMode::PacketUp => self.connect_packet_up().await,
            // auto: h2 握手可用即走 stream-one，失败退 packet-up
            XhttpMode::Auto => match self.connect_stream_one().await {
                Ok(stream) => Ok(stream),
                Err(e) => {
                    debug!(error = %e, "xhttp stream-one unavailable, trying packet-up");
                    self.connect_packet_up().await
                }
            },
        }
    }
}

/// h2 SendStream + RecvStream 适配为字节流（stream-one 用）
pub(crate) struct H2Stream {
    send: h2::SendStream<Bytes>,
    recv: h2::RecvStream,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl H2Stream {
    pub(crate) fn new(send: h2::SendStream<Bytes>, recv: h2::RecvStream) -> Self {
        Self {
            send,
            recv,
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_pos < self.read_buf.len() {
            let remaining = &self.read_buf[self.read_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.read_pos += n;
            if self.read_pos >= self.read_buf.len() {
                self.read_buf.clear();
                self.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        match self.recv.poll_data(cx) {
            Poll::Ready(Some(Ok(data))) => {
                let _ = self.recv.flow_control().release_capacity(data.len());
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf = data[n..].to_vec();
                    self.read_pos = 0;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.send.reserve_capacity(buf.len());

        match self.send.poll_capacity(cx) {
            Poll::Ready(Some(Ok(capacity))) => {
                let n = buf.len().min(capacity);
                let data = Bytes::copy_from_slice(&buf[..n]);
                self.send.send_data(data, false).map_err(io::Error::other)?;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "h2 stream closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let _ = self.send.send_data(Bytes::new(), true);
        Poll::Ready(Ok(()))
    }
}

struct UplinkContext {
    transport: XhttpTransport,
    /// POST 序号，拼在路径后面
    seq: AtomicU64,
}

/// packet-up 模式的字节流适配。
///
/// 每次 poll_write 产出一个独立的短 POST（路径带递增序号），
/// 读取端消费长活 GET 的响应体。
struct PacketUpStream {
    uplink: h2::client::SendRequest<Bytes>,
    ctx: UplinkContext,
    recv: h2::RecvStream,
    read_buf: Vec<u8>,
    read_pos: usize,
    inflight: Option<Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>>,
}

impl PacketUpStream {
    fn start_post(&mut self, buf: &[u8]) {
        let payload = Bytes::copy_from_slice(buf);
        let len = payload.len();
        let seq = self.ctx.seq.fetch_add(1, Ordering::Relaxed);
        let path = format!("{}/{}", self.ctx.transport.config.xhttp.path, seq);
        let config = self.ctx.transport.config.clone();
        let uplink = self.uplink.clone();

        self.inflight = Some(Box::pin(async move {
            let transport = XhttpTransport { config };
            let request = transport
                .apply_headers(http::Request::builder().method("POST").uri(&path))
                .body(())
                .map_err(io::Error::other)?;

            let (response_future, mut send_stream) = uplink
                .ready()
                .await
                .map_err(io::Error::other)?
                .send_request(request, false)
                .map_err(io::Error::other)?;

            send_stream.send_data(payload, true).map_err(io::Error::other)?;
            response_future.await.map_err(io::Error::other)?;
            Ok(len)
        }));
    }
}

impl AsyncRead for PacketUpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_pos < self.read_buf.len() {
            let remaining = &self.read_buf[self.read_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.read_pos += n;
            if self.read_pos >= self.read_buf.len() {
                self.read_buf.clear();
                self.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        match self.recv.poll_data(cx) {
            Poll::Ready(Some(Ok(data))) => {
                let _ = self.recv.flow_control().release_capacity(data.len());
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf = data[n..].to_vec();
                    self.read_pos = 0;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for PacketUpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            if let Some(fut) = self.inflight.as_mut() {
                match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(_)) => {
                        self.inflight = None;
                        // 上一个 POST 完成，本次数据开新 POST
                    }
                    Poll::Ready(Err(e)) => {
                        self.inflight = None;
                        return Poll::Ready(Err(e));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            self.start_post(buf);
            // 一个 POST 对应一个缓冲：等它完成再报告写入量
            let this = &mut *self;
            match this.inflight.as_mut().unwrap().as_mut().poll(cx) {
                Poll::Ready(Ok(n)) => {
                    self.inflight = None;
                    return Poll::Ready(Ok(n));
                }
                Poll::Ready(Err(e)) => {
                    self.inflight = None;
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => {
                    // 数据已被 future 持有，报告已消费
                    return Poll::Ready(Ok(buf.len()));
                }
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(fut) = self.inflight.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(_)) => self.inflight = None,
                Poll::Ready(Err(e)) => {
                    self.inflight = None;
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
