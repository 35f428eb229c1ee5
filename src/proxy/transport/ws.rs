//! WebSocket (RFC 6455) 传输。
//!
//! GET 升级请求带随机 16 字节 Sec-WebSocket-Key；早数据
//! base64url 编码后放进配置的头（默认 Sec-WebSocket-Protocol）。
//! 客户端帧始终掩码、服务端帧不掩码、ping 自动回 pong，
//! 这些由 tungstenite 保证。可选心跳按周期发 ping，发送失败即停。

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use futures_util::{Sink, Stream};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::common::ProxyStream;
use crate::config::VlessConfig;

use super::StreamTransport;

const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub struct WsTransport {
    config: Arc<VlessConfig>,
}

impl WsTransport {
    pub fn new(config: Arc<VlessConfig>) -> Self {
        Self { config }
    }

    async fn do_connect(&self, early: Option<&[u8]>) -> Result<ProxyStream> {
        let ws = &self.config.ws;
        let host = if ws.host.is_empty() {
            self.config.server_address.as_str()
        } else {
            ws.host.as_str()
        };

        let stream = super::dial_secure(&self.config).await?;

        let uri = format!("ws://{}:{}{}", host, self.config.server_port, ws.path);
        let mut request = Request::builder()
            .uri(&uri)
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("User-Agent", CHROME_UA);

        if let Some(early) = early.filter(|e| !e.is_empty()) {
            let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(early);
            request = request.header(ws.early_data_header.as_str(), encoded);
        }
        for (key, value) in &ws.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let request = request.body(())?;

        // tungstenite 校验 101 状态码与 Accept 头
        let (ws_stream, _response) = tokio_tungstenite::client_async(request, stream)
            .await
            .map_err(|e| anyhow::anyhow!("websocket handshake failed: {}", e))?;

        debug!(uri = uri.as_str(), "websocket connection established");

        Ok(Box::new(WsStream::new(ws_stream, ws.heartbeat_period)))
    }
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn connect(&self) -> Result<ProxyStream> {
        self.do_connect(None).await
    }

    fn max_early_data(&self) -> usize {
        self.config.ws.max_early_data
    }

    async fn connect_with_early_data(&self, early: &[u8]) -> Result<ProxyStream> {
        let capped = &early[..early.len().min(self.config.ws.max_early_data)];
        let mut stream = self.do_connect(Some(capped)).await?;
        if capped.len() < early.len() {
            use tokio::io::AsyncWriteExt;
            stream.write_all(&early[capped.len()..]).await?;
            stream.flush().await?;
        }
        Ok(stream)
    }
}

/// 把 WebSocket 流适配为字节流语义。
///
/// Binary 帧按序拼接；ping/pong/close 控制帧不进入数据流。
pub struct WsStream {
    inner: WebSocketStream<ProxyStream>,
    read_buf: Vec<u8>,
    read_pos: usize,
    /// 心跳定时器；发送失败后置 None
    heartbeat: Option<(Duration, Pin<Box<tokio::time::Sleep>>)>,
}

impl WsStream {
    fn new(inner: WebSocketStream<ProxyStream>, heartbeat_secs: u64) -> Self {
        let heartbeat = if heartbeat_secs > 0 {
            let period = Duration::from_secs(heartbeat_secs);
            Some((period, Box::pin(tokio::time::sleep(period))))
        } else {
            None
        };
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
            heartbeat,
        }
    }

    /// 心跳到点就排一个 ping；出错停掉心跳
    fn poll_heartbeat(&mut self, cx: &mut Context<'_>) {
        let due = match self.heartbeat.as_mut() {
            Some((period, sleep)) => {
                if sleep.as_mut().poll(cx).is_pending() {
                    return;
                }
                let deadline = tokio::time::Instant::now() + *period;
                sleep.as_mut().reset(deadline);
                true
            }
            None => false,
        };
        if !due {
            return;
        }

        let ready = matches!(Pin::new(&mut self.inner).poll_ready(cx), Poll::Ready(Ok(())));
        if !ready {
            return;
        }
        if Pin::new(&mut self.inner)
            .start_send(Message::Ping(Vec::new().into()))
            .is_err()
        {
            debug!("websocket heartbeat send failed, cancelling heartbeat");
            self.heartbeat = None;
        }
    }
}

use std::future::Future;

impl AsyncRead for WsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_heartbeat(cx);

        if self.read_pos < self.read_buf.len() {
            let remaining = &self.read_buf[self.read_pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.read_pos += to_copy;
            if self.read_pos >= self.read_buf.len() {
                self.read_buf.clear();
                self.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => match msg {
                    Message::Binary(data) => {
                        let bytes: &[u8] = &data;
                        let to_copy = bytes.len().min(buf.remaining());
                        buf.put_slice(&bytes[..to_copy]);
                        if to_copy < bytes.len() {
                            self.read_buf = bytes[to_copy..].to_vec();
                            self.read_pos = 0;
                        }
                        return Poll::Ready(Ok(()));
                    }
                    Message::Text(text) => {
                        let bytes: &[u8] = text.as_ref();
                        let to_copy = bytes.len().min(buf.remaining());
                        buf.put_slice(&bytes[..to_copy]);
                        if to_copy < bytes.len() {
                            self.read_buf = bytes[to_copy..].to_vec();
                            self.read_pos = 0;
                        }
                        return Poll::Ready(Ok(()));
                    }
                    Message::Close(_) => return Poll::Ready(Ok(())),
                    // ping 的 pong 回复由 tungstenite 在下次 poll 时带出
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                },
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::other(e)));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let msg = Message::Binary(buf.to_vec().into());
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => match Pin::new(&mut self.inner).start_send(msg) {
                Ok(()) => Poll::Ready(Ok(buf.len())),
                Err(e) => Poll::Ready(Err(io::Error::other(e))),
            },
            Poll::Ready(Err(e)) => Poll::Ready(Err(io::Error::other(e))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}
