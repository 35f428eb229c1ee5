//! UDP 流处理：每 5 元组一份状态 + 一个收发任务。
//!
//! 建连期间数据报排队（上限 16 KiB，超出静默丢弃）；
//! 全局 200 流上限；60 s 空闲由 1 Hz 清扫关停。

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{Address, BoxUdpTransport, UdpPacket, UdpTransport};
use crate::flow::{FlowEvent, UdpFlowKey};
use crate::proxy::mux::MuxManager;
use crate::proxy::vless::VlessClient;
use std::sync::Arc;

/// 建连期间排队上限
pub const PENDING_CAP: usize = 16 * 1024;
/// 全局流数上限
pub const MAX_FLOWS: usize = 200;
/// 空闲超时
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// 出站路径
pub enum UdpOutbound {
    /// 绕行：直连 UDP socket
    Direct,
    /// 专用 VLESS UDP 连接
    Vless(Arc<VlessClient>),
    /// Mux UDP 会话（XUDP 由配置决定）
    Mux(Arc<MuxManager>),
}

/// 栈任务里的每流记录
pub struct UdpFlow {
    pub to_outbound: mpsc::UnboundedSender<Bytes>,
    /// 建连期间排队的数据报与占用字节数
    pub pending: Vec<Bytes>,
    pub pending_bytes: usize,
    pub ready: bool,
    pub cancel: CancellationToken,
    pub last_activity: Instant,
}

impl UdpFlow {
    pub fn spawn(
        key: UdpFlowKey,
        dest: Address,
        outbound: UdpOutbound,
        src_host: String,
        evt_tx: mpsc::UnboundedSender<FlowEvent>,
    ) -> Self {
        let (to_outbound, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(run_flow(
            key,
            dest,
            outbound,
            src_host,
            rx,
            evt_tx,
            cancel.clone(),
        ));

        Self {
            to_outbound,
            pending: Vec::new(),
            pending_bytes: 0,
            ready: false,
            cancel,
            last_activity: Instant::now(),
        }
    }

    /// 入队或转发一个数据报；排队超限时静默丢弃
    pub fn offer(&mut self, payload: Bytes) {
        self.last_activity = Instant::now();
        if self.ready {
            let _ = self.to_outbound.send(payload);
            return;
        }
        if self.pending_bytes + payload.len() > PENDING_CAP {
            debug!("udp pending queue full, dropping datagram");
            return;
        }
        self.pending_bytes += payload.len();
        self.pending.push(payload);
    }

    /// 出站就绪：放行积压
    pub fn mark_ready(&mut self) {
        self.ready = true;
        for payload in self.pending.drain(..) {
            let _ = self.to_outbound.send(payload);
        }
        self.pending_bytes = 0;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity)
    }

    /// 同步取消
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// 直连 UDP socket 的 UdpTransport 适配
struct DirectUdpTransport {
    socket: tokio::net::UdpSocket,
    dest: Address,
}

#[async_trait::async_trait]
impl UdpTransport for DirectUdpTransport {
    async fn send(&self, packet: UdpPacket) -> anyhow::Result<()> {
        self.socket.send(&packet.data).await?;
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<UdpPacket> {
        let mut buf = vec![0u8; 65535];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(UdpPacket {
            addr: self.dest.clone(),
            data: Bytes::from(buf),
        })
    }
}

async fn connect(
    dest: &Address,
    outbound: UdpOutbound,
    src_host: &str,
    src_port: u16,
) -> anyhow::Result<BoxUdpTransport> {
    match outbound {
        UdpOutbound::Direct => {
            let remote = dest.resolve().await?;
            let bind: SocketAddr = if remote.is_ipv4() {
                "0.0.0.0:0".parse().expect("bind addr")
            } else {
                "[::]:0".parse().expect("bind addr")
            };
            let socket = tokio::net::UdpSocket::bind(bind).await?;
            socket.connect(remote).await?;
            debug!(dest = %dest, "direct udp connected");
            Ok(Box::new(DirectUdpTransport {
                socket,
                dest: dest.clone(),
            }))
        }
        UdpOutbound::Vless(client) => Ok(client.connect_udp(dest, src_host, src_port).await?),
        UdpOutbound::Mux(manager) => {
            let session = manager.open_udp(dest, src_host, src_port).await?;
            Ok(Box::new(session))
        }
    }
}

async fn run_flow(
    key: UdpFlowKey,
    dest: Address,
    outbound: UdpOutbound,
    src_host: String,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    evt_tx: mpsc::UnboundedSender<FlowEvent>,
    cancel: CancellationToken,
) {
    let src_port = key.0.port();
    let transport = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connect(&dest, outbound, &src_host, src_port) => match result {
            Ok(t) => t,
            Err(e) => {
                debug!(dest = %dest, error = %e, "udp outbound connect failed");
                let _ = evt_tx.send(FlowEvent::UdpError { key });
                return;
            }
        },
    };

    if evt_tx.send(FlowEvent::UdpReady { key }).is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            outgoing = rx.recv() => match outgoing {
                Some(payload) => {
                    let packet = UdpPacket { addr: dest.clone(), data: payload };
                    if transport.send(packet).await.is_err() {
                        let _ = evt_tx.send(FlowEvent::UdpError { key });
                        return;
                    }
                }
                None => return,
            },
            incoming = transport.recv() => match incoming {
                Ok(packet) => {
                    if evt_tx.send(FlowEvent::UdpResponse { key, payload: packet.data }).is_err() {
                        return;
                    }
                }
                Err(_) => {
                    let _ = evt_tx.send(FlowEvent::UdpError { key });
                    return;
                }
            },
        }
    }
}
