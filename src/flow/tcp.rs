//! TCP 连接处理：每个被接受的连接一份状态 + 一对中继任务。
//!
//! 状态机 `Connecting → Established → UplinkHalfClosed |
//! DownlinkHalfClosed → Closed`，任意状态可到 `Aborted`。
//! 溢出缓冲、定时器与状态迁移都在栈任务上；中继任务只做
//! 传输 I/O，经 `FlowEvent` 回栈。

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{Address, ProxyStream};
use crate::flow::FlowEvent;
use crate::proxy::vless::VlessClient;
use std::sync::Arc;

/// 入站→本地 溢出缓冲上限
pub const OVERFLOW_CAP: usize = 512 * 1024;
/// 出站建立总时限（TCP + TLS + 升级 + VLESS 头）
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
/// 双向空闲
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// 半关后的收尾时限
pub const HALF_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
/// 单次 tcp_write 上限
pub const MAX_WRITE_CHUNK: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpPhase {
    Connecting,
    Established,
    UplinkHalfClosed,
    DownlinkHalfClosed,
    Closed,
    Aborted,
}

impl TcpPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TcpPhase::Closed | TcpPhase::Aborted)
    }
}

/// 本地侧事件送往中继上行
pub enum LocalEvent {
    Data(Bytes),
    Eof,
}

/// 出站选择
pub enum TcpOutbound {
    /// 绕行：直接 TCP
    Direct,
    /// 经 VLESS 代理
    Vless(Arc<VlessClient>),
}

/// 栈任务里的每流记录
pub struct TcpFlow {
    pub phase: TcpPhase,
    pub dest: Address,
    /// 本地字节送往中继；建连期间入队的字节在通道里排队，
    /// 窗口信用要到实际发出后才归还，队长自然封顶
    pub to_outbound: mpsc::UnboundedSender<LocalEvent>,
    /// 入站→本地溢出缓冲；超过 OVERFLOW_CAP 即判死
    pub overflow: BytesMut,
    pub cancel: CancellationToken,
    pub created: Instant,
    pub last_activity: Instant,
    /// 进入半关状态的时刻（1s 收尾计时）
    pub half_close_since: Option<Instant>,
    pub local_eof: bool,
    pub outbound_eof: bool,
}

impl TcpFlow {
    /// 建流并起中继。返回的记录由栈任务持有。
    pub fn spawn(
        slot: u32,
        dest: Address,
        outbound: TcpOutbound,
        evt_tx: mpsc::UnboundedSender<FlowEvent>,
    ) -> Self {
        let (to_outbound, local_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let now = Instant::now();

        tokio::spawn(run_relay(
            slot,
            dest.clone(),
            outbound,
            local_rx,
            evt_tx,
            cancel.clone(),
        ));

        Self {
            phase: TcpPhase::Connecting,
            dest,
            to_outbound,
            overflow: BytesMut::new(),
            cancel,
            created: now,
            last_activity: now,
            half_close_since: None,
            local_eof: false,
            outbound_eof: false,
        }
    }

    /// 同步取消：中继任务观察 token 退出，不再投递任何事件
    pub fn shutdown(&mut self, phase: TcpPhase) {
        self.phase = phase;
        self.cancel.cancel();
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// 双向都结束了吗（进入 Closed 的条件）
    pub fn both_done(&self) -> bool {
        self.local_eof && self.outbound_eof
    }
}

async fn dial(dest: &Address, outbound: TcpOutbound) -> anyhow::Result<ProxyStream> {
    match outbound {
        TcpOutbound::Direct => {
            let addr = dest.resolve().await?;
            let stream = tokio::net::TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            debug!(dest = %dest, "direct tcp connected");
            Ok(Box::new(stream))
        }
        TcpOutbound::Vless(client) => Ok(client.connect_tcp(dest).await?),
    }
}

async fn run_relay(
    slot: u32,
    dest: Address,
    outbound: TcpOutbound,
    mut local_rx: mpsc::UnboundedReceiver<LocalEvent>,
    evt_tx: mpsc::UnboundedSender<FlowEvent>,
    cancel: CancellationToken,
) {
    // 建连阶段；60s 上限由栈任务的定时器执行（到点 cancel）
    let stream = tokio::select! {
        _ = cancel.cancelled() => return,
        result = dial(&dest, outbound) => match result {
            Ok(stream) => stream,
            Err(e) => {
                let _ = evt_tx.send(FlowEvent::TcpOutboundError {
                    slot,
                    error: e.to_string(),
                });
                return;
            }
        },
    };

    if cancel.is_cancelled() {
        return;
    }
    if evt_tx.send(FlowEvent::TcpOutboundReady { slot }).is_err() {
        return;
    }

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    // 上行：本地字节 → 出站
    let uplink = {
        let evt_tx = evt_tx.clone();
        let cancel = cancel.clone();
        async move {
            loop {
                let ev = tokio::select! {
                    _ = cancel.cancelled() => return,
                    ev = local_rx.recv() => ev,
                };
                match ev {
                    Some(LocalEvent::Data(bytes)) => {
                        let n = bytes.len();
                        if write_half.write_all(&bytes).await.is_err()
                            || write_half.flush().await.is_err()
                        {
                            let _ = evt_tx.send(FlowEvent::TcpOutboundError {
                                slot,
                                error: "uplink write failed".into(),
                            });
                            return;
                        }
                        // 发送完成才归还本地接收窗口
                        let _ = evt_tx.send(FlowEvent::TcpLocalDelivered { slot, n });
                    }
                    Some(LocalEvent::Eof) => {
                        let _ = write_half.shutdown().await;
                        // 出站仍可能在发；下行循环继续
                    }
                    None => return,
                }
            }
        }
    };

    // 下行：出站 → 本地，拉取式。每块数据等栈任务放行后再拉下一块。
    let downlink = {
        let evt_tx = evt_tx.clone();
        let cancel = cancel.clone();
        async move {
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = read_half.read(&mut buf) => r,
                };
                match result {
                    Ok(0) => {
                        let _ = evt_tx.send(FlowEvent::TcpOutboundEof { slot });
                        return;
                    }
                    Ok(n) => {
                        let (resume_tx, resume_rx) = oneshot::channel();
                        if evt_tx
                            .send(FlowEvent::TcpOutboundData {
                                slot,
                                data: Bytes::copy_from_slice(&buf[..n]),
                                resume: resume_tx,
                            })
                            .is_err()
                        {
                            return;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            r = resume_rx => {
                                if r.is_err() {
                                    // 流已拆除
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = evt_tx.send(FlowEvent::TcpOutboundError {
                            slot,
                            error: e.to_string(),
                        });
                        return;
                    }
                }
            }
        }
    };

    tokio::join!(uplink, downlink);
}
