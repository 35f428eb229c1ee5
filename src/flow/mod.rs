pub mod tcp;
pub mod udp;

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::oneshot;

/// UDP 流键：(源, 目的)
pub type UdpFlowKey = (SocketAddr, SocketAddr);

/// 流任务回传给栈任务的事件。
///
/// 传输 I/O 在运行时线程上进行，但所有触及栈或流状态的
/// 完成都经由这条通道回到栈任务上串行处理。
pub enum FlowEvent {
    /// 出站建连完成，可以放行排队数据
    TcpOutboundReady { slot: u32 },
    /// 出站→本地的一块数据；栈任务写完（或挂起溢出）后
    /// 触发 resume，接收循环才继续拉取下一块
    TcpOutboundData {
        slot: u32,
        data: Bytes,
        resume: oneshot::Sender<()>,
    },
    /// 出站方向 EOF
    TcpOutboundEof { slot: u32 },
    /// 出站 I/O 错误（对流致命）
    TcpOutboundError { slot: u32, error: String },
    /// 本地→出站的一批字节已发完，可以归还接收窗口
    TcpLocalDelivered { slot: u32, n: usize },
    /// UDP 出站就绪，可以放行排队数据报
    UdpReady { key: UdpFlowKey },
    /// UDP 回程数据报
    UdpResponse { key: UdpFlowKey, payload: Bytes },
    /// UDP 出站死亡
    UdpError { key: UdpFlowKey },
}
