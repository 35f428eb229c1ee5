use thiserror::Error;

/// 核心错误分类
///
/// 每个变体对应一种处置策略：配置错误在准入时拒绝，
/// 流级错误只终止所在 flow，容量错误静默丢弃，
/// 重载错误记录日志后继续启动新栈。
#[derive(Error, Debug)]
pub enum CoreError {
    /// 配置无效：URL 格式错误、缺少必填字段、未知枚举值
    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// 出站建链失败：TCP 连接、TLS 握手或传输层升级失败
    #[error("transport dial failed: {0}")]
    TransportDial(String),

    /// 协议违例：VLESS 头解析失败、响应版本错误、长度越界、mux 帧非法
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// TCP 回压缓冲超过 512 KiB
    #[error("backpressure overflow: {0} bytes buffered")]
    BackpressureOverflow(usize),

    /// 超时：握手 60s / 空闲 300s / 半关 1s / UDP 空闲 60s
    #[error("timeout: {0}")]
    Timeout(&'static str),

    /// 容量：UDP flow 达到 200 上限或待发队列超过 16 KiB
    #[error("capacity exceeded: {0}")]
    Capacity(&'static str),

    /// 重载过程中的拆除错误（仅记录，新栈照常启动）
    #[error("stack reload: {0}")]
    StackReload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<CoreError> for std::io::Error {
    fn from(e: CoreError) -> Self {
        std::io::Error::other(e.to_string())
    }
}
