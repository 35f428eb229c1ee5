use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::{Address, ProxyStream};
use crate::config::VlessConfig;

use super::StreamTransport;

/// 裸 TCP 拨号（域名走阻塞解析线程池）
pub async fn dial(host: &str, port: u16) -> Result<TcpStream> {
    let addr = Address::from_host_port(host, port).resolve().await?;
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    debug!(host, port, "tcp connected");
    Ok(stream)
}

/// TCP 传输（可按配置带 TLS / Reality 安全层）
pub struct TcpTransport {
    config: Arc<VlessConfig>,
}

impl TcpTransport {
    pub fn new(config: Arc<VlessConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StreamTransport for TcpTransport {
    async fn connect(&self) -> Result<ProxyStream> {
        super::dial_secure(&self.config).await
    }
}
