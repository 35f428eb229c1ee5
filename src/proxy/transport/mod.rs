pub mod httpupgrade;
pub mod tcp;
pub mod tls;
pub mod ws;
pub mod xhttp;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::common::ProxyStream;
use crate::config::{Security, Transport, VlessConfig};
use crate::proxy::reality;

/// 传输层抽象 trait
///
/// 负责建立到代理服务器的底层连接（TCP / TLS / Reality / WS /
/// HTTPUpgrade / XHTTP），VLESS 协议在这条连接之上收发。
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self) -> Result<ProxyStream>;

    /// 升级请求可随带的早数据字节数上限；0 表示不支持
    fn max_early_data(&self) -> usize {
        0
    }

    /// 带早数据建连。默认实现忽略早数据能力，建连后立即补发。
    async fn connect_with_early_data(&self, early: &[u8]) -> Result<ProxyStream> {
        use tokio::io::AsyncWriteExt;
        let mut stream = self.connect().await?;
        if !early.is_empty() {
            stream.write_all(early).await?;
            stream.flush().await?;
        }
        Ok(stream)
    }
}

/// 按配置构建传输层实例
pub fn build_transport(config: &Arc<VlessConfig>) -> Result<Arc<dyn StreamTransport>> {
    Ok(match config.transport {
        Transport::Tcp => Arc::new(tcp::TcpTransport::new(config.clone())),
        Transport::Ws => Arc::new(ws::WsTransport::new(config.clone())),
        Transport::HttpUpgrade => Arc::new(httpupgrade::HttpUpgradeTransport::new(config.clone())),
        Transport::Xhttp => Arc::new(xhttp::XhttpTransport::new(config.clone())),
    })
}

/// 建立 TCP 连接并套上配置要求的安全层
pub(crate) async fn dial_secure(config: &VlessConfig) -> Result<ProxyStream> {
    let tcp_stream = tcp::dial(&config.dial_host(), config.server_port).await?;
    match config.security {
        Security::None => Ok(Box::new(tcp_stream)),
        Security::Tls => {
            tls::wrap(
                Box::new(tcp_stream),
                config.effective_sni(),
                &config.tls.alpn,
                config.tls.allow_insecure,
            )
            .await
        }
        Security::Reality => reality::connect(Box::new(tcp_stream), &config.reality).await,
    }
}
