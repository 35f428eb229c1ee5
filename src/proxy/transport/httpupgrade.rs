//! HTTPUpgrade 传输。
//!
//! 与 WebSocket 同形的升级握手，101 之后是裸 TCP 字节流，
//! 没有帧封装。响应里 `Upgrade: websocket` 与 `Connection: upgrade`
//! 两个头都要在（大小写不敏感），缺一即失败。

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::common::ProxyStream;
use crate::config::VlessConfig;

use super::StreamTransport;

const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub struct HttpUpgradeTransport {
    config: Arc<VlessConfig>,
}

impl HttpUpgradeTransport {
    pub fn new(config: Arc<VlessConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StreamTransport for HttpUpgradeTransport {
    async fn connect(&self) -> Result<ProxyStream> {
        let hu = &self.config.http_upgrade;
        let host = if hu.host.is_empty() {
            self.config.server_address.as_str()
        } else {
            hu.host.as_str()
        };

        let mut stream = super::dial_secure(&self.config).await?;

        let ws_key = tokio_tungstenite::tungstenite::handshake::client::generate_key();
        let mut request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {}\r\n\
             User-Agent: {}\r\n",
            hu.path, host, ws_key, CHROME_UA
        );
        for (key, value) in &hu.headers {
            request.push_str(&format!("{}: {}\r\n", key, value));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let status_line = read_http_line(&mut stream).await?;
        let status_code = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| {
                anyhow::anyhow!("httpupgrade: invalid response: {}", status_line.trim())
            })?;
        if status_code != 101 {
            anyhow::bail!(
                "httpupgrade: expected 101 Switching Protocols, got {}: {}",
                status_code,
                status_line.trim()
            );
        }

        let mut saw_upgrade = false;
        let mut saw_connection = false;
        loop {
            let line = read_http_line(&mut stream).await?;
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                let (name, value) = (name.trim(), value.trim());
                if name.eq_ignore_ascii_case("upgrade")
                    && value.eq_ignore_ascii_case("websocket")
                {
                    saw_upgrade = true;
                }
                if name.eq_ignore_ascii_case("connection") && value.eq_ignore_ascii_case("upgrade")
                {
                    saw_connection = true;
                }
            }
        }
        if !saw_upgrade || !saw_connection {
            anyhow::bail!("httpupgrade: 101 response without Upgrade/Connection headers");
        }

        debug!(path = hu.path.as_str(), host, "httpupgrade connection established");

        // 之后是裸流
        Ok(stream)
    }
}

/// 逐字节读一行（到 \n 为止）
async fn read_http_line(stream: &mut ProxyStream) -> Result<String> {
    let mut line = Vec::with_capacity(128);
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
        if line.len() > 8192 {
            anyhow::bail!("httpupgrade: response line too long");
        }
    }
    Ok(String::from_utf8_lossy(&line).to_string())
}
