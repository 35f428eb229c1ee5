pub mod protocol;
pub mod vision;
pub mod xudp;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::common::error::CoreError;
use crate::common::{Address, BoxUdpTransport, ProxyStream, UdpPacket, UdpTransport};
use crate::config::VlessConfig;
use crate::proxy::transport::{build_transport, StreamTransport};

type Result<T> = std::result::Result<T, CoreError>;

/// VLESS 出站客户端。
///
/// 一个实例对应一个端点配置；每次 connect 建立一条独立的
/// 出站连接（mux 的复用在 `proxy::mux` 一层）。
pub struct VlessClient {
    config: Arc<VlessConfig>,
    transport: Arc<dyn StreamTransport>,
}

impl VlessClient {
    pub fn new(config: Arc<VlessConfig>) -> Result<Self> {
        let transport = build_transport(&config)
            .map_err(|e| CoreError::ConfigInvalid(e.to_string()))?;
        Ok(Self { config, transport })
    }

    pub fn config(&self) -> &Arc<VlessConfig> {
        &self.config
    }

    /// 打开一条 TCP 代理流：传输层建连 → 请求头 → 响应头 → (可选) Vision
    pub async fn connect_tcp(&self, target: &Address) -> Result<ProxyStream> {
        let flow = self.config.flow.wire_str();
        let header = protocol::encode_request(
            &self.config.uuid,
            target,
            flow,
            None,
            protocol::CMD_TCP,
        );

        // 传输层支持早数据时，请求头搭升级请求的便车
        let mut stream = if self.transport.max_early_data() >= header.len() {
            self.transport
                .connect_with_early_data(&header)
                .await
                .map_err(|e| CoreError::TransportDial(e.to_string()))?
        } else {
            let mut stream = self
                .transport
                .connect()
                .await
                .map_err(|e| CoreError::TransportDial(e.to_string()))?;
            protocol::write_request(
                &mut stream,
                &self.config.uuid,
                target,
                flow,
                None,
                protocol::CMD_TCP,
            )
            .await?;
            stream
        };

        protocol::read_response(&mut stream).await?;

        debug!(target = %target, server = self.config.server_address.as_str(), "vless tcp established");

        if self.config.flow.is_active() {
            Ok(Box::new(vision::VisionStream::new(
                stream,
                &self.config.vision_seed,
            )))
        } else {
            Ok(stream)
        }
    }

    /// 打开一条 UDP 代理连接（长度帧语义），src 用于 XUDP GlobalID
    pub async fn connect_udp(
        &self,
        target: &Address,
        src_host: &str,
        src_port: u16,
    ) -> Result<BoxUdpTransport> {
        let mut stream = self
            .transport
            .connect()
            .await
            .map_err(|e| CoreError::TransportDial(e.to_string()))?;

        let global_id = if self.config.xudp_enabled {
            Some(xudp::global_id(src_host, src_port))
        } else {
            None
        };

        protocol::write_request(
            &mut stream,
            &self.config.uuid,
            target,
            self.config.flow.wire_str(),
            global_id,
            protocol::CMD_UDP,
        )
        .await?;
        protocol::read_response(&mut stream).await?;

        debug!(target = %target, "vless udp established");

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Box::new(VlessUdpTransport {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
            target: target.clone(),
        }))
    }
}

/// VLESS UDP 连接：u16 BE 长度帧拼接
struct VlessUdpTransport {
    read_half: Mutex<ReadHalf<ProxyStream>>,
    write_half: Mutex<WriteHalf<ProxyStream>>,
    target: Address,
}

#[async_trait]
impl UdpTransport for VlessUdpTransport {
    async fn send(&self, packet: UdpPacket) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;
        let frame = protocol::encode_udp_frame(&packet.data)?;
        let mut write_half = self.write_half.lock().await;
        write_half.write_all(&frame).await?;
        write_half.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> anyhow::Result<UdpPacket> {
        use tokio::io::AsyncReadExt;
        let mut read_half = self.read_half.lock().await;
        let len = read_half.read_u16().await? as usize;
        let mut buf = vec![0u8; len];
        read_half.read_exact(&mut buf).await?;
        Ok(UdpPacket {
            addr: self.target.clone(),
            data: bytes::Bytes::from(buf),
        })
    }
}
