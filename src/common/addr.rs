use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use anyhow::Result;
use bytes::{BufMut, BytesMut};

/// 出站目标地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// 从主机字符串构造：IP 字面量转 `Ip`，其余作为域名
    pub fn from_host_port(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    /// 编码为 VLESS 地址格式
    /// [AddrType: 1B] [Address: 变长]
    /// AddrType: 0x01=IPv4, 0x02=Domain (1B 长度前缀), 0x03=IPv6
    pub fn encode_vless(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(0x01);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(0x03);
                buf.put_slice(&addr.ip().octets());
            }
            Address::Domain(domain, _) => {
                buf.put_u8(0x02);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
    }

    /// 从 VLESS 地址格式解析，返回 (地址, 消费字节数)
    pub fn decode_vless(atyp: u8, data: &[u8], port: u16) -> Result<(Self, usize)> {
        match atyp {
            0x01 => {
                if data.len() < 4 {
                    anyhow::bail!("truncated IPv4 address");
                }
                let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 4))
            }
            0x02 => {
                if data.is_empty() {
                    anyhow::bail!("missing domain length");
                }
                let len = data[0] as usize;
                if data.len() < 1 + len {
                    anyhow::bail!("truncated domain");
                }
                let domain = std::str::from_utf8(&data[1..1 + len])
                    .map_err(|_| anyhow::anyhow!("domain is not valid UTF-8"))?
                    .to_string();
                Ok((Address::Domain(domain, port), 1 + len))
            }
            0x03 => {
                if data.len() < 16 {
                    anyhow::bail!("truncated IPv6 address");
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[..16]);
                let ip = Ipv6Addr::from(octets);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V6(ip), port)), 16))
            }
            _ => anyhow::bail!("unsupported address type: 0x{:02x}", atyp),
        }
    }

    /// DNS 解析为 SocketAddr（域名解析放到阻塞线程池）
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => {
                let addr_str = format!("{}:{}", domain, port);
                let (domain, port) = (domain.clone(), *port);
                let resolved = tokio::task::spawn_blocking(move || addr_str.to_socket_addrs())
                    .await??
                    .next()
                    .ok_or_else(|| {
                        anyhow::anyhow!("DNS resolution failed for {}:{}", domain, port)
                    })?;
                Ok(resolved)
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
