//! VLESS 请求/响应头编解码与 UDP 长度帧。
//!
//! 请求头:
//! [Version: 1B = 0x00]
//! [UUID: 16B]
//! [Addons Length: 1B]
//! [Addons: 变长 (字段 0x01 = flow 字符串, 字段 0x02 = 8B GlobalID)]
//! [Command: 1B] [Port: 2B BE] [AddrType: 1B] [Address: 变长]
//!
//! 响应头: [Version: 1B] [Addons Length: 1B] [Addons]

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::common::error::CoreError;
use crate::common::{Address, ProxyStream};

type Result<T> = std::result::Result<T, CoreError>;

pub const VERSION: u8 = 0x00;
pub const CMD_TCP: u8 = 0x01;
pub const CMD_UDP: u8 = 0x02;

/// addons 字段 1：flow 字符串
const ADDON_FLOW: u8 = 0x01;
/// addons 字段 2：XUDP GlobalID
const ADDON_GLOBAL_ID: u8 = 0x02;

/// 编码请求头
pub fn encode_request(
    uuid: &Uuid,
    target: &Address,
    flow: Option<&str>,
    global_id: Option<[u8; 8]>,
    command: u8,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128);

    buf.put_u8(VERSION);
    buf.put_slice(uuid.as_bytes());

    let addons = encode_addons(flow, global_id);
    buf.put_u8(addons.len() as u8);
    buf.put_slice(&addons);

    buf.put_u8(command);
    buf.put_u16(target.port());
    target.encode_vless(&mut buf);

    buf
}

/// 解码后的请求头
#[derive(Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub uuid: Uuid,
    pub flow: Option<String>,
    pub global_id: Option<[u8; 8]>,
    pub command: u8,
    pub target: Address,
}

/// 从字节解码请求头，返回 (头, 消费字节数)
pub fn decode_request(data: &[u8]) -> Result<(RequestHeader, usize)> {
    let violation = |msg: &str| CoreError::ProtocolViolation(msg.to_string());

    if data.len() < 18 {
        return Err(violation("request header truncated"));
    }
    if data[0] != VERSION {
        return Err(CoreError::ProtocolViolation(format!(
            "unexpected request version 0x{:02x}",
            data[0]
        )));
    }
    let uuid = Uuid::from_slice(&data[1..17]).map_err(|_| violation("bad uuid"))?;

    let addons_len = data[17] as usize;
    let mut pos = 18;
    if data.len() < pos + addons_len {
        return Err(violation("addons truncated"));
    }
    let (flow, global_id) = decode_addons(&data[pos..pos + addons_len])?;
    pos += addons_len;

    if data.len() < pos + 4 {
        return Err(violation("command/port truncated"));
    }
    let command = data[pos];
    if command != CMD_TCP && command != CMD_UDP {
        return Err(CoreError::ProtocolViolation(format!(
            "unknown command 0x{:02x}",
            command
        )));
    }
    let port = u16::from_be_bytes([data[pos + 1], data[pos + 2]]);
    let atyp = data[pos + 3];
    pos += 4;

    let (target, consumed) = Address::decode_vless(atyp, &data[pos..], port)
        .map_err(|e| CoreError::ProtocolViolation(e.to_string()))?;
    pos += consumed;

    Ok((
        RequestHeader {
            uuid,
            flow,
            global_id,
            command,
            target,
        },
        pos,
    ))
}

fn encode_addons(flow: Option<&str>, global_id: Option<[u8; 8]>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(f) = flow.filter(|f| !f.is_empty()) {
        buf.push(ADDON_FLOW);
        buf.push(f.len() as u8);
        buf.extend_from_slice(f.as_bytes());
    }
    if let Some(id) = global_id {
        buf.push(ADDON_GLOBAL_ID);
        buf.push(8);
        buf.extend_from_slice(&id);
    }
    buf
}

fn decode_addons(mut data: &[u8]) -> Result<(Option<String>, Option<[u8; 8]>)> {
    let mut flow = None;
    let mut global_id = None;
    while !data.is_empty() {
        if data.len() < 2 {
            return Err(CoreError::ProtocolViolation("addons field truncated".into()));
        }
        let (tag, len) = (data[0], data[1] as usize);
        if data.len() < 2 + len {
            return Err(CoreError::ProtocolViolation("addons value truncated".into()));
        }
        let value = &data[2..2 + len];
        match tag {
            ADDON_FLOW => {
                flow = Some(
                    std::str::from_utf8(value)
                        .map_err(|_| CoreError::ProtocolViolation("flow is not UTF-8".into()))?
                        .to_string(),
                );
            }
            ADDON_GLOBAL_ID => {
                let id: [u8; 8] = value
                    .try_into()
                    .map_err(|_| CoreError::ProtocolViolation("global id must be 8 bytes".into()))?;
                global_id = Some(id);
            }
            // 未知字段跳过
            _ => {}
        }
        data = &data[2 + len..];
    }
    Ok((flow, global_id))
}

/// 发送请求头
pub async fn write_request(
    stream: &mut ProxyStream,
    uuid: &Uuid,
    target: &Address,
    flow: Option<&str>,
    global_id: Option<[u8; 8]>,
    command: u8,
) -> Result<()> {
    let buf = encode_request(uuid, target, flow, global_id, command);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// 读取响应头，必须在接收流起始处恰好消费一次
pub async fn read_response(stream: &mut ProxyStream) -> Result<()> {
    let version = stream.read_u8().await?;
    if version != VERSION {
        return Err(CoreError::ProtocolViolation(format!(
            "unexpected response version 0x{:02x}",
            version
        )));
    }
    let addons_len = stream.read_u8().await?;
    if addons_len > 0 {
        let mut addons = vec![0u8; addons_len as usize];
        stream.read_exact(&mut addons).await?;
    }
    Ok(())
}

/// 写入 UDP 帧: [Length: 2B BE][Payload]
pub async fn write_udp_frame(stream: &mut ProxyStream, data: &[u8]) -> Result<()> {
    let buf = encode_udp_frame(data)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

pub fn encode_udp_frame(data: &[u8]) -> Result<BytesMut> {
    if data.len() > u16::MAX as usize {
        return Err(CoreError::ProtocolViolation(format!(
            "udp payload too large: {}",
            data.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(2 + data.len());
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    Ok(buf)
}

/// 读取一个 UDP 帧
pub async fn read_udp_frame(stream: &mut ProxyStream) -> Result<Bytes> {
    let len = stream.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// 增量 UDP 帧解码器。
///
/// 长度前缀可能跨读取边界到达；未凑齐的前缀与载荷保留在内部缓冲，
/// 下次喂入后继续。
#[derive(Default)]
pub struct UdpFrameDecoder {
    buf: BytesMut,
}

impl UdpFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入新数据，取出所有完整帧
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < 2 {
                break;
            }
            let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            if self.buf.len() < 2 + len {
                break;
            }
            self.buf.advance(2);
            frames.push(self.buf.split_to(len).freeze());
        }
        frames
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
