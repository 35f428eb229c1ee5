//! 端到端测试共用件：假宿主隧道、原始帧构造与解析、共享状态 fixture。

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use skytun::config::settings::SharedPaths;
use skytun::engine::HostTunnel;

/// 捕获输出帧的假宿主隧道
pub struct FakeTunnel {
    pub frames: Mutex<Vec<(Vec<u8>, bool)>>,
    pub reapply_count: AtomicUsize,
}

impl FakeTunnel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            reapply_count: AtomicUsize::new(0),
        })
    }

    pub fn take_frames(&self) -> Vec<(Vec<u8>, bool)> {
        std::mem::take(&mut self.frames.lock().unwrap())
    }

    /// 轮询直到捕获到满足谓词的帧（或超时）
    pub async fn wait_for_frame<F>(&self, mut pred: F, timeout_ms: u64) -> Option<Vec<u8>>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_millis(timeout_ms);
        loop {
            {
                let frames = self.frames.lock().unwrap();
                if let Some((frame, _)) = frames.iter().find(|(f, _)| pred(f)) {
                    return Some(frame.clone());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
        }
    }
}

impl HostTunnel for FakeTunnel {
    fn write_frames(&self, frames: Vec<(Vec<u8>, bool)>) {
        self.frames.lock().unwrap().extend(frames);
    }
    fn request_reapply(&self) {
        self.reapply_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// 临时目录里的共享状态（settings.json / routing.json / geoip）
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub paths: SharedPaths,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = SharedPaths {
            settings_path: dir.path().join("settings.json"),
            routing_path: dir.path().join("routing.json"),
            geoip_path: None,
        };
        std::fs::write(&paths.settings_path, r#"{"ipv6Enabled":false,"dohEnabled":false}"#)
            .unwrap();
        Self { dir, paths }
    }

    pub fn write_settings(&self, json: &str) {
        std::fs::write(&self.paths.settings_path, json).unwrap();
    }

    pub fn write_routing(&self, json: &serde_json::Value) {
        std::fs::write(&self.paths.routing_path, serde_json::to_vec(json).unwrap()).unwrap();
    }

    /// 写入一个覆盖 127.0.0.0/8 的 GEO1 库并返回路径
    pub fn write_geoip_loopback(&mut self, country: &str) {
        let path: PathBuf = self.dir.path().join("geo.db");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"GEO1");
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&u32::from(Ipv4Addr::new(127, 0, 0, 0)).to_be_bytes());
        bytes.extend_from_slice(&u32::from(Ipv4Addr::new(127, 255, 255, 255)).to_be_bytes());
        let c = country.as_bytes();
        bytes.extend_from_slice(&[c[0].to_ascii_uppercase(), c[1].to_ascii_uppercase()]);
        std::fs::write(&path, bytes).unwrap();
        self.paths.geoip_path = Some(path);
    }
}

// ── 帧构造 ────────────────────────────────────────────────────

fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < header.len() {
        if i == 10 {
            i += 2;
            continue;
        }
        sum = sum.wrapping_add(u16::from_be_bytes([header[i], header[i + 1]]) as u32);
        i += 2;
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn tcp_checksum_v4(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let s = src.octets();
    let d = dst.octets();
    sum += u16::from_be_bytes([s[0], s[1]]) as u32;
    sum += u16::from_be_bytes([s[2], s[3]]) as u32;
    sum += u16::from_be_bytes([d[0], d[1]]) as u32;
    sum += u16::from_be_bytes([d[2], d[3]]) as u32;
    sum += 6;
    sum += segment.len() as u32;
    let mut i = 0;
    while i + 1 < segment.len() {
        if i != 16 {
            sum = sum.wrapping_add(u16::from_be_bytes([segment[i], segment[i + 1]]) as u32);
        }
        i += 2;
    }
    if i < segment.len() {
        sum = sum.wrapping_add((segment[i] as u32) << 8);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn build_udp_frame(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let (src_ip, dst_ip) = match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => (s, d),
        _ => panic!("v4 only"),
    };
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut pkt = vec![0u8; total_len];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());
    pkt[20..22].copy_from_slice(&src.port().to_be_bytes());
    pkt[22..24].copy_from_slice(&dst.port().to_be_bytes());
    pkt[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
    pkt[28..].copy_from_slice(payload);
    let csum = ipv4_header_checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&csum.to_be_bytes());
    pkt
}

pub fn build_tcp_frame(
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let (src_ip, dst_ip) = match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => (s, d),
        _ => panic!("v4 only"),
    };
    let total_len = 20 + 20 + payload.len();
    let mut pkt = vec![0u8; total_len];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 6;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());
    pkt[20..22].copy_from_slice(&src.port().to_be_bytes());
    pkt[22..24].copy_from_slice(&dst.port().to_be_bytes());
    pkt[24..28].copy_from_slice(&seq.to_be_bytes());
    pkt[28..32].copy_from_slice(&ack.to_be_bytes());
    pkt[32] = 5 << 4;
    pkt[33] = flags;
    pkt[34..36].copy_from_slice(&window.to_be_bytes());
    pkt[40..].copy_from_slice(payload);
    let ip_csum = ipv4_header_checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&ip_csum.to_be_bytes());
    let tcp_csum = tcp_checksum_v4(src_ip, dst_ip, &pkt[20..]);
    pkt[36..38].copy_from_slice(&tcp_csum.to_be_bytes());
    pkt
}

/// 解析一帧里的 UDP 要素
pub struct UdpView {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}

pub fn parse_udp_frame(frame: &[u8]) -> Option<UdpView> {
    if frame.len() < 28 || frame[0] >> 4 != 4 || frame[9] != 17 {
        return None;
    }
    let ihl = ((frame[0] & 0x0F) as usize) * 4;
    let src_ip = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    let dst_ip = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);
    let src_port = u16::from_be_bytes([frame[ihl], frame[ihl + 1]]);
    let dst_port = u16::from_be_bytes([frame[ihl + 2], frame[ihl + 3]]);
    Some(UdpView {
        src: SocketAddr::new(IpAddr::V4(src_ip), src_port),
        dst: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
        payload: frame[ihl + 8..].to_vec(),
    })
}

/// 解析一帧里的 TCP 要素
pub struct TcpView {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub payload: Vec<u8>,
}

pub fn parse_tcp_frame(frame: &[u8]) -> Option<TcpView> {
    if frame.len() < 40 || frame[0] >> 4 != 4 || frame[9] != 6 {
        return None;
    }
    let ihl = ((frame[0] & 0x0F) as usize) * 4;
    let src_ip = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    let dst_ip = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);
    let src_port = u16::from_be_bytes([frame[ihl], frame[ihl + 1]]);
    let dst_port = u16::from_be_bytes([frame[ihl + 2], frame[ihl + 3]]);
    let seq = u32::from_be_bytes(frame[ihl + 4..ihl + 8].try_into().unwrap());
    let ack = u32::from_be_bytes(frame[ihl + 8..ihl + 12].try_into().unwrap());
    let data_off = ((frame[ihl + 12] >> 4) as usize) * 4;
    let flags = frame[ihl + 13];
    Some(TcpView {
        src: SocketAddr::new(IpAddr::V4(src_ip), src_port),
        dst: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
        seq,
        ack,
        flags,
        payload: frame[ihl + data_off..].to_vec(),
    })
}

/// DNS 查询构造
pub fn build_dns_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut q = Vec::new();
    q.extend_from_slice(&id.to_be_bytes());
    q.extend_from_slice(&0x0100u16.to_be_bytes());
    q.extend_from_slice(&1u16.to_be_bytes());
    q.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    for label in name.split('.') {
        q.push(label.len() as u8);
        q.extend_from_slice(label.as_bytes());
    }
    q.push(0);
    q.extend_from_slice(&qtype.to_be_bytes());
    q.extend_from_slice(&1u16.to_be_bytes());
    q
}
