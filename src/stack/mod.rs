//! 用户态 TCP/IP 栈绑定。
//!
//! 单任务拥有、不可重入。TCP 由 smoltcp 终结：对未知 4 元组的
//! SYN 先上报 `TcpSyn`，接受后在目标端点上临时建一个监听
//! socket 再注入原帧，从而做到"接受任意目的地"。UDP 不进
//! smoltcp，按数据报直接解析/合成。所有操作产出 `StackEvent`
//! 列表由调用方（引擎）分发。

pub mod device;

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpListenEndpoint};
use tracing::{debug, warn};

use device::VirtualDevice;

/// 虚拟网卡 IPv4 地址
pub const LOCAL_IPV4: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);
/// 虚拟网卡 IPv6 地址
pub const LOCAL_IPV6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2);
/// MTU
pub const MTU: usize = 1400;

/// 每方向 TCP 缓冲
const TCP_BUF_SIZE: usize = 64 * 1024;

/// 栈产出的事件，由引擎在栈任务上分发
#[derive(Debug)]
pub enum StackEvent {
    /// 发往宿主隧道的一帧（计入 bytes_in）
    Output { frame: Vec<u8>, is_ipv6: bool },
    /// 未知 4 元组的 SYN；引擎决定 accept(frame) 或 reject(frame)
    TcpSyn {
        src: SocketAddr,
        dst: SocketAddr,
        is_ipv6: bool,
        frame: Vec<u8>,
    },
    /// 本地侧数据；空 data 表示本地半关
    TcpRecv { slot: u32, data: Vec<u8> },
    /// 本地侧 ACK 掉的字节数（释放的发送缓冲余量）
    TcpSent { slot: u32, bytes: u16 },
    /// 控制块已销毁，槽位已释放
    TcpClosed { slot: u32 },
    /// UDP 数据报
    UdpRecv {
        src: SocketAddr,
        dst: SocketAddr,
        is_ipv6: bool,
        payload: Vec<u8>,
    },
}

struct FlowSlot {
    handle: SocketHandle,
    /// 4 元组 (src, dst)，释放时从去重表摘除
    tuple: (SocketAddr, SocketAddr),
    /// 未消费的接收窗口信用
    credit: usize,
    last_send_queue: usize,
    established: bool,
    eof_delivered: bool,
}

pub struct NetStack {
    device: VirtualDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    slots: Vec<Option<FlowSlot>>,
    /// 已上报或已接管的 TCP 4 元组（抑制 SYN 重传重复上报）
    known_tuples: HashSet<(SocketAddr, SocketAddr)>,
    ipv6_enabled: bool,
}

impl NetStack {
    pub fn new(ipv6_enabled: bool) -> Self {
        let mut device = VirtualDevice::new(MTU);
        let config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, SmolInstant::now());

        iface.update_ip_addrs(|addrs| {
            addrs.push(IpCidr::new(IpAddress::Ipv4(LOCAL_IPV4), 24)).ok();
            if ipv6_enabled {
                addrs.push(IpCidr::new(IpAddress::Ipv6(LOCAL_IPV6), 64)).ok();
            }
        });

        debug!(ipv6 = ipv6_enabled, "userspace stack initialized");

        Self {
            device,
            iface,
            sockets: SocketSet::new(vec![]),
            slots: Vec::new(),
            known_tuples: HashSet::new(),
            ipv6_enabled,
        }
    }

    pub fn ipv6_enabled(&self) -> bool {
        self.ipv6_enabled
    }

    /// 提交一帧来自宿主的 IP 包
    pub fn input(&mut self, frame: &[u8], events: &mut Vec<StackEvent>) {
        let Some(pkt) = parse_packet(frame) else {
            return;
        };

        match pkt.proto {
            // UDP 完全旁路 smoltcp
            17 => {
                if !pkt.payload.is_empty() {
                    events.push(StackEvent::UdpRecv {
                        src: SocketAddr::new(pkt.src_ip, pkt.src_port),
                        dst: SocketAddr::new(pkt.dst_ip, pkt.dst_port),
                        is_ipv6: pkt.is_ipv6,
                        payload: pkt.payload,
                    });
                }
            }
            6 => {
                let src = SocketAddr::new(pkt.src_ip, pkt.src_port);
                let dst = SocketAddr::new(pkt.dst_ip, pkt.dst_port);
                let is_syn = pkt.tcp_flags & 0x02 != 0 && pkt.tcp_flags & 0x10 == 0;
                if is_syn && !self.known_tuples.contains(&(src, dst)) {
                    events.push(StackEvent::TcpSyn {
                        src,
                        dst,
                        is_ipv6: pkt.is_ipv6,
                        frame: frame.to_vec(),
                    });
                } else {
                    self.device.inject_packet(frame.to_vec());
                    self.poll(events);
                }
            }
            // 其他协议（ICMP 等）交给 smoltcp 自行应答或丢弃
            _ => {
                self.device.inject_packet(frame.to_vec());
                self.poll(events);
            }
        }
    }

    /// 接受一条上报过的 SYN：在目标端点建监听 socket、注入原帧。
    /// 返回槽位 id（即 TCP handle 的外部形态）。
    pub fn accept(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        syn_frame: Vec<u8>,
        events: &mut Vec<StackEvent>,
    ) -> u32 {
        let rx = tcp::SocketBuffer::new(vec![0u8; TCP_BUF_SIZE]);
        let tx = tcp::SocketBuffer::new(vec![0u8; TCP_BUF_SIZE]);
        let mut socket = tcp::Socket::new(rx, tx);
        socket.set_nagle_enabled(false);

        let endpoint = IpListenEndpoint {
            addr: Some(to_ip_address(dst.ip())),
            port: dst.port(),
        };
        if let Err(e) = socket.listen(endpoint) {
            warn!(error = %e, dst = %dst, "listen for accepted SYN failed");
        }
        let handle = self.sockets.add(socket);

        let slot = FlowSlot {
            handle,
            tuple: (src, dst),
            credit: TCP_BUF_SIZE,
            last_send_queue: 0,
            established: false,
            eof_delivered: false,
        };
        let slot_id = self.store_slot(slot);
        self.known_tuples.insert((src, dst));

        self.device.inject_packet(syn_frame);
        self.poll(events);

        debug!(src = %src, dst = %dst, slot = slot_id, "tcp accepted");
        slot_id
    }

    /// 拒绝一条 SYN：无 socket 注入，smoltcp 会回 RST
    pub fn reject(&mut self, syn_frame: Vec<u8>, events: &mut Vec<StackEvent>) {
        self.device.inject_packet(syn_frame);
        self.poll(events);
    }

    /// 向本地侧写数据，返回立即接纳的字节数（发送缓冲余量）
    pub fn tcp_write(&mut self, slot: u32, data: &[u8]) -> usize {
        let Some(handle) = self.slot_handle(slot) else {
            return 0;
        };
        let socket = self.sockets.get_mut::<tcp::Socket>(handle);
        let accepted = socket.send_slice(data).unwrap_or(0);
        // 刷新基线，避免把自己的入队当成 ACK
        let queued = socket.send_queue();
        if let Some(Some(s)) = self.slots.get_mut(slot as usize) {
            s.last_send_queue = queued;
        }
        accepted
    }

    /// 当前发送缓冲余量
    pub fn tcp_sndbuf(&self, slot: u32) -> u32 {
        let Some(handle) = self.slot_handle(slot) else {
            return 0;
        };
        let socket = self.sockets.get::<tcp::Socket>(handle);
        (socket.send_capacity() - socket.send_queue()) as u32
    }

    /// 推动输出（smoltcp 打包发帧）
    pub fn tcp_output(&mut self, events: &mut Vec<StackEvent>) {
        self.poll(events);
    }

    /// 归还接收窗口信用；随后立即尝试继续交付
    pub fn tcp_recved(&mut self, slot: u32, n: u16, events: &mut Vec<StackEvent>) {
        if let Some(Some(s)) = self.slots.get_mut(slot as usize) {
            s.credit += n as usize;
        }
        self.poll(events);
    }

    /// 优雅关闭（FIN）
    pub fn tcp_close(&mut self, slot: u32, events: &mut Vec<StackEvent>) {
        if let Some(handle) = self.slot_handle(slot) {
            self.sockets.get_mut::<tcp::Socket>(handle).close();
            self.poll(events);
        }
    }

    /// 强拆（RST）
    pub fn tcp_abort(&mut self, slot: u32, events: &mut Vec<StackEvent>) {
        if let Some(handle) = self.slot_handle(slot) {
            self.sockets.get_mut::<tcp::Socket>(handle).abort();
            self.poll(events);
        }
    }

    /// 向本地侧合成一个 UDP 数据报（DNS 应答、UDP 流回包）
    pub fn udp_sendto(
        &mut self,
        src: SocketAddr,
        dst: SocketAddr,
        is_ipv6: bool,
        payload: &[u8],
        events: &mut Vec<StackEvent>,
    ) {
        let frame = if is_ipv6 {
            match (src, dst) {
                (SocketAddr::V6(s), SocketAddr::V6(d)) => {
                    build_udp_frame_v6(*s.ip(), s.port(), *d.ip(), d.port(), payload)
                }
                _ => {
                    warn!("udp_sendto: is_ipv6 with non-v6 addresses");
                    return;
                }
            }
        } else {
            match (src, dst) {
                (SocketAddr::V4(s), SocketAddr::V4(d)) => {
                    build_udp_frame_v4(*s.ip(), s.port(), *d.ip(), d.port(), payload)
                }
                _ => {
                    warn!("udp_sendto: is_ipv6=false with non-v4 addresses");
                    return;
                }
            }
        };
        self.device.enqueue_outbound(frame);
        self.drain_outbound(events);
    }

    /// 250ms 周期调用：驱动 smoltcp 的重传与定时器
    pub fn check_timeouts(&mut self, events: &mut Vec<StackEvent>) {
        self.poll(events);
    }

    /// 活跃槽位数（测试与统计用）
    pub fn active_flows(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn store_slot(&mut self, slot: FlowSlot) -> u32 {
        for (i, entry) in self.slots.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(slot);
                return i as u32;
            }
        }
        self.slots.push(Some(slot));
        (self.slots.len() - 1) as u32
    }

    fn slot_handle(&self, slot: u32) -> Option<SocketHandle> {
        self.slots.get(slot as usize)?.as_ref().map(|s| s.handle)
    }

    fn drain_outbound(&mut self, events: &mut Vec<StackEvent>) {
        while let Some(frame) = self.device.take_outbound() {
            let is_ipv6 = frame.first().map(|b| b >> 4) == Some(6);
            events.push(StackEvent::Output { frame, is_ipv6 });
        }
    }

    fn poll(&mut self, events: &mut Vec<StackEvent>) {
        let _ = self
            .iface
            .poll(SmolInstant::now(), &mut self.device, &mut self.sockets);

        self.drain_outbound(events);

        for idx in 0..self.slots.len() {
            let Some(slot) = self.slots[idx].as_mut() else {
                continue;
            };
            let socket = self.sockets.get_mut::<tcp::Socket>(slot.handle);
            let state = socket.state();

            if !slot.established && matches!(state, tcp::State::Established) {
                slot.established = true;
            }

            // 本地 ACK → 发送缓冲余量释放
            let queued = socket.send_queue();
            if queued < slot.last_send_queue {
                let freed = slot.last_send_queue - queued;
                slot.last_send_queue = queued;
                events.push(StackEvent::TcpSent {
                    slot: idx as u32,
                    bytes: freed.min(u16::MAX as usize) as u16,
                });
            }

            // 本地侧数据，受信用约束
            if slot.credit > 0 && socket.can_recv() {
                let want = slot.credit.min(TCP_BUF_SIZE);
                let mut buf = vec![0u8; want];
                if let Ok(n) = socket.recv_slice(&mut buf) {
                    if n > 0 {
                        buf.truncate(n);
                        slot.credit -= n;
                        events.push(StackEvent::TcpRecv {
                            slot: idx as u32,
                            data: buf,
                        });
                    }
                }
            }

            // 本地半关：对端 FIN 且数据已清空，交付一次空 recv
            if slot.established
                && !slot.eof_delivered
                && !socket.can_recv()
                && !socket.may_recv()
            {
                slot.eof_delivered = true;
                events.push(StackEvent::TcpRecv {
                    slot: idx as u32,
                    data: Vec::new(),
                });
            }

            // 控制块终结：释放槽位
            if matches!(state, tcp::State::Closed | tcp::State::TimeWait) {
                let slot = self.slots[idx].take().expect("slot present");
                self.known_tuples.remove(&slot.tuple);
                self.sockets.remove(slot.handle);
                events.push(StackEvent::TcpClosed { slot: idx as u32 });
            }
        }

        // socket 状态变化可能又产出了帧
        self.drain_outbound(events);
    }
}

fn to_ip_address(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(a) => IpAddress::Ipv4(a),
        IpAddr::V6(a) => IpAddress::Ipv6(a),
    }
}

struct ParsedPacket {
    is_ipv6: bool,
    proto: u8,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: u16,
    dst_port: u16,
    tcp_flags: u8,
    payload: Vec<u8>,
}

/// 解析 IP 帧到传输层要素；UDP 时 payload 为数据报载荷
fn parse_packet(frame: &[u8]) -> Option<ParsedPacket> {
    if frame.is_empty() {
        return None;
    }
    match frame[0] >> 4 {
        4 => {
            if frame.len() < 20 {
                return None;
            }
            let ihl = ((frame[0] & 0x0F) as usize) * 4;
            if ihl < 20 || frame.len() < ihl + 4 {
                return None;
            }
            let proto = frame[9];
            let src_ip = IpAddr::V4(Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]));
            let dst_ip = IpAddr::V4(Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]));
            parse_transport(frame, ihl, false, proto, src_ip, dst_ip)
        }
        6 => {
            if frame.len() < 40 + 4 {
                return None;
            }
            let proto = frame[6];
            let mut src = [0u8; 16];
            src.copy_from_slice(&frame[8..24]);
            let mut dst = [0u8; 16];
            dst.copy_from_slice(&frame[24..40]);
            parse_transport(
                frame,
                40,
                true,
                proto,
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
            )
        }
        _ => None,
    }
}

fn parse_transport(
    frame: &[u8],
    offset: usize,
    is_ipv6: bool,
    proto: u8,
    src_ip: IpAddr,
    dst_ip: IpAddr,
) -> Option<ParsedPacket> {
    let (src_port, dst_port, tcp_flags, payload) = match proto {
        6 => {
            if frame.len() < offset + 20 {
                return None;
            }
            let src_port = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
            let dst_port = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
            let flags = frame[offset + 13];
            (src_port, dst_port, flags, Vec::new())
        }
        17 => {
            if frame.len() < offset + 8 {
                return None;
            }
            let src_port = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
            let dst_port = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
            (src_port, dst_port, 0, frame[offset + 8..].to_vec())
        }
        _ => (0, 0, 0, Vec::new()),
    };

    Some(ParsedPacket {
        is_ipv6,
        proto,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        tcp_flags,
        payload,
    })
}

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

/// 合成发往宿主的 IPv4 UDP 帧（UDP 校验和置 0，IPv4 下合法）
fn build_udp_frame_v4(
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut pkt = vec![0u8; total_len];

    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // DF
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src_ip.octets());
    pkt[16..20].copy_from_slice(&dst_ip.octets());

    pkt[20..22].copy_from_slice(&src_port.to_be_bytes());
    pkt[22..24].copy_from_slice(&dst_port.to_be_bytes());
    pkt[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
    pkt[28..].copy_from_slice(payload);

    let csum = ipv4_header_checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&csum.to_be_bytes());
    pkt
}

/// 合成发往宿主的 IPv6 UDP 帧（IPv6 下 UDP 校验和必填）
fn build_udp_frame_v6(
    src_ip: Ipv6Addr,
    src_port: u16,
    dst_ip: Ipv6Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let mut pkt = vec![0u8; 40 + udp_len];

    pkt[0] = 0x60;
    pkt[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    pkt[6] = 17; // next header
    pkt[7] = 64; // hop limit
    pkt[8..24].copy_from_slice(&src_ip.octets());
    pkt[24..40].copy_from_slice(&dst_ip.octets());

    pkt[40..42].copy_from_slice(&src_port.to_be_bytes());
    pkt[42..44].copy_from_slice(&dst_port.to_be_bytes());
    pkt[44..46].copy_from_slice(&(udp_len as u16).to_be_bytes());
    pkt[48..].copy_from_slice(payload);

    let csum = udp_checksum_v6(&src_ip, &dst_ip, &pkt[40..]);
    pkt[46..48].copy_from_slice(&csum.to_be_bytes());
    pkt
}

fn add_bytes_to_sum(sum: &mut u32, bytes: &[u8]) {
    let mut i = 0;
    while i + 1 < bytes.len() {
        *sum = sum.wrapping_add(u16::from_be_bytes([bytes[i], bytes[i + 1]]) as u32);
        i += 2;
    }
    if i < bytes.len() {
        *sum = sum.wrapping_add((bytes[i] as u32) << 8);
    }
}

fn udp_checksum_v6(src: &Ipv6Addr, dst: &Ipv6Addr, udp_segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    add_bytes_to_sum(&mut sum, &src.octets());
    add_bytes_to_sum(&mut sum, &dst.octets());
    sum = sum.wrapping_add(udp_segment.len() as u32);
    sum = sum.wrapping_add(17);
    // 跳过 checksum 字段本身（偏移 6..8）
    add_bytes_to_sum(&mut sum, &udp_segment[..6]);
    add_bytes_to_sum(&mut sum, &udp_segment[8..]);

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    let csum = !(sum as u16);
    if csum == 0 {
        0xFFFF
    } else {
        csum
    }
}
