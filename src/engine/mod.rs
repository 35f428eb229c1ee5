//! 数据面引擎：北向接口、栈任务与 writer 任务、重载控制。
//!
//! 两个串行上下文：栈任务拥有栈、FakeIP 池、路由器、全部流
//! 状态与统计；writer 任务只负责把出栈帧交给宿主隧道。
//! 传输 I/O 的完成经 `FlowEvent` 通道回到栈任务。

pub mod stats;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::error::CoreError;
use crate::common::Address;
use crate::config::settings::{Settings, SharedPaths};
use crate::config::VlessConfig;
use crate::dns::fakeip::{ip_to_offset, FakeIpPool};
use crate::dns::interceptor;
use crate::flow::tcp::{
    TcpFlow, TcpOutbound, TcpPhase, HALF_CLOSE_TIMEOUT, HANDSHAKE_TIMEOUT, IDLE_TIMEOUT,
    LocalEvent, MAX_WRITE_CHUNK, OVERFLOW_CAP,
};
use crate::flow::udp::{UdpFlow, UdpOutbound, IDLE_TIMEOUT as UDP_IDLE, MAX_FLOWS};
use crate::flow::{FlowEvent, UdpFlowKey};
use crate::proxy::mux::MuxManager;
use crate::proxy::vless::VlessClient;
use crate::router::geoip::GeoIpDb;
use crate::router::DomainRouter;
use crate::stack::{NetStack, StackEvent};
use stats::Stats;

/// 栈 tick 周期
const STACK_TICK: Duration = Duration::from_millis(250);
/// UDP 清扫周期
const UDP_SWEEP: Duration = Duration::from_secs(1);

/// 宿主隧道门面：输出帧下沉 + 网络设置重施加
pub trait HostTunnel: Send + Sync {
    /// 一批发往宿主的帧，附带协议族
    fn write_frames(&self, frames: Vec<(Vec<u8>, bool)>);
    /// IPv6 开关变化时请求宿主重新应用网络设置
    fn request_reapply(&self);
}

enum Command {
    Frames(Vec<Vec<u8>>),
    SettingsChanged,
    RoutingChanged,
    SwitchConfig {
        config: Arc<VlessConfig>,
        ipv6: Option<bool>,
    },
    Stop(oneshot::Sender<()>),
}

/// 数据面引擎句柄
pub struct Engine {
    cmd_tx: mpsc::UnboundedSender<Command>,
    stats: Arc<Stats>,
}

impl Engine {
    /// 启动：校验配置、装载共享状态、起栈任务与 writer 任务。
    /// 启动失败（配置无效）同步上报。
    pub fn start(
        tunnel: Arc<dyn HostTunnel>,
        config: VlessConfig,
        ipv6_enabled: bool,
        paths: SharedPaths,
    ) -> Result<Self, CoreError> {
        let default_config = Arc::new(config);
        let default_client = Arc::new(VlessClient::new(default_config.clone())?);

        let stats = Arc::new(Stats::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        // writer 任务：唯一消费者，不回头摸栈
        let writer_tunnel = tunnel.clone();
        tokio::spawn(writer_loop(output_rx, writer_tunnel));

        let mut settings = Settings::load(&paths.settings_path);
        settings.ipv6_enabled = ipv6_enabled;

        let router = DomainRouter::load(&paths.routing_path).unwrap_or_else(|e| {
            warn!(error = %e, "routing document unreadable, starting with empty rules");
            DomainRouter::empty()
        });
        let routing_raw = std::fs::read(&paths.routing_path).unwrap_or_default();

        let geoip = paths.geoip_path.as_ref().and_then(|p| match GeoIpDb::load(p) {
            Ok(db) => Some(db),
            Err(e) => {
                warn!(error = %e, "geoip database unavailable, bypass disabled");
                None
            }
        });

        let mux = build_mux(&default_config, &default_client);

        let core = Core {
            stack: NetStack::new(settings.ipv6_enabled),
            pool: FakeIpPool::new(),
            router,
            routing_raw,
            settings,
            geoip,
            paths,
            tunnel,
            default_config,
            default_client,
            clients: HashMap::new(),
            mux,
            tcp_flows: HashMap::new(),
            udp_flows: HashMap::new(),
            stats: stats.clone(),
            output_tx,
            evt_tx,
        };

        tokio::spawn(core.run(cmd_rx, evt_rx));

        info!("tunnel engine started");
        Ok(Self { cmd_tx, stats })
    }

    /// 宿主下发一批原始 IP 帧
    pub fn input_frames(&self, frames: Vec<Vec<u8>>) {
        let _ = self.cmd_tx.send(Command::Frames(frames));
    }

    /// 整体停机；完成后统计归零
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
        self.stats.reset();
    }

    /// 切换默认配置（可同时指定 IPv6 开关）
    pub fn switch_config(&self, config: VlessConfig, ipv6: Option<bool>) -> Result<(), CoreError> {
        // 准入在调用线程完成，非法配置不进栈任务
        let config = Arc::new(config);
        VlessClient::new(config.clone())?;
        let _ = self.cmd_tx.send(Command::SwitchConfig { config, ipv6 });
        Ok(())
    }

    pub fn read_stats(&self) -> (u64, u64) {
        self.stats.read()
    }

    pub fn notify_settings_changed(&self) {
        let _ = self.cmd_tx.send(Command::SettingsChanged);
    }

    pub fn notify_routing_changed(&self) {
        let _ = self.cmd_tx.send(Command::RoutingChanged);
    }
}

async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<(Vec<u8>, bool)>,
    tunnel: Arc<dyn HostTunnel>,
) {
    while let Some(first) = rx.recv().await {
        // 聚批：把已经排队的帧一次交给宿主
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
            if batch.len() >= 128 {
                break;
            }
        }
        tunnel.write_frames(batch);
    }
}

fn build_mux(config: &Arc<VlessConfig>, client: &Arc<VlessClient>) -> Option<Arc<MuxManager>> {
    if config.flow.is_active() && config.mux_enabled {
        Some(Arc::new(MuxManager::new(client.clone())))
    } else {
        None
    }
}

struct Core {
    stack: NetStack,
    pool: FakeIpPool,
    router: DomainRouter,
    /// routing.json 原文，用于 diff
    routing_raw: Vec<u8>,
    settings: Settings,
    geoip: Option<GeoIpDb>,
    paths: SharedPaths,
    tunnel: Arc<dyn HostTunnel>,
    default_config: Arc<VlessConfig>,
    default_client: Arc<VlessClient>,
    /// 非默认代理配置的客户端缓存
    clients: HashMap<Uuid, Arc<VlessClient>>,
    mux: Option<Arc<MuxManager>>,
    tcp_flows: HashMap<u32, TcpFlow>,
    udp_flows: HashMap<UdpFlowKey, UdpFlow>,
    stats: Arc<Stats>,
    output_tx: mpsc::UnboundedSender<(Vec<u8>, bool)>,
    evt_tx: mpsc::UnboundedSender<FlowEvent>,
}

impl Core {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut evt_rx: mpsc::UnboundedReceiver<FlowEvent>,
    ) {
        let mut tick = tokio::time::interval(STACK_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(UDP_SWEEP);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Frames(frames)) => self.handle_frames(frames),
                    Some(Command::SettingsChanged) | Some(Command::RoutingChanged) => {
                        self.reload(None, None, false);
                    }
                    Some(Command::SwitchConfig { config, ipv6 }) => {
                        self.reload(Some(config), ipv6, true);
                    }
                    Some(Command::Stop(ack)) => {
                        self.teardown();
                        self.pool.clear();
                        let _ = ack.send(());
                        info!("tunnel engine stopped");
                        return;
                    }
                    None => return,
                },
                ev = evt_rx.recv() => {
                    if let Some(ev) = ev {
                        self.handle_flow_event(ev);
                    }
                }
                _ = tick.tick() => self.handle_tick(),
                _ = sweep.tick() => self.sweep_udp(),
            }
        }
    }

    // ── 入帧与栈事件 ──────────────────────────────────────────

    fn handle_frames(&mut self, frames: Vec<Vec<u8>>) {
        let mut events = Vec::new();
        for frame in frames {
            self.stats.add_out(frame.len() as u64);
            self.stack.input(&frame, &mut events);
        }
        self.dispatch(events);
    }

    fn dispatch(&mut self, events: Vec<StackEvent>) {
        for event in events {
            match event {
                StackEvent::Output { frame, is_ipv6 } => {
                    self.stats.add_in(frame.len() as u64);
                    let _ = self.output_tx.send((frame, is_ipv6));
                }
                StackEvent::TcpSyn {
                    src,
                    dst,
                    is_ipv6: _,
                    frame,
                } => self.on_tcp_syn(src, dst, frame),
                StackEvent::TcpRecv { slot, data } => self.on_tcp_recv(slot, data),
                StackEvent::TcpSent { slot, bytes } => self.on_tcp_sent(slot, bytes),
                StackEvent::TcpClosed { slot } => self.on_tcp_closed(slot),
                StackEvent::UdpRecv {
                    src,
                    dst,
                    is_ipv6,
                    payload,
                } => self.on_udp_recv(src, dst, is_ipv6, payload),
            }
        }
    }

    // ── TCP ───────────────────────────────────────────────────

    fn on_tcp_syn(&mut self, src: std::net::SocketAddr, dst: std::net::SocketAddr, frame: Vec<u8>) {
        let mut events = Vec::new();

        // 目的解析：FakeIP 段内查池，miss 拒绝（池逐出 vs 陈旧套接字竞态）
        let routed = if let Some(offset) = ip_to_offset(dst.ip()) {
            let entry = self
                .pool
                .lookup(offset)
                .map(|e| (e.domain.clone(), e.config.clone(), e.is_direct));
            match entry {
                Some((domain, config, is_direct)) => {
                    let dest = Address::Domain(domain, dst.port());
                    if is_direct {
                        Some((dest, TcpOutbound::Direct))
                    } else {
                        let config = config.expect("proxy entry carries config");
                        let client = self.client_for(&config);
                        Some((dest, TcpOutbound::Vless(client)))
                    }
                }
                None => {
                    debug!(dst = %dst, "fake-ip miss, rejecting accept");
                    None
                }
            }
        } else {
            let dest = Address::Ip(dst);
            if self.geoip_bypass(dst.ip()) {
                Some((dest, TcpOutbound::Direct))
            } else {
                Some((dest, TcpOutbound::Vless(self.default_client.clone())))
            }
        };

        match routed {
            Some((dest, outbound)) => {
                let slot = self.stack.accept(src, dst, frame, &mut events);
                let flow = TcpFlow::spawn(slot, dest, outbound, self.evt_tx.clone());
                self.tcp_flows.insert(slot, flow);
            }
            None => self.stack.reject(frame, &mut events),
        }
        self.dispatch(events);
    }

    fn geoip_bypass(&self, ip: std::net::IpAddr) -> bool {
        if self.settings.bypass_country == 0 {
            return false;
        }
        match (ip, &self.geoip) {
            (std::net::IpAddr::V4(v4), Some(db)) => db.lookup(v4) == self.settings.bypass_country,
            _ => false,
        }
    }

    fn client_for(&mut self, config: &VlessConfig) -> Arc<VlessClient> {
        if config.uuid == self.default_config.uuid {
            return self.default_client.clone();
        }
        if let Some(client) = self.clients.get(&config.uuid) {
            return client.clone();
        }
        // 配置在准入时已校验过，这里构建不应失败；失败则退回默认
        match VlessClient::new(Arc::new(config.clone())) {
            Ok(client) => {
                let client = Arc::new(client);
                self.clients.insert(config.uuid, client.clone());
                client
            }
            Err(e) => {
                warn!(error = %e, "per-config client build failed, using default");
                self.default_client.clone()
            }
        }
    }

    fn on_tcp_recv(&mut self, slot: u32, data: Vec<u8>) {
        let Some(flow) = self.tcp_flows.get_mut(&slot) else {
            return;
        };
        flow.touch();

        if data.is_empty() {
            // 本地半关
            flow.local_eof = true;
            let _ = flow.to_outbound.send(LocalEvent::Eof);
            match flow.phase {
                TcpPhase::Established => {
                    flow.phase = TcpPhase::UplinkHalfClosed;
                    flow.half_close_since = Some(Instant::now());
                }
                TcpPhase::DownlinkHalfClosed => {
                    self.finish_flow(slot);
                }
                // Connecting 中半关：握手计时器继续管总时限
                _ => {}
            }
            return;
        }

        let _ = flow.to_outbound.send(LocalEvent::Data(Bytes::from(data)));
    }

    fn on_tcp_sent(&mut self, slot: u32, _bytes: u16) {
        let Some(flow) = self.tcp_flows.get_mut(&slot) else {
            return;
        };
        flow.touch();

        // 本地 ACK 腾出余量 → 排溢出
        if !flow.overflow.is_empty() {
            let mut events = Vec::new();
            loop {
                let sndbuf = self.stack.tcp_sndbuf(slot) as usize;
                if sndbuf == 0 || flow.overflow.is_empty() {
                    break;
                }
                let n = sndbuf.min(flow.overflow.len()).min(MAX_WRITE_CHUNK);
                let written = self.stack.tcp_write(slot, &flow.overflow[..n]);
                if written == 0 {
                    break;
                }
                use bytes::Buf;
                flow.overflow.advance(written);
            }
            self.stack.tcp_output(&mut events);
            if flow.overflow.is_empty() && flow.outbound_eof {
                self.close_local_side(slot, &mut events);
            }
            self.dispatch(events);
        }
    }

    /// 出站→本地一块数据：写栈，余量不够进溢出，溢出超限判死
    fn on_outbound_data(&mut self, slot: u32, data: Bytes, resume: oneshot::Sender<()>) {
        let Some(flow) = self.tcp_flows.get_mut(&slot) else {
            return;
        };
        flow.touch();

        let mut events = Vec::new();
        let mut offset = 0usize;
        if flow.overflow.is_empty() {
            while offset < data.len() {
                let sndbuf = self.stack.tcp_sndbuf(slot) as usize;
                if sndbuf == 0 {
                    break;
                }
                let n = sndbuf.min(data.len() - offset).min(MAX_WRITE_CHUNK);
                let written = self.stack.tcp_write(slot, &data[offset..offset + n]);
                if written == 0 {
                    break;
                }
                offset += written;
            }
        }
        if offset < data.len() {
            flow.overflow.extend_from_slice(&data[offset..]);
        }
        self.stack.tcp_output(&mut events);

        if flow.overflow.len() > OVERFLOW_CAP {
            warn!(
                slot,
                buffered = flow.overflow.len(),
                "{}",
                CoreError::BackpressureOverflow(flow.overflow.len())
            );
            self.dispatch(events);
            self.abort_flow(slot);
            return;
        }

        // 本块已入栈或入溢出，放行下一块；真正的背压是 512 KiB 上限
        let _ = resume.send(());
        self.dispatch(events);
    }

    fn on_outbound_ready(&mut self, slot: u32) {
        let Some(flow) = self.tcp_flows.get_mut(&slot) else {
            return;
        };
        flow.touch();
        if flow.phase == TcpPhase::Connecting {
            flow.phase = if flow.local_eof {
                flow.half_close_since = Some(Instant::now());
                TcpPhase::UplinkHalfClosed
            } else {
                TcpPhase::Established
            };
            debug!(slot, dest = %flow.dest, "tcp outbound established");
        }
    }

    fn on_outbound_eof(&mut self, slot: u32) {
        let Some(flow) = self.tcp_flows.get_mut(&slot) else {
            return;
        };
        flow.touch();
        flow.outbound_eof = true;

        if flow.overflow.is_empty() {
            let mut events = Vec::new();
            self.close_local_side(slot, &mut events);
            self.dispatch(events);
        }
        // 溢出未排空时推迟到 on_tcp_sent
    }

    /// 出站读尽且溢出已排空：FIN 本地侧并推进状态机
    fn close_local_side(&mut self, slot: u32, events: &mut Vec<StackEvent>) {
        let Some(flow) = self.tcp_flows.get_mut(&slot) else {
            return;
        };
        self.stack.tcp_close(slot, events);
        match flow.phase {
            TcpPhase::Established | TcpPhase::Connecting => {
                flow.phase = TcpPhase::DownlinkHalfClosed;
                flow.half_close_since = Some(Instant::now());
            }
            TcpPhase::UplinkHalfClosed => {
                flow.phase = TcpPhase::Closed;
            }
            _ => {}
        }
        if flow.both_done() {
            self.finish_flow(slot);
        }
    }

    /// 优雅终结：标记 Closed，等栈回收槽位
    fn finish_flow(&mut self, slot: u32) {
        let mut events = Vec::new();
        if let Some(flow) = self.tcp_flows.get_mut(&slot) {
            if !flow.phase.is_terminal() {
                flow.phase = TcpPhase::Closed;
            }
            // 溢出先落盘再关
            if flow.overflow.is_empty() {
                self.stack.tcp_close(slot, &mut events);
            }
        }
        self.dispatch(events);
    }

    fn abort_flow(&mut self, slot: u32) {
        let mut events = Vec::new();
        if let Some(mut flow) = self.tcp_flows.remove(&slot) {
            flow.shutdown(TcpPhase::Aborted);
            self.stack.tcp_abort(slot, &mut events);
        }
        self.dispatch(events);
    }

    fn on_tcp_closed(&mut self, slot: u32) {
        if let Some(mut flow) = self.tcp_flows.remove(&slot) {
            flow.shutdown(if flow.phase == TcpPhase::Aborted {
                TcpPhase::Aborted
            } else {
                TcpPhase::Closed
            });
            debug!(slot, "tcp flow released");
        }
    }

    // ── UDP ───────────────────────────────────────────────────

    fn on_udp_recv(
        &mut self,
        src: std::net::SocketAddr,
        dst: std::net::SocketAddr,
        is_ipv6: bool,
        payload: Vec<u8>,
    ) {
        // DNS 拦截永远先试；合成的应答不建流
        if dst.port() == interceptor::DNS_PORT {
            if let Some(response) = interceptor::intercept(
                &payload,
                &self.router,
                &mut self.pool,
                self.settings.doh_enabled,
                self.settings.ipv6_enabled,
            ) {
                let mut events = Vec::new();
                self.stack
                    .udp_sendto(dst, src, is_ipv6, &response, &mut events);
                self.dispatch(events);
                return;
            }
        }

        let key: UdpFlowKey = (src, dst);
        if let Some(flow) = self.udp_flows.get_mut(&key) {
            flow.offer(Bytes::from(payload));
            return;
        }

        if self.udp_flows.len() >= MAX_FLOWS {
            debug!("{}", CoreError::Capacity("udp flow cap reached"));
            return;
        }

        // vision（非 udp443 变体）下丢弃代理 UDP 443，迫使应用退回 TCP
        let quic_blocked = |config: &VlessConfig| {
            config.flow == crate::config::VisionFlow::Vision && dst.port() == 443
        };

        // 首包：解析目的与路径
        let (dest, outbound) = if let Some(offset) = ip_to_offset(dst.ip()) {
            let entry = self
                .pool
                .lookup(offset)
                .map(|e| (e.domain.clone(), e.config.clone(), e.is_direct));
            match entry {
                Some((domain, config, is_direct)) => {
                    let dest = Address::Domain(domain, dst.port());
                    if is_direct {
                        (dest, UdpOutbound::Direct)
                    } else {
                        let config = config.expect("proxy entry carries config");
                        if quic_blocked(&config) {
                            debug!(dst = %dst, "dropping udp 443 under vision flow");
                            return;
                        }
                        let outbound = self.udp_path_for(&config);
                        (dest, outbound)
                    }
                }
                None => {
                    debug!(dst = %dst, "fake-ip miss for udp, dropping");
                    return;
                }
            }
        } else if self.geoip_bypass(dst.ip()) {
            (Address::Ip(dst), UdpOutbound::Direct)
        } else {
            let config = self.default_config.clone();
            if quic_blocked(&config) {
                debug!(dst = %dst, "dropping udp 443 under vision flow");
                return;
            }
            (Address::Ip(dst), self.udp_path_for(&config))
        };

        let mut flow = UdpFlow::spawn(
            key,
            dest,
            outbound,
            src.ip().to_string(),
            self.evt_tx.clone(),
        );
        flow.offer(Bytes::from(payload));
        self.udp_flows.insert(key, flow);
    }

    /// 代理 UDP 的路径：默认配置开了 Vision+Mux 就走 mux，否则专连
    fn udp_path_for(&mut self, config: &VlessConfig) -> UdpOutbound {
        if config.uuid == self.default_config.uuid {
            if let Some(mux) = &self.mux {
                return UdpOutbound::Mux(mux.clone());
            }
        }
        UdpOutbound::Vless(self.client_for(config))
    }

    // ── 流事件 ────────────────────────────────────────────────

    fn handle_flow_event(&mut self, event: FlowEvent) {
        match event {
            FlowEvent::TcpOutboundReady { slot } => self.on_outbound_ready(slot),
            FlowEvent::TcpOutboundData { slot, data, resume } => {
                self.on_outbound_data(slot, data, resume)
            }
            FlowEvent::TcpOutboundEof { slot } => self.on_outbound_eof(slot),
            FlowEvent::TcpOutboundError { slot, error } => {
                debug!(slot, error = error.as_str(), "tcp outbound failed");
                self.abort_flow(slot);
            }
            FlowEvent::TcpLocalDelivered { slot, n } => {
                // 发送完成 → 归还接收窗口
                let mut events = Vec::new();
                let mut remaining = n;
                while remaining > 0 {
                    let chunk = remaining.min(u16::MAX as usize);
                    self.stack.tcp_recved(slot, chunk as u16, &mut events);
                    remaining -= chunk;
                }
                self.dispatch(events);
            }
            FlowEvent::UdpReady { key } => {
                if let Some(flow) = self.udp_flows.get_mut(&key) {
                    flow.mark_ready();
                }
            }
            FlowEvent::UdpResponse { key, payload } => {
                let Some(flow) = self.udp_flows.get_mut(&key) else {
                    return;
                };
                flow.touch();
                let (src, dst) = key;
                let is_ipv6 = src.is_ipv6();
                let mut events = Vec::new();
                // 源目互换：让本地侧看到一个应答
                self.stack.udp_sendto(dst, src, is_ipv6, &payload, &mut events);
                self.dispatch(events);
            }
            FlowEvent::UdpError { key } => {
                if let Some(flow) = self.udp_flows.remove(&key) {
                    flow.shutdown();
                }
            }
        }
    }

    // ── 定时器 ────────────────────────────────────────────────

    fn handle_tick(&mut self) {
        let mut events = Vec::new();
        self.stack.check_timeouts(&mut events);
        self.dispatch(events);

        let now = Instant::now();
        let mut expired = Vec::new();
        for (slot, flow) in &self.tcp_flows {
            let dead = match flow.phase {
                TcpPhase::Connecting => now.duration_since(flow.created) > HANDSHAKE_TIMEOUT,
                TcpPhase::Established => now.duration_since(flow.last_activity) > IDLE_TIMEOUT,
                TcpPhase::UplinkHalfClosed | TcpPhase::DownlinkHalfClosed => flow
                    .half_close_since
                    .map(|t| now.duration_since(t) > HALF_CLOSE_TIMEOUT)
                    .unwrap_or(false),
                _ => false,
            };
            if dead {
                expired.push(*slot);
            }
        }
        for slot in expired {
            // 超时静默关闭，不上报
            debug!(slot, "tcp flow timed out");
            self.abort_flow(slot);
        }
    }

    fn sweep_udp(&mut self) {
        let now = Instant::now();
        let expired: Vec<UdpFlowKey> = self
            .udp_flows
            .iter()
            .filter(|(_, flow)| flow.idle_for(now) > UDP_IDLE)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            if let Some(flow) = self.udp_flows.remove(&key) {
                debug!(src = %key.0, dst = %key.1, "udp flow idle, closing");
                flow.shutdown();
            }
        }
    }

    // ── 重载 ──────────────────────────────────────────────────

    /// 设置/路由变更与配置切换共用的重载路径（§ 重载控制器）。
    /// 拆除中的错误只记日志，新栈照常启动。
    fn reload(
        &mut self,
        new_default: Option<Arc<VlessConfig>>,
        ipv6_override: Option<bool>,
        force: bool,
    ) {
        let new_settings = {
            let mut s = Settings::load(&self.paths.settings_path);
            if let Some(v6) = ipv6_override {
                s.ipv6_enabled = v6;
            }
            s
        };
        let new_routing_raw = std::fs::read(&self.paths.routing_path).unwrap_or_default();

        let settings_changed = new_settings != self.settings;
        let routing_changed = new_routing_raw != self.routing_raw;
        if !force && !settings_changed && !routing_changed {
            debug!("change notification with no effective diff, skipping reload");
            return;
        }

        info!(
            settings_changed,
            routing_changed,
            switching = new_default.is_some(),
            "reloading data plane"
        );

        if new_settings.ipv6_enabled != self.settings.ipv6_enabled {
            self.tunnel.request_reapply();
        }

        // 拆除
        self.teardown();

        // 重载
        self.settings = new_settings;
        self.router = match DomainRouter::load(&self.paths.routing_path) {
            Ok(router) => router,
            Err(e) => {
                warn!("{}", CoreError::StackReload(e.to_string()));
                DomainRouter::empty()
            }
        };
        self.routing_raw = new_routing_raw;

        if let Some(config) = new_default {
            match VlessClient::new(config.clone()) {
                Ok(client) => {
                    self.default_config = config;
                    self.default_client = Arc::new(client);
                }
                Err(e) => warn!("{}", CoreError::StackReload(e.to_string())),
            }
        }
        self.clients.clear();

        // 池按新路由重建（不清空）
        self.pool.rebuild(&self.router);

        self.mux = build_mux(&self.default_config, &self.default_client);

        // 重建栈，恢复收包
        self.stack = NetStack::new(self.settings.ipv6_enabled);
        info!("data plane reloaded");
    }

    /// 停定时器由调用方负责（select 分支无状态）；这里取消所有
    /// 流、关 mux、丢栈。
    fn teardown(&mut self) {
        for (_, mut flow) in self.tcp_flows.drain() {
            flow.shutdown(TcpPhase::Aborted);
        }
        for (_, flow) in self.udp_flows.drain() {
            flow.shutdown();
        }
        if let Some(mux) = self.mux.take() {
            mux.shutdown();
        }
    }
}
