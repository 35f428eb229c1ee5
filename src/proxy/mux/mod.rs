//! 流多路复用：一条 VLESS 连接上承载多个虚拟流。
//!
//! 帧格式: `kind(1) | reserved(1) | len(2 BE)` + `stream_id(2 BE)` + payload，
//! len 计入 stream_id 与 payload。kind: 0x01 New / 0x02 Keep /
//! 0x03 End / 0x04 KeepAlive。UDP 流的数据在 Keep 里再按
//! u16 BE 长度前缀拼接（XUDP 时 New 帧带 8 字节 GlobalID）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::common::error::CoreError;
use crate::common::{Address, ProxyStream, UdpPacket, UdpTransport};
use crate::proxy::vless::protocol::UdpFrameDecoder;
use crate::proxy::vless::{xudp, VlessClient};

type Result<T> = std::result::Result<T, CoreError>;

pub const FRAME_NEW: u8 = 0x01;
pub const FRAME_KEEP: u8 = 0x02;
pub const FRAME_END: u8 = 0x03;
pub const FRAME_KEEPALIVE: u8 = 0x04;

const NETWORK_TCP: u8 = 0x01;
const NETWORK_UDP: u8 = 0x02;

/// 单个 client 的活跃流上限；到顶拒绝开新流，流号不回绕
pub const MAX_SESSIONS: usize = 32;

/// 空闲 KeepAlive 周期
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFrame {
    pub kind: u8,
    pub stream_id: u16,
    pub payload: Vec<u8>,
}

impl MuxFrame {
    pub fn keepalive() -> Self {
        MuxFrame {
            kind: FRAME_KEEPALIVE,
            stream_id: 0,
            payload: Vec::new(),
        }
    }

    pub fn keep(stream_id: u16, payload: Vec<u8>) -> Self {
        MuxFrame {
            kind: FRAME_KEEP,
            stream_id,
            payload,
        }
    }

    pub fn end(stream_id: u16, err: u8) -> Self {
        MuxFrame {
            kind: FRAME_END,
            stream_id,
            payload: vec![err],
        }
    }

    /// New 帧载荷: network | port | atyp | addr | [global_id]
    pub fn new_stream(
        stream_id: u16,
        network_udp: bool,
        target: &Address,
        global_id: Option<[u8; 8]>,
    ) -> Self {
        let mut payload = BytesMut::with_capacity(64);
        payload.put_u8(if network_udp { NETWORK_UDP } else { NETWORK_TCP });
        payload.put_u16(target.port());
        target.encode_vless(&mut payload);
        if let Some(id) = global_id {
            payload.put_slice(&id);
        }
        MuxFrame {
            kind: FRAME_NEW,
            stream_id,
            payload: payload.to_vec(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = 2 + self.payload.len();
        let mut buf = Vec::with_capacity(4 + len);
        buf.push(self.kind);
        buf.push(0); // reserved
        buf.extend_from_slice(&(len as u16).to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(CoreError::ProtocolViolation("mux header truncated".into()));
        }
        let kind = data[0];
        if !(FRAME_NEW..=FRAME_KEEPALIVE).contains(&kind) {
            return Err(CoreError::ProtocolViolation(format!(
                "unknown mux frame kind 0x{:02x}",
                kind
            )));
        }
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if len < 2 {
            return Err(CoreError::ProtocolViolation("mux frame len < 2".into()));
        }
        if data.len() < 4 + len {
            return Err(CoreError::ProtocolViolation("mux frame truncated".into()));
        }
        let stream_id = u16::from_be_bytes([data[4], data[5]]);
        let payload = data[6..4 + len].to_vec();
        Ok((
            MuxFrame {
                kind,
                stream_id,
                payload,
            },
            4 + len,
        ))
    }
}

enum SessionEvent {
    Data(Bytes),
    End,
}

struct SessionEntry {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

type SharedWriter = Arc<Mutex<WriteHalf<ProxyStream>>>;
type SessionTable = Arc<Mutex<HashMap<u16, SessionEntry>>>;

async fn send_frame(writer: &SharedWriter, frame: &MuxFrame) -> Result<()> {
    let bytes = frame.encode();
    let mut guard = writer.lock().await;
    guard.write_all(&bytes).await?;
    guard.flush().await?;
    Ok(())
}

/// 一条 mux 连接：一个 VlessConnection 与至多 32 个活跃流
pub struct MuxClient {
    writer: SharedWriter,
    sessions: SessionTable,
    /// 单调递增，从 1 起；不回绕
    next_id: Mutex<u16>,
    closed: Arc<AtomicBool>,
    reader_task: tokio::task::JoinHandle<()>,
    keepalive_task: tokio::task::JoinHandle<()>,
}

impl MuxClient {
    /// 向默认端点开一条 VLESS 连接并启动帧分发
    pub async fn connect(vless: &VlessClient, keepalive: Duration) -> Result<Arc<Self>> {
        let config = vless.config();
        let endpoint = Address::from_host_port(&config.server_address, config.server_port);
        let stream = vless.connect_tcp(&endpoint).await?;
        Ok(Self::from_stream(stream, keepalive))
    }

    /// 从已就绪的流构建（测试亦走此入口）
    pub fn from_stream(stream: ProxyStream, keepalive: Duration) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(Mutex::new(write_half));
        let sessions: SessionTable = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(reader_loop(
            read_half,
            sessions.clone(),
            closed.clone(),
        ));

        let keepalive_task = {
            let writer = writer.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(keepalive);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // 第一个 tick 立即完成，跳过
                loop {
                    ticker.tick().await;
                    if closed.load(Ordering::Relaxed) {
                        return;
                    }
                    if send_frame(&writer, &MuxFrame::keepalive()).await.is_err() {
                        return;
                    }
                }
            })
        };

        Arc::new(Self {
            writer,
            sessions,
            next_id: Mutex::new(1),
            closed,
            reader_task,
            keepalive_task,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_full(&self) -> bool {
        self.sessions.lock().await.len() >= MAX_SESSIONS
    }

    /// 开一条 UDP 流（XUDP 时带 GlobalID）。到达 32 流上限即拒绝。
    pub async fn open_udp(
        self: Arc<Self>,
        target: &Address,
        global_id: Option<[u8; 8]>,
    ) -> Result<MuxUdpSession> {
        if self.is_closed() {
            return Err(CoreError::TransportDial("mux client closed".into()));
        }

        let (stream_id, rx) = {
            let mut sessions = self.sessions.lock().await;
            if sessions.len() >= MAX_SESSIONS {
                return Err(CoreError::Capacity("mux client at session cap"));
            }
            let mut next_id = self.next_id.lock().await;
            let id = *next_id;
            if id == u16::MAX {
                return Err(CoreError::Capacity("mux stream ids exhausted"));
            }
            *next_id += 1;

            let (tx, rx) = mpsc::unbounded_channel();
            sessions.insert(id, SessionEntry { tx });
            (id, rx)
        };

        let frame = MuxFrame::new_stream(stream_id, true, target, global_id);
        send_frame(&self.writer, &frame).await?;

        Ok(MuxUdpSession {
            client: self,
            stream_id,
            target: target.clone(),
            rx: Mutex::new(rx),
            decoder: Mutex::new(UdpFrameDecoder::new()),
            ready: Mutex::new(std::collections::VecDeque::new()),
        })
    }

    async fn send_keep(&self, stream_id: u16, payload: Vec<u8>) -> Result<()> {
        send_frame(&self.writer, &MuxFrame::keep(stream_id, payload)).await
    }

    async fn close_session(&self, stream_id: u16) {
        let removed = self.sessions.lock().await.remove(&stream_id);
        if removed.is_some() {
            let _ = send_frame(&self.writer, &MuxFrame::end(stream_id, 0)).await;
        }
    }

    /// 同步取消：停任务、标记关闭、给所有流发合成关闭
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.reader_task.abort();
        self.keepalive_task.abort();
        // 清空会话表；发送端析构即合成关闭
        if let Ok(mut sessions) = self.sessions.try_lock() {
            for (_, entry) in sessions.drain() {
                let _ = entry.tx.send(SessionEvent::End);
            }
        }
    }
}

impl Drop for MuxClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// 帧分发循环。帧级错误对整个 client 致命：所有流收到合成关闭。
async fn reader_loop(
    mut read_half: ReadHalf<ProxyStream>,
    sessions: SessionTable,
    closed: Arc<AtomicBool>,
) {
    let fatal = |sessions: &SessionTable, closed: &Arc<AtomicBool>| {
        closed.store(true, Ordering::Relaxed);
        let sessions = sessions.clone();
        async move {
            let mut guard = sessions.lock().await;
            for (_, entry) in guard.drain() {
                let _ = entry.tx.send(SessionEvent::End);
            }
        }
    };

    loop {
        let mut header = [0u8; 4];
        if read_half.read_exact(&mut header).await.is_err() {
            fatal(&sessions, &closed).await;
            return;
        }
        let kind = header[0];
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        if !(FRAME_NEW..=FRAME_KEEPALIVE).contains(&kind) || len < 2 {
            warn!(kind, len, "invalid mux frame, shutting client down");
            fatal(&sessions, &closed).await;
            return;
        }
        let mut rest = vec![0u8; len];
        if read_half.read_exact(&mut rest).await.is_err() {
            fatal(&sessions, &closed).await;
            return;
        }
        let stream_id = u16::from_be_bytes([rest[0], rest[1]]);
        let payload = rest.split_off(2);

        match kind {
            FRAME_KEEP => {
                let guard = sessions.lock().await;
                if let Some(entry) = guard.get(&stream_id) {
                    let _ = entry.tx.send(SessionEvent::Data(Bytes::from(payload)));
                }
                // 未知流的数据丢弃
            }
            FRAME_END => {
                let mut guard = sessions.lock().await;
                if let Some(entry) = guard.remove(&stream_id) {
                    debug!(stream_id, "mux stream ended by peer");
                    let _ = entry.tx.send(SessionEvent::End);
                }
            }
            FRAME_KEEPALIVE => {}
            // 客户端不处理对端发起的 New
            _ => {}
        }
    }
}

/// 一条 mux UDP 流；数据报在 Keep 里按长度前缀拼接
pub struct MuxUdpSession {
    client: Arc<MuxClient>,
    stream_id: u16,
    target: Address,
    rx: Mutex<mpsc::UnboundedReceiver<SessionEvent>>,
    decoder: Mutex<UdpFrameDecoder>,
    ready: Mutex<std::collections::VecDeque<Bytes>>,
}

impl MuxUdpSession {
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// 主动关闭：发 End 并从表中摘除
    pub async fn close(&self) {
        self.client.close_session(self.stream_id).await;
    }
}

#[async_trait]
impl UdpTransport for MuxUdpSession {
    async fn send(&self, packet: UdpPacket) -> anyhow::Result<()> {
        if packet.data.len() > u16::MAX as usize {
            anyhow::bail!("datagram too large: {}", packet.data.len());
        }
        let mut payload = Vec::with_capacity(2 + packet.data.len());
        payload.extend_from_slice(&(packet.data.len() as u16).to_be_bytes());
        payload.extend_from_slice(&packet.data);
        self.client
            .send_keep(self.stream_id, payload)
            .await
            .map_err(|e| anyhow::anyhow!(e))
    }

    async fn recv(&self) -> anyhow::Result<UdpPacket> {
        loop {
            if let Some(datagram) = self.ready.lock().await.pop_front() {
                return Ok(UdpPacket {
                    addr: self.target.clone(),
                    data: datagram,
                });
            }

            let event = self
                .rx
                .lock()
                .await
                .recv()
                .await
                .unwrap_or(SessionEvent::End);
            match event {
                SessionEvent::Data(bytes) => {
                    let frames = self.decoder.lock().await.feed(&bytes);
                    let mut ready = self.ready.lock().await;
                    for f in frames {
                        ready.push_back(f);
                    }
                }
                SessionEvent::End => anyhow::bail!("mux stream closed"),
            }
        }
    }
}

/// 同一默认配置下的一组 MuxClient
pub struct MuxManager {
    vless: Arc<VlessClient>,
    clients: std::sync::Mutex<Vec<Arc<MuxClient>>>,
    keepalive: Duration,
}

impl MuxManager {
    pub fn new(vless: Arc<VlessClient>) -> Self {
        Self::with_keepalive(vless, KEEPALIVE_PERIOD)
    }

    pub fn with_keepalive(vless: Arc<VlessClient>, keepalive: Duration) -> Self {
        Self {
            vless,
            clients: std::sync::Mutex::new(Vec::new()),
            keepalive,
        }
    }

    fn snapshot(&self) -> Vec<Arc<MuxClient>> {
        let mut clients = self.clients.lock().expect("mux client list");
        clients.retain(|c| !c.is_closed());
        clients.clone()
    }

    /// 取第一个未满的活 client；全满或全死就新建
    pub async fn open_udp(&self, target: &Address, src_host: &str, src_port: u16) -> Result<MuxUdpSession> {
        let global_id = if self.vless.config().xudp_enabled {
            Some(xudp::global_id(src_host, src_port))
        } else {
            None
        };

        for client in self.snapshot() {
            if !client.is_full().await {
                return client.open_udp(target, global_id).await;
            }
        }

        let client = MuxClient::connect(&self.vless, self.keepalive).await?;
        let session = client.clone().open_udp(target, global_id).await?;
        self.clients.lock().expect("mux client list").push(client);
        Ok(session)
    }

    /// 同步关闭所有 client（重载拆除路径），所有流收到合成关闭
    pub fn shutdown(&self) {
        let mut clients = self.clients.lock().expect("mux client list");
        for client in clients.drain(..) {
            client.close();
        }
    }
}
