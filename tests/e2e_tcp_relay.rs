//! TCP 中继的端到端字节流场景：FakeIP 路由出代理头、
//! 回压溢出上限、握手超时。

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{
    build_dns_query, build_tcp_frame, build_udp_frame, parse_tcp_frame, parse_udp_frame,
    FakeTunnel, Fixture,
};
use serde_json::json;
use skytun::config::VlessConfig;
use skytun::engine::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const P1: &str = "11111111-1111-1111-1111-111111111111";
const CLIENT_UUID: &str = "550e8400-e29b-41d4-a716-446655440000";

/// 帧层面的迷你 TCP 客户端：对着引擎收发帧完成握手与 ACK
struct TcpPeer {
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    /// 下一个期望的服务端 seq（也是我们 ACK 的值）
    ack: u32,
    /// 已经处理过的输出帧数
    consumed: usize,
}

impl TcpPeer {
    fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            src,
            dst,
            seq: 1000,
            ack: 0,
            consumed: 0,
        }
    }

    async fn handshake(&mut self, engine: &Engine, tunnel: &Arc<FakeTunnel>) {
        let syn = build_tcp_frame(self.src, self.dst, self.seq, 0, 0x02, 65535, &[]);
        engine.input_frames(vec![syn]);
        self.seq += 1;

        let src = self.src;
        let dst = self.dst;
        let synack = tunnel
            .wait_for_frame(
                |f| {
                    parse_tcp_frame(f)
                        .map(|t| t.src == dst && t.dst == src && t.flags & 0x12 == 0x12)
                        .unwrap_or(false)
                },
                5000,
            )
            .await
            .expect("syn-ack");
        let view = parse_tcp_frame(&synack).unwrap();
        self.ack = view.seq.wrapping_add(1);

        let ack = build_tcp_frame(self.src, self.dst, self.seq, self.ack, 0x10, 65535, &[]);
        engine.input_frames(vec![ack]);
    }

    fn send(&mut self, engine: &Engine, payload: &[u8]) {
        let frame = build_tcp_frame(self.src, self.dst, self.seq, self.ack, 0x18, 65535, payload);
        engine.input_frames(vec![frame]);
        self.seq = self.seq.wrapping_add(payload.len() as u32);
    }

    fn send_fin(&mut self, engine: &Engine) {
        let frame = build_tcp_frame(self.src, self.dst, self.seq, self.ack, 0x11, 65535, &[]);
        engine.input_frames(vec![frame]);
        self.seq = self.seq.wrapping_add(1);
    }

    /// 消化新输出帧：收集发给我们的数据、自动回 ACK（window 可调）。
    /// 返回新收到的载荷字节。
    fn pump(&mut self, engine: &Engine, tunnel: &Arc<FakeTunnel>, window: u16) -> Vec<u8> {
        let frames: Vec<Vec<u8>> = {
            let guard = tunnel.frames.lock().unwrap();
            guard[self.consumed.min(guard.len())..]
                .iter()
                .map(|(f, _)| f.clone())
                .collect()
        };
        self.consumed += frames.len();

        let mut received = Vec::new();
        let mut progressed = false;
        for frame in frames {
            let Some(view) = parse_tcp_frame(&frame) else {
                continue;
            };
            if view.src != self.dst || view.dst != self.src {
                continue;
            }
            if !view.payload.is_empty() && view.seq == self.ack {
                received.extend_from_slice(&view.payload);
                self.ack = self.ack.wrapping_add(view.payload.len() as u32);
                progressed = true;
            }
            // FIN 也消耗一个序号
            if view.flags & 0x01 != 0 && view.seq.wrapping_add(view.payload.len() as u32) == self.ack
            {
                self.ack = self.ack.wrapping_add(1);
                progressed = true;
            }
        }
        if progressed {
            let ack = build_tcp_frame(self.src, self.dst, self.seq, self.ack, 0x10, window, &[]);
            engine.input_frames(vec![ack]);
        }
        received
    }

    /// 是否看到了发给我们的 RST
    fn saw_rst(&self, tunnel: &Arc<FakeTunnel>) -> bool {
        let guard = tunnel.frames.lock().unwrap();
        guard.iter().any(|(f, _)| {
            parse_tcp_frame(f)
                .map(|t| t.src == self.dst && t.dst == self.src && t.flags & 0x04 != 0)
                .unwrap_or(false)
        })
    }
}

fn routing_to(port: u16) -> serde_json::Value {
    json!({
        "rules": [{
            "action": "proxy",
            "configId": P1,
            "domainRules": [{"type": "domain", "value": "example.com"}]
        }],
        "configs": { P1: {
            "name": "p1",
            "serverAddress": "127.0.0.1",
            "serverPort": port,
            "uuid": P1
        }}
    })
}

fn default_config() -> VlessConfig {
    VlessConfig::from_dict(&json!({
        "name": "default",
        "serverAddress": "127.0.0.1",
        "serverPort": 1,
        "uuid": CLIENT_UUID
    }))
    .unwrap()
}

/// 场景 2：到 FakeIP 的 TCP 被路由到命中配置，出站首字节是
/// VLESS 请求头（atyp=2, addr="example.com", port=443, cmd=0x01），
/// 随后才是已见到的入站载荷。
#[tokio::test]
async fn tcp_to_fake_ip_emits_vless_header_first() {
    // 假 VLESS 服务端
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();

        // 请求头
        let mut head = vec![0u8; 18];
        sock.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], 0x00); // version
        assert_eq!(&head[1..17], P1.parse::<uuid::Uuid>().unwrap().as_bytes());
        assert_eq!(head[17], 0x00); // addons

        let mut rest = vec![0u8; 4];
        sock.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest[0], 0x01); // CMD_TCP
        assert_eq!(u16::from_be_bytes([rest[1], rest[2]]), 443);
        assert_eq!(rest[3], 0x02); // atyp = domain

        let mut dlen = [0u8; 1];
        sock.read_exact(&mut dlen).await.unwrap();
        assert_eq!(dlen[0] as usize, "example.com".len());
        let mut domain = vec![0u8; dlen[0] as usize];
        sock.read_exact(&mut domain).await.unwrap();
        assert_eq!(&domain, b"example.com");

        // 响应头，然后进入中继
        sock.write_all(&[0x00, 0x00]).await.unwrap();

        // 头之后才是入站载荷
        let mut payload = vec![0u8; 5];
        sock.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"GET /");

        sock.write_all(b"HTTP/1.1 200 OK\r\n").await.unwrap();
    });

    let fixture = Fixture::new();
    fixture.write_routing(&routing_to(port));

    let tunnel = FakeTunnel::new();
    let engine = Engine::start(tunnel.clone(), default_config(), false, fixture.paths.clone())
        .unwrap();

    // DNS: example.com → 198.18.0.1
    let q = build_udp_frame(
        "10.8.0.2:54321".parse().unwrap(),
        "1.1.1.1:53".parse().unwrap(),
        &build_dns_query(0x77, "example.com", 1),
    );
    engine.input_frames(vec![q]);
    let resp = tunnel
        .wait_for_frame(|f| parse_udp_frame(f).is_some(), 2000)
        .await
        .expect("dns answer");
    let rdata = {
        let p = parse_udp_frame(&resp).unwrap().payload;
        p[p.len() - 4..].to_vec()
    };
    assert_eq!(rdata, vec![198, 18, 0, 1]);

    // TCP 到合成地址
    let mut peer = TcpPeer::new(
        "10.8.0.2:50001".parse().unwrap(),
        "198.18.0.1:443".parse().unwrap(),
    );
    peer.handshake(&engine, &tunnel).await;
    peer.send(&engine, b"GET /");

    // 等服务端回显穿过中继回到帧层
    let mut received = Vec::new();
    for _ in 0..200 {
        received.extend_from_slice(&peer.pump(&engine, &tunnel, 65535));
        if received.ends_with(b"200 OK\r\n") {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
    }
    assert_eq!(&received, b"HTTP/1.1 200 OK\r\n");

    server.await.unwrap();
    engine.stop().await;
}

async fn start_bypass_engine(
    dump_len: usize,
) -> (Engine, Arc<FakeTunnel>, u16, tokio::task::JoinHandle<()>) {
    // 直连目标：写 dump_len 字节后关闭
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let chunk = vec![0xABu8; 8192];
        let mut left = dump_len;
        while left > 0 {
            let n = chunk.len().min(left);
            if sock.write_all(&chunk[..n]).await.is_err() {
                return;
            }
            left -= n;
        }
        let _ = sock.shutdown().await;
        // 对端可能晚关，读到 EOF 为止
        let mut sink = vec![0u8; 4096];
        while let Ok(n) = sock.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    });

    let mut fixture = Fixture::new();
    fixture.write_geoip_loopback("ZZ");
    fixture.write_settings(r#"{"ipv6Enabled":false,"dohEnabled":false,"bypassCountryCode":"ZZ"}"#);

    let tunnel = FakeTunnel::new();
    let engine = Engine::start(tunnel.clone(), default_config(), false, fixture.paths.clone())
        .unwrap();
    // fixture 的临时目录活到测试结束
    std::mem::forget(fixture);
    (engine, tunnel, port, server)
}

/// 场景 5（上半）：本地窗口打满、600 KiB 下行 → 溢出超过
/// 512 KiB，流以 RST 终结。
#[tokio::test]
async fn overflow_beyond_cap_aborts() {
    let (engine, tunnel, port, _server) = start_bypass_engine(600 * 1024).await;

    let mut peer = TcpPeer::new(
        "10.8.0.2:50002".parse().unwrap(),
        format!("127.0.0.1:{}", port).parse().unwrap(),
    );
    peer.handshake(&engine, &tunnel).await;
    // 握手后立刻通告零窗口并沉默：栈的发送缓冲填满后
    // 溢出缓冲接住余下下行，过 512 KiB 即判死
    let zero_win = build_tcp_frame(peer.src, peer.dst, peer.seq, peer.ack, 0x10, 0, &[]);
    engine.input_frames(vec![zero_win]);

    let mut aborted = false;
    for _ in 0..600 {
        if peer.saw_rst(&tunnel) {
            aborted = true;
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
    }
    assert!(aborted, "expected RST after overflow cap");

    engine.stop().await;
}

/// 场景 5（下半）：400 KiB 在持续 ACK 之下完整送达并正常收尾
#[tokio::test]
async fn moderate_backlog_drains_cleanly() {
    const LEN: usize = 400 * 1024;
    let (engine, tunnel, port, server) = start_bypass_engine(LEN).await;

    let mut peer = TcpPeer::new(
        "10.8.0.2:50003".parse().unwrap(),
        format!("127.0.0.1:{}", port).parse().unwrap(),
    );
    peer.handshake(&engine, &tunnel).await;

    let mut received = 0usize;
    for _ in 0..2000 {
        received += peer.pump(&engine, &tunnel, 65535).len();
        if received >= LEN {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
    }
    assert_eq!(received, LEN);
    assert!(!peer.saw_rst(&tunnel), "clean drain must not abort");

    peer.send_fin(&engine);
    server.await.unwrap();
    engine.stop().await;
}

/// 边界：本地在出站未建立前就半关——握手计时器仍然管总
/// 时限，出站永远连不上时 60 s 后中止。
#[tokio::test(start_paused = true)]
async fn half_close_before_connect_aborts_on_handshake_timer() {
    // 默认配置指向黑洞端口：拨号挂起（paused time 下不会完成）
    let fixture = Fixture::new();
    fixture.write_routing(&json!({"rules": [], "configs": {}}));

    let tunnel = FakeTunnel::new();
    // 不可达地址 + 无路由：SYN 走默认代理
    let config = VlessConfig::from_dict(&json!({
        "name": "blackhole",
        "serverAddress": "10.255.255.1",
        "serverPort": 65000,
        "uuid": CLIENT_UUID
    }))
    .unwrap();
    let engine = Engine::start(tunnel.clone(), config, false, fixture.paths.clone()).unwrap();

    let mut peer = TcpPeer::new(
        "10.8.0.2:50004".parse().unwrap(),
        "93.184.216.34:80".parse().unwrap(),
    );
    peer.handshake(&engine, &tunnel).await;
    // 立即半关
    peer.send_fin(&engine);

    // 60 s 的握手窗口過後必然 RST（paused time 自动快进）
    let mut aborted = false;
    for _ in 0..700 {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if peer.saw_rst(&tunnel) {
            aborted = true;
            break;
        }
    }
    assert!(aborted, "handshake timer must abort the flow");

    engine.stop().await;
}
