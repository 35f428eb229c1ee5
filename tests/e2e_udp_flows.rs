//! UDP 流的端到端场景：直连回显、200 流上限、VLESS UDP 长度帧。

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{build_udp_frame, parse_udp_frame, FakeTunnel, Fixture};
use serde_json::json;
use skytun::config::VlessConfig;
use skytun::engine::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const CLIENT_UUID: &str = "550e8400-e29b-41d4-a716-446655440000";

fn default_config_to(port: u16) -> VlessConfig {
    VlessConfig::from_dict(&json!({
        "name": "default",
        "serverAddress": "127.0.0.1",
        "serverPort": port,
        "uuid": CLIENT_UUID
    }))
    .unwrap()
}

/// GeoIP 绕行环境：127.0.0.0/8 → ZZ 直连
async fn start_bypass_engine() -> (Engine, Arc<FakeTunnel>) {
    let mut fixture = Fixture::new();
    fixture.write_geoip_loopback("ZZ");
    fixture.write_settings(r#"{"ipv6Enabled":false,"dohEnabled":false,"bypassCountryCode":"ZZ"}"#);

    let tunnel = FakeTunnel::new();
    let engine = Engine::start(
        tunnel.clone(),
        default_config_to(1),
        false,
        fixture.paths.clone(),
    )
    .unwrap();
    std::mem::forget(fixture);
    (engine, tunnel)
}

async fn spawn_udp_echo() -> SocketAddr {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

/// 直连路径回显：回包源目互换地回到本地侧
#[tokio::test]
async fn direct_udp_echo_roundtrip() {
    let echo = spawn_udp_echo().await;
    let (engine, tunnel) = start_bypass_engine().await;

    let src: SocketAddr = "10.8.0.2:41000".parse().unwrap();
    let dst: SocketAddr = SocketAddr::new("127.0.0.1".parse().unwrap(), echo.port());

    engine.input_frames(vec![build_udp_frame(src, dst, b"echo me")]);

    let frame = tunnel
        .wait_for_frame(
            |f| {
                parse_udp_frame(f)
                    .map(|u| u.payload == b"echo me")
                    .unwrap_or(false)
            },
            3000,
        )
        .await
        .expect("echoed datagram");
    let view = parse_udp_frame(&frame).unwrap();
    // 源目互换
    assert_eq!(view.src, dst);
    assert_eq!(view.dst, src);

    engine.stop().await;
}

/// 同一 5 元组复用同一个流（后续包不再建流）
#[tokio::test]
async fn same_tuple_reuses_flow() {
    let echo = spawn_udp_echo().await;
    let (engine, tunnel) = start_bypass_engine().await;

    let src: SocketAddr = "10.8.0.2:41001".parse().unwrap();
    let dst: SocketAddr = SocketAddr::new("127.0.0.1".parse().unwrap(), echo.port());

    for i in 0..3u8 {
        engine.input_frames(vec![build_udp_frame(src, dst, &[b'm', i])]);
    }

    for i in 0..3u8 {
        let want = vec![b'm', i];
        assert!(
            tunnel
                .wait_for_frame(
                    |f| parse_udp_frame(f).map(|u| u.payload == want).unwrap_or(false),
                    3000,
                )
                .await
                .is_some(),
            "datagram {} must round-trip in order",
            i
        );
    }

    engine.stop().await;
}

/// 场景 4：200 流上限。第 201 个新 5 元组的包静默丢弃，
/// 既有流继续工作。
#[tokio::test]
async fn udp_flow_cap_drops_201st() {
    let echo = spawn_udp_echo().await;
    let (engine, tunnel) = start_bypass_engine().await;

    let dst: SocketAddr = SocketAddr::new("127.0.0.1".parse().unwrap(), echo.port());

    // 开满 200 个流（不同源端口）
    let frames: Vec<Vec<u8>> = (0..200u16)
        .map(|i| {
            let src: SocketAddr = format!("10.8.0.2:{}", 42000 + i).parse().unwrap();
            build_udp_frame(src, dst, format!("flow-{}", i).as_bytes())
        })
        .collect();
    engine.input_frames(frames);

    // 第 1 个流的回显到位说明流已建立
    assert!(
        tunnel
            .wait_for_frame(
                |f| parse_udp_frame(f)
                    .map(|u| u.payload == b"flow-0")
                    .unwrap_or(false),
                5000,
            )
            .await
            .is_some()
    );
    // 给其余流一点建立时间
    tokio::time::sleep(tokio::time::Duration::from_millis(300)).await;

    // 第 201 个 5 元组
    let extra_src: SocketAddr = "10.8.0.2:49999".parse().unwrap();
    engine.input_frames(vec![build_udp_frame(extra_src, dst, b"overflow-flow")]);

    // 不应出现它的回显
    assert!(
        tunnel
            .wait_for_frame(
                |f| parse_udp_frame(f)
                    .map(|u| u.payload == b"overflow-flow")
                    .unwrap_or(false),
                500,
            )
            .await
            .is_none(),
        "201st flow must be silently dropped"
    );

    // 既有流仍然工作
    let src0: SocketAddr = "10.8.0.2:42000".parse().unwrap();
    engine.input_frames(vec![build_udp_frame(src0, dst, b"still-alive")]);
    assert!(
        tunnel
            .wait_for_frame(
                |f| parse_udp_frame(f)
                    .map(|u| u.payload == b"still-alive")
                    .unwrap_or(false),
                3000,
            )
            .await
            .is_some(),
        "existing flows must keep working at cap"
    );

    engine.stop().await;
}

/// 非绕行路径：数据报经 VLESS UDP 连接（u16 长度帧）出站
#[tokio::test]
async fn proxied_udp_uses_length_framing() {
    // 假 VLESS 服务端：校验 UDP 请求头，回一帧
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();

        let mut head = vec![0u8; 18];
        sock.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], 0x00);
        assert_eq!(head[17], 0x00);
        let mut rest = vec![0u8; 4];
        sock.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest[0], 0x02); // CMD_UDP
        assert_eq!(rest[3], 0x01); // atyp ipv4（非 fake 段按字面地址走）
        let mut addr = vec![0u8; 4];
        sock.read_exact(&mut addr).await.unwrap();
        assert_eq!(addr, vec![9, 9, 9, 9]);

        sock.write_all(&[0x00, 0x00]).await.unwrap();

        // 一帧上行
        let len = sock.read_u16().await.unwrap() as usize;
        let mut q = vec![0u8; len];
        sock.read_exact(&mut q).await.unwrap();
        assert_eq!(&q, b"proxied query");

        // 一帧下行
        sock.write_all(&6u16.to_be_bytes()).await.unwrap();
        sock.write_all(b"answer").await.unwrap();
    });

    let fixture = Fixture::new();
    let tunnel = FakeTunnel::new();
    let engine = Engine::start(
        tunnel.clone(),
        default_config_to(port),
        false,
        fixture.paths.clone(),
    )
    .unwrap();

    let src: SocketAddr = "10.8.0.2:41002".parse().unwrap();
    let dst: SocketAddr = "9.9.9.9:4444".parse().unwrap();
    engine.input_frames(vec![build_udp_frame(src, dst, b"proxied query")]);

    let frame = tunnel
        .wait_for_frame(
            |f| {
                parse_udp_frame(f)
                    .map(|u| u.payload == b"answer")
                    .unwrap_or(false)
            },
            3000,
        )
        .await
        .expect("proxied answer");
    let view = parse_udp_frame(&frame).unwrap();
    assert_eq!(view.src, dst);
    assert_eq!(view.dst, src);

    server.await.unwrap();
    engine.stop().await;
}
