//! 指纹化 ClientHello 构造与 Reality 认证子。
//!
//! 同一指纹标签在相同随机数与密钥下必须产出字节级相同的
//! ClientHello，对端靠这一点识别被模拟的客户端。
//! client_random = 24 字节随机 || 8 字节认证子。

use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::config::Fingerprint;

pub const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
pub const HANDSHAKE_SERVER_HELLO: u8 = 0x02;
pub const HANDSHAKE_ENCRYPTED_EXTENSIONS: u8 = 0x08;
pub const HANDSHAKE_CERTIFICATE: u8 = 0x0b;
pub const HANDSHAKE_CERTIFICATE_VERIFY: u8 = 0x0f;
pub const HANDSHAKE_FINISHED: u8 = 0x14;

const EXT_SERVER_NAME: u16 = 0;
const EXT_STATUS_REQUEST: u16 = 5;
const EXT_SUPPORTED_GROUPS: u16 = 10;
const EXT_EC_POINT_FORMATS: u16 = 11;
const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
const EXT_ALPN: u16 = 16;
const EXT_SIGNED_CERT_TIMESTAMP: u16 = 18;
const EXT_EXTENDED_MASTER_SECRET: u16 = 23;
const EXT_COMPRESS_CERTIFICATE: u16 = 27;
const EXT_SESSION_TICKET: u16 = 35;
const EXT_SUPPORTED_VERSIONS: u16 = 43;
const EXT_PSK_KEY_EXCHANGE_MODES: u16 = 45;
const EXT_KEY_SHARE: u16 = 51;
const EXT_RENEGOTIATION_INFO: u16 = 0xff01;

/// 确定性 GREASE 值（指纹要求同输入同输出）
const GREASE: u16 = 0x1a1a;
/// 扩展表中的 GREASE 占位
const EXT_GREASE: u16 = 0xfafa;

const GROUP_X25519: u16 = 0x001d;

struct FingerprintSpec {
    ciphers: &'static [u16],
    /// 扩展出现顺序；EXT_GREASE 表示该位置放一个 GREASE 扩展
    extensions: &'static [u16],
    grease_ciphers: bool,
}

fn spec_for(fp: Fingerprint) -> &'static FingerprintSpec {
    static CHROME: FingerprintSpec = FingerprintSpec {
        ciphers: &[
            0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8, 0xc013,
            0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
        ],
        extensions: &[
            EXT_GREASE,
            EXT_SERVER_NAME,
            EXT_EXTENDED_MASTER_SECRET,
            EXT_RENEGOTIATION_INFO,
            EXT_SUPPORTED_GROUPS,
            EXT_EC_POINT_FORMATS,
            EXT_SESSION_TICKET,
            EXT_ALPN,
            EXT_STATUS_REQUEST,
            EXT_SIGNATURE_ALGORITHMS,
            EXT_SIGNED_CERT_TIMESTAMP,
            EXT_KEY_SHARE,
            EXT_PSK_KEY_EXCHANGE_MODES,
            EXT_SUPPORTED_VERSIONS,
            EXT_COMPRESS_CERTIFICATE,
            EXT_GREASE,
        ],
        grease_ciphers: true,
    };
    static FIREFOX: FingerprintSpec = FingerprintSpec {
        ciphers: &[
            0x1301, 0x1303, 0x1302, 0xc02b, 0xc02f, 0xcca9, 0xcca8, 0xc02c, 0xc030, 0xc013,
            0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
        ],
        extensions: &[
            EXT_SERVER_NAME,
            EXT_EXTENDED_MASTER_SECRET,
            EXT_RENEGOTIATION_INFO,
            EXT_SUPPORTED_GROUPS,
            EXT_EC_POINT_FORMATS,
            EXT_SESSION_TICKET,
            EXT_ALPN,
            EXT_STATUS_REQUEST,
            EXT_KEY_SHARE,
            EXT_SUPPORTED_VERSIONS,
            EXT_SIGNATURE_ALGORITHMS,
            EXT_PSK_KEY_EXCHANGE_MODES,
        ],
        grease_ciphers: false,
    };
    static SAFARI: FingerprintSpec = FingerprintSpec {
        ciphers: &[
            0x1301, 0x1302, 0x1303, 0xc02c, 0xc02b, 0xcca9, 0xc030, 0xc02f, 0xcca8, 0xc00a,
            0xc009, 0xc014, 0xc013, 0x009d, 0x009c, 0x0035, 0x002f,
        ],
        extensions: &[
            EXT_SERVER_NAME,
            EXT_EXTENDED_MASTER_SECRET,
            EXT_RENEGOTIATION_INFO,
            EXT_SUPPORTED_GROUPS,
            EXT_EC_POINT_FORMATS,
            EXT_ALPN,
            EXT_STATUS_REQUEST,
            EXT_SIGNATURE_ALGORITHMS,
            EXT_SIGNED_CERT_TIMESTAMP,
            EXT_KEY_SHARE,
            EXT_PSK_KEY_EXCHANGE_MODES,
            EXT_SUPPORTED_VERSIONS,
        ],
        grease_ciphers: false,
    };

    match fp {
        Fingerprint::Chrome120 | Fingerprint::Edge | Fingerprint::Random => &CHROME,
        Fingerprint::Firefox => &FIREFOX,
        Fingerprint::Safari | Fingerprint::Ios => &SAFARI,
    }
}

/// 认证子：AES-128-GCM(key = SHA256(server_pub || client_pub)[..16],
/// nonce = 0) 加密 `short_id || ts_u32_be || SHA256(shared)`，取前 8 字节。
/// 时间戳向下取整到 8 秒。
pub fn compute_authenticator(
    server_public: &[u8; 32],
    client_public: &[u8; 32],
    shared_secret: &[u8; 32],
    short_id: &[u8],
    now_unix: u64,
) -> Result<[u8; 8]> {
    let mut key_input = Vec::with_capacity(64);
    key_input.extend_from_slice(server_public);
    key_input.extend_from_slice(client_public);
    let key_hash = Sha256::digest(&key_input);

    let timestamp = ((now_unix / 8) * 8) as u32;

    let mut msg = Vec::with_capacity(short_id.len() + 4 + 32);
    msg.extend_from_slice(short_id);
    msg.extend_from_slice(&timestamp.to_be_bytes());
    msg.extend_from_slice(&Sha256::digest(shared_secret));

    let aead = Aes128Gcm::new_from_slice(&key_hash[..16])
        .map_err(|_| anyhow::anyhow!("authenticator key init failed"))?;
    let nonce = Nonce::from_slice(&[0u8; 12]);
    let sealed = aead
        .encrypt(nonce, msg.as_slice())
        .map_err(|_| anyhow::anyhow!("authenticator seal failed"))?;

    let mut auth = [0u8; 8];
    auth.copy_from_slice(&sealed[..8]);
    Ok(auth)
}

/// ClientHello 的全部输入。随机量由调用方预生成，
/// 相同输入重建出相同字节。
pub struct HelloInput<'a> {
    pub fingerprint: Fingerprint,
    pub sni: &'a str,
    pub random_prefix: [u8; 24],
    pub authenticator: [u8; 8],
    pub session_id: [u8; 32],
    pub client_public: [u8; 32],
    pub alpn: &'a [&'a str],
}

/// 构造完整 ClientHello 握手消息（含 4 字节消息头），
/// 同时返回 32 字节 client_random。
pub fn build_client_hello(input: &HelloInput<'_>) -> (Vec<u8>, [u8; 32]) {
    let spec = spec_for(input.fingerprint);

    let mut random = [0u8; 32];
    random[..24].copy_from_slice(&input.random_prefix);
    random[24..].copy_from_slice(&input.authenticator);

    let mut body = Vec::with_capacity(512);
    body.extend_from_slice(&[0x03, 0x03]); // legacy_version
    body.extend_from_slice(&random);
    body.push(32);
    body.extend_from_slice(&input.session_id);

    // cipher_suites
    let grease_extra = if spec.grease_ciphers { 1 } else { 0 };
    let cipher_len = (spec.ciphers.len() + grease_extra) * 2;
    body.extend_from_slice(&(cipher_len as u16).to_be_bytes());
    if spec.grease_ciphers {
        body.extend_from_slice(&GREASE.to_be_bytes());
    }
    for suite in spec.ciphers {
        body.extend_from_slice(&suite.to_be_bytes());
    }

    // compression_methods: null only
    body.push(1);
    body.push(0);

    let mut extensions = Vec::with_capacity(256);
    for &ext in spec.extensions {
        append_extension(&mut extensions, ext, input);
    }
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut msg = Vec::with_capacity(4 + body.len());
    msg.push(HANDSHAKE_CLIENT_HELLO);
    msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    msg.extend_from_slice(&body);

    (msg, random)
}

fn put_extension(out: &mut Vec<u8>, id: u16, data: &[u8]) {
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
}

fn append_extension(out: &mut Vec<u8>, ext: u16, input: &HelloInput<'_>) {
    match ext {
        EXT_GREASE => put_extension(out, GREASE, &[]),
        EXT_SERVER_NAME => {
            let name = input.sni.as_bytes();
            let mut data = Vec::with_capacity(5 + name.len());
            data.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
            data.push(0); // host_name
            data.extend_from_slice(&(name.len() as u16).to_be_bytes());
            data.extend_from_slice(name);
            put_extension(out, EXT_SERVER_NAME, &data);
        }
        EXT_EXTENDED_MASTER_SECRET => put_extension(out, EXT_EXTENDED_MASTER_SECRET, &[]),
        EXT_RENEGOTIATION_INFO => put_extension(out, EXT_RENEGOTIATION_INFO, &[0]),
        EXT_SUPPORTED_GROUPS => {
            // x25519 在最前
            let groups: [u16; 3] = [GROUP_X25519, 0x0017, 0x0018];
            let mut data = Vec::with_capacity(2 + groups.len() * 2);
            data.extend_from_slice(&((groups.len() * 2) as u16).to_be_bytes());
            for g in groups {
                data.extend_from_slice(&g.to_be_bytes());
            }
            put_extension(out, EXT_SUPPORTED_GROUPS, &data);
        }
        EXT_EC_POINT_FORMATS => put_extension(out, EXT_EC_POINT_FORMATS, &[1, 0]),
        EXT_SESSION_TICKET => put_extension(out, EXT_SESSION_TICKET, &[]),
        EXT_ALPN => {
            let mut protocols = Vec::new();
            for p in input.alpn {
                protocols.push(p.len() as u8);
                protocols.extend_from_slice(p.as_bytes());
            }
            let mut data = Vec::with_capacity(2 + protocols.len());
            data.extend_from_slice(&(protocols.len() as u16).to_be_bytes());
            data.extend_from_slice(&protocols);
            put_extension(out, EXT_ALPN, &data);
        }
        EXT_STATUS_REQUEST => put_extension(out, EXT_STATUS_REQUEST, &[1, 0, 0, 0, 0]),
        EXT_SIGNATURE_ALGORITHMS => {
            let algs: [u16; 8] = [
                0x0403, 0x0804, 0x0401, 0x0503, 0x0805, 0x0501, 0x0806, 0x0601,
            ];
            let mut data = Vec::with_capacity(2 + algs.len() * 2);
            data.extend_from_slice(&((algs.len() * 2) as u16).to_be_bytes());
            for a in algs {
                data.extend_from_slice(&a.to_be_bytes());
            }
            put_extension(out, EXT_SIGNATURE_ALGORITHMS, &data);
        }
        EXT_SIGNED_CERT_TIMESTAMP => put_extension(out, EXT_SIGNED_CERT_TIMESTAMP, &[]),
        EXT_KEY_SHARE => {
            let mut data = Vec::with_capacity(6 + 32);
            data.extend_from_slice(&(4u16 + 32).to_be_bytes()); // client_shares 长度
            data.extend_from_slice(&GROUP_X25519.to_be_bytes());
            data.extend_from_slice(&32u16.to_be_bytes());
            data.extend_from_slice(&input.client_public);
            put_extension(out, EXT_KEY_SHARE, &data);
        }
        EXT_PSK_KEY_EXCHANGE_MODES => put_extension(out, EXT_PSK_KEY_EXCHANGE_MODES, &[1, 1]),
        EXT_SUPPORTED_VERSIONS => put_extension(out, EXT_SUPPORTED_VERSIONS, &[2, 0x03, 0x04]),
        EXT_COMPRESS_CERTIFICATE => put_extension(out, EXT_COMPRESS_CERTIFICATE, &[2, 0x00, 0x02]),
        other => put_extension(out, other, &[]),
    }
}

/// 解析出的 ServerHello 要点
pub struct ServerHello {
    pub cipher_suite: u16,
    pub server_public: [u8; 32],
}

/// 解析 ServerHello 握手消息体（不含 4 字节消息头）。
/// 必须协商出 TLS 1.3 与 x25519 key_share。
pub fn parse_server_hello(body: &[u8]) -> Result<ServerHello> {
    let fail = |msg: &str| anyhow::anyhow!("server hello: {}", msg);

    if body.len() < 2 + 32 + 1 {
        return Err(fail("truncated"));
    }
    let mut pos = 2 + 32; // legacy_version + random

    let session_id_len = body[pos] as usize;
    pos += 1 + session_id_len;
    if body.len() < pos + 3 {
        return Err(fail("truncated after session id"));
    }

    let cipher_suite = u16::from_be_bytes([body[pos], body[pos + 1]]);
    pos += 2;
    pos += 1; // compression

    if body.len() < pos + 2 {
        return Err(fail("missing extensions"));
    }
    let ext_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2;
    if body.len() < pos + ext_len {
        return Err(fail("extensions truncated"));
    }

    let mut tls13 = false;
    let mut server_public: Option<[u8; 32]> = None;
    let mut ext = &body[pos..pos + ext_len];
    while ext.len() >= 4 {
        let id = u16::from_be_bytes([ext[0], ext[1]]);
        let len = u16::from_be_bytes([ext[2], ext[3]]) as usize;
        if ext.len() < 4 + len {
            return Err(fail("extension truncated"));
        }
        let data = &ext[4..4 + len];
        match id {
            EXT_SUPPORTED_VERSIONS => {
                if data == [0x03, 0x04] {
                    tls13 = true;
                }
            }
            EXT_KEY_SHARE => {
                if data.len() >= 4 {
                    let group = u16::from_be_bytes([data[0], data[1]]);
                    let klen = u16::from_be_bytes([data[2], data[3]]) as usize;
                    if group == GROUP_X25519 && klen == 32 && data.len() >= 4 + 32 {
                        let mut key = [0u8; 32];
                        key.copy_from_slice(&data[4..36]);
                        server_public = Some(key);
                    }
                }
            }
            _ => {}
        }
        ext = &ext[4 + len..];
    }

    if !tls13 {
        return Err(fail("peer did not negotiate TLS 1.3"));
    }
    let server_public = server_public.ok_or_else(|| fail("missing x25519 key share"))?;

    Ok(ServerHello {
        cipher_suite,
        server_public,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> HelloInput<'static> {
        HelloInput {
            fingerprint: Fingerprint::Chrome120,
            sni: "www.example.com",
            random_prefix: [0x11; 24],
            authenticator: [0x22; 8],
            session_id: [0x33; 32],
            client_public: [0x44; 32],
            alpn: &["h2", "http/1.1"],
        }
    }

    #[test]
    fn hello_is_deterministic() {
        let input = sample_input();
        let (a, ra) = build_client_hello(&input);
        let (b, rb) = build_client_hello(&input);
        assert_eq!(a, b);
        assert_eq!(ra, rb);
    }

    #[test]
    fn fingerprints_differ() {
        let mut input = sample_input();
        let (chrome, _) = build_client_hello(&input);
        input.fingerprint = Fingerprint::Firefox;
        let (firefox, _) = build_client_hello(&input);
        input.fingerprint = Fingerprint::Safari;
        let (safari, _) = build_client_hello(&input);
        assert_ne!(chrome, firefox);
        assert_ne!(firefox, safari);
    }

    #[test]
    fn random_carries_authenticator() {
        let input = sample_input();
        let (msg, random) = build_client_hello(&input);
        assert_eq!(&random[..24], &[0x11; 24]);
        assert_eq!(&random[24..], &[0x22; 8]);
        // random 位于 消息头(4) + legacy_version(2) 之后
        assert_eq!(&msg[6..38], &random);
    }

    #[test]
    fn hello_structure_sane() {
        let input = sample_input();
        let (msg, _) = build_client_hello(&input);
        assert_eq!(msg[0], HANDSHAKE_CLIENT_HELLO);
        let body_len = u32::from_be_bytes([0, msg[1], msg[2], msg[3]]) as usize;
        assert_eq!(body_len, msg.len() - 4);
        // legacy_version = 0x0303
        assert_eq!(&msg[4..6], &[0x03, 0x03]);
        // SNI 与客户端公钥必须在字节流里出现
        let windows_contain = |needle: &[u8]| msg.windows(needle.len()).any(|w| w == needle);
        assert!(windows_contain(b"www.example.com"));
        assert!(windows_contain(&[0x44; 32]));
        assert!(windows_contain(b"h2"));
    }

    #[test]
    fn authenticator_deterministic_within_8s_window() {
        let server = [1u8; 32];
        let client = [2u8; 32];
        let shared = [3u8; 32];
        let sid = [0xAA, 0xBB];

        let a = compute_authenticator(&server, &client, &shared, &sid, 1000).unwrap();
        let b = compute_authenticator(&server, &client, &shared, &sid, 1007).unwrap();
        let c = compute_authenticator(&server, &client, &shared, &sid, 1008).unwrap();
        assert_eq!(a, b); // 同一 8s 窗口
        assert_ne!(a, c); // 下一个窗口
    }

    #[test]
    fn authenticator_binds_keys() {
        let shared = [3u8; 32];
        let a = compute_authenticator(&[1; 32], &[2; 32], &shared, &[], 0).unwrap();
        let b = compute_authenticator(&[9; 32], &[2; 32], &shared, &[], 0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn server_hello_roundtrip() {
        // 手工构造一个最小 ServerHello 体
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // 空 session id
        body.extend_from_slice(&0x1301u16.to_be_bytes());
        body.push(0); // compression

        let mut exts = Vec::new();
        put_extension(&mut exts, EXT_SUPPORTED_VERSIONS, &[0x03, 0x04]);
        let mut ks = Vec::new();
        ks.extend_from_slice(&GROUP_X25519.to_be_bytes());
        ks.extend_from_slice(&32u16.to_be_bytes());
        ks.extend_from_slice(&[0x55; 32]);
        put_extension(&mut exts, EXT_KEY_SHARE, &ks);

        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let sh = parse_server_hello(&body).unwrap();
        assert_eq!(sh.cipher_suite, 0x1301);
        assert_eq!(sh.server_public, [0x55; 32]);
    }

    #[test]
    fn server_hello_without_tls13_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&0x1301u16.to_be_bytes());
        body.push(0);
        body.extend_from_slice(&0u16.to_be_bytes()); // 无扩展
        assert!(parse_server_hello(&body).is_err());
    }
}
