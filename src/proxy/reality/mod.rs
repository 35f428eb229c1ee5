//! Reality：对被动观察者完全是一次普通 TLS 1.3 握手，
//! 实际上用静态 X25519 公钥认证并打开一条不透明隧道。
//!
//! ClientHello 的 client_random 末 8 字节是认证子（见 `hello`），
//! 之后走标准 RFC 8446 密钥调度与记录层（见 `keys`、`record`）。

pub mod hello;
pub mod keys;
pub mod record;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use bytes::{Buf, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::common::ProxyStream;
use crate::config::RealityParams;

use hello::{build_client_hello, compute_authenticator, parse_server_hello, HelloInput};
use keys::CipherSuite;
use record::{
    RecordCrypto, CONTENT_ALERT, CONTENT_APPLICATION_DATA, CONTENT_CHANGE_CIPHER_SPEC,
    CONTENT_HANDSHAKE, MAX_PLAINTEXT,
};

/// 在已建立的 TCP 流上完成 Reality 握手
pub async fn connect(mut stream: ProxyStream, params: &RealityParams) -> Result<ProxyStream> {
    // 1. 临时密钥与随机量
    let client_secret = StaticSecret::random_from_rng(rand::thread_rng());
    let client_public = PublicKey::from(&client_secret);

    let server_static = PublicKey::from(params.public_key);
    let auth_shared = client_secret.diffie_hellman(&server_static);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| anyhow::anyhow!("clock before epoch"))?
        .as_secs();
    let authenticator = compute_authenticator(
        &params.public_key,
        client_public.as_bytes(),
        auth_shared.as_bytes(),
        &params.short_id,
        now,
    )?;

    let mut random_prefix = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut random_prefix);
    let mut session_id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut session_id);

    // 2. ClientHello
    let input = HelloInput {
        fingerprint: params.fingerprint,
        sni: &params.server_name,
        random_prefix,
        authenticator,
        session_id,
        client_public: *client_public.as_bytes(),
        alpn: &["h2", "http/1.1"],
    };
    let (hello_msg, _random) = build_client_hello(&input);

    let mut transcript: Vec<u8> = hello_msg.clone();

    let mut rec = Vec::with_capacity(5 + hello_msg.len());
    rec.push(CONTENT_HANDSHAKE);
    rec.extend_from_slice(&[0x03, 0x03]);
    rec.extend_from_slice(&(hello_msg.len() as u16).to_be_bytes());
    rec.extend_from_slice(&hello_msg);
    stream.write_all(&rec).await?;
    stream.flush().await?;

    // 3. ServerHello（明文记录；之前的 CCS 跳过）
    let sh_msg = loop {
        let (ctype, body) = read_record(&mut stream).await?;
        match ctype {
            CONTENT_CHANGE_CIPHER_SPEC => continue,
            CONTENT_HANDSHAKE => break body,
            CONTENT_ALERT => anyhow::bail!("tls alert before server hello"),
            other => anyhow::bail!("unexpected record type 0x{:02x} before server hello", other),
        }
    };
    if sh_msg.len() < 4 || sh_msg[0] != hello::HANDSHAKE_SERVER_HELLO {
        anyhow::bail!("expected server hello");
    }
    let sh = parse_server_hello(&sh_msg[4..])?;
    let suite = CipherSuite::from_id(sh.cipher_suite)
        .ok_or_else(|| anyhow::anyhow!("server chose unsupported suite 0x{:04x}", sh.cipher_suite))?;
    transcript.extend_from_slice(&sh_msg);

    // 4. 握手密钥
    let server_ephemeral = PublicKey::from(sh.server_public);
    let hs_shared = client_secret.diffie_hellman(&server_ephemeral);
    let hs_transcript_hash = suite.hash(&transcript);
    let hs_keys = keys::derive_handshake(suite, hs_shared.as_bytes(), &hs_transcript_hash)?;

    let mut server_crypto = RecordCrypto::new(suite, &hs_keys.server)?;
    let mut client_crypto = RecordCrypto::new(suite, &hs_keys.client)?;

    // 5. 读服务端加密握手消息直到 Finished
    let mut hs_buf: Vec<u8> = Vec::new();
    let mut saw_finished = false;
    while !saw_finished {
        let (ctype, body) = read_record(&mut stream).await?;
        match ctype {
            CONTENT_CHANGE_CIPHER_SPEC => continue,
            CONTENT_ALERT => anyhow::bail!("tls alert during handshake"),
            CONTENT_APPLICATION_DATA => {}
            _ => continue,
        }
        let header = record_header(body.len());
        let (inner_type, plain) = server_crypto.open(&header, &body)?;
        match inner_type {
            CONTENT_HANDSHAKE => hs_buf.extend_from_slice(&plain),
            CONTENT_ALERT => anyhow::bail!("tls alert during handshake"),
            _ => continue,
        }

        // 按消息边界消化
        while hs_buf.len() >= 4 {
            let msg_len = u32::from_be_bytes([0, hs_buf[1], hs_buf[2], hs_buf[3]]) as usize;
            if hs_buf.len() < 4 + msg_len {
                break;
            }
            let msg: Vec<u8> = hs_buf.drain(..4 + msg_len).collect();
            let msg_type = msg[0];
            transcript.extend_from_slice(&msg);
            if msg_type == hello::HANDSHAKE_FINISHED {
                saw_finished = true;
                break;
            }
        }
    }

    // 6. 应用密钥（transcript 截至服务端 Finished）
    let finished_transcript_hash = suite.hash(&transcript);
    let app_keys = hs_keys.derive_application(&finished_transcript_hash)?;

    // 7. 客户端 CCS + Finished
    stream
        .write_all(&[CONTENT_CHANGE_CIPHER_SPEC, 0x03, 0x03, 0x00, 0x01, 0x01])
        .await?;

    let verify = hs_keys.finished_verify_data(&hs_keys.client_secret, &finished_transcript_hash)?;
    let mut finished_msg = Vec::with_capacity(4 + verify.len());
    finished_msg.push(hello::HANDSHAKE_FINISHED);
    finished_msg.extend_from_slice(&(verify.len() as u32).to_be_bytes()[1..]);
    finished_msg.extend_from_slice(&verify);
    let finished_record = client_crypto.seal(CONTENT_HANDSHAKE, &finished_msg)?;
    stream.write_all(&finished_record).await?;
    stream.flush().await?;

    debug!(
        sni = params.server_name.as_str(),
        suite = format!("0x{:04x}", suite.id()),
        "reality handshake complete"
    );

    Ok(Box::new(RealityStream {
        inner: stream,
        read_crypto: RecordCrypto::new(suite, &app_keys.server)?,
        write_crypto: RecordCrypto::new(suite, &app_keys.client)?,
        read_raw: BytesMut::with_capacity(8192),
        read_plain: BytesMut::new(),
        write_pending: BytesMut::new(),
        eof: false,
    }))
}

fn record_header(len: usize) -> [u8; 5] {
    [
        CONTENT_APPLICATION_DATA,
        0x03,
        0x03,
        (len >> 8) as u8,
        len as u8,
    ]
}

/// 读一条完整 TLS 记录，返回 (外层类型, 记录体)
async fn read_record(stream: &mut ProxyStream) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len > MAX_PLAINTEXT + 256 + 16 {
        anyhow::bail!("record too large: {}", len);
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok((header[0], body))
}

/// 握手完成后的不透明隧道流
pub struct RealityStream {
    inner: ProxyStream,
    read_crypto: RecordCrypto,
    write_crypto: RecordCrypto,
    /// 未拆记录的密文
    read_raw: BytesMut,
    /// 已解密待交付的应用数据
    read_plain: BytesMut,
    /// 已封装未写完的记录字节
    write_pending: BytesMut,
    eof: bool,
}

impl RealityStream {
    /// 拆 read_raw 中的完整记录；session ticket 等握手消息丢弃
    fn drain_records(&mut self) -> io::Result<()> {
        loop {
            if self.read_raw.len() < 5 {
                return Ok(());
            }
            let len = u16::from_be_bytes([self.read_raw[3], self.read_raw[4]]) as usize;
            if self.read_raw.len() < 5 + len {
                return Ok(());
            }
            let outer = self.read_raw[0];
            let header: [u8; 5] = self.read_raw[..5].try_into().expect("5 bytes");
            self.read_raw.advance(5);
            let body = self.read_raw.split_to(len);

            match outer {
                CONTENT_CHANGE_CIPHER_SPEC => continue,
                CONTENT_APPLICATION_DATA => {
                    let (inner_type, plain) = self
                        .read_crypto
                        .open(&header, &body)
                        .map_err(io::Error::other)?;
                    match inner_type {
                        CONTENT_APPLICATION_DATA => self.read_plain.extend_from_slice(&plain),
                        // 会话票据、KeyUpdate 等握手消息不上浮
                        CONTENT_HANDSHAKE => continue,
                        CONTENT_ALERT => {
                            self.eof = true;
                            return Ok(());
                        }
                        other => {
                            return Err(io::Error::other(format!(
                                "unexpected inner type 0x{:02x}",
                                other
                            )));
                        }
                    }
                }
                CONTENT_ALERT => {
                    self.eof = true;
                    return Ok(());
                }
                other => {
                    return Err(io::Error::other(format!(
                        "unexpected record type 0x{:02x}",
                        other
                    )));
                }
            }
        }
    }
}

impl AsyncRead for RealityStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_plain.is_empty() {
                let n = self.read_plain.len().min(buf.remaining());
                buf.put_slice(&self.read_plain[..n]);
                self.read_plain.advance(n);
                return Poll::Ready(Ok(()));
            }
            if self.eof {
                return Poll::Ready(Ok(()));
            }

            let mut tmp = [0u8; 8192];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut self.inner).poll_read(cx, &mut tmp_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = tmp_buf.filled();
                    if filled.is_empty() {
                        self.eof = true;
                        return Poll::Ready(Ok(()));
                    }
                    self.read_raw.extend_from_slice(filled);
                    self.drain_records()?;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for RealityStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // 先清掉上一条记录的残余
        while !self.write_pending.is_empty() {
            let this = &mut *self;
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_pending) {
                Poll::Ready(Ok(n)) => {
                    self.write_pending.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk = &buf[..buf.len().min(MAX_PLAINTEXT)];
        let record = self
            .write_crypto
            .seal(CONTENT_APPLICATION_DATA, chunk)
            .map_err(io::Error::other)?;

        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, &record) {
            Poll::Ready(Ok(n)) => {
                if n < record.len() {
                    self.write_pending.extend_from_slice(&record[n..]);
                }
                Poll::Ready(Ok(chunk.len()))
            }
            Poll::Ready(Err(e)) => {
                // 记录已占用序号，只能作废整条连接
                Poll::Ready(Err(e))
            }
            Poll::Pending => {
                // 密文已生成，挂到 pending，报告明文已消费
                self.write_pending.extend_from_slice(&record);
                Poll::Ready(Ok(chunk.len()))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_pending.is_empty() {
            let this = &mut *self;
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_pending) {
                Poll::Ready(Ok(n)) => {
                    self.write_pending.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.as_mut().poll_flush(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut self.inner).poll_shutdown(cx),
            other => other,
        }
    }
}
