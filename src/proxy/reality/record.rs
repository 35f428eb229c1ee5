//! TLS 1.3 记录层 AES-GCM 加解密。
//!
//! nonce = IV XOR 大端 64 位序号（右对齐）；序号按
//! (方向, 密钥期) 归零。AAD 是 5 字节记录头。内层明文为
//! `content || content_type || 零填充`，解包时从尾部找最后一个非零字节。

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use anyhow::Result;

use super::keys::{CipherSuite, TrafficKeys};

pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const CONTENT_ALERT: u8 = 0x15;
pub const CONTENT_HANDSHAKE: u8 = 0x16;
pub const CONTENT_APPLICATION_DATA: u8 = 0x17;

/// 密文记录最大载荷（2^14 + 256 上限内留出 tag 与类型字节）
pub const MAX_PLAINTEXT: usize = 16384;

enum AeadCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

/// 一个方向的记录加解密状态
pub struct RecordCrypto {
    cipher: AeadCipher,
    iv: [u8; 12],
    seq: u64,
}

impl RecordCrypto {
    pub fn new(suite: CipherSuite, keys: &TrafficKeys) -> Result<Self> {
        let cipher = match suite {
            CipherSuite::Aes128GcmSha256 => AeadCipher::Aes128(Box::new(
                Aes128Gcm::new_from_slice(&keys.key)
                    .map_err(|_| anyhow::anyhow!("bad aes-128 key length"))?,
            )),
            CipherSuite::Aes256GcmSha384 => AeadCipher::Aes256(Box::new(
                Aes256Gcm::new_from_slice(&keys.key)
                    .map_err(|_| anyhow::anyhow!("bad aes-256 key length"))?,
            )),
        };
        Ok(Self {
            cipher,
            iv: keys.iv,
            seq: 0,
        })
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = self.iv;
        let seq_bytes = self.seq.to_be_bytes();
        for i in 0..8 {
            nonce[4 + i] ^= seq_bytes[i];
        }
        self.seq += 1;
        nonce
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// 封装一条记录，返回完整字节（含 5 字节头）
    pub fn seal(&mut self, content_type: u8, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_PLAINTEXT {
            anyhow::bail!("record payload too large: {}", payload.len());
        }
        let mut inner = Vec::with_capacity(payload.len() + 1);
        inner.extend_from_slice(payload);
        inner.push(content_type);

        let cipher_len = inner.len() + 16;
        let header = [
            CONTENT_APPLICATION_DATA,
            0x03,
            0x03,
            (cipher_len >> 8) as u8,
            cipher_len as u8,
        ];

        let nonce_bytes = self.next_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let sealed = match &self.cipher {
            AeadCipher::Aes128(c) => c.encrypt(
                nonce,
                Payload {
                    msg: &inner,
                    aad: &header,
                },
            ),
            AeadCipher::Aes256(c) => c.encrypt(
                nonce,
                Payload {
                    msg: &inner,
                    aad: &header,
                },
            ),
        }
        .map_err(|_| anyhow::anyhow!("record seal failed"))?;

        let mut record = Vec::with_capacity(5 + sealed.len());
        record.extend_from_slice(&header);
        record.extend_from_slice(&sealed);
        Ok(record)
    }

    /// 解开一条记录，返回 (内层类型, 内容)
    pub fn open(&mut self, header: &[u8; 5], ciphertext: &[u8]) -> Result<(u8, Vec<u8>)> {
        let nonce_bytes = self.next_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut inner = match &self.cipher {
            AeadCipher::Aes128(c) => c.decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            ),
            AeadCipher::Aes256(c) => c.decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            ),
        }
        .map_err(|_| anyhow::anyhow!("record open failed (bad tag)"))?;

        // 去掉零填充，最后一个非零字节是真实类型
        let type_pos = inner
            .iter()
            .rposition(|&b| b != 0)
            .ok_or_else(|| anyhow::anyhow!("record is all padding"))?;
        let content_type = inner[type_pos];
        inner.truncate(type_pos);
        Ok((content_type, inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(suite: CipherSuite, seed: u8) -> TrafficKeys {
        TrafficKeys {
            key: vec![seed; suite.key_len()],
            iv: [seed.wrapping_add(1); 12],
        }
    }

    #[test]
    fn seal_open_roundtrip_both_suites() {
        for suite in [CipherSuite::Aes128GcmSha256, CipherSuite::Aes256GcmSha384] {
            let k = keys(suite, 0x42);
            let mut writer = RecordCrypto::new(suite, &k).unwrap();
            let mut reader = RecordCrypto::new(suite, &k).unwrap();

            for payload in [b"hello".as_slice(), b"", b"second record"] {
                let record = writer.seal(CONTENT_APPLICATION_DATA, payload).unwrap();
                assert_eq!(record[0], CONTENT_APPLICATION_DATA);
                assert_eq!(&record[1..3], &[0x03, 0x03]);

                let header: [u8; 5] = record[..5].try_into().unwrap();
                let (ctype, content) = reader.open(&header, &record[5..]).unwrap();
                assert_eq!(ctype, CONTENT_APPLICATION_DATA);
                assert_eq!(content, payload);
            }
        }
    }

    #[test]
    fn nonce_sequence_advances() {
        let suite = CipherSuite::Aes128GcmSha256;
        let k = keys(suite, 0x01);
        let mut writer = RecordCrypto::new(suite, &k).unwrap();
        let r1 = writer.seal(CONTENT_APPLICATION_DATA, b"a").unwrap();
        let r2 = writer.seal(CONTENT_APPLICATION_DATA, b"a").unwrap();
        // 同明文不同序号 → 不同密文
        assert_ne!(r1, r2);
        assert_eq!(writer.seq(), 2);
    }

    #[test]
    fn out_of_order_open_fails() {
        let suite = CipherSuite::Aes128GcmSha256;
        let k = keys(suite, 0x07);
        let mut writer = RecordCrypto::new(suite, &k).unwrap();
        let _skipped = writer.seal(CONTENT_APPLICATION_DATA, b"one").unwrap();
        let second = writer.seal(CONTENT_APPLICATION_DATA, b"two").unwrap();

        let mut reader = RecordCrypto::new(suite, &k).unwrap();
        let header: [u8; 5] = second[..5].try_into().unwrap();
        // reader 的序号还在 0，解第 2 条必然失败
        assert!(reader.open(&header, &second[5..]).is_err());
    }

    #[test]
    fn tampered_record_rejected() {
        let suite = CipherSuite::Aes256GcmSha384;
        let k = keys(suite, 0x09);
        let mut writer = RecordCrypto::new(suite, &k).unwrap();
        let mut record = writer.seal(CONTENT_HANDSHAKE, b"finished").unwrap();
        let last = record.len() - 1;
        record[last] ^= 0x01;

        let mut reader = RecordCrypto::new(suite, &k).unwrap();
        let header: [u8; 5] = record[..5].try_into().unwrap();
        assert!(reader.open(&header, &record[5..]).is_err());
    }

    #[test]
    fn inner_type_recovered_through_padding_scan() {
        let suite = CipherSuite::Aes128GcmSha256;
        let k = keys(suite, 0x0A);
        let mut writer = RecordCrypto::new(suite, &k).unwrap();
        let record = writer.seal(CONTENT_HANDSHAKE, b"ticket").unwrap();

        let mut reader = RecordCrypto::new(suite, &k).unwrap();
        let header: [u8; 5] = record[..5].try_into().unwrap();
        let (ctype, content) = reader.open(&header, &record[5..]).unwrap();
        assert_eq!(ctype, CONTENT_HANDSHAKE);
        assert_eq!(content, b"ticket");
    }

    #[test]
    fn oversize_payload_rejected() {
        let suite = CipherSuite::Aes128GcmSha256;
        let k = keys(suite, 0x0B);
        let mut writer = RecordCrypto::new(suite, &k).unwrap();
        assert!(writer.seal(CONTENT_APPLICATION_DATA, &vec![0u8; MAX_PLAINTEXT + 1]).is_err());
    }
}
