//! RFC 8446 密钥调度。
//!
//! Early → Handshake → Application 三级派生，外加流量密钥
//! 与 Finished 计算。套件由服务端在 ServerHello 里选定，
//! 哈希长度随之为 32 或 48 字节。

use anyhow::Result;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};

pub const TLS_AES_128_GCM_SHA256: u16 = 0x1301;
pub const TLS_AES_256_GCM_SHA384: u16 = 0x1302;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aes128GcmSha256,
    Aes256GcmSha384,
}

impl CipherSuite {
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            TLS_AES_128_GCM_SHA256 => Some(CipherSuite::Aes128GcmSha256),
            TLS_AES_256_GCM_SHA384 => Some(CipherSuite::Aes256GcmSha384),
            _ => None,
        }
    }

    pub fn id(&self) -> u16 {
        match self {
            CipherSuite::Aes128GcmSha256 => TLS_AES_128_GCM_SHA256,
            CipherSuite::Aes256GcmSha384 => TLS_AES_256_GCM_SHA384,
        }
    }

    pub fn hash_len(&self) -> usize {
        match self {
            CipherSuite::Aes128GcmSha256 => 32,
            CipherSuite::Aes256GcmSha384 => 48,
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherSuite::Aes128GcmSha256 => 16,
            CipherSuite::Aes256GcmSha384 => 32,
        }
    }

    pub fn iv_len(&self) -> usize {
        12
    }

    pub fn hash(&self, data: &[u8]) -> Vec<u8> {
        match self {
            CipherSuite::Aes128GcmSha256 => Sha256::digest(data).to_vec(),
            CipherSuite::Aes256GcmSha384 => Sha384::digest(data).to_vec(),
        }
    }

    pub fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            CipherSuite::Aes128GcmSha256 => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac key");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            CipherSuite::Aes256GcmSha384 => {
                let mut mac = <Hmac<Sha384> as Mac>::new_from_slice(key).expect("hmac key");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    pub fn hkdf_extract(&self, salt: &[u8], ikm: &[u8]) -> Vec<u8> {
        match self {
            CipherSuite::Aes128GcmSha256 => {
                let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
                prk.to_vec()
            }
            CipherSuite::Aes256GcmSha384 => {
                let (prk, _) = Hkdf::<Sha384>::extract(Some(salt), ikm);
                prk.to_vec()
            }
        }
    }

    fn hkdf_expand(&self, prk: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        match self {
            CipherSuite::Aes128GcmSha256 => Hkdf::<Sha256>::from_prk(prk)
                .map_err(|_| anyhow::anyhow!("bad prk length"))?
                .expand(info, &mut out)
                .map_err(|_| anyhow::anyhow!("hkdf expand overflow"))?,
            CipherSuite::Aes256GcmSha384 => Hkdf::<Sha384>::from_prk(prk)
                .map_err(|_| anyhow::anyhow!("bad prk length"))?
                .expand(info, &mut out)
                .map_err(|_| anyhow::anyhow!("hkdf expand overflow"))?,
        }
        Ok(out)
    }

    /// HKDF-Expand-Label(secret, "tls13 " + label, context, len)
    pub fn expand_label(
        &self,
        secret: &[u8],
        label: &str,
        context: &[u8],
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut info = Vec::with_capacity(4 + 6 + label.len() + context.len());
        info.extend_from_slice(&(len as u16).to_be_bytes());
        info.push((6 + label.len()) as u8);
        info.extend_from_slice(b"tls13 ");
        info.extend_from_slice(label.as_bytes());
        info.push(context.len() as u8);
        info.extend_from_slice(context);
        self.hkdf_expand(secret, &info, len)
    }

    /// Derive-Secret(secret, label, transcript) = Expand-Label(secret, label, Hash(transcript), hash_len)
    pub fn derive_secret(&self, secret: &[u8], label: &str, transcript_hash: &[u8]) -> Result<Vec<u8>> {
        self.expand_label(secret, label, transcript_hash, self.hash_len())
    }
}

/// 一个方向的流量密钥材料
#[derive(Clone)]
pub struct TrafficKeys {
    pub key: Vec<u8>,
    pub iv: [u8; 12],
}

fn traffic_keys(suite: CipherSuite, secret: &[u8]) -> Result<TrafficKeys> {
    let key = suite.expand_label(secret, "key", &[], suite.key_len())?;
    let iv_vec = suite.expand_label(secret, "iv", &[], suite.iv_len())?;
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&iv_vec);
    Ok(TrafficKeys { key, iv })
}

/// 握手阶段密钥集
pub struct HandshakeKeys {
    pub client: TrafficKeys,
    pub server: TrafficKeys,
    pub client_secret: Vec<u8>,
    pub server_secret: Vec<u8>,
    /// 进入应用阶段所需的中间量
    master_secret: Vec<u8>,
    suite: CipherSuite,
}

/// 应用阶段密钥集
pub struct ApplicationKeys {
    pub client: TrafficKeys,
    pub server: TrafficKeys,
}

/// Early → Handshake：输入 ECDH 共享密钥与 CH..SH 的 transcript hash
pub fn derive_handshake(
    suite: CipherSuite,
    shared_secret: &[u8],
    transcript_hash: &[u8],
) -> Result<HandshakeKeys> {
    let hash_len = suite.hash_len();
    let zeros = vec![0u8; hash_len];
    let empty_hash = suite.hash(&[]);

    let early_secret = suite.hkdf_extract(&[], &zeros);
    let derived = suite.derive_secret(&early_secret, "derived", &empty_hash)?;
    let handshake_secret = suite.hkdf_extract(&derived, shared_secret);

    let client_secret = suite.derive_secret(&handshake_secret, "c hs traffic", transcript_hash)?;
    let server_secret = suite.derive_secret(&handshake_secret, "s hs traffic", transcript_hash)?;

    let derived2 = suite.derive_secret(&handshake_secret, "derived", &empty_hash)?;
    let master_secret = suite.hkdf_extract(&derived2, &zeros);

    Ok(HandshakeKeys {
        client: traffic_keys(suite, &client_secret)?,
        server: traffic_keys(suite, &server_secret)?,
        client_secret,
        server_secret,
        master_secret,
        suite,
    })
}

impl HandshakeKeys {
    /// Handshake → Application：输入 CH..server Finished 的 transcript hash
    pub fn derive_application(&self, transcript_hash: &[u8]) -> Result<ApplicationKeys> {
        let suite = self.suite;
        let client_secret = suite.derive_secret(&self.master_secret, "c ap traffic", transcript_hash)?;
        let server_secret = suite.derive_secret(&self.master_secret, "s ap traffic", transcript_hash)?;
        Ok(ApplicationKeys {
            client: traffic_keys(suite, &client_secret)?,
            server: traffic_keys(suite, &server_secret)?,
        })
    }

    /// verify_data = HMAC(finished_key, transcript_hash)
    pub fn finished_verify_data(&self, base_secret: &[u8], transcript_hash: &[u8]) -> Result<Vec<u8>> {
        let suite = self.suite;
        let finished_key = suite.expand_label(base_secret, "finished", &[], suite.hash_len())?;
        Ok(suite.hmac(&finished_key, transcript_hash))
    }
}
