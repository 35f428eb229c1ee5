//! 与宿主共享的持久化设置（核心只读）。
//!
//! 三个键：`ipv6Enabled`、`dohEnabled`、`bypassCountryCode`。
//! 宿主在启动时注入存储路径，核心在收到变更通知后重读并 diff。

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::Value;
use tracing::warn;

/// 当前生效的共享设置快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Settings {
    pub ipv6_enabled: bool,
    pub doh_enabled: bool,
    /// 2 字母国家码打包为 u16，0 = 未启用绕行
    pub bypass_country: u16,
}

impl Settings {
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(doc) => Self::from_document(&doc),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "settings store is not JSON, using defaults");
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        }
    }

    pub fn from_document(doc: &Value) -> Self {
        Settings {
            ipv6_enabled: doc
                .get("ipv6Enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            doh_enabled: doc
                .get("dohEnabled")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            bypass_country: doc
                .get("bypassCountryCode")
                .and_then(Value::as_str)
                .map(pack_country)
                .unwrap_or(0),
        }
    }
}

/// 将 2 字母国家码打包为 u16（大端字节序），空串或非法输入返回 0
pub fn pack_country(code: &str) -> u16 {
    let bytes = code.as_bytes();
    if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii_alphabetic) {
        return 0;
    }
    u16::from_be_bytes([bytes[0].to_ascii_uppercase(), bytes[1].to_ascii_uppercase()])
}

/// 存储与路由文档的位置，宿主在 start 时注入
#[derive(Debug, Clone, Default)]
pub struct SharedPaths {
    pub settings_path: PathBuf,
    pub routing_path: PathBuf,
    pub geoip_path: Option<PathBuf>,
}

pub fn load_settings(paths: &SharedPaths) -> Result<Settings> {
    Ok(Settings::load(&paths.settings_path))
}
