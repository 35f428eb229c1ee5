//! `vless://` 分享 URL 准入路径。
//!
//! `vless://<uuid>@<host>:<port>[/]?<k=v&...>[#<name>]`
//! IPv6 主机写在方括号中。识别的参数见 `parse_url` 内的取值。

use std::borrow::Cow;
use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use super::{
    decode_public_key, decode_short_id, parse_seed, Fingerprint, HttpUpgradeParams, RealityParams,
    Security, TlsParams, Transport, VisionFlow, VlessConfig, WsParams, XhttpMode, XhttpParams,
    DEFAULT_VISION_SEED,
};
use crate::common::error::CoreError;

type Result<T> = std::result::Result<T, CoreError>;

impl VlessConfig {
    /// 从分享 URL 准入
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("vless://")
            .ok_or_else(|| CoreError::ConfigInvalid("missing vless:// scheme".into()))?;

        let (main, fragment) = rest.rsplit_once('#').unwrap_or((rest, ""));
        let name = url_decode(fragment)
            .unwrap_or(Cow::Borrowed(fragment))
            .to_string();

        let (userinfo, host_part) = main
            .split_once('@')
            .ok_or_else(|| CoreError::ConfigInvalid("missing @ in vless url".into()))?;
        let uuid = userinfo
            .parse::<Uuid>()
            .map_err(|e| CoreError::ConfigInvalid(format!("uuid: {}", e)))?;

        let (host_port, query) = match host_part.split_once('?') {
            Some((hp, q)) => (hp, q),
            None => (host_part, ""),
        };
        let host_port = host_port.trim_end_matches('/');
        let (host, port) = parse_host_port(host_port)?;
        let params = parse_query(query);

        let get = |key: &str| params.get(key).map(String::as_str).unwrap_or("");

        let transport = Transport::parse(get("type"))?;
        let flow = VisionFlow::parse(get("flow"))?;
        let security = Security::parse(get("security"))?;

        if !get("encryption").is_empty() && get("encryption") != "none" {
            return Err(CoreError::ConfigInvalid(format!(
                "unsupported encryption: {}",
                get("encryption")
            )));
        }

        let fingerprint = Fingerprint::parse(get("fp"))?;

        let tls = TlsParams {
            server_name: get("sni").to_string(),
            alpn: get("alpn")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            allow_insecure: matches!(get("allowInsecure"), "1" | "true"),
            fingerprint,
        };

        let reality = if security == Security::Reality {
            RealityParams {
                server_name: get("sni").to_string(),
                public_key: decode_public_key(get("pbk"))?,
                short_id: decode_short_id(get("sid"))?,
                fingerprint,
            }
        } else {
            RealityParams::default()
        };

        let ws = WsParams {
            host: get("host").to_string(),
            path: decode_path(get("path")),
            headers: Vec::new(),
            max_early_data: get("ed").parse().unwrap_or(0),
            early_data_header: "Sec-WebSocket-Protocol".to_string(),
            heartbeat_period: 0,
        };
        let http_upgrade = HttpUpgradeParams {
            host: get("host").to_string(),
            path: decode_path(get("path")),
            headers: Vec::new(),
        };
        let xhttp = XhttpParams {
            host: get("host").to_string(),
            path: decode_path(get("path")),
            headers: Vec::new(),
            mode: XhttpMode::parse(get("mode"))?,
            no_grpc_header: false,
        };

        let vision_seed = if get("testseed").is_empty() {
            DEFAULT_VISION_SEED
        } else {
            parse_seed(get("testseed"))?
        };

        Ok(VlessConfig {
            name,
            server_address: host,
            server_port: port,
            resolved_ip: None,
            uuid,
            encryption: "none".to_string(),
            transport,
            flow,
            security,
            tls,
            reality,
            ws,
            http_upgrade,
            xhttp,
            vision_seed,
            mux_enabled: matches!(get("mux"), "1" | "true"),
            xudp_enabled: matches!(get("xudp"), "1" | "true"),
        })
    }
}

/// `host:port`，IPv6 用方括号
fn parse_host_port(s: &str) -> Result<(String, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| CoreError::ConfigInvalid("unclosed IPv6 bracket".into()))?;
        let port_str = after
            .strip_prefix(':')
            .ok_or_else(|| CoreError::ConfigInvalid("missing port after IPv6 host".into()))?;
        let port = port_str
            .parse::<u16>()
            .map_err(|_| CoreError::ConfigInvalid(format!("bad port: {}", port_str)))?;
        return Ok((host.to_string(), port));
    }
    let (host, port_str) = s
        .rsplit_once(':')
        .ok_or_else(|| CoreError::ConfigInvalid("missing port".into()))?;
    if host.is_empty() {
        return Err(CoreError::ConfigInvalid("empty host".into()));
    }
    let port = port_str
        .parse::<u16>()
        .map_err(|_| CoreError::ConfigInvalid(format!("bad port: {}", port_str)))?;
    Ok((host.to_string(), port))
}

fn decode_path(s: &str) -> String {
    let decoded = url_decode(s).unwrap_or(Cow::Borrowed(s)).to_string();
    if decoded.is_empty() {
        "/".to_string()
    } else {
        decoded
    }
}

fn parse_query(s: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if s.is_empty() {
        return map;
    }
    for pair in s.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            let k = url_decode(k).unwrap_or(Cow::Borrowed(k)).to_string();
            let v = url_decode(v).unwrap_or(Cow::Borrowed(v)).to_string();
            map.insert(k, v);
        }
    }
    map
}

fn url_decode(s: &str) -> anyhow::Result<Cow<'_, str>> {
    if !s.contains('%') && !s.contains('+') {
        return Ok(Cow::Borrowed(s));
    }
    let mut result = Vec::with_capacity(s.len());
    let mut bytes = s.as_bytes().iter();
    while let Some(&b) = bytes.next() {
        if b == b'%' {
            let hi = *bytes
                .next()
                .ok_or_else(|| anyhow::anyhow!("incomplete percent encoding"))?;
            let lo = *bytes
                .next()
                .ok_or_else(|| anyhow::anyhow!("incomplete percent encoding"))?;
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex)?;
            result.push(u8::from_str_radix(hex, 16)?);
        } else if b == b'+' {
            result.push(b' ');
        } else {
            result.push(b);
        }
    }
    Ok(Cow::Owned(String::from_utf8(result)?))
}

/// 从任意一种准入表示构建：URL 字符串或序列化字典
pub fn admit(source: &Value) -> Result<VlessConfig> {
    match source {
        Value::String(s) => VlessConfig::from_url(s),
        other => VlessConfig::from_dict(other),
    }
}
