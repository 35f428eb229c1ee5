pub mod settings;
pub mod url;

use std::collections::HashMap;
use std::net::IpAddr;

use serde_json::Value;
use uuid::Uuid;

use crate::common::error::CoreError;

/// 默认 Vision padding 种子 [content_threshold, long_max, long_base, short_max]
pub const DEFAULT_VISION_SEED: [u32; 4] = [900, 500, 900, 256];

pub const FLOW_VISION: &str = "xtls-rprx-vision";
pub const FLOW_VISION_UDP443: &str = "xtls-rprx-vision-udp443";

type Result<T> = std::result::Result<T, CoreError>;

/// 传输层类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Ws,
    HttpUpgrade,
    Xhttp,
}

impl Transport {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "tcp" | "" => Ok(Transport::Tcp),
            "ws" => Ok(Transport::Ws),
            "httpupgrade" => Ok(Transport::HttpUpgrade),
            "xhttp" => Ok(Transport::Xhttp),
            other => Err(CoreError::ConfigInvalid(format!(
                "unknown transport: {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ws => "ws",
            Transport::HttpUpgrade => "httpupgrade",
            Transport::Xhttp => "xhttp",
        }
    }
}

/// Vision 流控模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisionFlow {
    #[default]
    None,
    Vision,
    VisionUdp443,
}

impl VisionFlow {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(VisionFlow::None),
            FLOW_VISION => Ok(VisionFlow::Vision),
            FLOW_VISION_UDP443 => Ok(VisionFlow::VisionUdp443),
            other => Err(CoreError::ConfigInvalid(format!("unknown flow: {}", other))),
        }
    }

    /// VLESS addons 中携带的 flow 字符串；None 模式下整个 addons 省略
    pub fn wire_str(&self) -> Option<&'static str> {
        match self {
            VisionFlow::None => None,
            VisionFlow::Vision => Some(FLOW_VISION),
            VisionFlow::VisionUdp443 => Some(FLOW_VISION_UDP443),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, VisionFlow::None)
    }
}

/// 外层安全层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(Security::None),
            "tls" => Ok(Security::Tls),
            "reality" => Ok(Security::Reality),
            other => Err(CoreError::ConfigInvalid(format!(
                "unknown security: {}",
                other
            ))),
        }
    }
}

/// 浏览器指纹标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fingerprint {
    #[default]
    Chrome120,
    Firefox,
    Safari,
    Edge,
    Ios,
    Random,
}

impl Fingerprint {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "chrome" | "chrome_120" => Ok(Fingerprint::Chrome120),
            "firefox" => Ok(Fingerprint::Firefox),
            "safari" => Ok(Fingerprint::Safari),
            "edge" => Ok(Fingerprint::Edge),
            "ios" => Ok(Fingerprint::Ios),
            "random" => Ok(Fingerprint::Random),
            other => Err(CoreError::ConfigInvalid(format!(
                "unknown fingerprint: {}",
                other
            ))),
        }
    }
}

/// XHTTP 子模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XhttpMode {
    #[default]
    Auto,
    PacketUp,
    StreamOne,
}

impl XhttpMode {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "auto" => Ok(XhttpMode::Auto),
            "packet-up" => Ok(XhttpMode::PacketUp),
            "stream-one" => Ok(XhttpMode::StreamOne),
            other => Err(CoreError::ConfigInvalid(format!(
                "unknown xhttp mode: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsParams {
    pub server_name: String,
    pub alpn: Vec<String>,
    pub allow_insecure: bool,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Default)]
pub struct RealityParams {
    pub server_name: String,
    pub public_key: [u8; 32],
    /// 0-8 字节
    pub short_id: Vec<u8>,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Default)]
pub struct WsParams {
    pub host: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub max_early_data: usize,
    pub early_data_header: String,
    /// 心跳 ping 周期秒数，0 = 关闭
    pub heartbeat_period: u64,
}

#[derive(Debug, Clone, Default)]
pub struct HttpUpgradeParams {
    pub host: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct XhttpParams {
    pub host: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub mode: XhttpMode,
    pub no_grpc_header: bool,
}

/// 一条经过准入校验的 VLESS 端点配置。
///
/// 准入后不可变；身份由 uuid 确定。两条准入路径
/// （分享 URL 与序列化字典）产出同一结构。
#[derive(Debug, Clone)]
pub struct VlessConfig {
    pub name: String,
    pub server_address: String,
    pub server_port: u16,
    pub resolved_ip: Option<IpAddr>,
    pub uuid: Uuid,
    /// 恒为 "none"
    pub encryption: String,
    pub transport: Transport,
    pub flow: VisionFlow,
    pub security: Security,
    pub tls: TlsParams,
    pub reality: RealityParams,
    pub ws: WsParams,
    pub http_upgrade: HttpUpgradeParams,
    pub xhttp: XhttpParams,
    pub vision_seed: [u32; 4],
    pub mux_enabled: bool,
    pub xudp_enabled: bool,
}

impl VlessConfig {
    /// 从序列化字典（routing.json 的 configs 值 / start 调用参数）准入
    pub fn from_dict(dict: &Value) -> Result<Self> {
        let obj = dict
            .as_object()
            .ok_or_else(|| CoreError::ConfigInvalid("config is not an object".into()))?;

        let get_str = |key: &str| -> String {
            obj.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let get_bool = |key: &str| -> bool {
            match obj.get(key) {
                Some(Value::Bool(b)) => *b,
                Some(Value::String(s)) => s == "true" || s == "1",
                Some(Value::Number(n)) => n.as_u64() == Some(1),
                _ => false,
            }
        };

        let server_address = get_str("serverAddress");
        if server_address.is_empty() {
            return Err(CoreError::ConfigInvalid("serverAddress is required".into()));
        }
        let server_port = match obj.get("serverPort") {
            Some(Value::Number(n)) => n
                .as_u64()
                .filter(|p| *p >= 1 && *p <= 65535)
                .ok_or_else(|| CoreError::ConfigInvalid("serverPort out of range".into()))?
                as u16,
            Some(Value::String(s)) => s
                .parse::<u16>()
                .map_err(|_| CoreError::ConfigInvalid("serverPort is not a port".into()))?,
            _ => return Err(CoreError::ConfigInvalid("serverPort is required".into())),
        };
        let uuid = get_str("uuid")
            .parse::<Uuid>()
            .map_err(|e| CoreError::ConfigInvalid(format!("uuid: {}", e)))?;

        let encryption = {
            let e = get_str("encryption");
            if e.is_empty() {
                "none".to_string()
            } else if e != "none" {
                return Err(CoreError::ConfigInvalid(format!(
                    "unsupported encryption: {}",
                    e
                )));
            } else {
                e
            }
        };

        let transport = Transport::parse(&get_str("transport"))?;
        let flow = VisionFlow::parse(&get_str("flow"))?;
        let security = Security::parse(&get_str("security"))?;

        let resolved_ip = {
            let s = get_str("resolvedIP");
            if s.is_empty() {
                None
            } else {
                Some(
                    s.parse::<IpAddr>()
                        .map_err(|_| CoreError::ConfigInvalid("resolvedIP is not an IP".into()))?,
                )
            }
        };

        let tls = TlsParams {
            server_name: get_str("tlsServerName"),
            alpn: split_nonempty(&get_str("tlsAlpn"), ','),
            allow_insecure: get_bool("tlsAllowInsecure"),
            fingerprint: Fingerprint::parse(&get_str("tlsFingerprint"))?,
        };

        let reality = if security == Security::Reality {
            RealityParams {
                server_name: get_str("realityServerName"),
                public_key: decode_public_key(&get_str("realityPublicKey"))?,
                short_id: decode_short_id(&get_str("realityShortId"))?,
                fingerprint: Fingerprint::parse(&get_str("realityFingerprint"))?,
            }
        } else {
            RealityParams::default()
        };

        let ws = WsParams {
            host: get_str("wsHost"),
            path: default_path(get_str("wsPath")),
            headers: split_headers(&get_str("wsHeaders")),
            max_early_data: get_str("wsMaxEarlyData").parse().unwrap_or(0),
            early_data_header: {
                let h = get_str("wsEarlyDataHeaderName");
                if h.is_empty() {
                    "Sec-WebSocket-Protocol".to_string()
                } else {
                    h
                }
            },
            heartbeat_period: get_str("wsHeartbeat").parse().unwrap_or(0),
        };

        let http_upgrade = HttpUpgradeParams {
            host: get_str("huHost"),
            path: default_path(get_str("huPath")),
            headers: split_headers(&get_str("huHeaders")),
        };

        let xhttp = XhttpParams {
            host: get_str("xhttpHost"),
            path: default_path(get_str("xhttpPath")),
            headers: split_headers(&get_str("xhttpHeaders")),
            mode: XhttpMode::parse(&get_str("xhttpMode"))?,
            no_grpc_header: get_bool("xhttpNoGrpcHeader"),
        };

        let vision_seed = match obj.get("testseed").and_then(Value::as_str) {
            Some(s) => parse_seed(s)?,
            None => DEFAULT_VISION_SEED,
        };

        Ok(VlessConfig {
            name: get_str("name"),
            server_address,
            server_port,
            resolved_ip,
            uuid,
            encryption,
            transport,
            flow,
            security,
            tls,
            reality,
            ws,
            http_upgrade,
            xhttp,
            vision_seed,
            mux_enabled: get_bool("muxEnabled"),
            xudp_enabled: get_bool("xudpEnabled"),
        })
    }

    /// 实际拨号地址：优先使用预解析 IP
    pub fn dial_host(&self) -> String {
        match self.resolved_ip {
            Some(ip) => ip.to_string(),
            None => self.server_address.clone(),
        }
    }

    /// TLS SNI：显式配置优先，否则用服务器地址
    pub fn effective_sni(&self) -> &str {
        if self.tls.server_name.is_empty() {
            &self.server_address
        } else {
            &self.tls.server_name
        }
    }
}

fn default_path(p: String) -> String {
    if p.is_empty() {
        "/".to_string()
    } else {
        p
    }
}

fn split_nonempty(s: &str, sep: char) -> Vec<String> {
    s.split(sep)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// "k1:v1,k2:v2" 形式的头部列表
fn split_headers(s: &str) -> Vec<(String, String)> {
    s.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once(':')?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() {
                None
            } else {
                Some((k.to_string(), v.to_string()))
            }
        })
        .collect()
}

/// testseed: 4 个逗号分隔的 u32
pub(crate) fn parse_seed(s: &str) -> Result<[u32; 4]> {
    let parts: Vec<u32> = s
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| CoreError::ConfigInvalid(format!("testseed is not 4 u32s: {}", s)))?;
    if parts.len() != 4 {
        return Err(CoreError::ConfigInvalid(format!(
            "testseed needs 4 values, got {}",
            parts.len()
        )));
    }
    Ok([parts[0], parts[1], parts[2], parts[3]])
}

/// base64 (标准或 URL-safe) 的 32 字节 X25519 公钥
pub(crate) fn decode_public_key(s: &str) -> Result<[u8; 32]> {
    use base64::Engine;
    let trimmed = s.trim_end_matches('=');
    let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|e| CoreError::ConfigInvalid(format!("realityPublicKey: {}", e)))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CoreError::ConfigInvalid("realityPublicKey must be 32 bytes".into()))?;
    Ok(arr)
}

/// hex 编码的 short id，0-8 字节
pub(crate) fn decode_short_id(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 || s.len() > 16 {
        return Err(CoreError::ConfigInvalid(format!(
            "realityShortId: bad length {}",
            s.len()
        )));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| CoreError::ConfigInvalid("realityShortId is not hex".into()))
        })
        .collect()
}

/// config_id → VlessConfig 查找表（路由文档的 configs 段）
pub type ConfigTable = HashMap<Uuid, VlessConfig>;
