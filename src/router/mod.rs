pub mod geoip;

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{ConfigTable, VlessConfig};

/// 路由决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Direct,
    Proxy(Uuid),
}

/// 编译后的域名规则集。
///
/// 匹配顺序：精确 → 后缀（全等或 ".suffix" 结尾）→ 关键字（子串）。
/// 同类规则先插入者优先。所有比较都在小写化后进行。
pub struct DomainRouter {
    exact: HashMap<String, RouteAction>,
    suffix: Vec<(String, RouteAction)>,
    keyword: Vec<(String, RouteAction)>,
    configs: ConfigTable,
}

impl DomainRouter {
    pub fn empty() -> Self {
        Self {
            exact: HashMap::new(),
            suffix: Vec::new(),
            keyword: Vec::new(),
            configs: HashMap::new(),
        }
    }

    /// 从 routing.json 文档编译
    ///
    /// 文档格式:
    /// `{"rules": [{"action", "configId", "domainRules": [{"type","value"}]}],
    ///   "configs": {"<uuid>": {...}}}`
    pub fn from_document(doc: &Value) -> Result<Self> {
        let mut router = DomainRouter::empty();

        if let Some(configs) = doc.get("configs").and_then(Value::as_object) {
            for (id, dict) in configs {
                let id: Uuid = match id.parse() {
                    Ok(id) => id,
                    Err(_) => {
                        warn!(id = id.as_str(), "skipping config with non-uuid id");
                        continue;
                    }
                };
                match VlessConfig::from_dict(dict) {
                    Ok(cfg) => {
                        router.configs.insert(id, cfg);
                    }
                    Err(e) => warn!(id = %id, error = %e, "skipping malformed config"),
                }
            }
        }

        let rules = doc
            .get("rules")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for rule in &rules {
            let action = match rule.get("action").and_then(Value::as_str) {
                Some("direct") => RouteAction::Direct,
                Some("proxy") => {
                    let id = rule
                        .get("configId")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse::<Uuid>().ok());
                    match id {
                        Some(id) => RouteAction::Proxy(id),
                        None => {
                            warn!("proxy rule without configId, skipping");
                            continue;
                        }
                    }
                }
                other => {
                    warn!(action = ?other, "rule with unknown action, skipping");
                    continue;
                }
            };

            let domain_rules = rule
                .get("domainRules")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for dr in &domain_rules {
                let value = match dr.get("value").and_then(Value::as_str) {
                    Some(v) if !v.is_empty() => v.to_lowercase(),
                    _ => continue,
                };
                match dr.get("type").and_then(Value::as_str) {
                    Some("domain") => {
                        router.exact.entry(value).or_insert(action);
                    }
                    Some("domainSuffix") => router.suffix.push((value, action)),
                    Some("domainKeyword") => router.keyword.push((value, action)),
                    other => warn!(rule_type = ?other, "unknown domain rule type, skipping"),
                }
            }
        }

        debug!(
            exact = router.exact.len(),
            suffix = router.suffix.len(),
            keyword = router.keyword.len(),
            configs = router.configs.len(),
            "router compiled"
        );
        Ok(router)
    }

    /// 从共享目录下的 routing.json 文件加载；文件缺失视为空规则集
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let doc: Value = serde_json::from_slice(&bytes)?;
                Self::from_document(&doc)
            }
            Err(_) => Ok(DomainRouter::empty()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.suffix.is_empty() && self.keyword.is_empty()
    }

    /// 规则匹配；入参内部小写化，结果是入参的纯函数
    pub fn match_domain(&self, domain: &str) -> Option<RouteAction> {
        let domain = domain.to_lowercase();

        if let Some(action) = self.exact.get(&domain) {
            return Some(*action);
        }
        for (suffix, action) in &self.suffix {
            if domain == *suffix || domain.ends_with(&format!(".{}", suffix)) {
                return Some(*action);
            }
        }
        for (keyword, action) in &self.keyword {
            if domain.contains(keyword.as_str()) {
                return Some(*action);
            }
        }
        None
    }

    pub fn config(&self, id: &Uuid) -> Option<&VlessConfig> {
        self.configs.get(id)
    }

    pub fn configs(&self) -> &ConfigTable {
        &self.configs
    }
}
