//! FakeIP 池：域名与合成 IP 偏移量的双向映射。
//!
//! 偏移量取值 [1, 131071]。IPv4 地址 = 198.18.0.0 + offset，
//! IPv6 地址 = fc00:: 末 32 位放 offset。池满时按 LRU 逐出。

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::debug;

use crate::config::VlessConfig;
use crate::router::{DomainRouter, RouteAction};

/// 偏移量下界（0 保留）
pub const MIN_OFFSET: u32 = 1;
/// 偏移量上界（198.18.0.0/15 去掉 .0）
pub const MAX_OFFSET: u32 = 131_071;

const IPV4_BASE: u32 = 0xC612_0000; // 198.18.0.0

/// 一条域名绑定：目标配置与直连标记。config 为 None 当且仅当 is_direct。
#[derive(Debug, Clone)]
pub struct FakeIpEntry {
    pub domain: String,
    pub config: Option<VlessConfig>,
    pub is_direct: bool,
}

#[derive(Debug, Clone, Copy)]
struct LruLink {
    prev: u32, // 0 = 无
    next: u32,
}

/// 双 map + 侵入式 LRU 链表（以 offset 为节点）
pub struct FakeIpPool {
    domain_to_offset: HashMap<String, u32>,
    offset_to_entry: HashMap<u32, FakeIpEntry>,
    links: HashMap<u32, LruLink>,
    head: u32, // 最近使用
    tail: u32, // 最久未用
    next_offset: u32,
}

impl FakeIpPool {
    pub fn new() -> Self {
        Self {
            domain_to_offset: HashMap::new(),
            offset_to_entry: HashMap::new(),
            links: HashMap::new(),
            head: 0,
            tail: 0,
            next_offset: MIN_OFFSET,
        }
    }

    pub fn len(&self) -> usize {
        self.offset_to_entry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offset_to_entry.is_empty()
    }

    /// 为域名分配偏移量。已知域名触达 LRU 并替换条目（配置可能已变）；
    /// 新域名优先用未发过的偏移量，池满则逐出 LRU 尾。
    pub fn allocate(&mut self, domain: &str, config: Option<VlessConfig>, is_direct: bool) -> u32 {
        let domain = domain.to_lowercase();

        if let Some(&offset) = self.domain_to_offset.get(&domain) {
            self.touch(offset);
            self.offset_to_entry.insert(
                offset,
                FakeIpEntry {
                    domain,
                    config,
                    is_direct,
                },
            );
            return offset;
        }

        let offset = if self.next_offset <= MAX_OFFSET {
            let off = self.next_offset;
            self.next_offset += 1;
            off
        } else {
            let victim = self.tail;
            self.evict(victim);
            victim
        };

        self.domain_to_offset.insert(domain.clone(), offset);
        self.offset_to_entry.insert(
            offset,
            FakeIpEntry {
                domain: domain.clone(),
                config,
                is_direct,
            },
        );
        self.push_front(offset);
        debug!(domain = domain.as_str(), offset, "fake-ip allocated");
        offset
    }

    /// 按偏移量取条目并触达 LRU（活跃流量让映射保鲜）
    pub fn lookup(&mut self, offset: u32) -> Option<&FakeIpEntry> {
        if !self.offset_to_entry.contains_key(&offset) {
            return None;
        }
        self.touch(offset);
        self.offset_to_entry.get(&offset)
    }

    pub fn offset_of(&self, domain: &str) -> Option<u32> {
        self.domain_to_offset.get(&domain.to_lowercase()).copied()
    }

    /// 针对新路由重建：逐域名重新解析，不匹配或代理配置缺失则移除，
    /// 否则原位更新条目。偏移量保持不变。
    pub fn rebuild(&mut self, router: &DomainRouter) {
        let domains: Vec<(String, u32)> = self
            .domain_to_offset
            .iter()
            .map(|(d, o)| (d.clone(), *o))
            .collect();

        for (domain, offset) in domains {
            match router.match_domain(&domain) {
                Some(RouteAction::Direct) => {
                    self.offset_to_entry.insert(
                        offset,
                        FakeIpEntry {
                            domain,
                            config: None,
                            is_direct: true,
                        },
                    );
                }
                Some(RouteAction::Proxy(id)) => match router.config(&id) {
                    Some(cfg) => {
                        self.offset_to_entry.insert(
                            offset,
                            FakeIpEntry {
                                domain,
                                config: Some(cfg.clone()),
                                is_direct: false,
                            },
                        );
                    }
                    None => {
                        debug!(domain = domain.as_str(), "rebuild: proxy config gone, dropping");
                        self.remove(offset);
                    }
                },
                None => {
                    debug!(domain = domain.as_str(), "rebuild: no longer routed, dropping");
                    self.remove(offset);
                }
            }
        }
    }

    /// 完全清空（整体拆除时）
    pub fn clear(&mut self) {
        self.domain_to_offset.clear();
        self.offset_to_entry.clear();
        self.links.clear();
        self.head = 0;
        self.tail = 0;
        self.next_offset = MIN_OFFSET;
    }

    fn remove(&mut self, offset: u32) {
        if let Some(entry) = self.offset_to_entry.remove(&offset) {
            self.domain_to_offset.remove(&entry.domain);
            self.unlink(offset);
        }
    }

    fn evict(&mut self, offset: u32) {
        if let Some(entry) = self.offset_to_entry.remove(&offset) {
            debug!(domain = entry.domain.as_str(), offset, "fake-ip evicted");
            self.domain_to_offset.remove(&entry.domain);
            self.unlink(offset);
        }
    }

    fn unlink(&mut self, offset: u32) {
        let Some(link) = self.links.remove(&offset) else {
            return;
        };
        if link.prev != 0 {
            if let Some(p) = self.links.get_mut(&link.prev) {
                p.next = link.next;
            }
        } else {
            self.head = link.next;
        }
        if link.next != 0 {
            if let Some(n) = self.links.get_mut(&link.next) {
                n.prev = link.prev;
            }
        } else {
            self.tail = link.prev;
        }
    }

    fn push_front(&mut self, offset: u32) {
        let old_head = self.head;
        self.links.insert(
            offset,
            LruLink {
                prev: 0,
                next: old_head,
            },
        );
        if old_head != 0 {
            if let Some(h) = self.links.get_mut(&old_head) {
                h.prev = offset;
            }
        }
        self.head = offset;
        if self.tail == 0 {
            self.tail = offset;
        }
    }

    fn touch(&mut self, offset: u32) {
        if self.head == offset {
            return;
        }
        self.unlink(offset);
        self.push_front(offset);
    }

    #[cfg(test)]
    fn lru_order(&self) -> Vec<u32> {
        let mut order = Vec::new();
        let mut cur = self.head;
        while cur != 0 {
            order.push(cur);
            cur = self.links.get(&cur).map(|l| l.next).unwrap_or(0);
        }
        order
    }
}

/// 偏移量 → 合成 IPv4
pub fn ipv4_addr(offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(IPV4_BASE + offset)
}

/// 偏移量 → 合成 IPv6 (fc00:: + 末 32 位)
pub fn ipv6_addr(offset: u32) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[0] = 0xFC;
    octets[12..16].copy_from_slice(&offset.to_be_bytes());
    Ipv6Addr::from(octets)
}

/// 从地址还原偏移量；不在池地址段或偏移量越界返回 None
pub fn ip_to_offset(ip: IpAddr) -> Option<u32> {
    match ip {
        IpAddr::V4(v4) => {
            let raw = u32::from(v4);
            let offset = raw.checked_sub(IPV4_BASE)?;
            if (MIN_OFFSET..=MAX_OFFSET).contains(&offset) {
                Some(offset)
            } else {
                None
            }
        }
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            if octets[0] != 0xFC || octets[1] != 0x00 {
                return None;
            }
            if octets[2..12].iter().any(|&b| b != 0) {
                return None;
            }
            let offset = u32::from_be_bytes([octets[12], octets[13], octets[14], octets[15]]);
            if (MIN_OFFSET..=MAX_OFFSET).contains(&offset) {
                Some(offset)
            } else {
                None
            }
        }
    }
}

/// 地址是否落在 FakeIP 段内（不校验偏移量是否已分配）
pub fn is_fake_ip(ip: IpAddr) -> bool {
    ip_to_offset(ip).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_invariants(pool: &FakeIpPool) {
        // 双 map 一致
        assert_eq!(pool.domain_to_offset.len(), pool.offset_to_entry.len());
        for (domain, &offset) in &pool.domain_to_offset {
            let entry = pool.offset_to_entry.get(&offset).expect("offset present");
            assert_eq!(&entry.domain, domain);
            // config None 当且仅当 is_direct
            assert_eq!(entry.config.is_none(), entry.is_direct);
        }
        // 每个活跃 offset 在 LRU 里恰好一次
        let order = pool.lru_order();
        assert_eq!(order.len(), pool.offset_to_entry.len());
        let mut seen = std::collections::HashSet::new();
        for off in &order {
            assert!(seen.insert(*off), "offset {} duplicated in LRU", off);
            assert!((MIN_OFFSET..=MAX_OFFSET).contains(off));
        }
    }

    #[test]
    fn allocate_sequential_offsets() {
        let mut pool = FakeIpPool::new();
        assert_eq!(pool.allocate("a.com", None, true), 1);
        assert_eq!(pool.allocate("b.com", None, true), 2);
        assert_eq!(pool.allocate("c.com", None, true), 3);
        pool_invariants(&pool);
    }

    #[test]
    fn allocate_known_domain_keeps_offset() {
        let mut pool = FakeIpPool::new();
        let off = pool.allocate("a.com", None, true);
        assert_eq!(pool.allocate("a.com", None, true), off);
        assert_eq!(pool.len(), 1);
        pool_invariants(&pool);
    }

    #[test]
    fn domain_keys_lowercased() {
        let mut pool = FakeIpPool::new();
        let off = pool.allocate("Example.COM", None, true);
        assert_eq!(pool.offset_of("example.com"), Some(off));
        assert_eq!(pool.allocate("EXAMPLE.com", None, true), off);
        pool_invariants(&pool);
    }

    #[test]
    fn lookup_touches_lru() {
        let mut pool = FakeIpPool::new();
        let a = pool.allocate("a.com", None, true);
        let b = pool.allocate("b.com", None, true);
        assert_eq!(pool.lru_order(), vec![b, a]);
        pool.lookup(a);
        assert_eq!(pool.lru_order(), vec![a, b]);
        pool_invariants(&pool);
    }

    #[test]
    fn ipv4_roundtrip() {
        assert_eq!(ipv4_addr(1), Ipv4Addr::new(198, 18, 0, 1));
        for off in [MIN_OFFSET, 2, 255, 256, 65535, MAX_OFFSET] {
            assert_eq!(ip_to_offset(IpAddr::V4(ipv4_addr(off))), Some(off));
        }
    }

    #[test]
    fn ipv6_roundtrip() {
        for off in [MIN_OFFSET, 7, 65536, MAX_OFFSET] {
            let addr = ipv6_addr(off);
            assert_eq!(addr.octets()[0], 0xFC);
            assert_eq!(ip_to_offset(IpAddr::V6(addr)), Some(off));
        }
    }

    #[test]
    fn offset_boundaries() {
        // offset 0 与 131072 拒绝
        assert_eq!(ip_to_offset("198.18.0.0".parse().unwrap()), None);
        assert_eq!(
            ip_to_offset(IpAddr::V4(Ipv4Addr::from(IPV4_BASE + MAX_OFFSET + 1))),
            None
        );
        let mut octets = [0u8; 16];
        octets[0] = 0xFC;
        assert_eq!(ip_to_offset(IpAddr::V6(Ipv6Addr::from(octets))), None); // offset 0
        octets[12..16].copy_from_slice(&(MAX_OFFSET + 1).to_be_bytes());
        assert_eq!(ip_to_offset(IpAddr::V6(Ipv6Addr::from(octets))), None);
    }

    #[test]
    fn foreign_addresses_rejected() {
        assert_eq!(ip_to_offset("1.1.1.1".parse().unwrap()), None);
        assert_eq!(ip_to_offset("10.8.0.2".parse().unwrap()), None);
        assert_eq!(ip_to_offset("fd00::2".parse().unwrap()), None);
        // fc00:: 前缀但中段非零
        assert_eq!(ip_to_offset("fc00:1::1".parse().unwrap()), None);
    }

    #[test]
    fn eviction_when_full() {
        let mut pool = FakeIpPool::new();
        pool.next_offset = MAX_OFFSET - 1; // 只剩 2 个新偏移量
        let a = pool.allocate("a.com", None, true);
        let b = pool.allocate("b.com", None, true);
        assert_eq!(b, MAX_OFFSET);

        // 池满；第三个域名逐出 LRU 尾（a.com）
        let c = pool.allocate("c.com", None, true);
        assert_eq!(c, a);
        assert_eq!(pool.offset_of("a.com"), None);
        assert_eq!(pool.offset_of("b.com"), Some(b));
        pool_invariants(&pool);
    }

    #[test]
    fn rebuild_updates_and_drops() {
        use serde_json::json;
        const P1: &str = "11111111-1111-1111-1111-111111111111";

        let router = DomainRouter::from_document(&json!({
            "rules": [
                {"action": "proxy", "configId": P1,
                 "domainRules": [{"type": "domain", "value": "keep.com"}]},
                {"action": "direct",
                 "domainRules": [{"type": "domain", "value": "direct.com"}]}
            ],
            "configs": { P1: {
                "serverAddress": "s.net", "serverPort": 443,
                "uuid": "550e8400-e29b-41d4-a716-446655440000"
            }}
        }))
        .unwrap();

        let mut pool = FakeIpPool::new();
        let keep = pool.allocate("keep.com", None, true);
        let gone = pool.allocate("gone.com", None, true);
        let direct = pool.allocate("direct.com", None, true);

        pool.rebuild(&router);
        pool_invariants(&pool);

        // keep.com 原位换上代理配置
        assert_eq!(pool.offset_of("keep.com"), Some(keep));
        let entry = pool.lookup(keep).unwrap();
        assert!(!entry.is_direct);
        assert!(entry.config.is_some());

        // 不再匹配的条目被移除
        assert_eq!(pool.offset_of("gone.com"), None);
        assert!(pool.lookup(gone).is_none() || gone == keep);

        // direct.com 保持直连
        let entry = pool.lookup(direct).unwrap();
        assert!(entry.is_direct);
    }

    #[test]
    fn rebuild_is_idempotent() {
        use serde_json::json;
        let router = DomainRouter::from_document(&json!({
            "rules": [
                {"action": "direct",
                 "domainRules": [{"type": "domainSuffix", "value": "keep.net"}]}
            ],
            "configs": {}
        }))
        .unwrap();

        let mut pool = FakeIpPool::new();
        pool.allocate("a.keep.net", None, true);
        pool.allocate("drop.org", None, true);

        pool.rebuild(&router);
        let after_first: Vec<_> = {
            let mut v: Vec<_> = pool.domain_to_offset.iter().map(|(d, o)| (d.clone(), *o)).collect();
            v.sort();
            v
        };
        pool.rebuild(&router);
        let after_second: Vec<_> = {
            let mut v: Vec<_> = pool.domain_to_offset.iter().map(|(d, o)| (d.clone(), *o)).collect();
            v.sort();
            v
        };
        assert_eq!(after_first, after_second);
        pool_invariants(&pool);
    }

    #[test]
    fn clear_resets_everything() {
        let mut pool = FakeIpPool::new();
        pool.allocate("a.com", None, true);
        pool.allocate("b.com", None, true);
        pool.clear();
        assert!(pool.is_empty());
        assert_eq!(pool.allocate("c.com", None, true), 1);
    }
}
