//! DNS 拦截器。
//!
//! 目的端口 53 的 UDP 数据报在建流之前先经过这里：
//! 命中路由规则的 A/AAAA 查询直接用 FakeIP 作答（TTL 1），
//! DoH 关闭时拦截 DDR 发现查询，其余查询放行走正常 UDP 流。

use tracing::debug;

use super::fakeip::{ipv4_addr, ipv6_addr, FakeIpPool};
use crate::router::{DomainRouter, RouteAction};

/// DNS 标准端口
pub const DNS_PORT: u16 = 53;

/// 响应头标志：QR=1, AA=1, RD=1, RA=1
const RESPONSE_FLAGS: u16 = 0x8580;

/// DDR (RFC 9462) 发现名
const DDR_QNAME: &str = "_dns.resolver.arpa";

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;

/// 解析出的查询信息
pub struct DnsQuery {
    pub id: u16,
    /// 小写化的 QNAME
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// header 之后、answer 之前的完整 question 字节
    raw_question: Vec<u8>,
}

/// 从 DNS payload 解析单条查询；查询中不允许压缩指针
pub fn parse_query(data: &[u8]) -> Option<DnsQuery> {
    if data.len() < 12 {
        return None;
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    // QR 位必须为 0（查询）
    if flags & 0x8000 != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut pos = 12;
    let mut name_parts: Vec<String> = Vec::new();
    loop {
        if pos >= data.len() {
            return None;
        }
        let label_len = data[pos] as usize;
        if label_len == 0 {
            pos += 1;
            break;
        }
        if label_len & 0xC0 == 0xC0 {
            return None;
        }
        pos += 1;
        if pos + label_len > data.len() {
            return None;
        }
        let label = std::str::from_utf8(&data[pos..pos + label_len]).ok()?;
        name_parts.push(label.to_lowercase());
        pos += label_len;
    }
    if name_parts.is_empty() {
        return None;
    }

    if pos + 4 > data.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
    let qclass = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);
    pos += 4;

    Some(DnsQuery {
        id,
        name: name_parts.join("."),
        qtype,
        qclass,
        raw_question: data[12..pos].to_vec(),
    })
}

enum Answer {
    /// 一条 A/AAAA 记录
    Record { qtype: u16, rdata: Vec<u8> },
    /// ANCOUNT = 0
    NoData,
}

fn build_response(query: &DnsQuery, answer: Answer) -> Vec<u8> {
    let (ancount, answer_len) = match &answer {
        Answer::Record { rdata, .. } => (1u16, 2 + 2 + 2 + 4 + 2 + rdata.len()),
        Answer::NoData => (0u16, 0),
    };

    let mut resp = Vec::with_capacity(12 + query.raw_question.len() + answer_len);

    resp.extend_from_slice(&query.id.to_be_bytes());
    resp.extend_from_slice(&RESPONSE_FLAGS.to_be_bytes());
    resp.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    resp.extend_from_slice(&ancount.to_be_bytes());
    resp.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    resp.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    resp.extend_from_slice(&query.raw_question);

    if let Answer::Record { qtype, rdata } = answer {
        resp.extend_from_slice(&0xC00Cu16.to_be_bytes()); // 指向 question 的名字
        resp.extend_from_slice(&qtype.to_be_bytes());
        resp.extend_from_slice(&1u16.to_be_bytes()); // CLASS = IN
        resp.extend_from_slice(&1u32.to_be_bytes()); // TTL = 1
        resp.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        resp.extend_from_slice(&rdata);
    }

    resp
}

/// 拦截结果：Some(payload) 表示合成了响应（不再建 UDP 流），
/// None 表示放行。
pub fn intercept(
    payload: &[u8],
    router: &DomainRouter,
    pool: &mut FakeIpPool,
    doh_enabled: bool,
    ipv6_enabled: bool,
) -> Option<Vec<u8>> {
    let query = parse_query(payload)?;

    // DoH 关闭时挡掉 DDR 发现，防止客户端升级到 DoH 绕过拦截
    if !doh_enabled && query.name == DDR_QNAME {
        debug!("blocking DDR discovery query");
        return Some(build_response(&query, Answer::NoData));
    }

    if query.qtype != QTYPE_A && query.qtype != QTYPE_AAAA {
        return None;
    }
    if router.is_empty() {
        return None;
    }

    let action = router.match_domain(&query.name)?;
    let (config, is_direct) = match action {
        RouteAction::Direct => (None, true),
        RouteAction::Proxy(id) => match router.config(&id) {
            Some(cfg) => (Some(cfg.clone()), false),
            None => {
                debug!(domain = query.name.as_str(), config = %id, "routed config unknown, falling through");
                return None;
            }
        },
    };

    let offset = pool.allocate(&query.name, config, is_direct);

    let answer = match query.qtype {
        QTYPE_A => Answer::Record {
            qtype: QTYPE_A,
            rdata: ipv4_addr(offset).octets().to_vec(),
        },
        QTYPE_AAAA if ipv6_enabled => Answer::Record {
            qtype: QTYPE_AAAA,
            rdata: ipv6_addr(offset).octets().to_vec(),
        },
        // AAAA 但 IPv6 未启用
        _ => Answer::NoData,
    };

    debug!(
        domain = query.name.as_str(),
        qtype = query.qtype,
        offset,
        "dns query intercepted"
    );
    Some(build_response(&query, answer))
}
