//! GeoIP 数据库：`GEO1` 平铺有序数组格式。
//!
//! 文件布局: `"GEO1"` magic (4B) + count (u32 BE) + count 条记录，
//! 每条 `{ start_ipv4: u32 BE, end_ipv4: u32 BE, country: u16 BE }`。
//! 记录按 start 升序，查询用二分。

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::Result;

const MAGIC: &[u8; 4] = b"GEO1";
const RECORD_LEN: usize = 10;

#[derive(Debug, Clone, Copy)]
struct Range {
    start: u32,
    end: u32,
    country: u16,
}

/// 预构建的 IPv4 → 国家码查询表
pub struct GeoIpDb {
    ranges: Vec<Range>,
}

impl GeoIpDb {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("failed to read geoip db '{}': {}", path.display(), e))?;
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 || &bytes[..4] != MAGIC {
            anyhow::bail!("geoip db: bad magic");
        }
        let count = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        let body = &bytes[8..];
        if body.len() < count * RECORD_LEN {
            anyhow::bail!(
                "geoip db: truncated, need {} records but body is {} bytes",
                count,
                body.len()
            );
        }

        let mut ranges = Vec::with_capacity(count);
        for i in 0..count {
            let r = &body[i * RECORD_LEN..(i + 1) * RECORD_LEN];
            ranges.push(Range {
                start: u32::from_be_bytes([r[0], r[1], r[2], r[3]]),
                end: u32::from_be_bytes([r[4], r[5], r[6], r[7]]),
                country: u16::from_be_bytes([r[8], r[9]]),
            });
        }
        Ok(GeoIpDb { ranges })
    }

    /// 查询 IPv4 所属国家码（打包 u16），未命中返回 0
    pub fn lookup(&self, ip: Ipv4Addr) -> u16 {
        let ip = u32::from(ip);
        // 找最后一条 start <= ip 的记录
        let idx = self.ranges.partition_point(|r| r.start <= ip);
        if idx == 0 {
            return 0;
        }
        let r = self.ranges[idx - 1];
        if ip <= r.end {
            r.country
        } else {
            0
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::pack_country;

    fn build_db(entries: &[(u32, u32, u16)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for (start, end, country) in entries {
            bytes.extend_from_slice(&start.to_be_bytes());
            bytes.extend_from_slice(&end.to_be_bytes());
            bytes.extend_from_slice(&country.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn lookup_hits_and_misses() {
        let cn = pack_country("CN");
        let us = pack_country("US");
        let db = GeoIpDb::parse(&build_db(&[
            (u32::from(Ipv4Addr::new(1, 0, 0, 0)), u32::from(Ipv4Addr::new(1, 0, 0, 255)), cn),
            (u32::from(Ipv4Addr::new(8, 8, 8, 0)), u32::from(Ipv4Addr::new(8, 8, 8, 255)), us),
        ]))
        .unwrap();

        assert_eq!(db.lookup(Ipv4Addr::new(1, 0, 0, 1)), cn);
        assert_eq!(db.lookup(Ipv4Addr::new(1, 0, 0, 255)), cn);
        assert_eq!(db.lookup(Ipv4Addr::new(8, 8, 8, 8)), us);
        // 区间之间的洞
        assert_eq!(db.lookup(Ipv4Addr::new(2, 0, 0, 1)), 0);
        // 所有区间之前
        assert_eq!(db.lookup(Ipv4Addr::new(0, 0, 0, 1)), 0);
        // 所有区间之后
        assert_eq!(db.lookup(Ipv4Addr::new(200, 0, 0, 1)), 0);
    }

    #[test]
    fn range_boundaries_inclusive() {
        let jp = pack_country("JP");
        let db = GeoIpDb::parse(&build_db(&[(100, 200, jp)])).unwrap();
        assert_eq!(db.lookup(Ipv4Addr::from(100)), jp);
        assert_eq!(db.lookup(Ipv4Addr::from(200)), jp);
        assert_eq!(db.lookup(Ipv4Addr::from(99)), 0);
        assert_eq!(db.lookup(Ipv4Addr::from(201)), 0);
    }

    #[test]
    fn bad_magic_rejected() {
        assert!(GeoIpDb::parse(b"GEO2\x00\x00\x00\x00").is_err());
        assert!(GeoIpDb::parse(b"GE").is_err());
    }

    #[test]
    fn truncated_body_rejected() {
        let mut bytes = build_db(&[(1, 2, 3)]);
        bytes.truncate(bytes.len() - 1);
        assert!(GeoIpDb::parse(&bytes).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geo.db");
        std::fs::write(&path, build_db(&[(10, 20, pack_country("DE"))])).unwrap();
        let db = GeoIpDb::load(&path).unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db.lookup(Ipv4Addr::from(15)), pack_country("DE"));
    }
}
