//! XUDP GlobalID：客户端指定的 8 字节流标识。
//!
//! 服务端用它把 `global_id → 出站 UDP socket` 固定下来，
//! 客户端侧临时端口重绑后源端口映射不变（full-cone NAT）。

/// 仓库固定的 BLAKE3 密钥
const GLOBAL_ID_KEY: [u8; 32] = [
    0x73, 0x6b, 0x79, 0x74, 0x75, 0x6e, 0x2d, 0x78, // "skytun-x"
    0x75, 0x64, 0x70, 0x2d, 0x67, 0x6c, 0x6f, 0x62, // "udp-glob"
    0x61, 0x6c, 0x2d, 0x69, 0x64, 0x2d, 0x6b, 0x65, // "al-id-ke"
    0x79, 0x2d, 0x76, 0x31, 0x00, 0x00, 0x00, 0x00, // "y-v1"
];

/// `blake3_keyed("udp:" + host + ":" + port)` 截断到 8 字节
pub fn global_id(src_host: &str, src_port: u16) -> [u8; 8] {
    let input = format!("udp:{}:{}", src_host, src_port);
    let hash = blake3::keyed_hash(&GLOBAL_ID_KEY, input.as_bytes());
    let mut id = [0u8; 8];
    id.copy_from_slice(&hash.as_bytes()[..8]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_for_same_source() {
        assert_eq!(global_id("10.8.0.2", 50000), global_id("10.8.0.2", 50000));
    }

    #[test]
    fn differs_by_host_and_port() {
        let base = global_id("10.8.0.2", 50000);
        assert_ne!(base, global_id("10.8.0.2", 50001));
        assert_ne!(base, global_id("10.8.0.3", 50000));
    }

    #[test]
    fn not_a_plain_hash_of_input() {
        // keyed hash 与未加 key 的 blake3 不同
        let keyed = global_id("h", 1);
        let plain = blake3::hash(b"udp:h:1");
        assert_ne!(&keyed, &plain.as_bytes()[..8]);
    }
}
