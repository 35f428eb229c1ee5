//! Vision 流包装器：自适应 padding 与直通切换。
//!
//! 写入方向：对每条穿过 TLS 的应用记录分类，
//! 握手/CCS 记录原样发出；其余记录在 content_threshold 耗尽前
//! 前置一段短 padding，耗尽后前置一段长 padding 并就此停止。
//! 读取方向用同一种子推导出的调度还原记录边界、剥离 padding。
//! 嗅探到对端 Finished / 首条应用数据记录后整条连接切换为直通。

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::common::ProxyStream;

const TLS_CHANGE_CIPHER_SPEC: u8 = 0x14;
const TLS_HANDSHAKE: u8 = 0x16;
const TLS_APPLICATION_DATA: u8 = 0x17;
const TLS_HEADER_LEN: usize = 5;

const READ_CHUNK: usize = 8192;

/// 一个方向的 padding 调度。
///
/// 长度全部取自种子化的 ChaCha20，因此对端用同一种子
/// 能复现完全相同的长度序列。padding 内容另取系统随机，
/// 不参与调度。
pub struct PaddingSchedule {
    content_threshold: u32,
    long_max: u32,
    long_base: u32,
    short_max: u32,
    rng: ChaCha20Rng,
    /// 长 padding 已发出，本方向不再 padding
    exhausted: bool,
}

impl PaddingSchedule {
    pub fn new(seed: &[u32; 4], direction: &str) -> Self {
        let mut key = [0u8; 32];
        for (i, word) in seed.iter().enumerate() {
            key[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        let label = direction.as_bytes();
        let n = label.len().min(16);
        key[16..16 + n].copy_from_slice(&label[..n]);

        Self {
            content_threshold: seed[0],
            long_max: seed[1],
            long_base: seed[2],
            short_max: seed[3],
            rng: ChaCha20Rng::from_seed(key),
            exhausted: false,
        }
    }

    /// 下一条被 padding 的记录前应有的 padding 长度。
    /// 返回 None 表示本方向 padding 已结束。
    pub fn next_padding_len(&mut self) -> Option<usize> {
        if self.exhausted {
            return None;
        }
        if self.content_threshold > 0 {
            self.content_threshold -= 1;
            Some(self.rng.gen_range(0..=self.short_max) as usize)
        } else {
            self.exhausted = true;
            Some((self.long_base + self.rng.gen_range(0..self.long_max.max(1))) as usize)
        }
    }

    pub fn exhausted(&self) -> bool {
        self.exhausted
    }
}

/// 读取端状态机
enum ReadPhase {
    /// 判定下一个块：padding 前缀还是裸握手记录
    ExpectBlock,
    /// 跳过 padding
    SkipPadding { remaining: usize },
    /// 凑 TLS 记录头
    ReadHeader,
    /// 读记录体
    ReadBody { remaining: usize, record_type: u8 },
    /// 直通
    Direct,
}

/// Vision 流。包在 VLESS 头交换之后的传输流外侧。
pub struct VisionStream {
    inner: ProxyStream,

    write_schedule: PaddingSchedule,
    read_schedule: PaddingSchedule,

    read_phase: ReadPhase,
    /// 尚未处理的密文流字节
    read_buf: BytesMut,
    /// 已还原、待交付的明文记录字节
    read_out: BytesMut,

    /// 嗅探结果：整条连接直通，写方向也停 padding
    direct: bool,
    /// 已构帧未写完的字节（部分写/Pending 时暂存）
    write_pending: BytesMut,
}

impl VisionStream {
    pub fn new(inner: ProxyStream, seed: &[u32; 4]) -> Self {
        Self {
            inner,
            write_schedule: PaddingSchedule::new(seed, "client"),
            read_schedule: PaddingSchedule::new(seed, "server"),
            read_phase: ReadPhase::ExpectBlock,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            read_out: BytesMut::new(),
            direct: false,
            write_pending: BytesMut::new(),
        }
    }

    /// 是否已切换直通
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// 为一条出站记录构帧
    fn frame_record(&mut self, record: &[u8]) -> BytesMut {
        let mut out = BytesMut::with_capacity(record.len() + 64);

        let first = record.first().copied().unwrap_or(0);
        let is_handshake = first == TLS_HANDSHAKE || first == TLS_CHANGE_CIPHER_SPEC;

        if !self.direct && !is_handshake {
            if let Some(pad_len) = self.write_schedule.next_padding_len() {
                let mut padding = vec![0u8; pad_len];
                rand::thread_rng().fill_bytes(&mut padding);
                if let Some(b) = padding.first_mut() {
                    // 首字节避开 TLS 记录类型空间，对端据此区分 padding 与裸记录
                    *b |= 0x80;
                }
                out.extend_from_slice(&padding);
            }
        }
        out.extend_from_slice(record);
        out
    }

    /// 消化 read_buf，把还原的记录字节搬进 read_out
    fn unpad(&mut self) {
        loop {
            match self.read_phase {
                ReadPhase::Direct => {
                    if !self.read_buf.is_empty() {
                        self.read_out.extend_from_slice(&self.read_buf);
                        self.read_buf.clear();
                    }
                    return;
                }
                ReadPhase::ExpectBlock => {
                    let Some(&first) = self.read_buf.first() else {
                        return;
                    };
                    if first == TLS_HANDSHAKE || first == TLS_CHANGE_CIPHER_SPEC {
                        // 裸握手记录，无 padding
                        self.read_phase = ReadPhase::ReadHeader;
                    } else if first == TLS_APPLICATION_DATA {
                        // 对端已进入直通（padding 首字节永不落在记录类型空间）
                        debug!("vision: inbound application data, direct mode");
                        self.direct = true;
                        self.read_phase = ReadPhase::Direct;
                    } else {
                        match self.read_schedule.next_padding_len() {
                            Some(len) => {
                                self.read_phase = ReadPhase::SkipPadding { remaining: len };
                            }
                            None => {
                                // 调度已尽但仍有非记录字节，视作直通数据
                                self.read_phase = ReadPhase::Direct;
                            }
                        }
                    }
                }
                ReadPhase::SkipPadding { remaining } => {
                    let skip = remaining.min(self.read_buf.len());
                    self.read_buf.advance(skip);
                    let left = remaining - skip;
                    if left > 0 {
                        self.read_phase = ReadPhase::SkipPadding { remaining: left };
                        return;
                    }
                    self.read_phase = ReadPhase::ReadHeader;
                }
                ReadPhase::ReadHeader => {
                    if self.read_buf.len() < TLS_HEADER_LEN {
                        return;
                    }
                    let record_type = self.read_buf[0];
                    let body_len =
                        u16::from_be_bytes([self.read_buf[3], self.read_buf[4]]) as usize;
                    self.read_out.extend_from_slice(&self.read_buf[..TLS_HEADER_LEN]);
                    self.read_buf.advance(TLS_HEADER_LEN);
                    self.read_phase = ReadPhase::ReadBody {
                        remaining: body_len,
                        record_type,
                    };
                }
                ReadPhase::ReadBody {
                    remaining,
                    record_type,
                } => {
                    let take = remaining.min(self.read_buf.len());
                    self.read_out.extend_from_slice(&self.read_buf[..take]);
                    self.read_buf.advance(take);
                    let left = remaining - take;
                    if left > 0 {
                        self.read_phase = ReadPhase::ReadBody {
                            remaining: left,
                            record_type,
                        };
                        return;
                    }
                    if record_type == TLS_APPLICATION_DATA || self.read_schedule.exhausted() {
                        // Finished/应用数据已过，或长 padding 已消费：之后都是裸流
                        debug!("vision: record boundary restored, switching to direct");
                        self.direct = true;
                        self.read_phase = ReadPhase::Direct;
                    } else {
                        self.read_phase = ReadPhase::ExpectBlock;
                    }
                }
            }
        }
    }
}

impl AsyncRead for VisionStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            // 先交付已还原的数据
            if !self.read_out.is_empty() {
                let n = self.read_out.len().min(buf.remaining());
                buf.put_slice(&self.read_out[..n]);
                self.read_out.advance(n);
                return Poll::Ready(Ok(()));
            }

            // 直通且无缓冲：直接从内层读
            if matches!(self.read_phase, ReadPhase::Direct) && self.read_buf.is_empty() {
                return Pin::new(&mut self.inner).poll_read(cx, buf);
            }

            let mut tmp = [0u8; READ_CHUNK];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut self.inner).poll_read(cx, &mut tmp_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = tmp_buf.filled();
                    if filled.is_empty() {
                        // EOF：缓冲里还有未成帧的字节就按直通尽数交付
                        if !self.read_buf.is_empty() {
                            let leftovers = self.read_buf.split();
                            self.read_out.extend_from_slice(&leftovers);
                            continue;
                        }
                        return Poll::Ready(Ok(()));
                    }
                    self.read_buf.extend_from_slice(filled);
                    self.unpad();
                    // read_out 可能仍为空（padding 未跳完），继续循环
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for VisionStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // 上一条记录的余量先写完；这些字节早已报告为已消费
        while !self.write_pending.is_empty() {
            let this = &mut *self;
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_pending) {
                Poll::Ready(Ok(n)) => {
                    self.write_pending.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if self.direct || self.write_schedule.exhausted() {
            return Pin::new(&mut self.inner).poll_write(cx, buf);
        }

        // 一次 poll_write 恰好构一次帧；重复构帧会重复消耗调度
        let framed = self.frame_record(buf);
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, &framed) {
            Poll::Ready(Ok(n)) => {
                if n < framed.len() {
                    self.write_pending.extend_from_slice(&framed[n..]);
                }
                Poll::Ready(Ok(buf.len()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                // 帧已生成：挂起余量，报告明文已消费
                self.write_pending.extend_from_slice(&framed);
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // 残留记录先落盘
        while !self.write_pending.is_empty() {
            let this = &mut *self;
            match Pin::new(&mut this.inner).poll_write(cx, &this.write_pending) {
                Poll::Ready(Ok(n)) => {
                    self.write_pending.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_VISION_SEED;

    fn tls_record(record_type: u8, body: &[u8]) -> Vec<u8> {
        let mut rec = vec![record_type, 0x03, 0x03];
        rec.extend_from_slice(&(body.len() as u16).to_be_bytes());
        rec.extend_from_slice(body);
        rec
    }

    #[test]
    fn schedule_is_deterministic() {
        let mut a = PaddingSchedule::new(&DEFAULT_VISION_SEED, "client");
        let mut b = PaddingSchedule::new(&DEFAULT_VISION_SEED, "client");
        for _ in 0..50 {
            assert_eq!(a.next_padding_len(), b.next_padding_len());
        }
    }

    #[test]
    fn schedule_directions_differ() {
        let mut c = PaddingSchedule::new(&DEFAULT_VISION_SEED, "client");
        let mut s = PaddingSchedule::new(&DEFAULT_VISION_SEED, "server");
        let cs: Vec<_> = (0..20).map(|_| c.next_padding_len()).collect();
        let ss: Vec<_> = (0..20).map(|_| s.next_padding_len()).collect();
        assert_ne!(cs, ss);
    }

    #[test]
    fn schedule_short_then_long_then_none() {
        let seed = [3, 100, 900, 256];
        let mut sched = PaddingSchedule::new(&seed, "client");
        for _ in 0..3 {
            let len = sched.next_padding_len().unwrap();
            assert!(len <= 256);
            assert!(!sched.exhausted());
        }
        let long = sched.next_padding_len().unwrap();
        assert!((900..1000).contains(&long));
        assert!(sched.exhausted());
        assert_eq!(sched.next_padding_len(), None);
    }

    #[test]
    fn frame_leaves_handshake_records_alone() {
        let inner: ProxyStream = Box::new(tokio::io::duplex(1).0);
        let mut stream = VisionStream::new(inner, &DEFAULT_VISION_SEED);

        let rec = tls_record(TLS_HANDSHAKE, b"client hello");
        let framed = stream.frame_record(&rec);
        assert_eq!(&framed[..], &rec[..]);

        let ccs = tls_record(TLS_CHANGE_CIPHER_SPEC, &[1]);
        let framed = stream.frame_record(&ccs);
        assert_eq!(&framed[..], &ccs[..]);
    }

    #[test]
    fn frame_prepends_padding_for_other_records() {
        let inner: ProxyStream = Box::new(tokio::io::duplex(1).0);
        let seed = [10, 100, 900, 256];
        let mut stream = VisionStream::new(inner, &seed);
        let mut expect = PaddingSchedule::new(&seed, "client");

        let rec = tls_record(TLS_APPLICATION_DATA, b"data");
        let framed = stream.frame_record(&rec);
        let pad_len = expect.next_padding_len().unwrap();
        assert_eq!(framed.len(), pad_len + rec.len());
        assert_eq!(&framed[pad_len..], &rec[..]);
        if pad_len > 0 {
            assert!(framed[0] >= 0x80);
        }
    }

    #[tokio::test]
    async fn padded_roundtrip_restores_records() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let seed = [4, 50, 100, 64];
        let (a, b) = tokio::io::duplex(64 * 1024);

        // 写端：client 方向调度
        let mut writer = VisionStream::new(Box::new(a), &seed);
        // 读端需要用 client 调度剥离 client 发出的 padding
        let mut reader = VisionStream::new(Box::new(b), &seed);
        reader.read_schedule = PaddingSchedule::new(&seed, "client");

        // 非 0x17 的记录类型（0x18: 心跳，占位测试流），保持 padded 阶段
        let records: Vec<Vec<u8>> = (0..3)
            .map(|i| tls_record(0x18, format!("record-{}", i).as_bytes()))
            .collect();

        for rec in &records {
            writer.write_all(rec).await.unwrap();
            writer.flush().await.unwrap();
        }

        let mut restored = vec![0u8; records.iter().map(Vec::len).sum()];
        reader.read_exact(&mut restored).await.unwrap();

        let expected: Vec<u8> = records.concat();
        assert_eq!(restored, expected);
    }

    #[tokio::test]
    async fn application_data_flips_reader_to_direct() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let seed = DEFAULT_VISION_SEED;
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = VisionStream::new(Box::new(a), &seed);
        let mut reader = VisionStream::new(Box::new(b), &seed);
        reader.read_schedule = PaddingSchedule::new(&seed, "client");

        let finished = tls_record(TLS_APPLICATION_DATA, b"finished-then-data");
        writer.write_all(&finished).await.unwrap();
        writer.flush().await.unwrap();

        let mut got = vec![0u8; finished.len()];
        reader.read_exact(&mut got).await.unwrap();
        assert_eq!(got, finished);
        assert!(reader.is_direct());

        // 直通后任意字节原样通过
        writer.write_all(b"raw bytes now").await.unwrap();
        writer.flush().await.unwrap();
        let mut raw = vec![0u8; 13];
        reader.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw, b"raw bytes now");
    }

    #[tokio::test]
    async fn writer_stops_padding_after_direct() {
        use tokio::io::AsyncWriteExt;

        let (a, mut probe) = tokio::io::duplex(64 * 1024);
        let mut writer = VisionStream::new(Box::new(a), &DEFAULT_VISION_SEED);
        writer.direct = true;

        writer.write_all(b"plain").await.unwrap();
        writer.flush().await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut got = vec![0u8; 5];
        probe.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"plain");
    }

    #[tokio::test]
    async fn handshake_records_pass_unpadded_end_to_end() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let seed = DEFAULT_VISION_SEED;
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = VisionStream::new(Box::new(a), &seed);
        let mut reader = VisionStream::new(Box::new(b), &seed);
        reader.read_schedule = PaddingSchedule::new(&seed, "client");

        let hs = tls_record(TLS_HANDSHAKE, b"server hello bytes");
        writer.write_all(&hs).await.unwrap();
        writer.flush().await.unwrap();

        let mut got = vec![0u8; hs.len()];
        reader.read_exact(&mut got).await.unwrap();
        assert_eq!(got, hs);
        assert!(!reader.is_direct());
    }
}
