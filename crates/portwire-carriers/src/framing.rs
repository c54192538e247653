//! # framing 模块说明
//!
//! ## 意图（Why）
//! - 汇总 YARP 家族二进制线缆格式的固定字节：8 字节前导、发送方说明、索引头与确认包；
//!   各载体只组合这些积木，不重复实现位级细节。
//!
//! ## 线上形态（What）
//! - 前导：`'Y' 'A' <i32 LE: 7777 + specifier> 'R' 'P'`；
//! - 发送方说明：`i32(len + 1)`、名字字节、结尾 NUL；
//! - 索引：`'Y' 'A' i32(10) 'R' 'P'`，随后 10 字节 `[块数, 1, 0xFF × 8]`，再跟每块长度与一个
//!   恒为 0 的回复长度，最后是各块内容；
//! - 确认：`'Y' 'A' i32(0) 'R' 'P'`，读方丢弃其后声明长度的字节。
//!
//! ## 注意事项（Trade-offs）
//! - 块数以单字节表示，一条消息最多 255 块；
//! - 读索引时先累计声明长度并与上限比较，再分配缓冲，伪造的巨大长度不会触发大块分配。

use bytes::{BufMut, Bytes, BytesMut};
use portwire_core::error::{CoreError, Result, codes};
use portwire_transport::{TwoWayStream, read_i32_le};

/// 前导长度。
pub const HEADER_LEN: usize = 8;

/// YARP 前导中的基准值。
const YARP_BASE: i32 = 7777;

/// 索引头中的固定值。
const INDEX_MARK: i32 = 10;

/// 索引头之后的固定区长度。
const INDEX_PREFIX_LEN: usize = 10;

/// 发送方名字的长度上限。
const MAX_SENDER_LEN: usize = 4096;

pub mod specifier {
    pub const UDP: i32 = 0;
    pub const MCAST: i32 = 1;
    pub const TCP: i32 = 3;
    pub const LOCAL: i32 = 5;
    /// 置位表示不发送确认包。
    pub const NO_ACK: i32 = 128;
}

/// 文本载体前导。
pub const TEXT_PREAMBLE: &[u8; HEADER_LEN] = b"CONNECT ";

/// 带确认的文本载体前导。
pub const TEXT_ACK_PREAMBLE: &[u8; HEADER_LEN] = b"CONNACK ";

fn yarp_frame(value: i32) -> [u8; HEADER_LEN] {
    let n = value.to_le_bytes();
    [b'Y', b'A', n[0], n[1], n[2], n[3], b'R', b'P']
}

fn parse_yarp_frame(header: &[u8; HEADER_LEN]) -> Option<i32> {
    let framed = header[0] == b'Y' && header[1] == b'A' && header[6] == b'R' && header[7] == b'P';
    framed.then(|| i32::from_le_bytes([header[2], header[3], header[4], header[5]]))
}

/// 构造二进制载体的前导。
pub fn yarp_preamble(specifier: i32) -> [u8; HEADER_LEN] {
    yarp_frame(YARP_BASE + specifier)
}

/// 从前导中取出载体说明符；不是 YARP 前导时返回 `None`。
pub fn parse_yarp_preamble(header: &[u8; HEADER_LEN]) -> Option<i32> {
    parse_yarp_frame(header)
        .map(|value| value - YARP_BASE)
        .filter(|spec| (0..256).contains(spec))
}

/// 编码发送方说明。
pub fn encode_sender(sender: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(sender.len() + 5);
    out.put_i32_le(sender.len() as i32 + 1);
    out.put_slice(sender.as_bytes());
    out.put_u8(0);
    out.freeze()
}

/// 读取发送方说明。
pub async fn read_sender(stream: &mut (dyn TwoWayStream + '_)) -> Result<String> {
    let len = read_i32_le(stream).await?;
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_SENDER_LEN)
        .ok_or_else(|| {
            CoreError::violation(codes::WIRE_MALFORMED, format!("bad sender length {len}"))
        })?;
    let mut raw = vec![0u8; len];
    stream.read_exact(&mut raw).await?;
    if raw.last() == Some(&0) {
        raw.pop();
    }
    String::from_utf8(raw).map_err(|err| {
        CoreError::violation(codes::WIRE_MALFORMED, "sender name is not utf-8").with_cause(err)
    })
}

/// 为一组块生成索引头。
pub fn encode_index(block_lens: &[usize]) -> Result<Bytes> {
    let count = u8::try_from(block_lens.len()).map_err(|_| {
        CoreError::violation(
            codes::WIRE_TOO_LARGE,
            format!("message has {} blocks, at most 255 allowed", block_lens.len()),
        )
    })?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + INDEX_PREFIX_LEN + 4 * block_lens.len() + 4);
    out.put_slice(&yarp_frame(INDEX_MARK));
    out.put_u8(count);
    out.put_u8(1);
    out.put_slice(&[0xFF; 8]);
    for len in block_lens {
        out.put_i32_le(*len as i32);
    }
    out.put_i32_le(0);
    Ok(out.freeze())
}

/// 以索引头加各块的形式整体写出。
///
/// 各块总长超过 `max_bytes` 时返回 `WIRE_TOO_LARGE`，不写出任何字节：
/// 接收方以同一口径拒收，写出去只会让连接被拆除。
pub async fn write_indexed(
    stream: &mut (dyn TwoWayStream + '_),
    blocks: &[Bytes],
    max_bytes: usize,
) -> Result<()> {
    let lens: Vec<usize> = blocks.iter().map(Bytes::len).collect();
    let total: usize = lens.iter().sum();
    if total > max_bytes {
        return Err(CoreError::violation(
            codes::WIRE_TOO_LARGE,
            format!("message of {total} bytes exceeds the limit of {max_bytes}"),
        ));
    }
    let index = encode_index(&lens)?;
    let mut parts: Vec<&[u8]> = Vec::with_capacity(blocks.len() + 1);
    parts.push(&index);
    parts.extend(blocks.iter().map(|block| block.as_ref()));
    stream.send(&parts).await
}

/// 读取索引头及其声明的全部块。
pub async fn read_indexed(
    stream: &mut (dyn TwoWayStream + '_),
    max_bytes: usize,
) -> Result<Vec<Bytes>> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    if parse_yarp_frame(&header) != Some(INDEX_MARK) {
        return Err(CoreError::violation(
            codes::WIRE_MALFORMED,
            format!("expected index header, got {}", hex::encode(header)),
        ));
    }
    let mut prefix = [0u8; INDEX_PREFIX_LEN];
    stream.read_exact(&mut prefix).await?;
    let count = usize::from(prefix[0]);
    let replies = usize::from(prefix[1]);

    let mut lens = Vec::with_capacity(count);
    let mut total = 0usize;
    for _ in 0..count {
        let len = read_i32_le(stream).await?;
        let len = usize::try_from(len).map_err(|_| {
            CoreError::violation(codes::WIRE_MALFORMED, format!("negative block length {len}"))
        })?;
        total = total.saturating_add(len);
        lens.push(len);
    }
    for _ in 0..replies {
        read_i32_le(stream).await?;
    }
    if total > max_bytes {
        return Err(CoreError::violation(
            codes::WIRE_TOO_LARGE,
            format!("message declares {total} bytes, limit is {max_bytes}"),
        ));
    }

    let mut blocks = Vec::with_capacity(count);
    for len in lens {
        let mut block = vec![0u8; len];
        stream.read_exact(&mut block).await?;
        blocks.push(Bytes::from(block));
    }
    Ok(blocks)
}

/// 确认包。
pub fn ack_frame() -> [u8; HEADER_LEN] {
    yarp_frame(0)
}

/// 读取确认包并丢弃其附带字节。
pub async fn read_ack(stream: &mut (dyn TwoWayStream + '_)) -> Result<()> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let len = parse_yarp_frame(&header)
        .and_then(|len| usize::try_from(len).ok())
        .filter(|len| *len <= MAX_SENDER_LEN)
        .ok_or_else(|| {
            CoreError::violation(
                codes::WIRE_MALFORMED,
                format!("expected ack, got {}", hex::encode(header)),
            )
        })?;
    if len > 0 {
        let mut skip = vec![0u8; len];
        stream.read_exact(&mut skip).await?;
    }
    Ok(())
}
