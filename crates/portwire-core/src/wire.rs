//! # wire 模块说明
//!
//! ## 角色定位（Why）
//! - 负载对象与载体之间的唯一接口：负载只管“追加/读取类型化字段”，载体只管“把块搬上线”；
//! - 同一组写入调用既可以产出二进制帧，也可以产出文本行，模式由载体能力决定。
//!
//! ## 契约（What）
//! - [`ConnectionWriter`] 只在内存中累积块，交给载体之前不会触碰通道，因此一次写入要么整体
//!   交付、要么完全不交付；
//! - [`ConnectionReader`] 只消费预先缓冲好的负载，任何越界读取都返回
//!   [`ErrorKind::ProtocolViolation`](crate::error::ErrorKind::ProtocolViolation)，绝不回落到通道；
//! - 所有整数、浮点均为小端序。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result, codes};

/// 负载读写契约。
///
/// 实现者需保证 `read` 能完整还原 `write` 写出的字段序列。
pub trait Portable {
    /// 将自身追加到写入器。
    fn write(&self, writer: &mut ConnectionWriter) -> Result<()>;

    /// 从读取器还原自身，覆盖原有内容。
    fn read(&mut self, reader: &mut ConnectionReader) -> Result<()>;
}

/// 累积块的写入器。
///
/// # 教案式注释
///
/// ## 逻辑 (How)
/// - 小字段写入当前块 `current`；`append_block` 先封存当前块，再把外部块原样挂上，
///   大块数据因此无需复制；
/// - [`into_blocks`](Self::into_blocks) 返回有序块列表，载体据此生成索引头。
///
/// ## 契约 (What)
/// - `text_mode` 由载体能力决定，负载实现据此选择文本或二进制语法；
/// - 空块不会出现在输出中。
#[derive(Debug, Default)]
pub struct ConnectionWriter {
    blocks: Vec<Bytes>,
    current: BytesMut,
    text_mode: bool,
}

impl ConnectionWriter {
    pub fn new(text_mode: bool) -> Self {
        Self {
            blocks: Vec::new(),
            current: BytesMut::new(),
            text_mode,
        }
    }

    /// 二进制写入器。
    pub fn binary() -> Self {
        Self::new(false)
    }

    /// 文本写入器。
    pub fn text() -> Self {
        Self::new(true)
    }

    pub fn is_text_mode(&self) -> bool {
        self.text_mode
    }

    pub fn append_i8(&mut self, value: i8) {
        self.current.put_i8(value);
    }

    pub fn append_i16(&mut self, value: i16) {
        self.current.put_i16_le(value);
    }

    pub fn append_i32(&mut self, value: i32) {
        self.current.put_i32_le(value);
    }

    pub fn append_i64(&mut self, value: i64) {
        self.current.put_i64_le(value);
    }

    pub fn append_f32(&mut self, value: f32) {
        self.current.put_f32_le(value);
    }

    pub fn append_f64(&mut self, value: f64) {
        self.current.put_f64_le(value);
    }

    /// 复制字节到当前块。
    pub fn append_bytes(&mut self, data: &[u8]) {
        self.current.put_slice(data);
    }

    /// 追加一行文本，自动补换行符。
    pub fn append_line(&mut self, line: &str) {
        self.current.put_slice(line.as_bytes());
        self.current.put_u8(b'\n');
    }

    /// 作为独立块挂接外部数据，不复制。
    pub fn append_block(&mut self, block: Bytes) {
        self.seal();
        if !block.is_empty() {
            self.blocks.push(block);
        }
    }

    /// 已累积的总字节数。
    pub fn size(&self) -> usize {
        self.blocks.iter().map(Bytes::len).sum::<usize>() + self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// 取出有序块列表。
    pub fn into_blocks(mut self) -> Vec<Bytes> {
        self.seal();
        self.blocks
    }

    fn seal(&mut self) {
        if !self.current.is_empty() {
            let block = self.current.split().freeze();
            self.blocks.push(block);
        }
    }
}

/// 把块列表拼接为一段连续负载。
pub fn concat_blocks(blocks: &[Bytes]) -> Bytes {
    match blocks {
        [] => Bytes::new(),
        [single] => single.clone(),
        many => {
            let total = many.iter().map(Bytes::len).sum();
            let mut out = BytesMut::with_capacity(total);
            for block in many {
                out.put_slice(block);
            }
            out.freeze()
        }
    }
}

/// 基于预缓冲负载、带边界检查的读取器。
#[derive(Clone, Debug)]
pub struct ConnectionReader {
    payload: Bytes,
    text_mode: bool,
}

impl ConnectionReader {
    pub fn new(payload: Bytes, text_mode: bool) -> Self {
        Self { payload, text_mode }
    }

    /// 从块列表构造。
    pub fn from_blocks(blocks: &[Bytes], text_mode: bool) -> Self {
        Self::new(concat_blocks(blocks), text_mode)
    }

    pub fn is_text_mode(&self) -> bool {
        self.text_mode
    }

    /// 剩余可读字节数。
    pub fn remaining(&self) -> usize {
        self.payload.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn expect_i8(&mut self) -> Result<i8> {
        self.ensure(1, "i8")?;
        Ok(self.payload.get_i8())
    }

    pub fn expect_i16(&mut self) -> Result<i16> {
        self.ensure(2, "i16")?;
        Ok(self.payload.get_i16_le())
    }

    pub fn expect_i32(&mut self) -> Result<i32> {
        self.ensure(4, "i32")?;
        Ok(self.payload.get_i32_le())
    }

    pub fn expect_i64(&mut self) -> Result<i64> {
        self.ensure(8, "i64")?;
        Ok(self.payload.get_i64_le())
    }

    pub fn expect_f32(&mut self) -> Result<f32> {
        self.ensure(4, "f32")?;
        Ok(self.payload.get_f32_le())
    }

    pub fn expect_f64(&mut self) -> Result<f64> {
        self.ensure(8, "f64")?;
        Ok(self.payload.get_f64_le())
    }

    /// 读取带长度前缀的数据时使用：长度必须非负。
    pub fn expect_len(&mut self) -> Result<usize> {
        let len = self.expect_i32()?;
        usize::try_from(len).map_err(|_| {
            CoreError::violation(codes::WIRE_MALFORMED, format!("negative length {len}"))
        })
    }

    /// 精确读取 `len` 字节。
    pub fn expect_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len, "bytes")?;
        Ok(self.payload.split_to(len))
    }

    /// 读取一行（不含换行符，去除行尾 `\r`）。
    pub fn expect_line(&mut self) -> Result<String> {
        let Some(end) = self.payload.iter().position(|b| *b == b'\n') else {
            if self.payload.is_empty() {
                return Err(out_of_bounds("line", 1, 0));
            }
            let rest = self.payload.split_to(self.payload.len());
            return decode_utf8(&rest);
        };
        let line = self.payload.split_to(end);
        self.payload.advance(1);
        let line = if line.last() == Some(&b'\r') {
            line.slice(..line.len() - 1)
        } else {
            line
        };
        decode_utf8(&line)
    }

    /// 取出剩余全部字节。
    pub fn take_rest(&mut self) -> Bytes {
        self.payload.split_to(self.payload.len())
    }

    fn ensure(&self, wanted: usize, what: &str) -> Result<()> {
        let left = self.payload.remaining();
        if wanted > left {
            Err(out_of_bounds(what, wanted, left))
        } else {
            Ok(())
        }
    }
}

fn out_of_bounds(what: &str, wanted: usize, left: usize) -> CoreError {
    CoreError::violation(
        codes::WIRE_OUT_OF_BOUNDS,
        format!("reading {what} needs {wanted} bytes but only {left} remain"),
    )
}

fn decode_utf8(data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec()).map_err(|err| {
        CoreError::violation(codes::WIRE_MALFORMED, "text is not valid utf-8").with_cause(err)
    })
}
