//! # value 模块说明
//!
//! ## 角色定位（Why）
//! - [`Bottle`] 是端口间最常用的负载：一串有序、带类型的字段，可嵌套列表；
//! - 同一个 `Bottle` 既能写成二进制（带类型标签），也能写成人类可读的文本行，
//!   文本载体与二进制载体因此共享同一套负载实现。
//!
//! ## 二进制布局（What）
//! - 顶层：`i32(LIST | speciality)`、`i32(count)`，随后逐项写 `i32(tag)` 与原始值；
//! - 所有条目同为一种标量类型时，`speciality` 取该标签，逐项标签被省略；
//! - 嵌套列表省略顶层码，只写 `i32(count)`，其类型标签为 `LIST | 内层 speciality`；
//! - 字符串写 `i32(len + 1)`、字节与结尾 NUL；二进制块写 `i32(len)` 与字节。
//!
//! ## 文本语法（What）
//! - 整数与浮点按字面形态识别，`"..."` 为字符串（支持 `\\ \" \n \r \t` 转义），
//!   `(...)` 为嵌套列表，`[abcd]` 为四字符以内的词汇，`{1 2 3}` 为二进制块；
//! - 未加引号的单词按字符串处理，与手工输入兼容；
//! - 非有限浮点写作 `inf`、`-inf`、`NaN`，解析时按浮点识别。
//!
//! ## 注意事项（Trade-offs）
//! - 两种语法的解码都是递归下降，嵌套深度以 [`MAX_NESTING`] 为上限，
//!   超出即 `WIRE_MALFORMED`，不会耗尽调用栈。

use std::fmt::{self, Write as _};

use bytes::Bytes;
use thiserror::Error;

use crate::error::{CoreError, Result, codes};
use crate::wire::{ConnectionReader, ConnectionWriter, Portable};

/// 类型标签。
pub mod tag {
    pub const INT8: i32 = 32;
    pub const INT16: i32 = 64;
    pub const INT32: i32 = 1;
    pub const INT64: i32 = 1 + 16;
    pub const VOCAB32: i32 = 1 + 8;
    pub const FLOAT32: i32 = 128;
    pub const FLOAT64: i32 = 2 + 8;
    pub const STRING: i32 = 4;
    pub const BLOB: i32 = 4 + 8;
    pub const LIST: i32 = 256;
    pub const DICT: i32 = 512;

    /// 标量标签的并集。
    pub const UNIT_MASK: i32 = INT8 | INT16 | INT32 | INT64 | FLOAT32 | FLOAT64 | VOCAB32 | STRING | BLOB;
    /// 容器标签的并集。
    pub const GROUP_MASK: i32 = LIST | DICT;
}

/// 解码时允许的最大列表嵌套层数（顶层 bottle 记为第 0 层）。
pub const MAX_NESTING: usize = 128;

/// 文本语法解析失败。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unbalanced `{0}`")]
    Unbalanced(char),
    #[error("vocab `{0}` is longer than four characters")]
    VocabTooLong(String),
    #[error("blob byte `{0}` is not in 0..=255")]
    BadBlobByte(String),
    #[error("unknown escape `\\{0}`")]
    BadEscape(char),
    #[error("lists nested deeper than {0} levels")]
    TooDeep(usize),
}

impl From<ValueError> for CoreError {
    fn from(err: ValueError) -> Self {
        CoreError::violation(codes::WIRE_MALFORMED, err.to_string()).with_cause(err)
    }
}

/// 单个字段。
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Vocab(u32),
    Float32(f32),
    Float64(f64),
    String(String),
    Blob(Bytes),
    List(Bottle),
}

impl Value {
    /// 由最多四个 ASCII 字符构造词汇。
    pub fn vocab(text: &str) -> Result<Self> {
        encode_vocab(text).map(Value::Vocab).map_err(CoreError::from)
    }

    /// 完整类型码；列表附带内层 speciality。
    pub fn code(&self) -> i32 {
        match self {
            Value::Int8(_) => tag::INT8,
            Value::Int16(_) => tag::INT16,
            Value::Int32(_) => tag::INT32,
            Value::Int64(_) => tag::INT64,
            Value::Vocab(_) => tag::VOCAB32,
            Value::Float32(_) => tag::FLOAT32,
            Value::Float64(_) => tag::FLOAT64,
            Value::String(_) => tag::STRING,
            Value::Blob(_) => tag::BLOB,
            Value::List(inner) => tag::LIST | inner.speciality(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(v) => Some(i64::from(*v)),
            Value::Int16(v) => Some(i64::from(*v)),
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float32(v) => Some(f64::from(*v)),
            Value::Float64(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// 词汇或字符串的文字形式。
    pub fn as_word(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Vocab(v) => Some(decode_vocab(*v)),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Bottle> {
        match self {
            Value::List(b) => Some(b),
            _ => None,
        }
    }

    fn write_raw(&self, writer: &mut ConnectionWriter) {
        match self {
            Value::Int8(v) => writer.append_i8(*v),
            Value::Int16(v) => writer.append_i16(*v),
            Value::Int32(v) => writer.append_i32(*v),
            Value::Int64(v) => writer.append_i64(*v),
            Value::Vocab(v) => writer.append_i32(*v as i32),
            Value::Float32(v) => writer.append_f32(*v),
            Value::Float64(v) => writer.append_f64(*v),
            Value::String(s) => {
                writer.append_i32(s.len() as i32 + 1);
                writer.append_bytes(s.as_bytes());
                writer.append_i8(0);
            }
            Value::Blob(b) => {
                writer.append_i32(b.len() as i32);
                writer.append_bytes(b);
            }
            Value::List(inner) => inner.write_binary(writer, true),
        }
    }

    fn read_raw(code: i32, reader: &mut ConnectionReader, depth: usize) -> Result<Self> {
        if code & tag::LIST != 0 {
            if depth >= MAX_NESTING {
                return Err(CoreError::violation(
                    codes::WIRE_MALFORMED,
                    format!("lists nested deeper than {MAX_NESTING} levels"),
                ));
            }
            let mut inner = Bottle::new();
            inner.read_items(reader, code & tag::UNIT_MASK, depth + 1)?;
            return Ok(Value::List(inner));
        }
        let value = match code {
            tag::INT8 => Value::Int8(reader.expect_i8()?),
            tag::INT16 => Value::Int16(reader.expect_i16()?),
            tag::INT32 => Value::Int32(reader.expect_i32()?),
            tag::INT64 => Value::Int64(reader.expect_i64()?),
            tag::VOCAB32 => Value::Vocab(reader.expect_i32()? as u32),
            tag::FLOAT32 => Value::Float32(reader.expect_f32()?),
            tag::FLOAT64 => Value::Float64(reader.expect_f64()?),
            tag::STRING => {
                let len = reader.expect_len()?;
                let raw = reader.expect_bytes(len)?;
                let body = match raw.last() {
                    Some(0) => &raw[..raw.len() - 1],
                    _ => &raw[..],
                };
                let text = String::from_utf8(body.to_vec()).map_err(|err| {
                    CoreError::violation(codes::WIRE_MALFORMED, "string is not utf-8")
                        .with_cause(err)
                })?;
                Value::String(text)
            }
            tag::BLOB => {
                let len = reader.expect_len()?;
                Value::Blob(reader.expect_bytes(len)?)
            }
            other => {
                return Err(CoreError::violation(
                    codes::WIRE_MALFORMED,
                    format!("unrecognized value code {other}"),
                ));
            }
        };
        Ok(value)
    }

    fn write_text(&self, out: &mut String) {
        // 写入 String 不会失败
        let _ = match self {
            Value::Int8(v) => write!(out, "{v}"),
            Value::Int16(v) => write!(out, "{v}"),
            Value::Int32(v) => write!(out, "{v}"),
            Value::Int64(v) => write!(out, "{v}"),
            Value::Vocab(v) => write!(out, "[{}]", decode_vocab(*v)),
            Value::Float32(v) => write_float(out, f64::from(*v)),
            Value::Float64(v) => write_float(out, *v),
            Value::String(s) => {
                out.push('"');
                for ch in s.chars() {
                    match ch {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\t' => out.push_str("\\t"),
                        c => out.push(c),
                    }
                }
                out.push('"');
                Ok(())
            }
            Value::Blob(b) => {
                out.push('{');
                for (i, byte) in b.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    let _ = write!(out, "{byte}");
                }
                out.push('}');
                Ok(())
            }
            Value::List(inner) => {
                out.push('(');
                inner.write_text_items(out);
                out.push(')');
                Ok(())
            }
        };
    }
}

fn write_float(out: &mut String, v: f64) -> fmt::Result {
    // `{:?}` 总会保留小数点或指数，文本解析时不会被误判为整数；
    // 非有限值写作 `inf`、`-inf`、`NaN`，由 `classify_token` 认回
    write!(out, "{v:?}")
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Bottle> for Value {
    fn from(v: Bottle) -> Self {
        Value::List(v)
    }
}

/// 把最多四个字符压成小端 `u32`。
pub fn encode_vocab(text: &str) -> std::result::Result<u32, ValueError> {
    let bytes = text.as_bytes();
    if bytes.len() > 4 {
        return Err(ValueError::VocabTooLong(text.to_owned()));
    }
    let mut raw = [0u8; 4];
    raw[..bytes.len()].copy_from_slice(bytes);
    Ok(u32::from_le_bytes(raw))
}

/// [`encode_vocab`] 的逆过程。
pub fn decode_vocab(code: u32) -> String {
    code.to_le_bytes()
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| char::from(*b))
        .collect()
}

/// 有序字段列表。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bottle {
    items: Vec<Value>,
}

impl Bottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(items: Vec<Value>) -> Self {
        Self { items }
    }

    pub fn push(&mut self, value: impl Into<Value>) -> &mut Self {
        self.items.push(value.into());
        self
    }

    /// 链式追加。
    pub fn with(mut self, value: impl Into<Value>) -> Self {
        self.items.push(value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.items
    }

    pub fn into_values(self) -> Vec<Value> {
        self.items
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// 所有条目同为一种标量类型时返回该标签，否则为 0。
    pub fn speciality(&self) -> i32 {
        let Some(first) = self.items.first() else {
            return 0;
        };
        let code = first.code();
        if code & tag::GROUP_MASK != 0 {
            return 0;
        }
        if self.items.iter().all(|item| item.code() == code) {
            code
        } else {
            0
        }
    }

    /// 二进制编码为单块。
    pub fn to_binary(&self) -> Bytes {
        let mut writer = ConnectionWriter::binary();
        self.write_binary(&mut writer, false);
        crate::wire::concat_blocks(&writer.into_blocks())
    }

    /// 从二进制负载解码。
    pub fn from_binary(payload: Bytes) -> Result<Self> {
        let mut reader = ConnectionReader::new(payload, false);
        let mut bottle = Bottle::new();
        bottle.read_binary(&mut reader)?;
        Ok(bottle)
    }

    /// 文本形式，条目以空格分隔。
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        self.write_text_items(&mut out);
        out
    }

    /// 解析文本形式。
    pub fn from_text(text: &str) -> Result<Self> {
        let mut parser = TextParser::new(text);
        let items = parser.parse_items(None, 0)?;
        Ok(Self { items })
    }

    fn write_binary(&self, writer: &mut ConnectionWriter, nested: bool) {
        let speciality = self.speciality();
        if !nested {
            writer.append_i32(tag::LIST | speciality);
        }
        writer.append_i32(self.items.len() as i32);
        for item in &self.items {
            if speciality == 0 {
                writer.append_i32(item.code());
            }
            item.write_raw(writer);
        }
    }

    fn read_binary(&mut self, reader: &mut ConnectionReader) -> Result<()> {
        let code = reader.expect_i32()?;
        if code & tag::LIST == 0 {
            return Err(CoreError::violation(
                codes::WIRE_MALFORMED,
                format!("bottle must start with a list code, got {code}"),
            ));
        }
        self.read_items(reader, code & tag::UNIT_MASK, 0)
    }

    fn read_items(
        &mut self,
        reader: &mut ConnectionReader,
        speciality: i32,
        depth: usize,
    ) -> Result<()> {
        self.items.clear();
        let count = reader.expect_len()?;
        // 每个条目至少占一个字节，提前拒绝伪造的巨大计数
        if count > reader.remaining() {
            return Err(CoreError::violation(
                codes::WIRE_OUT_OF_BOUNDS,
                format!("bottle declares {count} items but only {} bytes remain", reader.remaining()),
            ));
        }
        self.items.reserve(count);
        for _ in 0..count {
            let code = if speciality != 0 {
                speciality
            } else {
                reader.expect_i32()?
            };
            self.items.push(Value::read_raw(code, reader, depth)?);
        }
        Ok(())
    }

    fn write_text_items(&self, out: &mut String) {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            item.write_text(out);
        }
    }
}

impl Portable for Bottle {
    fn write(&self, writer: &mut ConnectionWriter) -> Result<()> {
        if writer.is_text_mode() {
            writer.append_line(&self.to_text());
        } else {
            self.write_binary(writer, false);
        }
        Ok(())
    }

    fn read(&mut self, reader: &mut ConnectionReader) -> Result<()> {
        if reader.is_text_mode() {
            let line = if reader.is_empty() {
                String::new()
            } else {
                reader.expect_line()?
            };
            *self = Bottle::from_text(&line)?;
            Ok(())
        } else {
            self.read_binary(reader)
        }
    }
}

impl fmt::Display for Bottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl FromIterator<Value> for Bottle {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

struct TextParser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> TextParser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
        }
    }

    fn parse_items(
        &mut self,
        close: Option<char>,
        depth: usize,
    ) -> std::result::Result<Vec<Value>, ValueError> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.chars.peek().copied() {
                None => {
                    return match close {
                        Some(_) => Err(ValueError::Unbalanced('(')),
                        None => Ok(items),
                    };
                }
                Some(')') => {
                    self.chars.next();
                    return match close {
                        Some(')') => Ok(items),
                        _ => Err(ValueError::Unbalanced(')')),
                    };
                }
                Some('(') => {
                    self.chars.next();
                    if depth >= MAX_NESTING {
                        return Err(ValueError::TooDeep(MAX_NESTING));
                    }
                    let inner = self.parse_items(Some(')'), depth + 1)?;
                    items.push(Value::List(Bottle::from_values(inner)));
                }
                Some('"') => {
                    self.chars.next();
                    items.push(Value::String(self.parse_quoted()?));
                }
                Some('[') => {
                    self.chars.next();
                    let word = self.take_until(']')?;
                    items.push(Value::Vocab(encode_vocab(&word)?));
                }
                Some('{') => {
                    self.chars.next();
                    let body = self.take_until('}')?;
                    let mut blob = Vec::new();
                    for token in body.split_whitespace() {
                        let byte = token
                            .parse::<u8>()
                            .map_err(|_| ValueError::BadBlobByte(token.to_owned()))?;
                        blob.push(byte);
                    }
                    items.push(Value::Blob(Bytes::from(blob)));
                }
                Some(_) => {
                    let token = self.take_token();
                    items.push(classify_token(&token));
                }
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn parse_quoted(&mut self) -> std::result::Result<String, ValueError> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err(ValueError::UnterminatedString),
                Some('"') => return Ok(out),
                Some('\\') => match self.chars.next() {
                    Some('"') => out.push('"'),
                    Some('\\') => out.push('\\'),
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some(other) => return Err(ValueError::BadEscape(other)),
                    None => return Err(ValueError::UnterminatedString),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn take_until(&mut self, end: char) -> std::result::Result<String, ValueError> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err(ValueError::Unbalanced(end)),
                Some(c) if c == end => return Ok(out),
                Some(c) => out.push(c),
            }
        }
    }

    fn take_token(&mut self) -> String {
        let mut out = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || matches!(c, '(' | ')' | '"' | '[' | '{') {
                break;
            }
            out.push(c);
            self.chars.next();
        }
        out
    }
}

/// 根据字面形态识别数字，其余按字符串处理。
fn classify_token(token: &str) -> Value {
    match token {
        "inf" | "+inf" => return Value::Float64(f64::INFINITY),
        "-inf" => return Value::Float64(f64::NEG_INFINITY),
        "NaN" | "nan" => return Value::Float64(f64::NAN),
        _ => {}
    }
    let looks_numeric = token
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == '-' || c == '+' || c == '.');
    if looks_numeric {
        if let Ok(v) = token.parse::<i32>() {
            return Value::Int32(v);
        }
        if let Ok(v) = token.parse::<i64>() {
            return Value::Int64(v);
        }
        if token.contains(['.', 'e', 'E'])
            && let Ok(v) = token.parse::<f64>()
        {
            return Value::Float64(v);
        }
    }
    Value::String(token.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn testing_one() -> Bottle {
        Bottle::new().with("testing").with(1)
    }

    #[test]
    fn binary_layout_matches_tagged_format() {
        let bytes = testing_one().to_binary();
        let mut expected = Vec::new();
        expected.extend_from_slice(&tag::LIST.to_le_bytes());
        expected.extend_from_slice(&2i32.to_le_bytes());
        expected.extend_from_slice(&tag::STRING.to_le_bytes());
        expected.extend_from_slice(&8i32.to_le_bytes());
        expected.extend_from_slice(b"testing\0");
        expected.extend_from_slice(&tag::INT32.to_le_bytes());
        expected.extend_from_slice(&1i32.to_le_bytes());
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn homogeneous_bottle_uses_speciality() {
        let bottle = Bottle::new().with(1).with(2).with(3);
        assert_eq!(bottle.speciality(), tag::INT32);
        let bytes = bottle.to_binary();
        // 顶层码 + 计数 + 三个无标签整数
        assert_eq!(bytes.len(), 4 + 4 + 3 * 4);
        assert_eq!(&bytes[..4], &(tag::LIST | tag::INT32).to_le_bytes());
        assert_eq!(Bottle::from_binary(bytes).expect("特化列表可解码"), bottle);
    }

    #[test]
    fn nested_lists_round_trip() {
        let inner = Bottle::new().with(1.5).with(2.5);
        let bottle = Bottle::new()
            .with("outer")
            .with(inner.clone())
            .with(Value::Blob(Bytes::from_static(&[0, 255])))
            .with(Value::vocab("ok").expect("合法词汇"));
        let decoded = Bottle::from_binary(bottle.to_binary()).expect("嵌套可解码");
        assert_eq!(decoded, bottle);
        assert_eq!(decoded.get(1).and_then(Value::as_list), Some(&inner));
    }

    #[test]
    fn truncated_binary_is_violation() {
        let bytes = testing_one().to_binary();
        let err = Bottle::from_binary(bytes.slice(..bytes.len() - 2)).expect_err("截断必须报错");
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn absurd_count_is_rejected_before_allocation() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&tag::LIST.to_le_bytes());
        raw.extend_from_slice(&i32::MAX.to_le_bytes());
        let err = Bottle::from_binary(Bytes::from(raw)).expect_err("伪造计数");
        assert_eq!(err.code(), codes::WIRE_OUT_OF_BOUNDS);
    }

    #[test]
    fn text_syntax_round_trips() {
        let bottle = Bottle::from_text(r#"testing 1 -2.5 "two words" (3 [ok]) {1 2 3} 9999999999"#)
            .expect("合法文本");
        assert_eq!(bottle.get(0), Some(&Value::String("testing".into())));
        assert_eq!(bottle.get(1), Some(&Value::Int32(1)));
        assert_eq!(bottle.get(2), Some(&Value::Float64(-2.5)));
        assert_eq!(bottle.get(3), Some(&Value::String("two words".into())));
        assert_eq!(bottle.get(6), Some(&Value::Int64(9_999_999_999)));
        let reparsed = Bottle::from_text(&bottle.to_text()).expect("再次解析");
        assert_eq!(reparsed, bottle);
    }

    #[test]
    fn float_text_keeps_its_type() {
        let bottle = Bottle::new().with(1.0);
        assert_eq!(bottle.to_text(), "1.0");
        assert_eq!(Bottle::from_text("1.0").expect("浮点"), bottle);
    }

    #[test]
    fn text_errors_are_violations() {
        for bad in [r#""open"#, "(1 2", "1 )", "[toolong]", "{300}", r#""\q""#] {
            let err = Bottle::from_text(bad).expect_err(bad);
            assert_eq!(err.kind(), ErrorKind::ProtocolViolation, "{bad}");
        }
    }

    #[test]
    fn nesting_beyond_the_limit_is_malformed() {
        // 每层只有一个 `LIST` 标签与计数 1，体积很小而层数极深
        let levels = MAX_NESTING * 8;
        let mut raw = Vec::new();
        raw.extend_from_slice(&tag::LIST.to_le_bytes());
        raw.extend_from_slice(&1i32.to_le_bytes());
        for _ in 0..levels {
            raw.extend_from_slice(&tag::LIST.to_le_bytes());
            raw.extend_from_slice(&1i32.to_le_bytes());
        }
        raw.extend_from_slice(&tag::INT32.to_le_bytes());
        raw.extend_from_slice(&7i32.to_le_bytes());
        let err = Bottle::from_binary(Bytes::from(raw)).expect_err("嵌套过深");
        assert_eq!(err.code(), codes::WIRE_MALFORMED);

        let text = format!("{}1{}", "(".repeat(levels), ")".repeat(levels));
        let err = Bottle::from_text(&text).expect_err("文本嵌套过深");
        assert_eq!(err.code(), codes::WIRE_MALFORMED);
    }

    #[test]
    fn nesting_at_the_limit_still_decodes() {
        let mut bottle = Bottle::new().with(7);
        for _ in 0..MAX_NESTING {
            bottle = Bottle::new().with(bottle);
        }
        let decoded = Bottle::from_binary(bottle.to_binary()).expect("上限内的嵌套");
        assert_eq!(decoded, bottle);
        let reparsed = Bottle::from_text(&bottle.to_text()).expect("上限内的文本嵌套");
        assert_eq!(reparsed, bottle);
    }

    #[test]
    fn non_finite_floats_survive_text() {
        let bottle = Bottle::new()
            .with(f64::INFINITY)
            .with(f64::NEG_INFINITY)
            .with(f64::NAN);
        let text = bottle.to_text();
        assert_eq!(text, "inf -inf NaN");
        let reparsed = Bottle::from_text(&text).expect("非有限浮点");
        assert_eq!(reparsed.get(0), Some(&Value::Float64(f64::INFINITY)));
        assert_eq!(reparsed.get(1), Some(&Value::Float64(f64::NEG_INFINITY)));
        assert!(reparsed.get(2).and_then(Value::as_f64).is_some_and(f64::is_nan));
        assert!(matches!(reparsed.get(2), Some(Value::Float64(_))));
    }

    #[test]
    fn portable_honours_writer_mode() {
        let bottle = testing_one();
        let mut text = ConnectionWriter::text();
        bottle.write(&mut text).expect("文本写入");
        let blocks = text.into_blocks();
        assert_eq!(&blocks[0][..], b"\"testing\" 1\n");

        let mut reader = ConnectionReader::from_blocks(&blocks, true);
        let mut decoded = Bottle::new();
        decoded.read(&mut reader).expect("文本读取");
        assert_eq!(decoded, bottle);
    }
}
