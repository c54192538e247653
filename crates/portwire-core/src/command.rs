//! # command 模块说明
//!
//! 每条消息的第一个块是端口命令，告诉接收方如何处理后续负载。
//!
//! ## 线上形态（What）
//! - 二进制：8 字节 `[0,0,0,0,'~',key,0,1]`；携带文本（信封或目标名）时 `key` 置 0，
//!   随后紧跟完整命令文本与结尾 NUL，例如 `d 3 1.5 "/a"`；
//! - 文本：单行 `key[ text]`，例如 `d`、`/ /receiver`。

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result, codes};

const BINARY_HEADER_LEN: usize = 8;

/// 命令种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKey {
    /// 数据，发送方等待回复。
    Data,
    /// 数据，不需要回复。
    DataNoReply,
    /// 管理命令，负载为命令 bottle。
    Admin,
    /// 为接收方端口新增一条输出连接。
    AddOutput,
    /// 删除接收方端口的一条输出连接。
    RemoveOutput,
    /// 删除接收方端口的一条输入连接。
    RemoveInput,
    /// 请求端口描述。
    Describe,
    /// 关闭当前连接。
    Quit,
}

impl CommandKey {
    pub fn as_byte(self) -> u8 {
        match self {
            CommandKey::Data => b'd',
            CommandKey::DataNoReply => b'D',
            CommandKey::Admin => b'a',
            CommandKey::AddOutput => b'/',
            CommandKey::RemoveOutput => b'!',
            CommandKey::RemoveInput => b'~',
            CommandKey::Describe => b'*',
            CommandKey::Quit => b'q',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        let key = match byte {
            b'd' => CommandKey::Data,
            b'D' => CommandKey::DataNoReply,
            b'a' => CommandKey::Admin,
            b'/' => CommandKey::AddOutput,
            b'!' => CommandKey::RemoveOutput,
            b'~' => CommandKey::RemoveInput,
            b'*' => CommandKey::Describe,
            b'q' => CommandKey::Quit,
            _ => return None,
        };
        Some(key)
    }

    /// 是否携带需要投递给读者的负载。
    pub fn carries_data(self) -> bool {
        matches!(self, CommandKey::Data | CommandKey::DataNoReply)
    }
}

/// 端口命令：种类加可选文本参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortCommand {
    key: CommandKey,
    text: String,
}

impl PortCommand {
    pub fn new(key: CommandKey, text: impl Into<String>) -> Self {
        Self {
            key,
            text: text.into(),
        }
    }

    /// 数据命令；`envelope` 为编码后的信封文本。
    pub fn data(wants_reply: bool, envelope: Option<String>) -> Self {
        let key = if wants_reply {
            CommandKey::Data
        } else {
            CommandKey::DataNoReply
        };
        Self::new(key, envelope.unwrap_or_default())
    }

    pub fn admin() -> Self {
        Self::new(CommandKey::Admin, "")
    }

    pub fn quit() -> Self {
        Self::new(CommandKey::Quit, "")
    }

    pub fn key(&self) -> CommandKey {
        self.key
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// 发送方是否在等待回复。
    pub fn wants_reply(&self) -> bool {
        self.key == CommandKey::Data
    }

    /// 数据命令携带的信封文本。
    pub fn envelope(&self) -> Option<&str> {
        (self.key.carries_data() && !self.text.is_empty()).then_some(self.text.as_str())
    }

    /// 编码为二进制命令块。
    pub fn to_binary(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(BINARY_HEADER_LEN + self.text.len() + 3);
        out.put_slice(&[0, 0, 0, 0, b'~']);
        if self.text.is_empty() {
            out.put_slice(&[self.key.as_byte(), 0, 1]);
        } else {
            out.put_slice(&[0, 0, 1]);
            out.put_slice(self.to_text_line().as_bytes());
            out.put_u8(0);
        }
        out.freeze()
    }

    /// 解码二进制命令块。
    pub fn from_binary(block: &[u8]) -> Result<Self> {
        if block.len() < BINARY_HEADER_LEN || block[4] != b'~' {
            return Err(CoreError::violation(
                codes::WIRE_MALFORMED,
                format!("bad port command block of {} bytes", block.len()),
            ));
        }
        if block[5] != 0 {
            let key = CommandKey::from_byte(block[5]).ok_or_else(|| unknown_key(block[5]))?;
            return Ok(Self::new(key, ""));
        }
        let body = &block[BINARY_HEADER_LEN..];
        let body = body.strip_suffix(&[0]).unwrap_or(body);
        let line = std::str::from_utf8(body).map_err(|err| {
            CoreError::violation(codes::WIRE_MALFORMED, "port command text is not utf-8")
                .with_cause(err)
        })?;
        Self::from_text_line(line)
    }

    /// 文本行形式（不含换行）。
    pub fn to_text_line(&self) -> String {
        let key = char::from(self.key.as_byte());
        if self.text.is_empty() {
            key.to_string()
        } else {
            format!("{key} {}", self.text)
        }
    }

    /// 解析文本行。
    pub fn from_text_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(first) = line.bytes().next() else {
            return Err(CoreError::violation(codes::WIRE_MALFORMED, "empty port command"));
        };
        let key = CommandKey::from_byte(first).ok_or_else(|| unknown_key(first))?;
        let text = line[1..].trim_start();
        Ok(Self::new(key, text))
    }
}

impl fmt::Display for PortCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text_line())
    }
}

fn unknown_key(byte: u8) -> CoreError {
    CoreError::violation(
        codes::WIRE_MALFORMED,
        format!("unknown port command key 0x{byte:02x}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn plain_binary_command_is_eight_bytes() {
        let block = PortCommand::data(true, None).to_binary();
        assert_eq!(&block[..], &[0, 0, 0, 0, b'~', b'd', 0, 1]);
        assert_eq!(PortCommand::from_binary(&block).expect("可解码"), PortCommand::data(true, None));
    }

    #[test]
    fn binary_command_with_text() {
        let cmd = PortCommand::new(CommandKey::AddOutput, "/receiver");
        let block = cmd.to_binary();
        assert_eq!(block[5], 0, "携带文本时 key 字节为 0");
        assert_eq!(&block[8..], b"/ /receiver\0");
        assert_eq!(PortCommand::from_binary(&block).expect("可解码"), cmd);
    }

    #[test]
    fn text_lines() {
        let cmd = PortCommand::from_text_line("d 1 2.0 \"/a\"\r\n").expect("文本命令");
        assert_eq!(cmd.key(), CommandKey::Data);
        assert_eq!(cmd.text(), "1 2.0 \"/a\"");
        assert_eq!(PortCommand::from_text_line("q").expect("退出").key(), CommandKey::Quit);
    }

    #[test]
    fn malformed_commands_are_violations() {
        for bad in [&b"short"[..], &[0, 0, 0, 0, b'x', b'd', 0, 1][..], &[0, 0, 0, 0, b'~', b'Z', 0, 1][..]] {
            let err = PortCommand::from_binary(bad).expect_err("非法命令块");
            assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        }
        assert!(PortCommand::from_text_line("").is_err());
        assert!(PortCommand::from_text_line("z").is_err());
    }
}
