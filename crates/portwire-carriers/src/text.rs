//! 行式文本载体：`text` 与 `text_ack`。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 允许人类用 telnet 之类的工具直接与端口对话：握手、命令与负载都是可读的文本行。
//!
//! ## 线上形态 (What)
//! - 握手：客户端发送 `CONNECT /sender\n`（或 `CONNACK /sender\n`），服务端回应
//!   `Welcome /sender\n`；
//! - 消息：一行端口命令（如 `d`、`D 3 1.5 "/a"`），携带负载的命令随后再跟一行 bottle 文本；
//! - `text_ack`：服务端先写回复行（若有），再写 `<ACK>\n`。
//!
//! ## 注意事项 (Trade-offs)
//! - 负载限定为单行，多行文本需由负载自身转义；
//! - `text` 不发送任何回应，因此不支持回复。

use async_trait::async_trait;
use bytes::Bytes;
use portwire_core::error::{CoreError, Result, codes};
use portwire_core::{CommandKey, PortCommand};
use portwire_transport::{BoxStream, TwoWayStream, read_line};
use tracing::trace;

use crate::carrier::{Capabilities, Carrier, CarrierFactory, CarrierOptions, Frame};
use crate::framing::{HEADER_LEN, TEXT_ACK_PREAMBLE, TEXT_PREAMBLE};

const ACK_LINE: &str = "<ACK>";
const WELCOME: &str = "Welcome";

/// 文本载体工厂。
#[derive(Debug)]
pub struct TextCarrierFactory {
    ack: bool,
}

impl TextCarrierFactory {
    /// `text`。
    pub fn plain() -> Self {
        Self { ack: false }
    }

    /// `text_ack`。
    pub fn acknowledged() -> Self {
        Self { ack: true }
    }
}

fn capabilities(ack: bool) -> Capabilities {
    Capabilities {
        supports_reply: ack,
        connectionless: false,
        text_mode: true,
        requires_ack: ack,
        local: false,
    }
}

impl CarrierFactory for TextCarrierFactory {
    fn name(&self) -> &str {
        if self.ack { "text_ack" } else { "text" }
    }

    fn capabilities(&self) -> Capabilities {
        capabilities(self.ack)
    }

    fn check_header(&self, header: &[u8; HEADER_LEN]) -> bool {
        let expected = if self.ack {
            TEXT_ACK_PREAMBLE
        } else {
            TEXT_PREAMBLE
        };
        header == expected
    }

    fn create(&self, options: &CarrierOptions) -> Box<dyn Carrier> {
        Box::new(TextCarrier {
            ack: self.ack,
            max_line: options.max_message_bytes,
            sender: String::new(),
        })
    }
}

/// 文本载体实例。
#[derive(Debug)]
pub struct TextCarrier {
    ack: bool,
    max_line: usize,
    sender: String,
}

impl TextCarrier {
    fn preamble(&self) -> &'static [u8; HEADER_LEN] {
        if self.ack {
            TEXT_ACK_PREAMBLE
        } else {
            TEXT_PREAMBLE
        }
    }
}

#[async_trait]
impl Carrier for TextCarrier {
    fn name(&self) -> &str {
        if self.ack { "text_ack" } else { "text" }
    }

    fn capabilities(&self) -> Capabilities {
        capabilities(self.ack)
    }

    async fn send_header(&mut self, stream: &mut (dyn TwoWayStream + '_), sender: &str) -> Result<()> {
        self.sender = sender.to_owned();
        let line = format!("{sender}\n");
        stream.send(&[self.preamble(), line.as_bytes()]).await
    }

    async fn expect_reply_to_header(&mut self, mut stream: BoxStream) -> Result<BoxStream> {
        let line = read_line(stream.as_mut(), self.max_line).await?;
        if !line.starts_with(WELCOME) {
            return Err(CoreError::handshake_failed(format!(
                "text peer answered `{line}` instead of a welcome"
            )));
        }
        Ok(stream)
    }

    async fn expect_sender(
        &mut self,
        stream: &mut (dyn TwoWayStream + '_),
        _header: &[u8; HEADER_LEN],
    ) -> Result<String> {
        let line = read_line(stream, self.max_line).await?;
        self.sender = line.trim().to_owned();
        Ok(self.sender.clone())
    }

    async fn respond_to_header(&mut self, mut stream: BoxStream) -> Result<BoxStream> {
        let line = format!("{WELCOME} {}\n", self.sender);
        stream.send(&[line.as_bytes()]).await?;
        Ok(stream)
    }

    async fn write(&mut self, stream: &mut (dyn TwoWayStream + '_), frame: &Frame) -> Result<()> {
        if let Some(block) = frame.blocks.iter().find(|block| block.len() > self.max_line) {
            return Err(CoreError::violation(
                codes::WIRE_TOO_LARGE,
                format!("text line of {} bytes exceeds {}", block.len(), self.max_line),
            ));
        }
        let command = format!("{}\n", frame.command.to_text_line());
        let mut parts: Vec<&[u8]> = Vec::with_capacity(frame.blocks.len() + 1);
        parts.push(command.as_bytes());
        parts.extend(frame.blocks.iter().map(|block| block.as_ref()));
        stream.send(&parts).await
    }

    async fn read(&mut self, stream: &mut (dyn TwoWayStream + '_)) -> Result<Frame> {
        let mut line = read_line(stream, self.max_line).await?;
        // 交互式客户端可能敲入空行，跳过即可
        while line.trim().is_empty() {
            line = read_line(stream, self.max_line).await?;
        }
        let command = PortCommand::from_text_line(&line)?;
        let blocks = if command.key().carries_data() || command.key() == CommandKey::Admin {
            let payload = read_line(stream, self.max_line).await?;
            trace!(carrier = self.name(), len = payload.len(), "text payload received");
            vec![Bytes::from(payload)]
        } else {
            Vec::new()
        };
        Ok(Frame::new(command, blocks))
    }

    async fn respond(
        &mut self,
        stream: &mut (dyn TwoWayStream + '_),
        reply: Option<&[Bytes]>,
    ) -> Result<()> {
        if !self.ack {
            return Ok(());
        }
        let mut parts: Vec<&[u8]> = Vec::new();
        if let Some(reply) = reply {
            parts.extend(reply.iter().map(|block| block.as_ref()));
            if !reply.last().is_some_and(|block| block.ends_with(b"\n")) {
                parts.push(b"\n");
            }
        }
        parts.push(b"<ACK>\n");
        stream.send(&parts).await
    }

    async fn expect_response(
        &mut self,
        stream: &mut (dyn TwoWayStream + '_),
        wants_reply: bool,
    ) -> Result<Option<Vec<Bytes>>> {
        if !self.ack {
            return Ok(None);
        }
        let reply = if wants_reply {
            Some(vec![Bytes::from(read_line(stream, self.max_line).await?)])
        } else {
            None
        };
        let ack = read_line(stream, self.max_line).await?;
        if ack != ACK_LINE {
            return Err(CoreError::violation(
                codes::WIRE_MALFORMED,
                format!("expected `{ACK_LINE}`, got `{ack}`"),
            ));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preambles_are_distinct() {
        let plain = TextCarrierFactory::plain();
        let ack = TextCarrierFactory::acknowledged();
        assert!(plain.check_header(b"CONNECT "));
        assert!(!plain.check_header(b"CONNACK "));
        assert!(ack.check_header(b"CONNACK "));
        assert_eq!(plain.name(), "text");
        assert!(ack.capabilities().supports_reply);
        assert!(!plain.capabilities().supports_reply);
        assert!(plain.capabilities().text_mode);
    }
}
