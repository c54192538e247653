//! 消息信封：随负载一起传输、但独立于负载字节的元数据。

use crate::error::{CoreError, Result, codes};
use crate::value::{Bottle, Value};

/// 序号、时间戳与发送方。
///
/// 线上以 bottle 文本 `seq timestamp "sender"` 表示，随端口命令块传输。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub seq: i64,
    pub timestamp: f64,
    pub sender: String,
}

impl Envelope {
    pub fn new(seq: i64, timestamp: f64, sender: impl Into<String>) -> Self {
        Self {
            seq,
            timestamp,
            sender: sender.into(),
        }
    }

    /// 编码为文本。
    pub fn to_text(&self) -> String {
        Bottle::new()
            .with(Value::Int64(self.seq))
            .with(self.timestamp)
            .with(self.sender.as_str())
            .to_text()
    }

    /// 从文本还原。
    pub fn from_text(text: &str) -> Result<Self> {
        let bottle = Bottle::from_text(text)?;
        let malformed = || {
            CoreError::violation(codes::WIRE_MALFORMED, format!("malformed envelope `{text}`"))
        };
        let seq = bottle.get(0).and_then(Value::as_i64).ok_or_else(malformed)?;
        let timestamp = bottle.get(1).and_then(Value::as_f64).ok_or_else(malformed)?;
        let sender = bottle
            .get(2)
            .and_then(Value::as_word)
            .unwrap_or_default();
        Ok(Self {
            seq,
            timestamp,
            sender,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_text_round_trip() {
        let env = Envelope::new(42, 1700000000.25, "/sender");
        let text = env.to_text();
        assert_eq!(text, "42 1700000000.25 \"/sender\"");
        assert_eq!(Envelope::from_text(&text).expect("合法信封"), env);
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(Envelope::from_text("42").is_err());
        assert!(Envelope::from_text("\"x\" 1.0").is_err());
    }
}
