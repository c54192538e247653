//! # 连接协议状态机
//!
//! ## 核心意图（Why）
//! - 每条连接（无论输入还是输出）都沿同一张状态图推进，非法跃迁立即以
//!   `INVALID_TRANSITION` 暴露，而不是在错误的阶段读写通道。
//!
//! ## 状态机约束（What）
//! - 主干：`Handshaking → Established → Streaming ⇄ AwaitingReply → Closing → Closed`；
//! - 任何状态都可直接进入 `Closed`（携带错误码）；
//! - `Established` 可直接进入 `AwaitingReply`（第一条消息即请求回复）或 `Closing`；
//! - 命名输出连接故障后从 `Closed` 回到 `Handshaking` 重新握手，路由保持不变。
//!
//! ## 注意事项（Trade-offs）
//! - 状态只由持有连接的任务修改，因此是普通字段而非原子量；
//!   外部观察通过连接自身的锁完成。

use std::fmt;

use portwire_core::error::{CoreError, Result, codes};

/// 连接所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// 正在交换前导与发送方说明。
    Handshaking,
    /// 握手完成，尚未传输消息。
    Established,
    /// 正常收发。
    Streaming,
    /// 一条请求回复的消息已交付，等待回复写回。
    AwaitingReply,
    /// 正在释放通道。
    Closing,
    /// 通道已释放。
    Closed,
}

impl Phase {
    /// 判断能否跃迁到 `target`。
    pub fn can_transition_to(self, target: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, target),
            (_, Closed)
                | (Handshaking, Established)
                | (Established, Streaming)
                | (Established, AwaitingReply)
                | (Established, Closing)
                | (Streaming, Streaming)
                | (Streaming, AwaitingReply)
                | (Streaming, Closing)
                | (AwaitingReply, Streaming)
                | (AwaitingReply, Closing)
                | (Closing, Closing)
                | (Closed, Handshaking)
        )
    }

    /// 是否可以传输消息。
    pub fn is_open(self) -> bool {
        matches!(
            self,
            Phase::Established | Phase::Streaming | Phase::AwaitingReply
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Phase::Handshaking => "handshaking",
            Phase::Established => "established",
            Phase::Streaming => "streaming",
            Phase::AwaitingReply => "awaiting-reply",
            Phase::Closing => "closing",
            Phase::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// 单条连接的状态记录。
#[derive(Clone, Debug)]
pub struct ProtocolState {
    phase: Phase,
    /// 进入 `Closed` 时附带的错误码。
    close_code: Option<&'static str>,
}

impl Default for ProtocolState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolState {
    /// 从 `Handshaking` 开始。
    pub fn new() -> Self {
        Self {
            phase: Phase::Handshaking,
            close_code: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn close_code(&self) -> Option<&'static str> {
        self.close_code
    }

    /// 跃迁到 `target`；非法跃迁返回 `INVALID_TRANSITION`，状态不变。
    pub fn advance(&mut self, target: Phase) -> Result<()> {
        if !self.phase.can_transition_to(target) {
            return Err(CoreError::violation(
                codes::INVALID_TRANSITION,
                format!("connection cannot move from {} to {target}", self.phase),
            ));
        }
        if target == Phase::Handshaking {
            self.close_code = None;
        }
        self.phase = target;
        Ok(())
    }

    /// 以错误码关闭；任何状态均可。
    pub fn fail(&mut self, code: &'static str) {
        self.phase = Phase::Closed;
        self.close_code = Some(code);
    }

    /// 正常关闭。
    pub fn close(&mut self) {
        self.phase = Phase::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_with_one_reply() {
        let mut state = ProtocolState::new();
        for next in [
            Phase::Established,
            Phase::Streaming,
            Phase::AwaitingReply,
            Phase::Streaming,
            Phase::Closing,
            Phase::Closed,
        ] {
            state.advance(next).expect("合法跃迁");
        }
        assert_eq!(state.phase(), Phase::Closed);
        assert_eq!(state.close_code(), None);
    }

    #[test]
    fn reply_pipelining_is_rejected() {
        let mut state = ProtocolState::new();
        state.advance(Phase::Established).expect("握手完成");
        state.advance(Phase::AwaitingReply).expect("等待回复");
        let err = state.advance(Phase::AwaitingReply).expect_err("不允许第二个待回复");
        assert_eq!(err.code(), codes::INVALID_TRANSITION);
        assert_eq!(state.phase(), Phase::AwaitingReply);
    }

    #[test]
    fn failure_then_reconnect() {
        let mut state = ProtocolState::new();
        state.advance(Phase::Established).expect("握手完成");
        state.fail(codes::CONNECTION_CLOSED);
        assert_eq!(state.close_code(), Some(codes::CONNECTION_CLOSED));
        state.advance(Phase::Handshaking).expect("重新握手");
        assert_eq!(state.close_code(), None);
        assert!(!state.phase().is_open());
    }
}
