//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为端口、载体、名字解析三条链路提供统一的 [`CoreError`]，让调用方只需面对一种错误形态；
//! - 以稳定错误码（`portwire.<领域>.<语义>`）承载语义，日志与告警可以直接按码聚合。
//!
//! ## 设计要求（What）
//! - [`ErrorKind`] 对应对外承诺的错误分类：`NameNotFound`、`HandshakeFailed`、`Io`、
//!   `ProtocolViolation`、`Timeout` 等；
//! - [`ErrorCategory`] 描述“调用方该如何处置”（重试、放弃、关闭连接），与 `ErrorKind` 正交；
//! - 各 crate 私有的 `thiserror` 枚举通过 `From` 汇入 `CoreError`。

use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// 统一的结果别名。
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// 底层原因的装箱形式。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// 稳定错误码表。
///
/// 新增码值时需同步更新 [`default_kind`]，否则分类将退化为按 [`ErrorCategory`] 推断。
pub mod codes {
    pub const NAME_NOT_FOUND: &str = "portwire.name.not_found";
    pub const NAME_INVALID: &str = "portwire.name.invalid";
    pub const STORE_UNAVAILABLE: &str = "portwire.name.store_unavailable";
    pub const STORE_TIMEOUT: &str = "portwire.name.query_timeout";
    pub const CARRIER_UNKNOWN: &str = "portwire.carrier.unknown";
    pub const CARRIER_DUPLICATE: &str = "portwire.carrier.duplicate";
    pub const HANDSHAKE_FAILED: &str = "portwire.protocol.handshake_failed";
    pub const PROTOCOL_VIOLATION: &str = "portwire.protocol.violation";
    pub const INVALID_TRANSITION: &str = "portwire.protocol.invalid_transition";
    pub const WIRE_OUT_OF_BOUNDS: &str = "portwire.wire.out_of_bounds";
    pub const WIRE_MALFORMED: &str = "portwire.wire.malformed";
    pub const WIRE_TOO_LARGE: &str = "portwire.wire.too_large";
    pub const REPLY_TWICE: &str = "portwire.port.reply_twice";
    pub const REPLY_PENDING: &str = "portwire.port.reply_pending";
    pub const REPLY_UNSUPPORTED: &str = "portwire.port.reply_unsupported";
    pub const REPLY_TIMEOUT: &str = "portwire.port.reply_timeout";
    pub const PORT_CLOSED: &str = "portwire.port.closed";
    pub const PORT_NOT_OPEN: &str = "portwire.port.not_open";
    pub const PORT_ALREADY_OPEN: &str = "portwire.port.already_open";
    pub const PORT_CALLBACK_MODE: &str = "portwire.port.callback_mode";
    pub const NO_CONNECTION: &str = "portwire.port.no_connection";
    pub const CONNECTION_CLOSED: &str = "portwire.connection.closed";
    pub const CONFIG_INVALID: &str = "portwire.config.invalid";

    const ALL: &[&str] = &[
        NAME_NOT_FOUND,
        NAME_INVALID,
        STORE_UNAVAILABLE,
        STORE_TIMEOUT,
        CARRIER_UNKNOWN,
        CARRIER_DUPLICATE,
        HANDSHAKE_FAILED,
        PROTOCOL_VIOLATION,
        INVALID_TRANSITION,
        WIRE_OUT_OF_BOUNDS,
        WIRE_MALFORMED,
        WIRE_TOO_LARGE,
        REPLY_TWICE,
        REPLY_PENDING,
        REPLY_UNSUPPORTED,
        REPLY_TIMEOUT,
        PORT_CLOSED,
        PORT_NOT_OPEN,
        PORT_ALREADY_OPEN,
        PORT_CALLBACK_MODE,
        NO_CONNECTION,
        CONNECTION_CLOSED,
        CONFIG_INVALID,
    ];

    /// 把线上收到的码值还原为静态码值；未知码值返回 `None`。
    ///
    /// 管理命令的失败回复以字符串携带错误码，远端调用方据此重建 `CoreError`。
    pub fn intern(code: &str) -> Option<&'static str> {
        ALL.iter().copied().find(|known| *known == code)
    }
}

/// 对外承诺的错误分类。
///
/// # 教案式注释
/// - **意图 (Why)**：调用方常需要区分“名字不存在”与“名字服务不可达”，前者应快速失败，
///   后者值得重试；单靠错误码字符串比较容易写错，因此提供枚举。
/// - **契约 (What)**：`StoreUnavailable` 只表示名字存储不可达；连接建立阶段的拒绝、
///   载体不匹配统一归入 `HandshakeFailed`；`Closed` 用于端口或连接已经关闭的场景。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    NameNotFound,
    StoreUnavailable,
    HandshakeFailed,
    Io,
    ProtocolViolation,
    Timeout,
    Closed,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::NameNotFound => "name not found",
            ErrorKind::StoreUnavailable => "name store unavailable",
            ErrorKind::HandshakeFailed => "handshake failed",
            ErrorKind::Io => "i/o error",
            ErrorKind::ProtocolViolation => "protocol violation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Closed => "closed",
            ErrorKind::Config => "invalid configuration",
        };
        f.write_str(text)
    }
}

/// 重试建议：推荐的最短等待时间。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryAdvice {
    wait: Duration,
}

impl RetryAdvice {
    /// 在 `wait` 之后重试。
    pub const fn after(wait: Duration) -> Self {
        Self { wait }
    }

    /// 建议的等待时长。
    pub fn wait(&self) -> Duration {
        self.wait
    }
}

/// 错误处置分类，驱动调用方的自动化策略。
///
/// - `Retryable`：携带退避建议；
/// - `ProtocolViolation`：对端行为非法，必须关闭所在连接；
/// - `Cancelled`/`Timeout`：调用被取消或超时，资源已释放。
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Retryable(RetryAdvice),
    NonRetryable,
    ProtocolViolation,
    Cancelled,
    Timeout,
}

/// portwire 的统一错误类型。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 端口层要把握手、解析、I/O 等来源各异的失败合流后交给调用方或事件通道；
/// - 错误码为 `'static` 字符串，天然适合作为日志字段与测试断言。
///
/// ## 逻辑 (How)
/// - 以 Builder 风格叠加分类、类别与底层原因；
/// - [`kind`](Self::kind) 优先返回显式设置值，其次查码表，最后按分类推断。
///
/// ## 契约 (What)
/// - `code`：遵循 `portwire.<领域>.<语义>` 的稳定码值；
/// - `message`：面向排障人员的描述，不含敏感信息；
/// - 实现 `Send + Sync + 'static`，可跨任务传播。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    kind: Option<ErrorKind>,
    category: Option<ErrorCategory>,
    cause: Option<ErrorCause>,
}

impl CoreError {
    /// 构造核心错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            kind: None,
            category: None,
            cause: None,
        }
    }

    /// 名字未在名字存储中登记。
    pub fn name_not_found(name: &str) -> Self {
        Self::new(codes::NAME_NOT_FOUND, format!("no contact registered for `{name}`"))
    }

    /// 名字存储不可达。
    pub fn store_unavailable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::STORE_UNAVAILABLE, message).with_category(ErrorCategory::Retryable(
            RetryAdvice::after(Duration::from_millis(200)),
        ))
    }

    /// 握手失败：载体不匹配、拒绝连接或对端不可达。
    pub fn handshake_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::HANDSHAKE_FAILED, message)
    }

    /// 协议违规，使用通用码值。
    pub fn protocol_violation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::violation(codes::PROTOCOL_VIOLATION, message)
    }

    /// 以指定码值构造协议违规。
    pub fn violation(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(code, message)
            .with_kind(ErrorKind::ProtocolViolation)
            .with_category(ErrorCategory::ProtocolViolation)
    }

    /// 连接已被对端或本端关闭。
    pub fn closed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::CONNECTION_CLOSED, message).with_category(ErrorCategory::Cancelled)
    }

    /// 配置或参数非法。
    pub fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::CONFIG_INVALID, message)
    }

    /// 以指定码值构造超时错误。
    pub fn timeout(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(code, message)
            .with_kind(ErrorKind::Timeout)
            .with_category(ErrorCategory::Timeout)
    }

    /// 附带底层原因。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 显式指定错误分类，覆盖码表推断。
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// 标记处置分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 就地更新处置分类。
    pub fn set_category(&mut self, category: ErrorCategory) {
        self.category = Some(category);
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 对外承诺的错误分类。
    pub fn kind(&self) -> ErrorKind {
        if let Some(kind) = self.kind {
            return kind;
        }
        if let Some(kind) = default_kind(self.code) {
            return kind;
        }
        match self.category() {
            ErrorCategory::Timeout => ErrorKind::Timeout,
            ErrorCategory::ProtocolViolation => ErrorKind::ProtocolViolation,
            ErrorCategory::Cancelled => ErrorKind::Closed,
            _ => ErrorKind::Io,
        }
    }

    /// 处置分类；未显式设置时按码值给出默认值。
    pub fn category(&self) -> ErrorCategory {
        if let Some(category) = &self.category {
            return category.clone();
        }
        match default_kind(self.code) {
            Some(ErrorKind::ProtocolViolation) => ErrorCategory::ProtocolViolation,
            Some(ErrorKind::Timeout) => ErrorCategory::Timeout,
            Some(ErrorKind::Closed) => ErrorCategory::Cancelled,
            Some(ErrorKind::StoreUnavailable) => {
                ErrorCategory::Retryable(RetryAdvice::after(Duration::from_millis(200)))
            }
            _ => ErrorCategory::NonRetryable,
        }
    }

    /// 是否值得重试。
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Retryable(_))
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn Error + 'static))
    }
}

/// 码值到分类的默认映射。
pub fn default_kind(code: &str) -> Option<ErrorKind> {
    let kind = match code {
        codes::NAME_NOT_FOUND => ErrorKind::NameNotFound,
        codes::STORE_UNAVAILABLE => ErrorKind::StoreUnavailable,
        codes::STORE_TIMEOUT | codes::REPLY_TIMEOUT => ErrorKind::Timeout,
        codes::HANDSHAKE_FAILED | codes::CARRIER_UNKNOWN => ErrorKind::HandshakeFailed,
        codes::PROTOCOL_VIOLATION
        | codes::INVALID_TRANSITION
        | codes::WIRE_OUT_OF_BOUNDS
        | codes::WIRE_MALFORMED
        | codes::WIRE_TOO_LARGE
        | codes::REPLY_TWICE
        | codes::REPLY_PENDING
        | codes::REPLY_UNSUPPORTED => ErrorKind::ProtocolViolation,
        codes::PORT_CLOSED | codes::CONNECTION_CLOSED => ErrorKind::Closed,
        codes::NAME_INVALID
        | codes::CARRIER_DUPLICATE
        | codes::CONFIG_INVALID
        | codes::PORT_NOT_OPEN
        | codes::PORT_ALREADY_OPEN
        | codes::PORT_CALLBACK_MODE
        | codes::NO_CONNECTION => ErrorKind::Config,
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_code_table() {
        let err = CoreError::name_not_found("/ghost");
        assert_eq!(err.kind(), ErrorKind::NameNotFound);
        assert_eq!(err.code(), codes::NAME_NOT_FOUND);
        assert!(err.message().contains("/ghost"));
        assert!(!err.is_retryable(), "名字不存在应快速失败");
    }

    #[test]
    fn intern_recovers_static_codes() {
        assert_eq!(codes::intern("portwire.name.not_found"), Some(codes::NAME_NOT_FOUND));
        assert_eq!(codes::intern("portwire.nope"), None);
    }

    #[test]
    fn store_unavailable_is_retryable() {
        let err = CoreError::store_unavailable("connection refused");
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert!(err.is_retryable());
    }

    #[test]
    fn unknown_code_falls_back_to_category() {
        let err = CoreError::new("portwire.transport.tcp.read_failed", "tcp read: eof")
            .with_category(ErrorCategory::Timeout);
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err = CoreError::new("portwire.transport.tcp.write_failed", "tcp write: reset");
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn violation_carries_its_category() {
        let err = CoreError::violation(codes::WIRE_OUT_OF_BOUNDS, "read past block");
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(err.category(), ErrorCategory::ProtocolViolation);
    }

    #[test]
    fn display_carries_code() {
        let err = CoreError::closed("peer hung up");
        assert_eq!(err.to_string(), "[portwire.connection.closed] peer hung up");
    }
}
