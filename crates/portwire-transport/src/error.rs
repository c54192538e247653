use portwire_core::error::{CoreError, ErrorCategory, ErrorKind, RetryAdvice, codes};
use std::borrow::Cow;
use std::io;
use std::time::Duration;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const BIND: OperationKind = OperationKind {
    code: "portwire.transport.bind_failed",
    message: "bind",
};
pub const ACCEPT: OperationKind = OperationKind {
    code: "portwire.transport.accept_failed",
    message: "accept",
};
pub const CONNECT: OperationKind = OperationKind {
    code: "portwire.transport.connect_failed",
    message: "connect",
};
pub const READ: OperationKind = OperationKind {
    code: "portwire.transport.read_failed",
    message: "read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "portwire.transport.write_failed",
    message: "write",
};
pub const SHUTDOWN: OperationKind = OperationKind {
    code: "portwire.transport.shutdown_failed",
    message: "shutdown",
};
pub const CONFIGURE: OperationKind = OperationKind {
    code: "portwire.transport.configure_failed",
    message: "configure",
};
pub const JOIN: OperationKind = OperationKind {
    code: "portwire.transport.join_failed",
    message: "multicast join",
};

const CANCEL_CODE: &str = "portwire.transport.cancelled";
const TIMEOUT_CODE: &str = "portwire.transport.timeout";

/// 将 IO 错误映射为 [`CoreError`]，并附带错误分类。
///
/// 读到 EOF 表示对端已关闭，映射为 `Closed` 而不是 `Io`，读循环据此区分
/// “正常结束”与“链路故障”。
pub fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    if error.kind() == io::ErrorKind::UnexpectedEof {
        return CoreError::new(
            codes::CONNECTION_CLOSED,
            Cow::Owned(format!("{}: peer closed the stream", kind.message)),
        )
        .with_cause(error);
    }
    let category = categorize_io_error(&error);
    let err = CoreError::new(
        kind.code,
        Cow::Owned(format!("{}: {}", kind.message, error)),
    )
    .with_category(category);
    match error.kind() {
        io::ErrorKind::InvalidData => err.with_kind(ErrorKind::ProtocolViolation),
        io::ErrorKind::TimedOut => err.with_kind(ErrorKind::Timeout),
        _ => err.with_kind(ErrorKind::Io),
    }
    .with_cause(error)
}

/// 构造取消错误。
pub fn cancelled_error(kind: OperationKind) -> CoreError {
    let message = format!("{} cancelled", kind.message);
    CoreError::new(CANCEL_CODE, message)
        .with_kind(ErrorKind::Closed)
        .with_category(ErrorCategory::Cancelled)
}

/// 构造超时错误。
pub fn timeout_error(kind: OperationKind) -> CoreError {
    let message = format!("{} timed out", kind.message);
    CoreError::timeout(TIMEOUT_CODE, message)
}

/// IO 错误到处置分类的映射。
pub fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::InvalidData => ErrorCategory::ProtocolViolation,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            ErrorCategory::Retryable(RetryAdvice::after(Duration::from_millis(5)))
        }
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => {
            ErrorCategory::Retryable(RetryAdvice::after(Duration::from_millis(50)))
        }
        ErrorKind::PermissionDenied | ErrorKind::Unsupported => ErrorCategory::NonRetryable,
        ErrorKind::WriteZero => {
            ErrorCategory::Retryable(RetryAdvice::after(Duration::from_millis(10)))
        }
        _ => ErrorCategory::NonRetryable,
    }
}
