use crate::error::{OperationKind, cancelled_error, map_io_error, timeout_error};
use portwire_core::CoreError;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// 一次性取消信号。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 端口关闭时需要同时唤醒阻塞在 `read()`、`accept` 与握手上的所有任务；
///   `watch` 通道天然支持一写多读，且晚到的订阅者也能看到已取消状态。
///
/// ## 契约 (What)
/// - `cancel` 幂等，调用后 `is_cancelled` 恒为 `true`；
/// - `cancelled()` 在已取消时立即完成。
#[derive(Clone, Debug)]
pub struct CancellationSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// 触发取消。
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// 等待取消发生。
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // 发送端由 `self` 持有，`wait_for` 只会在值变为 true 时返回
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// 在保留取消/超时语义的前提下执行 IO Future。
///
/// `timeout` 为 `None` 时不设上限；`cancel` 为 `None` 时不可取消。
pub async fn run_with_context<F, T>(
    kind: OperationKind,
    timeout: Option<Duration>,
    cancel: Option<&CancellationSignal>,
    future: F,
) -> Result<T, CoreError>
where
    F: Future<Output = io::Result<T>>,
{
    if let Some(cancel) = cancel
        && cancel.is_cancelled()
    {
        return Err(cancelled_error(kind));
    }

    let cancelled = async {
        match cancel {
            Some(cancel) => cancel.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(cancelled);
    tokio::pin!(future);

    if let Some(timeout) = timeout {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        tokio::select! {
            biased;
            _ = &mut cancelled => Err(cancelled_error(kind)),
            _ = &mut sleep => Err(timeout_error(kind)),
            result = &mut future => result.map_err(|err| map_io_error(kind, err)),
        }
    } else {
        tokio::select! {
            biased;
            _ = &mut cancelled => Err(cancelled_error(kind)),
            result = &mut future => result.map_err(|err| map_io_error(kind, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::READ;
    use portwire_core::ErrorKind;

    #[tokio::test]
    async fn cancel_wakes_pending_future() {
        let signal = CancellationSignal::new();
        let waker = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.cancel();
        });
        let err = run_with_context(
            READ,
            None,
            Some(&signal),
            std::future::pending::<io::Result<()>>(),
        )
        .await
        .expect_err("应被取消");
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn timeout_fires() {
        let err = run_with_context(
            READ,
            Some(Duration::from_millis(10)),
            None,
            std::future::pending::<io::Result<()>>(),
        )
        .await
        .expect_err("应超时");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn already_cancelled_short_circuits() {
        let signal = CancellationSignal::new();
        signal.cancel();
        signal.cancelled().await;
        let result = run_with_context(READ, None, Some(&signal), async { Ok(1) }).await;
        assert!(result.is_err());
    }
}
