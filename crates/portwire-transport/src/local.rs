//! # local 模块说明
//!
//! ## 意图（Why）
//! - 同一进程内的两个端口无需经过套接字即可互联；[`LocalHub`] 以端口的监听地址为键，
//!   把“连接”变成一对内存管道，握手与帧格式仍与网络载体完全一致。
//!
//! ## 契约（What）
//! - 每个 `Network` 持有一个 hub，不同 hub 之间互不可见；
//! - `connect` 在键未绑定或监听端已关闭时返回 `HandshakeFailed`；
//! - 监听端被丢弃后自动视为解绑。

use std::net::SocketAddr;

use async_trait::async_trait;
use dashmap::DashMap;
use portwire_core::error::{CoreError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{self, map_io_error};
use crate::stream::TwoWayStream;
use crate::util::CancellationSignal;

/// 单向缓冲容量；写满后写入方等待，形成自然背压。
const PIPE_CAPACITY: usize = 64 * 1024;

/// 进程内管道的一端。
#[derive(Debug)]
pub struct LocalChannel {
    pipe: DuplexStream,
    closed: bool,
}

#[async_trait]
impl TwoWayStream for LocalChannel {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.pipe
            .read_exact(buf)
            .await
            .map(|_| ())
            .map_err(|err| map_io_error(error::READ, err))
    }

    async fn send(&mut self, parts: &[&[u8]]) -> Result<()> {
        for part in parts {
            self.pipe
                .write_all(part)
                .await
                .map_err(|err| map_io_error(error::WRITE, err))?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.pipe
            .shutdown()
            .await
            .map_err(|err| map_io_error(error::SHUTDOWN, err))
    }
}

/// 进程内监听端，由 [`LocalHub::bind`] 创建。
#[derive(Debug)]
pub struct LocalListener {
    key: String,
    incoming: mpsc::UnboundedReceiver<LocalChannel>,
}

impl LocalListener {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 等待下一个进程内连接；hub 解绑或 `cancel` 触发时返回 `Closed`。
    pub async fn accept(&mut self, cancel: Option<&CancellationSignal>) -> Result<LocalChannel> {
        let cancelled = async {
            match cancel {
                Some(cancel) => cancel.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => Err(CoreError::closed("local listener cancelled")),
            channel = self.incoming.recv() => {
                channel.ok_or_else(|| CoreError::closed("local listener unbound"))
            }
        }
    }
}

/// 进程内连接的登记处。
#[derive(Debug, Default)]
pub struct LocalHub {
    listeners: DashMap<String, mpsc::UnboundedSender<LocalChannel>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以 `key` 登记监听端，已有同名登记时被替换。
    pub fn bind(&self, key: impl Into<String>) -> LocalListener {
        let key = key.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.insert(key.clone(), tx);
        debug!(key = %key, "local listener bound");
        LocalListener { key, incoming: rx }
    }

    /// 解除登记。
    pub fn unbind(&self, key: &str) {
        if self.listeners.remove(key).is_some() {
            debug!(key, "local listener unbound");
        }
    }

    pub fn is_bound(&self, key: &str) -> bool {
        self.listeners
            .get(key)
            .is_some_and(|sender| !sender.is_closed())
    }

    /// 连接到 `key` 对应的监听端，返回客户端一侧的管道。
    pub fn connect(&self, key: &str) -> Result<LocalChannel> {
        let sender = self
            .listeners
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                CoreError::handshake_failed(format!("no local listener bound at `{key}`"))
            })?;
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let server = LocalChannel {
            pipe: server,
            closed: false,
        };
        if sender.send(server).is_err() {
            self.listeners.remove(key);
            return Err(CoreError::handshake_failed(format!(
                "local listener at `{key}` is gone"
            )));
        }
        Ok(LocalChannel {
            pipe: client,
            closed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portwire_core::ErrorKind;

    #[tokio::test]
    async fn connect_pairs_both_ends() {
        let hub = LocalHub::new();
        let mut listener = hub.bind("127.0.0.1:1");
        let mut client = hub.connect("127.0.0.1:1").expect("连接");
        let mut server = listener.accept(None).await.expect("接受");

        client.send(&[b"ping"]).await.expect("写入");
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.expect("读取");
        assert_eq!(&buf, b"ping");

        client.shutdown().await.expect("关闭");
        let err = server.read_exact(&mut buf).await.expect_err("对端关闭");
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn unknown_or_dropped_listener_fails_handshake() {
        let hub = LocalHub::new();
        let err = hub.connect("nowhere").expect_err("未绑定");
        assert_eq!(err.kind(), ErrorKind::HandshakeFailed);

        let listener = hub.bind("gone");
        drop(listener);
        assert!(!hub.is_bound("gone"));
        let err = hub.connect("gone").expect_err("监听端已丢弃");
        assert_eq!(err.kind(), ErrorKind::HandshakeFailed);
    }
}
