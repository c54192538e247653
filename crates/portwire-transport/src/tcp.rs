use crate::error::{self, CONFIGURE, map_io_error};
use crate::stream::TwoWayStream;
use crate::util::{CancellationSignal, run_with_context};
use async_trait::async_trait;
use portwire_core::error::{CoreError, Result};
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream as TokioTcpStream};

/// TCP 套接字级配置项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 端口消息通常很小且要求低延迟，默认关闭 Nagle 算法（`TCP_NODELAY`）；
/// - 关闭阶段的 `SO_LINGER` 策略显式配置化，避免调用方直接操作 `socket2`。
///
/// ## 核心逻辑（How）
/// - `apply` 通过 `socket2::SockRef` 在建连或接受后一次性写入内核选项；
/// - `linger = None` 表示遵循内核默认策略。
///
/// ## 注意事项（Trade-offs）
/// - `SO_LINGER` 在 Linux 上取整到秒，过小的超时可能让对端收到 RST。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    nodelay: bool,
    linger: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketConfig {
    /// 默认配置：开启 `TCP_NODELAY`，`linger` 沿用内核默认。
    pub const fn new() -> Self {
        Self {
            nodelay: true,
            linger: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    fn apply(&self, stream: &TokioTcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        sock.set_tcp_nodelay(self.nodelay)?;
        sock.set_linger(self.linger)
    }
}

/// 单条 TCP 连接。
///
/// # 教案式注释
///
/// ## 逻辑 (How)
/// - 内部使用 `BufStream` 包裹 `TcpStream`：文本载体逐字节读行时不会退化成逐字节系统调用；
/// - `send` 依次写入所有片段后统一 `flush`，一个消息单元对应尽量少的报文段。
///
/// ## 契约 (What)
/// - 通道由唯一持有者独占，方法均以 `&mut self` 调用，不需要内部锁；
/// - `shutdown` 幂等。
#[derive(Debug)]
pub struct TcpChannel {
    stream: BufStream<TokioTcpStream>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    closed: bool,
}

impl TcpChannel {
    fn from_stream(stream: TokioTcpStream, config: &TcpSocketConfig) -> Result<Self, CoreError> {
        config
            .apply(&stream)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let local_addr = stream
            .local_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|err| map_io_error(CONFIGURE, err))?;
        Ok(Self {
            stream: BufStream::new(stream),
            local_addr,
            peer_addr,
            closed: false,
        })
    }

    /// 以默认配置连接目标地址。
    pub async fn connect(addr: &str, timeout: Option<Duration>) -> Result<Self, CoreError> {
        Self::connect_with_config(addr, timeout, &TcpSocketConfig::default()).await
    }

    /// 连接目标地址并应用套接字配置。
    ///
    /// `addr` 可以是 `host:port` 形式的主机名，解析交给 Tokio。
    pub async fn connect_with_config(
        addr: &str,
        timeout: Option<Duration>,
        config: &TcpSocketConfig,
    ) -> Result<Self, CoreError> {
        let stream =
            run_with_context(error::CONNECT, timeout, None, TokioTcpStream::connect(addr)).await?;
        Self::from_stream(stream, config)
    }
}

#[async_trait]
impl TwoWayStream for TcpChannel {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer_addr)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream
            .read_exact(buf)
            .await
            .map(|_| ())
            .map_err(|err| map_io_error(error::READ, err))
    }

    async fn send(&mut self, parts: &[&[u8]]) -> Result<()> {
        for part in parts {
            self.stream
                .write_all(part)
                .await
                .map_err(|err| map_io_error(error::WRITE, err))?;
        }
        self.stream
            .flush()
            .await
            .map_err(|err| map_io_error(error::WRITE, err))
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            // 对端先行关闭时 shutdown 会报 NotConnected，视为已经关闭
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(map_io_error(error::SHUTDOWN, err)),
        }
    }
}

/// 对 Tokio `TcpListener` 的语义封装。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 端口的接收任务只需要“接受 → 交给握手任务”，不关心 Tokio 具体类型；
/// - `accept` 接入 [`CancellationSignal`]，端口关闭时接收循环能立即退出。
///
/// ## 契约 (What)
/// - `bind("127.0.0.1:0")` 由内核分配端口，实际地址通过 [`local_addr`](Self::local_addr) 获取；
/// - `accept` 返回的通道已应用监听器的默认 [`TcpSocketConfig`]。
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
    local_addr: SocketAddr,
    default_config: TcpSocketConfig,
}

impl TcpListener {
    /// 绑定到指定地址。
    pub async fn bind(addr: &str) -> Result<Self, CoreError> {
        Self::bind_with_config(addr, TcpSocketConfig::default()).await
    }

    /// 绑定到指定地址并设置新连接的默认套接字配置。
    pub async fn bind_with_config(
        addr: &str,
        default_config: TcpSocketConfig,
    ) -> Result<Self, CoreError> {
        let listener = TokioTcpListener::bind(addr)
            .await
            .map_err(|err| map_io_error(error::BIND, err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        Ok(Self {
            inner: listener,
            local_addr,
            default_config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 接受一个入站连接；`cancel` 触发时返回 `Closed`。
    pub async fn accept(
        &self,
        cancel: Option<&CancellationSignal>,
    ) -> Result<(TcpChannel, SocketAddr), CoreError> {
        let (stream, peer) = run_with_context(error::ACCEPT, None, cancel, self.inner.accept()).await?;
        let channel = TcpChannel::from_stream(stream, &self.default_config)?;
        Ok((channel, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portwire_core::ErrorKind;

    #[tokio::test]
    async fn echo_through_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定");
        let addr = listener.local_addr().to_string();
        let server = tokio::spawn(async move {
            let (mut channel, _) = listener.accept(None).await.expect("接受");
            let mut buf = [0u8; 5];
            channel.read_exact(&mut buf).await.expect("读取");
            channel.send(&[&buf[..2], &buf[2..]]).await.expect("回写");
            channel
        });

        let mut client = TcpChannel::connect(&addr, Some(Duration::from_secs(2)))
            .await
            .expect("连接");
        client.send(&[b"hel", b"lo"]).await.expect("写入");
        let mut echo = [0u8; 5];
        client.read_exact(&mut echo).await.expect("读取回显");
        assert_eq!(&echo, b"hello");

        let mut server_side = server.await.expect("服务端任务");
        server_side.shutdown().await.expect("关闭");
        server_side.shutdown().await.expect("重复关闭应幂等");
        let err = client.read_exact(&mut echo).await.expect_err("对端已关闭");
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn accept_honours_cancellation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("绑定");
        let signal = CancellationSignal::new();
        signal.cancel();
        let err = listener.accept(Some(&signal)).await.expect_err("已取消");
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[test]
    fn config_builder() {
        let config = TcpSocketConfig::new()
            .with_nodelay(false)
            .with_linger(Some(Duration::from_secs(1)));
        assert!(!config.nodelay());
        assert_eq!(config.linger(), Some(Duration::from_secs(1)));
    }
}
