//! # datagram 模块说明
//!
//! ## 意图（Why）
//! - `udp` 与 `mcast` 载体在 TCP 控制流上完成握手后改走数据报；[`DatagramChannel`] 让它们
//!   仍以 [`TwoWayStream`] 的形态被连接层驱动；
//! - 控制流保留到连接结束：它关闭即表示发送方离开，数据报接收方据此退出读循环。
//!
//! ## 逻辑（How）
//! - `send` 把所有片段拼成一个数据报；
//! - `read_exact` 从当前数据报中取字节，当前数据报耗尽时才接收下一个；
//!   一个消息跨越数据报边界意味着数据报被截断，按协议违规处理。
//!
//! ## 注意事项（Trade-offs）
//! - 数据报无重传，丢失的消息不会被察觉，这正是 best-effort 载体的语义；
//! - 单条消息受 [`MAX_DATAGRAM`] 限制，超出时写入方得到 `WIRE_TOO_LARGE`。

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use portwire_core::error::{CoreError, Result, codes};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tracing::trace;

use crate::error::{self, map_io_error};
use crate::stream::{BoxStream, TwoWayStream};

/// 单个 UDP 数据报的最大负载。
pub const MAX_DATAGRAM: usize = 65_507;

/// 基于 UDP 套接字的数据报通道。
#[derive(Debug)]
pub struct DatagramChannel {
    socket: UdpSocket,
    target: Option<SocketAddr>,
    packet: Bytes,
    control: Option<BoxStream>,
    closed: bool,
}

impl DatagramChannel {
    fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            target: None,
            packet: Bytes::new(),
            control: None,
            closed: false,
        }
    }

    /// 绑定本地地址，端口为 0 时由内核分配。
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|err| map_io_error(error::BIND, err))?;
        Ok(Self::from_socket(socket))
    }

    /// 绑定组地址上的端口并加入组播组。
    ///
    /// `group` 不是组播地址时退化为普通单播绑定，便于在没有组播路由的环境里测试。
    pub fn join(group: Ipv4Addr, port: u16) -> Result<Self> {
        let bind_ip = if group.is_multicast() {
            Ipv4Addr::UNSPECIFIED
        } else {
            group
        };
        let socket = reusable_udp_socket(SocketAddr::new(IpAddr::V4(bind_ip), port))?;
        if group.is_multicast() {
            socket
                .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                .map_err(|err| map_io_error(error::JOIN, err))?;
        }
        Ok(Self::from_socket(socket))
    }

    /// 面向组地址的发送端。
    pub async fn multicast_sender(group: Ipv4Addr, port: u16) -> Result<Self> {
        let bind_ip = if group.is_loopback() {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        let channel = Self::bind(SocketAddr::new(IpAddr::V4(bind_ip), 0)).await?;
        if group.is_multicast() {
            channel
                .socket
                .set_multicast_loop_v4(true)
                .map_err(|err| map_io_error(error::CONFIGURE, err))?;
            channel
                .socket
                .set_multicast_ttl_v4(1)
                .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        }
        Ok(channel.with_target(SocketAddr::new(IpAddr::V4(group), port)))
    }

    /// 设置发送目标。
    pub fn with_target(mut self, target: SocketAddr) -> Self {
        self.target = Some(target);
        self
    }

    /// 挂接控制流：控制流关闭即视为连接结束。
    pub fn with_control(mut self, control: BoxStream) -> Self {
        self.control = Some(control);
        self
    }

    /// 套接字实际绑定的地址。
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|err| map_io_error(error::CONFIGURE, err))
    }

    /// 接收一个数据报，返回内容与来源地址。
    pub async fn recv_from(&self) -> Result<(Bytes, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, from) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|err| map_io_error(error::READ, err))?;
        buf.truncate(len);
        Ok((Bytes::from(buf), from))
    }

    /// 向指定地址发送单个数据报。
    pub async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        if data.len() > MAX_DATAGRAM {
            return Err(CoreError::violation(
                codes::WIRE_TOO_LARGE,
                format!("datagram of {} bytes exceeds {MAX_DATAGRAM}", data.len()),
            ));
        }
        self.socket
            .send_to(data, target)
            .await
            .map(|_| ())
            .map_err(|err| map_io_error(error::WRITE, err))
    }

    async fn next_packet(&mut self) -> Result<()> {
        let socket = &self.socket;
        let control = &mut self.control;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = received.map_err(|err| map_io_error(error::READ, err))?;
                    if len == 0 {
                        continue;
                    }
                    trace!(%from, len, "datagram received");
                    self.packet = Bytes::copy_from_slice(&buf[..len]);
                    return Ok(());
                }
                _ = control_closed(control) => {
                    return Err(CoreError::closed("datagram control stream closed"));
                }
            }
        }
    }
}

async fn control_closed(control: &mut Option<BoxStream>) {
    match control {
        Some(stream) => {
            let mut byte = [0u8; 1];
            // 控制流上不再有合法数据：读到任何字节、EOF 或错误都代表连接结束
            let _ = stream.read_exact(&mut byte).await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[async_trait]
impl TwoWayStream for DatagramChannel {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.target
            .or_else(|| self.control.as_ref().and_then(|control| control.peer_addr()))
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.closed {
            return Err(CoreError::closed("datagram channel closed"));
        }
        if self.packet.is_empty() {
            self.next_packet().await?;
        }
        if self.packet.len() < buf.len() {
            let available = self.packet.len();
            self.packet.clear();
            return Err(CoreError::violation(
                codes::WIRE_OUT_OF_BOUNDS,
                format!("datagram truncated: need {} bytes, {available} left", buf.len()),
            ));
        }
        buf.copy_from_slice(&self.packet[..buf.len()]);
        self.packet.advance(buf.len());
        Ok(())
    }

    async fn send(&mut self, parts: &[&[u8]]) -> Result<()> {
        let Some(target) = self.target else {
            return Err(CoreError::config("datagram channel has no target"));
        };
        let datagram = parts.concat();
        self.send_to(&datagram, target).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.control.as_mut() {
            Some(control) => control.shutdown().await,
            None => Ok(()),
        }
    }

    fn begin_packet(&mut self) {
        self.packet.clear();
    }

    fn is_datagram(&self) -> bool {
        true
    }
}

fn reusable_udp_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let configure = |err| map_io_error(error::CONFIGURE, err);
    let socket =
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(configure)?;
    socket.set_reuse_address(true).map_err(configure)?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|err| map_io_error(error::BIND, err))?;
    socket.set_nonblocking(true).map_err(configure)?;
    UdpSocket::from_std(socket.into()).map_err(configure)
}

/// 让内核在 `ip` 上挑一个当前空闲的 UDP 端口。
///
/// 探测套接字随即释放，调用方应尽快使用该端口。
pub fn pick_free_port(ip: Ipv4Addr) -> Result<u16> {
    let bind_ip = if ip.is_multicast() {
        Ipv4Addr::UNSPECIFIED
    } else {
        ip
    };
    let scratch = std::net::UdpSocket::bind(SocketAddr::new(IpAddr::V4(bind_ip), 0))
        .map_err(|err| map_io_error(error::BIND, err))?;
    scratch
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|err| map_io_error(error::BIND, err))
}
