//! 数据报载体：`udp` 与 `mcast`。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 面向高频、可丢失的数据（传感器流等）：不确认、不回复，发送方永不因接收方变慢而阻塞。
//!
//! ## 逻辑 (How)
//! - 握手在 TCP 控制流上完成：`udp` 的接收方绑定一个数据报端口并以 YARP 整数告知发送方；
//!   `mcast` 由发送方挑选组地址与端口，经 6 字节附加头（4 字节 IPv4 地址 + 大端 u16 端口）
//!   告知接收方，接收方入组后回应 0；
//! - 握手结束后通道替换为 [`DatagramChannel`]，TCP 控制流被其持有，控制流关闭即连接结束；
//! - 每条消息是一个数据报，帧格式与流式载体的索引帧相同。
//!
//! ## 注意事项 (Trade-offs)
//! - 组地址不是组播地址时退化为单播，测试环境无需组播路由；
//! - 发送方挑选端口后到接收方绑定之间存在极短的竞争窗口。

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use portwire_core::error::{CoreError, Result, codes};
use portwire_core::PortCommand;
use portwire_transport::{BoxStream, DatagramChannel, TwoWayStream, pick_free_port, read_i32_le};
use tracing::debug;

use crate::carrier::{Capabilities, Carrier, CarrierFactory, CarrierOptions, Frame};
use crate::framing::{
    HEADER_LEN, encode_sender, parse_yarp_preamble, read_indexed, read_sender, specifier,
    write_indexed, yarp_preamble,
};

/// 组播附加头长度。
pub const MCAST_HEADER_LEN: usize = 6;

/// 数据报载体的两种模式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatagramMode {
    Unicast,
    Multicast,
}

impl DatagramMode {
    fn name(self) -> &'static str {
        match self {
            DatagramMode::Unicast => "udp",
            DatagramMode::Multicast => "mcast",
        }
    }

    fn specifier(self) -> i32 {
        match self {
            DatagramMode::Unicast => specifier::UDP,
            DatagramMode::Multicast => specifier::MCAST,
        }
    }
}

const CAPABILITIES: Capabilities = Capabilities {
    supports_reply: false,
    connectionless: true,
    text_mode: false,
    requires_ack: false,
    local: false,
};

/// 编码组播附加头。
pub fn encode_group(group: SocketAddr) -> Result<[u8; MCAST_HEADER_LEN]> {
    let SocketAddr::V4(group) = group else {
        return Err(CoreError::config("multicast groups must be IPv4"));
    };
    let ip = group.ip().octets();
    let port = group.port().to_be_bytes();
    Ok([ip[0], ip[1], ip[2], ip[3], port[0], port[1]])
}

/// 解码组播附加头。
pub fn decode_group(raw: &[u8; MCAST_HEADER_LEN]) -> SocketAddr {
    let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
    let port = u16::from_be_bytes([raw[4], raw[5]]);
    SocketAddr::new(IpAddr::V4(ip), port)
}

/// 数据报载体工厂。
#[derive(Debug)]
pub struct DatagramCarrierFactory {
    mode: DatagramMode,
}

impl DatagramCarrierFactory {
    pub fn udp() -> Self {
        Self {
            mode: DatagramMode::Unicast,
        }
    }

    pub fn mcast() -> Self {
        Self {
            mode: DatagramMode::Multicast,
        }
    }
}

impl CarrierFactory for DatagramCarrierFactory {
    fn name(&self) -> &str {
        self.mode.name()
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    fn check_header(&self, header: &[u8; HEADER_LEN]) -> bool {
        parse_yarp_preamble(header) == Some(self.mode.specifier())
    }

    fn create(&self, options: &CarrierOptions) -> Box<dyn Carrier> {
        Box::new(DatagramCarrier {
            mode: self.mode,
            max_message_bytes: options.max_message_bytes,
            mcast_group: options.mcast_group,
            group: None,
        })
    }
}

/// 数据报载体实例。
#[derive(Debug)]
pub struct DatagramCarrier {
    mode: DatagramMode,
    max_message_bytes: usize,
    mcast_group: Ipv4Addr,
    group: Option<SocketAddr>,
}

fn local_ip(stream: &dyn TwoWayStream) -> IpAddr {
    stream
        .local_addr()
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[async_trait]
impl Carrier for DatagramCarrier {
    fn name(&self) -> &str {
        self.mode.name()
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    async fn send_header(&mut self, stream: &mut (dyn TwoWayStream + '_), sender: &str) -> Result<()> {
        let preamble = yarp_preamble(self.mode.specifier());
        let sender = encode_sender(sender);
        match self.mode {
            DatagramMode::Unicast => stream.send(&[&preamble, &sender]).await,
            DatagramMode::Multicast => {
                let port = pick_free_port(self.mcast_group)?;
                let group = SocketAddr::new(IpAddr::V4(self.mcast_group), port);
                self.group = Some(group);
                debug!(%group, "announcing multicast group");
                let extra = encode_group(group)?;
                stream.send(&[&preamble, &sender, &extra]).await
            }
        }
    }

    async fn expect_reply_to_header(&mut self, mut stream: BoxStream) -> Result<BoxStream> {
        let value = read_i32_le(stream.as_mut()).await?;
        let channel = match (self.mode, self.group) {
            (DatagramMode::Unicast, _) => {
                let port = u16::try_from(value).map_err(|_| {
                    CoreError::handshake_failed(format!("udp peer announced bad port {value}"))
                })?;
                let peer = stream
                    .peer_addr()
                    .ok_or_else(|| CoreError::handshake_failed("udp needs a socket peer"))?;
                let local = SocketAddr::new(local_ip(stream.as_ref()), 0);
                DatagramChannel::bind(local)
                    .await?
                    .with_target(SocketAddr::new(peer.ip(), port))
            }
            (DatagramMode::Multicast, Some(SocketAddr::V4(group))) => {
                DatagramChannel::multicast_sender(*group.ip(), group.port()).await?
            }
            (DatagramMode::Multicast, _) => {
                return Err(CoreError::handshake_failed("multicast group was never announced"));
            }
        };
        Ok(Box::new(channel.with_control(stream)))
    }

    async fn expect_sender(
        &mut self,
        stream: &mut (dyn TwoWayStream + '_),
        _header: &[u8; HEADER_LEN],
    ) -> Result<String> {
        let sender = read_sender(stream).await?;
        if self.mode == DatagramMode::Multicast {
            let mut raw = [0u8; MCAST_HEADER_LEN];
            stream.read_exact(&mut raw).await?;
            self.group = Some(decode_group(&raw));
        }
        Ok(sender)
    }

    async fn respond_to_header(&mut self, mut stream: BoxStream) -> Result<BoxStream> {
        let (channel, announce) = match (self.mode, self.group) {
            (DatagramMode::Unicast, _) => {
                let local = SocketAddr::new(local_ip(stream.as_ref()), 0);
                let channel = DatagramChannel::bind(local).await?;
                let port = channel.socket_addr()?.port();
                (channel, i32::from(port))
            }
            (DatagramMode::Multicast, Some(SocketAddr::V4(group))) => {
                debug!(%group, "joining multicast group");
                (DatagramChannel::join(*group.ip(), group.port())?, 0)
            }
            (DatagramMode::Multicast, _) => {
                return Err(CoreError::violation(
                    codes::WIRE_MALFORMED,
                    "multicast header did not carry an IPv4 group",
                ));
            }
        };
        stream.send(&[&announce.to_le_bytes()]).await?;
        Ok(Box::new(channel.with_control(stream)))
    }

    async fn write(&mut self, stream: &mut (dyn TwoWayStream + '_), frame: &Frame) -> Result<()> {
        let mut blocks = Vec::with_capacity(frame.blocks.len() + 1);
        blocks.push(frame.command.to_binary());
        blocks.extend(frame.blocks.iter().cloned());
        write_indexed(stream, &blocks, self.max_message_bytes).await
    }

    async fn read(&mut self, stream: &mut (dyn TwoWayStream + '_)) -> Result<Frame> {
        stream.begin_packet();
        let mut blocks = read_indexed(stream, self.max_message_bytes).await?;
        if blocks.is_empty() {
            return Err(CoreError::protocol_violation("datagram carries no command block"));
        }
        let command = PortCommand::from_binary(&blocks.remove(0))?;
        Ok(Frame::new(command, blocks))
    }

    async fn respond(
        &mut self,
        _stream: &mut (dyn TwoWayStream + '_),
        _reply: Option<&[Bytes]>,
    ) -> Result<()> {
        Ok(())
    }

    async fn expect_response(
        &mut self,
        _stream: &mut (dyn TwoWayStream + '_),
        _wants_reply: bool,
    ) -> Result<Option<Vec<Bytes>>> {
        Ok(None)
    }
}
