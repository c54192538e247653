//! # carrier 模块说明
//!
//! ## 意图（Why）
//! - 载体是“传输 + 线缆格式”的策略对象。连接层只通过 [`Carrier`] 驱动握手与收发，
//!   新载体实现这两个 trait 并注册即可接入，无需修改端口或连接代码。
//!
//! ## 逻辑（How）
//! - [`CarrierFactory`] 是进程级的无状态描述：名字、能力、前导识别谓词；
//! - [`Carrier`] 是每条连接一个的有状态实例，由工厂创建；
//! - 握手分客户端（`send_header` → `expect_reply_to_header`）与服务端
//!   （`expect_sender` → `respond_to_header`）两半，后者可替换底层通道（数据报载体在握手后改走 UDP）。
//!
//! ## 契约（What）
//! - 每条消息是一个 [`Frame`]：端口命令加负载块；
//! - 回复先于确认发送：`respond` 写出回复（若有）再写确认，`expect_response` 按同一顺序读取。

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;
use portwire_core::error::{CoreError, Result, codes};
use portwire_core::{NetworkConfig, PortCommand};
use portwire_transport::{BoxStream, TwoWayStream};

use crate::framing::HEADER_LEN;

/// 载体能力。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// 支持请求/回复。
    pub supports_reply: bool,
    /// 握手后走数据报，不保证送达。
    pub connectionless: bool,
    /// 负载使用文本语法。
    pub text_mode: bool,
    /// 每条消息后接收方发送确认。
    pub requires_ack: bool,
    /// 进程内管道，不建立套接字。
    pub local: bool,
}

/// 创建载体实例时的运行参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CarrierOptions {
    pub max_message_bytes: usize,
    pub mcast_group: Ipv4Addr,
}

impl Default for CarrierOptions {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

impl CarrierOptions {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            max_message_bytes: config.max_message_bytes,
            mcast_group: config.mcast_group,
        }
    }
}

/// 线上传输的一条消息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: PortCommand,
    pub blocks: Vec<Bytes>,
}

impl Frame {
    pub fn new(command: PortCommand, blocks: Vec<Bytes>) -> Self {
        Self { command, blocks }
    }

    /// 只有命令、没有负载的消息。
    pub fn command_only(command: PortCommand) -> Self {
        Self::new(command, Vec::new())
    }

    /// 负载总字节数。
    pub fn payload_len(&self) -> usize {
        self.blocks.iter().map(Bytes::len).sum()
    }

    /// 写出前的体积检查，口径与接收方一致：命令块加全部负载块。
    pub fn ensure_within(&self, max_bytes: usize) -> Result<()> {
        let total = self.command.to_binary().len() + self.payload_len();
        if total > max_bytes {
            return Err(CoreError::violation(
                codes::WIRE_TOO_LARGE,
                format!("message of {total} bytes exceeds the limit of {max_bytes}"),
            ));
        }
        Ok(())
    }
}

/// 载体工厂：进程级注册的无状态描述。
pub trait CarrierFactory: Send + Sync + fmt::Debug + 'static {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// 8 字节前导是否属于本载体。
    fn check_header(&self, header: &[u8; HEADER_LEN]) -> bool;

    /// 为一条连接创建载体实例。
    fn create(&self, options: &CarrierOptions) -> Box<dyn Carrier>;
}

/// 每条连接一个的载体实例。
#[async_trait]
pub trait Carrier: Send + fmt::Debug {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// 客户端：写出前导、发送方说明与附加头。
    async fn send_header(&mut self, stream: &mut (dyn TwoWayStream + '_), sender: &str) -> Result<()>;

    /// 客户端：等待服务端对头部的回应，返回此后使用的通道。
    async fn expect_reply_to_header(&mut self, stream: BoxStream) -> Result<BoxStream>;

    /// 服务端：前导已被读取并识别，继续读取发送方说明与附加头，返回发送方名字。
    async fn expect_sender(
        &mut self,
        stream: &mut (dyn TwoWayStream + '_),
        header: &[u8; HEADER_LEN],
    ) -> Result<String>;

    /// 服务端：回应头部，返回此后使用的通道。
    async fn respond_to_header(&mut self, stream: BoxStream) -> Result<BoxStream>;

    /// 写出一条消息。
    async fn write(&mut self, stream: &mut (dyn TwoWayStream + '_), frame: &Frame) -> Result<()>;

    /// 读取一条消息。
    async fn read(&mut self, stream: &mut (dyn TwoWayStream + '_)) -> Result<Frame>;

    /// 服务端：写出回复（若有）与确认（若载体需要）。
    async fn respond(
        &mut self,
        stream: &mut (dyn TwoWayStream + '_),
        reply: Option<&[Bytes]>,
    ) -> Result<()>;

    /// 客户端：读取回复（`wants_reply` 时）与确认。
    async fn expect_response(
        &mut self,
        stream: &mut (dyn TwoWayStream + '_),
        wants_reply: bool,
    ) -> Result<Option<Vec<Bytes>>>;
}
