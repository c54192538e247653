//! # portwire-carriers
//!
//! ## 定位（Why）
//! - 载体 = 字节通道 + 线缆格式 + 握手规则。本 crate 实现全部内建载体与进程级注册表，
//!   端口层只通过 [`Carrier`] 与 [`CarrierRegistry`] 使用它们。
//!
//! ## 模块地图（What）
//! - [`framing`]：前导、发送方说明、索引头与确认包；
//! - [`carrier`]：`CarrierFactory`/`Carrier` 契约与 `Frame`；
//! - [`binary`]：`tcp`、`fast_tcp`、`local`；
//! - [`text`]：`text`、`text_ack`；
//! - [`datagram`]：`udp`、`mcast`；
//! - [`registry`]：按名查找与按前导嗅探；
//! - [`handshake`]：两端握手流程。

pub mod binary;
pub mod carrier;
pub mod datagram;
pub mod framing;
pub mod handshake;
pub mod registry;
pub mod text;

pub use carrier::{Capabilities, Carrier, CarrierFactory, CarrierOptions, Frame};
pub use datagram::DatagramCarrierFactory;
pub use handshake::Established;
pub use registry::CarrierRegistry;
pub use text::TextCarrierFactory;
