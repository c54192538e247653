//! # portwire-port
//!
//! ## 定位（Why）
//! - 面向用户的一层：[`Network`] 持有共享上下文，[`Port`] 是收发消息的端点；
//!   名字解析、载体选择与握手都隐藏在 `add_output` / `write` / `read` 之后。
//!
//! ## 模块地图（What）
//! - [`network`]：上下文、装配器与跨端口的 `connect` / `disconnect`；
//! - [`port`]：端口的读写、回复纪律、回调模式与事件；
//! - [`connection`]：输出连接与重连；
//! - `input`：接受循环与输入连接的读任务；
//! - [`protocol`]：连接状态机；
//! - [`delivery`]：入站队列元素与回复句柄；
//! - `admin`：管理命令的解析、执行与远程调用。
//!
//! ## 使用示例
//! ```no_run
//! use portwire_core::Bottle;
//! use portwire_port::Network;
//!
//! # async fn demo() -> portwire_core::Result<()> {
//! let network = Network::local()?;
//! let receiver = network.open_port("/receiver").await?;
//! let sender = network.open_port("/sender").await?;
//! network.connect("/sender", "/receiver", None).await?;
//! sender.write(&Bottle::new().with("testing").with(1)).await?;
//! let received = receiver.read().await?;
//! assert_eq!(received.map(|bottle| bottle.len()), Some(2));
//! network.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod admin;
pub mod connection;
pub mod delivery;
mod input;
pub mod network;
pub mod port;
pub mod protocol;

pub use connection::OutputConnection;
pub use delivery::{Delivery, Replier};
pub use network::{Network, NetworkBuilder};
pub use port::{Port, PortReader, WriteSummary};
pub use protocol::{Phase, ProtocolState};
