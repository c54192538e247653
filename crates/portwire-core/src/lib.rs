//! # portwire-core
//!
//! ## 定位（Why）
//! - 端口中间件的基础层：错误域、地址模型、线缆编解码契约、负载类型与名字解析；
//! - 不依赖具体传输，`portwire-transport`、`portwire-carriers` 与 `portwire-port` 都建立在其上。
//!
//! ## 模块地图（What）
//! - [`error`]：`CoreError`、`ErrorKind` 与稳定错误码；
//! - [`contact`]：`Contact` 与 `Route`；
//! - [`wire`]：`ConnectionWriter`/`ConnectionReader` 与 `Portable` 契约；
//! - [`value`]：`Bottle` 负载的二进制与文本语法；
//! - [`command`]：每条消息首块的端口命令；
//! - [`envelope`]：可选的消息信封；
//! - [`name`] 与 [`resolver`]：名字存储抽象、解析缓存与最后手段发现；
//! - [`config`]：运行参数；
//! - [`event`]：连接生命周期事件。

pub mod command;
pub mod config;
pub mod contact;
pub mod envelope;
pub mod error;
pub mod event;
pub mod name;
pub mod resolver;
pub mod value;
pub mod wire;

pub use command::{CommandKey, PortCommand};
pub use config::{ConfigError, DiscoveryConfig, NetworkConfig};
pub use contact::{Contact, Route};
pub use envelope::Envelope;
pub use error::{CoreError, ErrorCategory, ErrorKind, Result, RetryAdvice};
pub use event::{PortInfo, PortInfoKind};
pub use name::{InMemoryNameStore, NameStore};
pub use resolver::{ContactCache, Discovery, Resolver};
pub use value::{Bottle, MAX_NESTING, Value};
pub use wire::{ConnectionReader, ConnectionWriter, Portable};
