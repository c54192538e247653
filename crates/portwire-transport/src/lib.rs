//! # portwire-transport
//!
//! ## 定位（Why）
//! - 为载体提供三类字节通道：TCP 流、UDP/组播数据报与进程内管道，统一收敛到 [`TwoWayStream`]；
//! - 承载组播名字发现，作为名字存储不可达时的最后手段。
//!
//! ## 约定（What）
//! - 所有 IO 错误经 [`error::map_io_error`] 映射为带稳定码值与处置分类的 `CoreError`；
//! - 长时间阻塞的操作（accept、connect）均可通过 [`CancellationSignal`] 或超时打断。

pub mod datagram;
pub mod discovery;
pub mod error;
pub mod local;
pub mod stream;
pub mod tcp;
pub mod util;

pub use datagram::{DatagramChannel, MAX_DATAGRAM, pick_free_port};
pub use discovery::{DiscoveryMessage, DiscoveryResponder, MulticastDiscovery};
pub use local::{LocalChannel, LocalHub, LocalListener};
pub use stream::{BoxStream, TwoWayStream, read_i32_le, read_line};
pub use tcp::{TcpChannel, TcpListener, TcpSocketConfig};
pub use util::{CancellationSignal, run_with_context};
