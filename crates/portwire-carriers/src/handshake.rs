//! 连接两端的握手流程。
//!
//! # 教案式注释
//!
//! ## 逻辑 (How)
//! - 服务端：读取 8 字节前导 → 注册表嗅探工厂 → 创建载体实例 → 读取发送方 → 回应头部；
//! - 客户端：写出头部 → 等待回应；
//! - 两端的回应步骤都可能替换底层通道，调用方必须使用返回的通道。
//!
//! ## 注意事项 (Trade-offs)
//! - 握手本身不设超时，由调用方用 `run_with_context` 包裹。

use std::fmt;

use portwire_core::error::Result;
use portwire_transport::BoxStream;
use tracing::debug;

use crate::carrier::{Carrier, CarrierFactory, CarrierOptions};
use crate::framing::HEADER_LEN;
use crate::registry::CarrierRegistry;

/// 握手完成后的连接端点。
pub struct Established {
    pub stream: BoxStream,
    pub carrier: Box<dyn Carrier>,
    /// 对端宣告的发送方名字；客户端一侧为自身名字。
    pub sender: String,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("carrier", &self.carrier.name())
            .field("sender", &self.sender)
            .finish()
    }
}

/// 服务端握手。
pub async fn accept(
    registry: &CarrierRegistry,
    options: &CarrierOptions,
    mut stream: BoxStream,
) -> Result<Established> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let factory = registry.sniff(&header)?;
    let mut carrier = factory.create(options);
    let sender = carrier.expect_sender(stream.as_mut(), &header).await?;
    let stream = carrier.respond_to_header(stream).await?;
    debug!(carrier = carrier.name(), %sender, "inbound handshake complete");
    Ok(Established {
        stream,
        carrier,
        sender,
    })
}

/// 客户端握手。
pub async fn connect(
    factory: &dyn CarrierFactory,
    options: &CarrierOptions,
    mut stream: BoxStream,
    sender: &str,
) -> Result<Established> {
    let mut carrier = factory.create(options);
    carrier.send_header(stream.as_mut(), sender).await?;
    let stream = carrier.expect_reply_to_header(stream).await?;
    debug!(carrier = carrier.name(), %sender, "outbound handshake complete");
    Ok(Established {
        stream,
        carrier,
        sender: sender.to_owned(),
    })
}
