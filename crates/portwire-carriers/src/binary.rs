//! 流式二进制载体：`tcp`、`fast_tcp` 与进程内的 `local`。
//!
//! 三者共用索引帧格式，差别只在前导说明符、是否发送确认，以及通道是套接字还是内存管道。

use async_trait::async_trait;
use bytes::Bytes;
use portwire_core::error::{CoreError, Result};
use portwire_core::PortCommand;
use portwire_transport::{BoxStream, TwoWayStream, read_i32_le};
use tracing::trace;

use crate::carrier::{Capabilities, Carrier, CarrierFactory, CarrierOptions, Frame};
use crate::framing::{
    HEADER_LEN, ack_frame, encode_sender, parse_yarp_preamble, read_ack, read_indexed,
    read_sender, specifier, write_indexed, yarp_preamble,
};

/// 流式二进制载体的静态描述。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BinaryFlavor {
    name: &'static str,
    specifier: i32,
    requires_ack: bool,
    local: bool,
}

impl BinaryFlavor {
    /// 标准 TCP：每条消息确认。
    pub const TCP: Self = Self {
        name: "tcp",
        specifier: specifier::TCP,
        requires_ack: true,
        local: false,
    };

    /// 省略确认的 TCP。
    pub const FAST_TCP: Self = Self {
        name: "fast_tcp",
        specifier: specifier::TCP | specifier::NO_ACK,
        requires_ack: false,
        local: false,
    };

    /// 进程内管道。
    pub const LOCAL: Self = Self {
        name: "local",
        specifier: specifier::LOCAL,
        requires_ack: false,
        local: true,
    };

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_reply: true,
            connectionless: false,
            text_mode: false,
            requires_ack: self.requires_ack,
            local: self.local,
        }
    }
}

/// 流式二进制载体工厂。
#[derive(Debug)]
pub struct BinaryCarrierFactory {
    flavor: BinaryFlavor,
}

impl BinaryCarrierFactory {
    pub fn new(flavor: BinaryFlavor) -> Self {
        Self { flavor }
    }
}

impl CarrierFactory for BinaryCarrierFactory {
    fn name(&self) -> &str {
        self.flavor.name
    }

    fn capabilities(&self) -> Capabilities {
        self.flavor.capabilities()
    }

    fn check_header(&self, header: &[u8; HEADER_LEN]) -> bool {
        parse_yarp_preamble(header) == Some(self.flavor.specifier)
    }

    fn create(&self, options: &CarrierOptions) -> Box<dyn Carrier> {
        Box::new(BinaryCarrier {
            flavor: self.flavor,
            max_message_bytes: options.max_message_bytes,
        })
    }
}

/// 流式二进制载体实例。
#[derive(Debug)]
pub struct BinaryCarrier {
    flavor: BinaryFlavor,
    max_message_bytes: usize,
}

#[async_trait]
impl Carrier for BinaryCarrier {
    fn name(&self) -> &str {
        self.flavor.name
    }

    fn capabilities(&self) -> Capabilities {
        self.flavor.capabilities()
    }

    async fn send_header(&mut self, stream: &mut (dyn TwoWayStream + '_), sender: &str) -> Result<()> {
        let preamble = yarp_preamble(self.flavor.specifier);
        let sender = encode_sender(sender);
        stream.send(&[&preamble, &sender]).await
    }

    async fn expect_reply_to_header(&mut self, mut stream: BoxStream) -> Result<BoxStream> {
        // 服务端以一个 YARP 整数回应头部，流式载体不使用其值
        let value = read_i32_le(stream.as_mut()).await?;
        trace!(carrier = self.flavor.name, value, "header acknowledged");
        Ok(stream)
    }

    async fn expect_sender(
        &mut self,
        stream: &mut (dyn TwoWayStream + '_),
        _header: &[u8; HEADER_LEN],
    ) -> Result<String> {
        read_sender(stream).await
    }

    async fn respond_to_header(&mut self, mut stream: BoxStream) -> Result<BoxStream> {
        stream.send(&[&0i32.to_le_bytes()]).await?;
        Ok(stream)
    }

    async fn write(&mut self, stream: &mut (dyn TwoWayStream + '_), frame: &Frame) -> Result<()> {
        let mut blocks = Vec::with_capacity(frame.blocks.len() + 1);
        blocks.push(frame.command.to_binary());
        blocks.extend(frame.blocks.iter().cloned());
        trace!(carrier = self.flavor.name, blocks = blocks.len(), "writing frame");
        write_indexed(stream, &blocks, self.max_message_bytes).await
    }

    async fn read(&mut self, stream: &mut (dyn TwoWayStream + '_)) -> Result<Frame> {
        let mut blocks = read_indexed(stream, self.max_message_bytes).await?;
        if blocks.is_empty() {
            return Err(CoreError::protocol_violation("message carries no command block"));
        }
        let command = PortCommand::from_binary(&blocks.remove(0))?;
        Ok(Frame::new(command, blocks))
    }

    async fn respond(
        &mut self,
        stream: &mut (dyn TwoWayStream + '_),
        reply: Option<&[Bytes]>,
    ) -> Result<()> {
        if let Some(reply) = reply {
            write_indexed(stream, reply, self.max_message_bytes).await?;
        }
        if self.flavor.requires_ack {
            stream.send(&[&ack_frame()]).await?;
        }
        Ok(())
    }

    async fn expect_response(
        &mut self,
        stream: &mut (dyn TwoWayStream + '_),
        wants_reply: bool,
    ) -> Result<Option<Vec<Bytes>>> {
        let reply = if wants_reply {
            Some(read_indexed(stream, self.max_message_bytes).await?)
        } else {
            None
        };
        if self.flavor.requires_ack {
            read_ack(stream).await?;
        }
        Ok(reply)
    }
}

/// `tcp` 工厂。
pub fn tcp() -> BinaryCarrierFactory {
    BinaryCarrierFactory::new(BinaryFlavor::TCP)
}

/// `fast_tcp` 工厂。
pub fn fast_tcp() -> BinaryCarrierFactory {
    BinaryCarrierFactory::new(BinaryFlavor::FAST_TCP)
}

/// `local` 工厂。
pub fn local() -> BinaryCarrierFactory {
    BinaryCarrierFactory::new(BinaryFlavor::LOCAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flavours_recognise_only_their_own_preamble() {
        let tcp = tcp();
        let fast = fast_tcp();
        let tcp_header = yarp_preamble(specifier::TCP);
        let fast_header = yarp_preamble(specifier::TCP | specifier::NO_ACK);
        assert!(tcp.check_header(&tcp_header));
        assert!(!tcp.check_header(&fast_header));
        assert!(fast.check_header(&fast_header));
        assert!(!local().check_header(&tcp_header));
    }

    #[test]
    fn capabilities_follow_flavour() {
        assert!(tcp().capabilities().requires_ack);
        assert!(!fast_tcp().capabilities().requires_ack);
        assert!(local().capabilities().local);
        assert!(tcp().capabilities().supports_reply);
    }
}
