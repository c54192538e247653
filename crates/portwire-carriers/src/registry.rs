//! # registry 模块说明
//!
//! ## 意图（Why）
//! - 进程内所有连接共享同一份载体表：客户端按名字查找工厂，服务端按 8 字节前导嗅探工厂。
//!
//! ## 逻辑（How）
//! - 载体表保存在 `ArcSwap<Vec<..>>` 中，读路径（每次握手一次）无锁取快照；
//! - 写路径（注册新载体）先取 `parking_lot::Mutex` 串行化，再复制、追加并原子替换，
//!   正在握手的连接继续使用旧快照。
//!
//! ## 契约（What）
//! - 名字唯一，重复注册返回 `CARRIER_DUPLICATE`；
//! - `sniff` 按注册顺序询问 `check_header`，第一个认领者胜出；无人认领时返回握手失败。
//!
//! ## 注意事项（Trade-offs）
//! - 载体只增不减：运行期移除载体会让已建立连接的能力描述失效，目前没有这一需求。

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use portwire_core::error::{CoreError, Result, codes};
use tracing::debug;

use crate::binary;
use crate::carrier::CarrierFactory;
use crate::datagram::DatagramCarrierFactory;
use crate::framing::HEADER_LEN;
use crate::text::TextCarrierFactory;

type FactoryList = Vec<Arc<dyn CarrierFactory>>;

/// 载体注册表。
#[derive(Debug)]
pub struct CarrierRegistry {
    factories: ArcSwap<FactoryList>,
    writer: Mutex<()>,
}

impl Default for CarrierRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl CarrierRegistry {
    /// 空注册表。
    pub fn empty() -> Self {
        Self {
            factories: ArcSwap::from_pointee(Vec::new()),
            writer: Mutex::new(()),
        }
    }

    /// 预置全部内建载体：`tcp`、`fast_tcp`、`text`、`text_ack`、`udp`、`mcast`、`local`。
    pub fn with_defaults() -> Self {
        let builtins: FactoryList = vec![
            Arc::new(binary::tcp()),
            Arc::new(binary::fast_tcp()),
            Arc::new(TextCarrierFactory::plain()),
            Arc::new(TextCarrierFactory::acknowledged()),
            Arc::new(DatagramCarrierFactory::udp()),
            Arc::new(DatagramCarrierFactory::mcast()),
            Arc::new(binary::local()),
        ];
        Self {
            factories: ArcSwap::from_pointee(builtins),
            writer: Mutex::new(()),
        }
    }

    /// 注册载体。
    ///
    /// # 契约（What）
    /// - 同名载体已存在时返回 `CARRIER_DUPLICATE`，注册表保持不变；
    /// - 成功后对之后的 `lookup`/`sniff` 立即可见。
    pub fn add(&self, factory: Arc<dyn CarrierFactory>) -> Result<()> {
        let _guard = self.writer.lock();
        let current = self.factories.load_full();
        if current.iter().any(|existing| existing.name() == factory.name()) {
            return Err(CoreError::new(
                codes::CARRIER_DUPLICATE,
                format!("carrier `{}` is already registered", factory.name()),
            ));
        }
        let mut next = FactoryList::clone(&current);
        debug!(carrier = factory.name(), "carrier registered");
        next.push(factory);
        self.factories.store(Arc::new(next));
        Ok(())
    }

    /// 按名字查找。
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn CarrierFactory>> {
        self.factories
            .load()
            .iter()
            .find(|factory| factory.name() == name)
            .cloned()
            .ok_or_else(|| {
                CoreError::new(codes::CARRIER_UNKNOWN, format!("no carrier named `{name}`"))
            })
    }

    /// 按前导嗅探。
    pub fn sniff(&self, header: &[u8; HEADER_LEN]) -> Result<Arc<dyn CarrierFactory>> {
        self.factories
            .load()
            .iter()
            .find(|factory| factory.check_header(header))
            .cloned()
            .ok_or_else(|| {
                CoreError::handshake_failed(format!(
                    "no carrier recognises header {}",
                    hex::encode(header)
                ))
            })
    }

    /// 已注册载体名，按注册顺序。
    pub fn names(&self) -> Vec<String> {
        self.factories
            .load()
            .iter()
            .map(|factory| factory.name().to_owned())
            .collect()
    }
}
