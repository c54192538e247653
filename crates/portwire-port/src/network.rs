//! # 网络上下文
//!
//! ## 意图（Why）
//! - 一个 [`Network`] 聚合同一进程内所有端口共享的资源：配置、名字解析器、载体注册表、
//!   进程内通道中枢，以及（可选的）发现应答服务；
//! - 上下文是显式值而不是全局单例：测试可以在同一进程里构造多个互不干扰的网络。
//!
//! ## 逻辑（How）
//! - [`NetworkBuilder`] 负责校验配置并装配默认组件；
//! - 端口以弱引用登记在 `ports` 表中，供 `connect` / `disconnect` 判断某个名字是否属于本进程；
//! - [`Network::shutdown`] 关闭仍存活的端口并停止后台任务。
//!
//! ## 契约（What）
//! - `connect(from, to)` 对本地端口直接增加输出连接；对远端端口经管理命令请求对方增加；
//! - 克隆 [`Network`] 共享同一上下文。

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use portwire_carriers::{CarrierOptions, CarrierRegistry};
use portwire_core::error::{CoreError, Result, codes};
use portwire_core::{
    Contact, Discovery, InMemoryNameStore, NameStore, NetworkConfig, Resolver, Route,
};
use portwire_transport::{CancellationSignal, DiscoveryResponder, LocalHub, MulticastDiscovery};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::admin::{self, AdminRequest};
use crate::port::{Port, PortInner};

/// 所有端口共享的状态。
pub(crate) struct NetworkShared {
    pub(crate) config: NetworkConfig,
    pub(crate) options: CarrierOptions,
    pub(crate) registry: Arc<CarrierRegistry>,
    pub(crate) resolver: Arc<Resolver>,
    pub(crate) hub: Arc<LocalHub>,
    pub(crate) ports: DashMap<String, Weak<PortInner>>,
    pub(crate) shutdown: CancellationSignal,
    responder: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkShared {
    /// 名字对应的本地存活端口。
    pub(crate) fn local_port(&self, name: &str) -> Option<Port> {
        let inner = self.ports.get(name)?.upgrade()?;
        (!inner.is_closed()).then(|| Port::from_inner(inner))
    }
}

/// 网络上下文句柄。
#[derive(Clone)]
pub struct Network {
    shared: Arc<NetworkShared>,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("ports", &self.shared.ports.len())
            .field("carriers", &self.shared.registry.names())
            .finish()
    }
}

impl Network {
    pub fn builder() -> NetworkBuilder {
        NetworkBuilder::default()
    }

    /// 以缺省配置与进程内名字存储构造。
    pub fn local() -> Result<Self> {
        Self::builder().build()
    }

    pub(crate) fn shared(&self) -> &Arc<NetworkShared> {
        &self.shared
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<CarrierRegistry> {
        &self.shared.registry
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.shared.resolver
    }

    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.shared.hub
    }

    /// 解析名字或字面地址。
    pub async fn resolve(&self, name: &str) -> Result<Contact> {
        self.shared.resolver.resolve(name).await
    }

    /// 打开端口；`name` 为空时为匿名端口。
    pub async fn open_port(&self, name: &str) -> Result<Port> {
        Port::open(self, name).await
    }

    /// 建立 `from → to` 的连接。
    ///
    /// # 逻辑（How）
    /// - `from` 是本进程的端口：直接调用 [`Port::add_output`]；
    /// - 否则解析 `from`，向其发送 `add` 管理命令，由对方发起连接。
    pub async fn connect(&self, from: &str, to: &str, carrier: Option<&str>) -> Result<Route> {
        if let Some(port) = self.shared.local_port(from) {
            return port.add_output(to, carrier).await;
        }
        let contact = self.shared.resolver.resolve(from).await?;
        debug!(from, to, "asking remote port to connect");
        admin::remote(
            &self.shared,
            &contact,
            &AdminRequest::Add {
                to: to.to_owned(),
                carrier: carrier.map(str::to_owned),
            },
        )
        .await?;
        Ok(Route::new(from, to, carrier.unwrap_or_default()))
    }

    /// 拆除 `from → to` 的连接；不存在时返回 `NO_CONNECTION`。
    pub async fn disconnect(&self, from: &str, to: &str) -> Result<()> {
        if let Some(port) = self.shared.local_port(from) {
            return if port.remove_output(to).await {
                Ok(())
            } else {
                Err(no_connection(from, to))
            };
        }
        let contact = self.shared.resolver.resolve(from).await?;
        admin::remote(&self.shared, &contact, &AdminRequest::Del(to.to_owned())).await?;
        Ok(())
    }

    /// 关闭所有存活端口并停止后台服务。
    pub async fn shutdown(&self) {
        let ports: Vec<Port> = self
            .shared
            .ports
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .map(Port::from_inner)
            .collect();
        for port in ports {
            port.close().await;
        }
        self.shared.shutdown.cancel();
        let responder = self.shared.responder.lock().take();
        if let Some(handle) = responder
            && let Err(err) = handle.await
        {
            warn!(error = %err, "discovery responder ended abnormally");
        }
        info!("network shut down");
    }
}

pub(crate) fn no_connection(from: &str, to: &str) -> CoreError {
    CoreError::new(
        codes::NO_CONNECTION,
        format!("no connection from {from} to {to}"),
    )
}

/// [`Network`] 的装配器。
#[derive(Default)]
pub struct NetworkBuilder {
    config: Option<NetworkConfig>,
    store: Option<Arc<dyn NameStore>>,
    registry: Option<Arc<CarrierRegistry>>,
    discovery: Option<Arc<dyn Discovery>>,
    hub: Option<Arc<LocalHub>>,
}

impl NetworkBuilder {
    pub fn config(mut self, config: NetworkConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// 共享名字存储；缺省为新的 [`InMemoryNameStore`]。
    pub fn name_store(mut self, store: Arc<dyn NameStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(mut self, registry: Arc<CarrierRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 显式指定发现机制，优先于配置中的组播发现。
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// 共享进程内通道中枢，使多个网络上下文可以经 `local` 载体互通。
    pub fn local_hub(mut self, hub: Arc<LocalHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// 校验并装配。
    ///
    /// # 契约（What）
    /// - 配置非法时返回 `CONFIG_INVALID`；
    /// - 启用发现时需在 Tokio 运行时内调用，应答服务随之启动。
    pub fn build(self) -> Result<Network> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryNameStore::new()));
        let discovery = self.discovery.or_else(|| {
            config.discovery.enabled.then(|| {
                Arc::new(MulticastDiscovery::new(
                    config.discovery.clone(),
                    config.query_timeout(),
                )) as Arc<dyn Discovery>
            })
        });
        let mut resolver = Resolver::new(store.clone(), config.query_timeout(), config.cache_ttl());
        if let Some(discovery) = discovery {
            resolver = resolver.with_discovery(discovery);
        }

        let shutdown = CancellationSignal::new();
        let responder = if config.discovery.enabled {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(CoreError::config(
                    "discovery requires a running tokio runtime",
                ));
            }
            let responder = DiscoveryResponder::bind(&config.discovery, store)?;
            info!(group = %config.discovery.socket_addr(), "discovery responder started");
            Some(responder.spawn(shutdown.clone()))
        } else {
            None
        };

        Ok(Network {
            shared: Arc::new(NetworkShared {
                options: CarrierOptions::from_config(&config),
                config,
                registry: self
                    .registry
                    .unwrap_or_else(|| Arc::new(CarrierRegistry::with_defaults())),
                resolver: Arc::new(resolver),
                hub: self.hub.unwrap_or_default(),
                ports: DashMap::new(),
                shutdown,
                responder: Mutex::new(responder),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portwire_core::ErrorKind;

    #[test]
    fn invalid_config_is_rejected() {
        let config = NetworkConfig {
            connect_timeout_ms: 0,
            ..NetworkConfig::default()
        };
        let err = Network::builder().config(config).build().expect_err("超时为 0");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn discovery_outside_runtime_is_a_config_error() {
        let mut config = NetworkConfig::default();
        config.discovery.enabled = true;
        let err = Network::builder().config(config).build().expect_err("没有运行时");
        assert_eq!(err.code(), codes::CONFIG_INVALID);
    }

    #[tokio::test]
    async fn ghost_cannot_be_connected() {
        let network = Network::local().expect("构造网络");
        let err = network
            .connect("/ghost", "/elsewhere", None)
            .await
            .expect_err("未登记的名字");
        assert_eq!(err.kind(), ErrorKind::NameNotFound);
    }
}
