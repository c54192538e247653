//! # config 模块说明
//!
//! ## 意图（Why）
//! - 把超时、缓存、队列容量等运行参数集中到一个可序列化结构，测试可以构造多个互不干扰的实例；
//! - 支持从 TOML 文件加载，缺省字段回退到默认值。
//!
//! ## 契约（What）
//! - 时长字段在 TOML 中以毫秒整数表示（`connect_timeout_ms = 5000`）；
//! - `inbound_capacity = 0` 表示无界入站队列；
//! - [`NetworkConfig::validate`] 在加载后执行，拒绝 0 超时等无意义组合。

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{CoreError, codes};

/// 配置加载失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        CoreError::new(codes::CONFIG_INVALID, err.to_string()).with_cause(err)
    }
}

/// 最后手段发现机制的参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub group: Ipv4Addr,
    pub port: u16,
}

impl DiscoveryConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.group), self.port)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group: Ipv4Addr::new(224, 2, 1, 1),
            port: 10002,
        }
    }
}

/// 网络上下文的运行参数。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_ms: u64,
    pub query_timeout_ms: u64,
    /// 等待回复的上限；缺省为不限。
    pub reply_timeout_ms: Option<u64>,
    pub cache_ttl_ms: u64,
    pub inbound_capacity: usize,
    pub default_carrier: String,
    pub max_message_bytes: usize,
    pub bind_host: String,
    pub mcast_group: Ipv4Addr,
    pub discovery: DiscoveryConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            query_timeout_ms: 2_000,
            reply_timeout_ms: None,
            cache_ttl_ms: 30_000,
            inbound_capacity: 0,
            default_carrier: "tcp".to_owned(),
            max_message_bytes: 16 * 1024 * 1024,
            bind_host: "127.0.0.1".to_owned(),
            mcast_group: Ipv4Addr::new(224, 2, 1, 2),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 读取 TOML 文件并校验。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 || self.query_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".to_owned()));
        }
        if self.default_carrier.is_empty() {
            return Err(ConfigError::Invalid("default_carrier must not be empty".to_owned()));
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::Invalid("max_message_bytes must be positive".to_owned()));
        }
        // 回环地址退化为单播，供没有组播路由的环境使用
        let usable = |group: Ipv4Addr| group.is_multicast() || group.is_loopback();
        if !usable(self.mcast_group) || !usable(self.discovery.group) {
            return Err(ConfigError::Invalid(
                "multicast groups must be in 224.0.0.0/4 or loopback".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// 链式设置默认载体。
    pub fn with_default_carrier(mut self, carrier: impl Into<String>) -> Self {
        self.default_carrier = carrier.into();
        self
    }

    /// 链式设置入站队列容量。
    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }

    /// 链式设置名字查询超时。
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 链式设置缓存有效期。
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_ms = ttl.as_millis() as u64;
        self
    }
}
