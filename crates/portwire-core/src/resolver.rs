//! # resolver 模块说明
//!
//! ## 意图（Why）
//! - 把“名字 → 地址”的解析集中到一处：名字存储查询、超时、缓存与最后手段发现都在这里完成；
//! - 端口与连接只面对 [`Resolver::resolve`]，不直接接触存储。
//!
//! ## 逻辑（How）
//! 1. 字面地址（`host:port`、`carrier://host:port`）直接解析返回；
//! 2. 命中未过期缓存则返回缓存；
//! 3. 在 `query_timeout` 内查询名字存储：命中写入缓存；未登记返回 `NameNotFound`；
//! 4. 存储不可达或超时，且配置了 [`Discovery`] 时，改走组播发现；发现也落空则返回存储错误。
//!
//! ## 契约（What）
//! - `NameNotFound` 与 `StoreUnavailable`/`Timeout` 严格区分；
//! - `register`、`unregister` 与 `invalidate` 都会清除对应缓存项。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::contact::{Contact, validate_name};
use crate::error::{CoreError, ErrorKind, Result, codes};
use crate::name::NameStore;

/// 名字存储之外的最后手段发现机制。
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// 尝试发现名字；`Ok(None)` 表示无人应答。
    async fn discover(&self, name: &str) -> Result<Option<Contact>>;
}

#[derive(Clone, Debug)]
struct CacheEntry {
    contact: Contact,
    expires_at: Instant,
}

/// 带有效期的解析缓存。
#[derive(Debug)]
pub struct ContactCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContactCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// 读取未过期的缓存项，过期项顺带移除。
    pub fn get(&self, name: &str) -> Option<Contact> {
        let fresh = self
            .entries
            .get(name)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.contact.clone());
        match fresh {
            Some(contact) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(contact)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.entries.remove(name);
                None
            }
        }
    }

    pub fn put(&self, contact: Contact) {
        if self.ttl.is_zero() || contact.is_anonymous() {
            return;
        }
        let expires_at = Instant::now() + self.ttl;
        self.entries.insert(
            contact.name().to_owned(),
            CacheEntry {
                contact,
                expires_at,
            },
        );
    }

    pub fn invalidate(&self, name: &str) {
        self.entries.remove(name);
    }

    /// 清除所有过期项。
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    /// `(hits, misses)`。
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

/// 名字解析器。
pub struct Resolver {
    store: Arc<dyn NameStore>,
    cache: ContactCache,
    query_timeout: Duration,
    discovery: Option<Arc<dyn Discovery>>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("query_timeout", &self.query_timeout)
            .field("discovery", &self.discovery.is_some())
            .finish()
    }
}

impl Resolver {
    pub fn new(store: Arc<dyn NameStore>, query_timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: ContactCache::new(cache_ttl),
            query_timeout,
            discovery: None,
        }
    }

    /// 挂接最后手段发现机制。
    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn store(&self) -> &Arc<dyn NameStore> {
        &self.store
    }

    pub fn cache(&self) -> &ContactCache {
        &self.cache
    }

    /// 解析名字或字面地址。
    pub async fn resolve(&self, name: &str) -> Result<Contact> {
        if !name.is_empty() && !name.starts_with('/') {
            return Contact::parse(name);
        }
        validate_name(name)?;
        if name.is_empty() {
            return Err(CoreError::name_not_found(name));
        }
        if let Some(contact) = self.cache.get(name) {
            return Ok(contact);
        }

        let failure = match tokio::time::timeout(self.query_timeout, self.store.query(name)).await {
            Ok(Ok(Some(contact))) => {
                self.cache.put(contact.clone());
                return Ok(contact);
            }
            Ok(Ok(None)) => return Err(CoreError::name_not_found(name)),
            Ok(Err(err)) if matches!(err.kind(), ErrorKind::StoreUnavailable | ErrorKind::Io) => err,
            Ok(Err(err)) => return Err(err),
            Err(_) => CoreError::timeout(
                codes::STORE_TIMEOUT,
                format!("name query for `{name}` exceeded {:?}", self.query_timeout),
            ),
        };

        warn!(name, error = %failure, "name store unreachable");
        let Some(discovery) = &self.discovery else {
            return Err(failure);
        };
        match discovery.discover(name).await {
            Ok(Some(contact)) => {
                debug!(name, contact = %contact, "resolved through discovery");
                self.cache.put(contact.clone());
                Ok(contact)
            }
            Ok(None) => Err(failure),
            Err(err) => {
                debug!(name, error = %err, "discovery failed");
                Err(failure)
            }
        }
    }

    /// 登记地址并清除旧缓存。
    pub async fn register(&self, contact: Contact) -> Result<Contact> {
        self.cache.invalidate(contact.name());
        self.with_timeout(self.store.register(contact)).await
    }

    /// 注销名字并清除缓存。
    pub async fn unregister(&self, name: &str) -> Result<()> {
        self.cache.invalidate(name);
        self.with_timeout(self.store.unregister(name)).await
    }

    /// 报告活跃度；端口在输入或输出连接建立、拆除时以 ±1 调用。
    pub async fn announce(&self, name: &str, activity: i32) -> Result<()> {
        self.with_timeout(self.store.announce(name, activity)).await
    }

    /// 连接失败后调用，迫使下一次解析重新查询存储。
    pub fn invalidate(&self, name: &str) {
        self.cache.invalidate(name);
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| {
                CoreError::timeout(
                    codes::STORE_TIMEOUT,
                    format!("name store call exceeded {:?}", self.query_timeout),
                )
            })?
    }
}
