//! # name 模块说明
//!
//! ## 意图（Why）
//! - 名字存储是外部协作者（名字服务器、数据库……），核心只依赖 [`NameStore`] 这一抽象；
//! - [`InMemoryNameStore`] 用于单进程部署与测试，行为与远端存储的契约一致。
//!
//! ## 契约（What）
//! - `query` 返回 `Ok(None)` 表示名字未登记；`Err` 仅用于存储不可达等传输层失败；
//! - `register` 覆盖同名旧记录并返回最终登记的地址；
//! - `unregister` 对未登记的名字是幂等的；
//! - `announce` 累加活跃度计数，不存在的名字被忽略。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::contact::{Contact, validate_name};
use crate::error::{CoreError, Result};

/// 名字存储抽象。
#[async_trait]
pub trait NameStore: Send + Sync + 'static {
    /// 查询名字对应的地址。
    async fn query(&self, name: &str) -> Result<Option<Contact>>;

    /// 登记地址。
    async fn register(&self, contact: Contact) -> Result<Contact>;

    /// 注销名字。
    async fn unregister(&self, name: &str) -> Result<()>;

    /// 报告活跃度变化。
    async fn announce(&self, name: &str, activity: i32) -> Result<()>;
}

#[async_trait]
impl<T: NameStore + ?Sized> NameStore for Arc<T> {
    async fn query(&self, name: &str) -> Result<Option<Contact>> {
        (**self).query(name).await
    }

    async fn register(&self, contact: Contact) -> Result<Contact> {
        (**self).register(contact).await
    }

    async fn unregister(&self, name: &str) -> Result<()> {
        (**self).unregister(name).await
    }

    async fn announce(&self, name: &str, activity: i32) -> Result<()> {
        (**self).announce(name, activity).await
    }
}

#[derive(Clone, Debug)]
struct Entry {
    contact: Contact,
    activity: i64,
}

/// 进程内名字存储。
///
/// `set_available(false)` 可模拟存储宕机，此时所有调用返回 `StoreUnavailable`。
#[derive(Debug)]
pub struct InMemoryNameStore {
    entries: DashMap<String, Entry>,
    available: AtomicBool,
}

impl Default for InMemoryNameStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNameStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// 切换可用性。
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 名字的累计活跃度。
    pub fn activity(&self, name: &str) -> Option<i64> {
        self.entries.get(name).map(|entry| entry.activity)
    }

    /// 已登记的名字数。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::store_unavailable("in-memory name store is offline"))
        }
    }
}

#[async_trait]
impl NameStore for InMemoryNameStore {
    async fn query(&self, name: &str) -> Result<Option<Contact>> {
        self.ensure_available()?;
        Ok(self.entries.get(name).map(|entry| entry.contact.clone()))
    }

    async fn register(&self, contact: Contact) -> Result<Contact> {
        self.ensure_available()?;
        validate_name(contact.name())?;
        if contact.is_anonymous() {
            return Err(CoreError::config("cannot register an anonymous contact"));
        }
        debug!(name = contact.name(), contact = %contact, "name registered");
        self.entries.insert(
            contact.name().to_owned(),
            Entry {
                contact: contact.clone(),
                activity: 0,
            },
        );
        Ok(contact)
    }

    async fn unregister(&self, name: &str) -> Result<()> {
        self.ensure_available()?;
        if self.entries.remove(name).is_some() {
            debug!(name, "name unregistered");
        }
        Ok(())
    }

    async fn announce(&self, name: &str, activity: i32) -> Result<()> {
        self.ensure_available()?;
        if let Some(mut entry) = self.entries.get_mut(name) {
            entry.activity += i64::from(activity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn register_query_unregister() {
        let store = InMemoryNameStore::new();
        let contact = Contact::new("/foo", "127.0.0.1", 1234, "tcp").expect("合法地址");
        store.register(contact.clone()).await.expect("登记");
        assert_eq!(store.query("/foo").await.expect("查询"), Some(contact));

        store.unregister("/foo").await.expect("注销");
        assert_eq!(store.query("/foo").await.expect("再次查询"), None);
        store.unregister("/foo").await.expect("重复注销应幂等");
    }

    #[tokio::test]
    async fn register_replaces_existing_entry() {
        let store = InMemoryNameStore::new();
        store
            .register(Contact::new("/foo", "127.0.0.1", 1, "tcp").expect("地址"))
            .await
            .expect("首次登记");
        store
            .register(Contact::new("/foo", "127.0.0.1", 2, "tcp").expect("地址"))
            .await
            .expect("覆盖登记");
        let found = store.query("/foo").await.expect("查询").expect("存在");
        assert_eq!(found.port(), 2);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = InMemoryNameStore::new();
        store.set_available(false);
        let err = store.query("/foo").await.expect_err("离线");
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[tokio::test]
    async fn announce_accumulates_activity() {
        let store = InMemoryNameStore::new();
        store
            .register(Contact::new("/foo", "h", 1, "tcp").expect("地址"))
            .await
            .expect("登记");
        store.announce("/foo", 2).await.expect("活跃");
        store.announce("/foo", -1).await.expect("活跃");
        store.announce("/ghost", 5).await.expect("未知名字被忽略");
        assert_eq!(store.activity("/foo"), Some(1));
    }
}
