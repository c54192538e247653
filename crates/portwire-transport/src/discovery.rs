//! # discovery 模块说明
//!
//! ## 意图（Why）
//! - 名字存储不可达时，解析器的最后手段：向发现组广播“谁是 `/name`”，由持有该名字的进程回答；
//! - 用延迟换可用性，只在常规查询失败后才走这条路径。
//!
//! ## 线上形态（What）
//! - 查询：bottle 文本 `"query" "/name"`；
//! - 应答：bottle 文本 `"contact" "/name" "host" port "carrier"`，直接发回查询方的源地址。
//!
//! ## 注意事项（Trade-offs）
//! - 组地址不是组播地址时按单播处理，测试环境无需组播路由；
//! - 应答方只回答自己名字存储中存在的名字，未知名字保持沉默，查询方以超时收场。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use portwire_core::error::{CoreError, Result, codes};
use portwire_core::{Bottle, Contact, Discovery, DiscoveryConfig, NameStore, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::datagram::DatagramChannel;
use crate::util::CancellationSignal;

/// 发现报文格式错误。
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery message is not valid bottle text")]
    NotText,
    #[error("unexpected discovery verb `{0}`")]
    UnknownVerb(String),
    #[error("discovery message is missing field `{0}`")]
    MissingField(&'static str),
}

impl From<DiscoveryError> for CoreError {
    fn from(err: DiscoveryError) -> Self {
        CoreError::violation(codes::WIRE_MALFORMED, err.to_string()).with_cause(err)
    }
}

/// 发现报文。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryMessage {
    Query(String),
    Contact(Contact),
}

impl DiscoveryMessage {
    pub fn encode(&self) -> String {
        let bottle = match self {
            DiscoveryMessage::Query(name) => Bottle::new().with("query").with(name.as_str()),
            DiscoveryMessage::Contact(contact) => Bottle::new()
                .with("contact")
                .with(contact.name())
                .with(contact.host())
                .with(i32::from(contact.port()))
                .with(contact.carrier()),
        };
        bottle.to_text()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data).map_err(|_| DiscoveryError::NotText)?;
        let bottle = Bottle::from_text(text)?;
        let field = |index: usize, what: &'static str| {
            bottle
                .get(index)
                .and_then(Value::as_str)
                .ok_or(DiscoveryError::MissingField(what))
        };
        match field(0, "verb")? {
            "query" => Ok(DiscoveryMessage::Query(field(1, "name")?.to_owned())),
            "contact" => {
                let name = field(1, "name")?;
                let host = field(2, "host")?;
                let port = bottle
                    .get(3)
                    .and_then(Value::as_i64)
                    .and_then(|port| u16::try_from(port).ok())
                    .ok_or(DiscoveryError::MissingField("port"))?;
                let carrier = field(4, "carrier")?;
                Ok(DiscoveryMessage::Contact(Contact::new(
                    name, host, port, carrier,
                )?))
            }
            other => Err(DiscoveryError::UnknownVerb(other.to_owned()).into()),
        }
    }
}

/// 基于 UDP 组播的名字发现。
#[derive(Clone, Debug)]
pub struct MulticastDiscovery {
    config: DiscoveryConfig,
    timeout: Duration,
}

impl MulticastDiscovery {
    pub fn new(config: DiscoveryConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }
}

#[async_trait]
impl Discovery for MulticastDiscovery {
    async fn discover(&self, name: &str) -> Result<Option<Contact>> {
        let channel = DatagramChannel::multicast_sender(self.config.group, self.config.port).await?;
        let query = DiscoveryMessage::Query(name.to_owned()).encode();
        channel
            .send_to(query.as_bytes(), self.config.socket_addr())
            .await?;
        debug!(name, group = %self.config.socket_addr(), "discovery query sent");

        match tokio::time::timeout(self.timeout, wait_for_answer(&channel, name)).await {
            Ok(found) => found.map(Some),
            Err(_) => Ok(None),
        }
    }
}

async fn wait_for_answer(channel: &DatagramChannel, name: &str) -> Result<Contact> {
    loop {
        let (data, from) = channel.recv_from().await?;
        match DiscoveryMessage::decode(&data) {
            Ok(DiscoveryMessage::Contact(contact)) if contact.name() == name => {
                debug!(name, %from, contact = %contact, "discovery answered");
                return Ok(contact);
            }
            Ok(other) => trace!(?other, %from, "ignoring unrelated discovery message"),
            Err(err) => trace!(error = %err, %from, "ignoring malformed discovery message"),
        }
    }
}

/// 应答发现查询的后台服务。
pub struct DiscoveryResponder {
    channel: DatagramChannel,
    store: Arc<dyn NameStore>,
}

impl std::fmt::Debug for DiscoveryResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryResponder")
            .field("channel", &self.channel)
            .finish()
    }
}

impl DiscoveryResponder {
    /// 加入发现组。
    pub fn bind(config: &DiscoveryConfig, store: Arc<dyn NameStore>) -> Result<Self> {
        let channel = DatagramChannel::join(config.group, config.port)?;
        Ok(Self { channel, store })
    }

    /// 在后台运行，直到 `cancel` 触发。
    pub fn spawn(self, cancel: CancellationSignal) -> JoinHandle<()> {
        let span = info_span!("discovery");
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => debug!("discovery responder stopped"),
                    _ = self.serve() => {}
                }
            }
            .instrument(span),
        )
    }

    async fn serve(&self) {
        loop {
            let (data, from) = match self.channel.recv_from().await {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "discovery responder receive failed");
                    return;
                }
            };
            let name = match DiscoveryMessage::decode(&data) {
                Ok(DiscoveryMessage::Query(name)) => name,
                Ok(_) => continue,
                Err(err) => {
                    trace!(error = %err, %from, "ignoring malformed discovery query");
                    continue;
                }
            };
            match self.store.query(&name).await {
                Ok(Some(contact)) => {
                    let answer = DiscoveryMessage::Contact(contact).encode();
                    if let Err(err) = self.channel.send_to(answer.as_bytes(), from).await {
                        warn!(error = %err, %from, "discovery answer failed");
                    }
                }
                Ok(None) => trace!(name = %name, "discovery query for unknown name"),
                Err(err) => warn!(name = %name, error = %err, "discovery lookup failed"),
            }
        }
    }
}
