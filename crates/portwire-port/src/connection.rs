//! # 输出连接
//!
//! ## 意图（Why）
//! - 一条输出连接 = 一个路由 + 一个按需建立的会话（通道 + 载体实例）+ 一份协议状态；
//!   端口写入时对每条输出连接各自调用 [`OutputConnection::send`]，互不阻塞。
//!
//! ## 逻辑（How）
//! - 会话与状态放在连接自己的 `tokio::sync::Mutex` 里：一次发送从写帧到读完回复/确认都持锁，
//!   同一连接上的消息因此严格串行、回复不会交错；
//! - 会话缺失时先握手；在复用的会话上发送失败时，命名路由会作废解析缓存、重新握手并重发一次，
//!   匿名路由直接把错误交给端口，由端口将其移除。
//!
//! - 每条连接带一个关闭信号：`close` 先触发它，正在等待回复或确认的发送随即放弃并拆除会话，
//!   `close` 因而不会被一次永远得不到回复的交换挡住。
//!
//! ## 注意事项（Trade-offs）
//! - 重发意味着至少一次语义：对端可能已经收到失败前那次写入。

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use portwire_carriers::handshake::{self, Established};
use portwire_carriers::{Capabilities, CarrierFactory, Frame};
use portwire_core::error::{CoreError, ErrorKind, Result, codes};
use portwire_core::{Bottle, ConnectionReader, Contact, PortCommand, Portable, Route};
use portwire_transport::{BoxStream, CancellationSignal, TcpChannel};
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::delivery::encode_bottle;
use crate::network::NetworkShared;
use crate::protocol::{Phase, ProtocolState};

/// 在可选时限内执行。
pub(crate) async fn within<T>(
    limit: Option<Duration>,
    code: &'static str,
    what: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, future).await.map_err(|_| {
            CoreError::timeout(code, format!("{what} exceeded {limit:?}"))
        })?,
        None => future.await,
    }
}

/// 解码块序列为 bottle。
pub(crate) fn decode_bottle(blocks: &[Bytes], text_mode: bool) -> Result<Bottle> {
    let mut reader = ConnectionReader::from_blocks(blocks, text_mode);
    let mut bottle = Bottle::new();
    bottle.read(&mut reader)?;
    Ok(bottle)
}

/// 打开到 `contact` 的通道并完成客户端握手。
pub(crate) async fn dial(
    shared: &NetworkShared,
    factory: &dyn CarrierFactory,
    contact: &Contact,
    sender: &str,
) -> Result<Established> {
    let address = contact.socket_address();
    let connect_timeout = shared.config.connect_timeout();
    let stream: BoxStream = if factory.capabilities().local {
        Box::new(shared.hub.connect(&address)?)
    } else {
        let channel = TcpChannel::connect(&address, Some(connect_timeout))
            .await
            .map_err(|err| {
                CoreError::handshake_failed(format!("cannot reach {contact}")).with_cause(err)
            })?;
        Box::new(channel)
    };
    within(
        Some(connect_timeout),
        codes::HANDSHAKE_FAILED,
        "handshake",
        handshake::connect(factory, &shared.options, stream, sender),
    )
    .await
    .map_err(|err| match err.kind() {
        ErrorKind::Timeout | ErrorKind::Io | ErrorKind::Closed => {
            CoreError::handshake_failed(format!("handshake with {contact} failed")).with_cause(err)
        }
        _ => err,
    })
}

/// 通道层面的故障：对端关闭或 IO 错误，重新握手有望恢复。
fn is_channel_failure(err: &CoreError) -> bool {
    matches!(err.kind(), ErrorKind::Io | ErrorKind::Closed)
}

struct Link {
    state: ProtocolState,
    session: Option<Established>,
}

/// 端口的一条输出连接。
pub struct OutputConnection {
    route: Route,
    shared: Arc<NetworkShared>,
    link: Mutex<Link>,
    closed: CancellationSignal,
}

impl fmt::Debug for OutputConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputConnection")
            .field("route", &self.route)
            .finish()
    }
}

impl OutputConnection {
    /// 新建并立即握手；解析或握手失败同步返回。
    pub(crate) async fn open(shared: Arc<NetworkShared>, route: Route) -> Result<Arc<Self>> {
        let connection = Arc::new(Self {
            route,
            shared,
            link: Mutex::new(Link {
                state: ProtocolState::new(),
                session: None,
            }),
            closed: CancellationSignal::new(),
        });
        {
            let mut link = connection.link.lock().await;
            connection.establish(&mut link).await?;
        }
        Ok(connection)
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// 路由两端都有名字时才会在故障后重连。
    pub fn is_named(&self) -> bool {
        self.route.is_named()
    }

    /// 当前协议阶段。
    pub async fn phase(&self) -> Phase {
        self.link.lock().await.state.phase()
    }

    /// 当前会话的载体能力；会话缺失时为 `None`。
    pub async fn capabilities(&self) -> Option<Capabilities> {
        self.link
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.carrier.capabilities())
    }

    async fn establish(&self, link: &mut Link) -> Result<()> {
        if link.state.phase() != Phase::Handshaking {
            link.state.advance(Phase::Handshaking)?;
        }
        let span = info_span!("handshake", route = %self.route);
        let result = async {
            let contact = self.shared.resolver.resolve(self.route.to_name()).await?;
            let carrier = if !self.route.carrier().is_empty() {
                self.route.carrier()
            } else if !contact.carrier().is_empty() {
                contact.carrier()
            } else {
                self.shared.config.default_carrier.as_str()
            };
            let factory = self.shared.registry.lookup(carrier)?;
            debug!(contact = %contact, carrier, "dialing");
            dial(&self.shared, factory.as_ref(), &contact, self.route.from_name()).await
        }
        .instrument(span)
        .await;

        match result {
            Ok(session) => {
                link.state.advance(Phase::Established)?;
                info!(route = %self.route, carrier = session.carrier.name(), "output connected");
                link.session = Some(session);
                Ok(())
            }
            Err(err) => {
                link.state.fail(err.code());
                Err(err)
            }
        }
    }

    /// 发送一条消息。
    ///
    /// # 契约（What）
    /// - `wants_reply` 为真且载体支持回复时返回 `Some(reply)`，否则返回 `None`；
    /// - 载体不支持回复却要求回复时返回 `REPLY_UNSUPPORTED`，消息超过 `max_message_bytes`
    ///   时返回 `WIRE_TOO_LARGE`；两者都不写出任何字节，连接保持可用；
    /// - 连接被 [`close`](Self::close) 时，进行中的发送以 `CONNECTION_CLOSED` 放弃。
    pub(crate) async fn send(
        &self,
        bottle: &Bottle,
        envelope: Option<&str>,
        wants_reply: bool,
    ) -> Result<Option<Bottle>> {
        let mut link = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            link = self.link.lock() => link,
        };
        let outcome = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            outcome = self.send_locked(&mut link, bottle, envelope, wants_reply) => Some(outcome),
        };
        match outcome {
            Some(outcome) => outcome,
            None => {
                // 交换被中途放弃，通道上可能残留半帧或未读的回复，只能丢弃
                debug!(route = %self.route, "in-flight exchange abandoned on close");
                self.teardown(&mut link, codes::CONNECTION_CLOSED).await;
                Err(self.closed_error())
            }
        }
    }

    fn closed_error(&self) -> CoreError {
        CoreError::closed(format!("{} is closed", self.route))
    }

    async fn send_locked(
        &self,
        link: &mut Link,
        bottle: &Bottle,
        envelope: Option<&str>,
        wants_reply: bool,
    ) -> Result<Option<Bottle>> {
        let reused = link.session.is_some();
        if !reused {
            self.establish(link).await?;
        }
        // 准备阶段的拒绝发生在写出之前，连接保持可用
        let frame = self.prepare(link, bottle, envelope, wants_reply)?;
        match self.exchange(link, &frame, wants_reply).await {
            Ok(reply) => Ok(reply),
            Err(err) if reused && self.is_named() && is_channel_failure(&err) => {
                warn!(route = %self.route, error = %err, "output failed, reconnecting");
                self.teardown(link, err.code()).await;
                self.shared.resolver.invalidate(self.route.to_name());
                self.establish(link).await?;
                let frame = self.prepare(link, bottle, envelope, wants_reply)?;
                match self.exchange(link, &frame, wants_reply).await {
                    Ok(reply) => Ok(reply),
                    Err(err) => {
                        self.teardown(link, err.code()).await;
                        Err(err)
                    }
                }
            }
            Err(err) => {
                self.teardown(link, err.code()).await;
                Err(err)
            }
        }
    }

    /// 按当前会话的载体能力编码消息，并做写出前的全部检查。
    ///
    /// 载体不支持回复返回 `REPLY_UNSUPPORTED`，超过 `max_message_bytes` 返回 `WIRE_TOO_LARGE`。
    fn prepare(
        &self,
        link: &Link,
        bottle: &Bottle,
        envelope: Option<&str>,
        wants_reply: bool,
    ) -> Result<Frame> {
        let Some(session) = link.session.as_ref() else {
            return Err(CoreError::closed(format!("{} has no session", self.route)));
        };
        let caps = session.carrier.capabilities();
        if wants_reply && !caps.supports_reply {
            return Err(CoreError::violation(
                codes::REPLY_UNSUPPORTED,
                format!("carrier `{}` cannot carry replies", session.carrier.name()),
            ));
        }
        let blocks = encode_bottle(bottle, caps.text_mode)?;
        let command = PortCommand::data(wants_reply, envelope.map(str::to_owned));
        let frame = Frame::new(command, blocks);
        frame.ensure_within(self.shared.options.max_message_bytes)?;
        Ok(frame)
    }

    async fn exchange(
        &self,
        link: &mut Link,
        frame: &Frame,
        wants_reply: bool,
    ) -> Result<Option<Bottle>> {
        let Link { state, session } = link;
        let Some(session) = session.as_mut() else {
            return Err(CoreError::closed(format!("{} has no session", self.route)));
        };
        let caps = session.carrier.capabilities();
        state.advance(if wants_reply {
            Phase::AwaitingReply
        } else {
            Phase::Streaming
        })?;
        session.carrier.write(session.stream.as_mut(), frame).await?;
        let reply = within(
            if wants_reply { self.shared.config.reply_timeout() } else { None },
            codes::REPLY_TIMEOUT,
            "reply",
            session.carrier.expect_response(session.stream.as_mut(), wants_reply),
        )
        .await?;
        state.advance(Phase::Streaming)?;
        reply
            .map(|blocks| decode_bottle(&blocks, caps.text_mode))
            .transpose()
    }

    /// 在已持锁的空闲会话上发送不带负载的命令（例如退出）。
    async fn send_command(&self, link: &mut Link, command: PortCommand) -> Result<()> {
        let Some(session) = link.session.as_mut() else {
            return Ok(());
        };
        within(
            Some(self.shared.config.connect_timeout()),
            codes::CONNECTION_CLOSED,
            "quit",
            session
                .carrier
                .write(session.stream.as_mut(), &Frame::command_only(command)),
        )
        .await
    }

    async fn teardown(&self, link: &mut Link, code: &'static str) {
        if let Some(mut session) = link.session.take() {
            let _ = session.stream.shutdown().await;
        }
        link.state.fail(code);
    }

    /// 主动关闭：中止进行中的交换，向空闲会话发送退出命令并释放通道。
    pub(crate) async fn close(&self) {
        self.closed.cancel();
        let mut link = self.link.lock().await;
        if let Err(err) = self.send_command(&mut link, PortCommand::quit()).await {
            debug!(route = %self.route, error = %err, "quit not delivered");
        }
        if link.state.phase().is_open() {
            let _ = link.state.advance(Phase::Closing);
        }
        if let Some(mut session) = link.session.take() {
            let _ = session.stream.shutdown().await;
        }
        link.state.close();
        info!(route = %self.route, "output closed");
    }
}
