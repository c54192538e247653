//! # 端口
//!
//! ## 意图（Why）
//! - 端口是用户唯一直接操作的对象：它拥有一个监听地址、一组输出连接与一组输入连接，
//!   对外提供写（扇出 / 定向 / 请求回复）、读（阻塞 / 非阻塞 / 有状态回复 / 回调）与关闭；
//! - 输出连接各自持锁、并发发送，一条连接的故障不会阻塞其他连接。
//!
//! ## 逻辑（How）
//! - 打开时绑定 TCP 监听器，并以同一 `host:port` 在进程内中枢上登记，随后把名字登记到名字存储；
//! - 接受任务为每个入站通道派生输入任务，输入任务把消息推入端口的入站队列；
//! - 读者从队列取消息；回调模式下队列的接收端移交给专门的投递任务；
//! - 关闭信号同时唤醒接受任务、输入任务与阻塞中的读者。
//!
//! ## 契约（What）
//! - `read` 在关闭后返回 `Ok(None)`；
//! - 对请求回复的消息，读者无论走哪条读取路径，写方最终都会收到一个回复；
//! - `close` 幂等。
//!
//! ## 注意事项（Trade-offs）
//! - 连接集合由 `parking_lot::Mutex` 保护，持锁期间不做 IO；
//! - 在另一个任务阻塞于 `read` 时调用 `set_reader`，会等到那次读取返回后才切换。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use portwire_core::error::{CoreError, Result, codes};
use portwire_core::{Bottle, Contact, Envelope, PortInfo, PortInfoKind, Route};
use portwire_transport::{CancellationSignal, TcpListener};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::connection::OutputConnection;
use crate::delivery::{Delivery, InboundReceiver, InboundSender, Replier, inbound_queue};
use crate::input::{InputHandle, accept_loop};
use crate::network::{Network, NetworkShared, no_connection};

const EVENT_CAPACITY: usize = 64;

/// 回调模式下接收每条消息的读者。
#[async_trait]
pub trait PortReader: Send + Sync + 'static {
    async fn on_read(&self, delivery: Delivery);
}

/// 一次扇出写入的结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub delivered: usize,
    pub failed: usize,
}

impl WriteSummary {
    /// 全部输出连接都成功（包括没有输出连接的情形）。
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// `read_request` 留在端口内的回复状态。
#[derive(Debug, Default)]
enum ReplySlot {
    #[default]
    Idle,
    /// 某个 `read_request` 正在等待消息，槽位已被它占用。
    Reading,
    Pending(Replier),
    Answered,
}

/// 占用中的回复槽；读取未交出消息（关闭、出错或被取消）时把槽位还原为空闲。
struct ReadingSlot<'a> {
    slot: &'a Mutex<ReplySlot>,
    armed: bool,
}

impl ReadingSlot<'_> {
    fn fill(mut self, replier: Replier) {
        self.armed = false;
        *self.slot.lock() = ReplySlot::Pending(replier);
    }
}

impl Drop for ReadingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut slot = self.slot.lock();
            if matches!(*slot, ReplySlot::Reading) {
                *slot = ReplySlot::Idle;
            }
        }
    }
}

pub(crate) struct PortInner {
    shared: Arc<NetworkShared>,
    name: String,
    contact: Contact,
    local_key: String,
    outputs: Mutex<Vec<Arc<OutputConnection>>>,
    pub(crate) inputs: Mutex<Vec<InputHandle>>,
    next_input: AtomicU64,
    pub(crate) inbound_tx: InboundSender,
    inbound_rx: AsyncMutex<Option<InboundReceiver>>,
    reply_slot: Mutex<ReplySlot>,
    events: broadcast::Sender<PortInfo>,
    outgoing_envelope: Mutex<Option<Envelope>>,
    last_envelope: Mutex<Option<Envelope>>,
    callback: AtomicBool,
    closing: AtomicBool,
    pub(crate) closed: CancellationSignal,
}

impl PortInner {
    pub(crate) fn next_input_id(&self) -> u64 {
        self.next_input.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// 没有订阅者时事件直接丢弃。
    ///
    /// 连接的建立与拆除同时以 ±1 报告给名字存储的活跃度计数；报告在后台完成，
    /// 失败只记日志，不影响连接本身。
    pub(crate) fn emit(&self, info: PortInfo) {
        if matches!(info.kind, PortInfoKind::Incoming | PortInfoKind::Outgoing) {
            self.announce_activity(if info.created { 1 } else { -1 });
        }
        let _ = self.events.send(info);
    }

    fn announce_activity(&self, activity: i32) {
        if self.name.is_empty() {
            return;
        }
        let resolver = Arc::clone(&self.shared.resolver);
        let name = self.name.clone();
        tokio::spawn(
            async move {
                if let Err(err) = resolver.announce(&name, activity).await {
                    debug!(port = %name, activity, error = %err, "activity not announced");
                }
            }
            .in_current_span(),
        );
    }

    /// 输出连接发送失败后的处置：匿名路由遗忘，命名路由保留待下次重连。
    fn output_failed(&self, output: &Arc<OutputConnection>, err: &CoreError) {
        let route = output.route().clone();
        if self.is_closed() {
            debug!(%route, error = %err, "output stopped by close");
            return;
        }
        if refused_before_write(err) {
            debug!(%route, error = %err, "message refused, output kept");
            return;
        }
        if output.is_named() {
            warn!(%route, error = %err, "write failed, will reconnect on next write");
            self.emit(PortInfo::misc(route, format!("write failed: {err}")));
            return;
        }
        warn!(%route, error = %err, "write failed, dropping anonymous output");
        self.outputs
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, output));
        self.emit(PortInfo::outgoing(route, false));
    }
}

/// 发送前即被拒绝的消息：连接未受影响，不必移除或重连。
fn refused_before_write(err: &CoreError) -> bool {
    matches!(err.code(), codes::REPLY_UNSUPPORTED | codes::WIRE_TOO_LARGE)
}

impl Drop for PortInner {
    fn drop(&mut self) {
        self.closed.cancel();
        self.shared.hub.unbind(&self.local_key);
    }
}

/// 端口句柄；克隆共享同一端口。
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.inner.name)
            .field("contact", &self.inner.contact)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Port {
    pub(crate) fn from_inner(inner: Arc<PortInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<PortInner> {
        &self.inner
    }

    pub(crate) fn shared(&self) -> &Arc<NetworkShared> {
        &self.inner.shared
    }

    /// 以名字打开；空名字得到匿名端口，不登记到名字存储。
    pub(crate) async fn open(network: &Network, name: &str) -> Result<Self> {
        let contact = if name.is_empty() {
            Contact::socket("", 0, "")
        } else {
            Contact::by_name(name)?
        };
        Self::open_contact(network, contact).await
    }

    /// 以完整地址打开：带套接字的地址按其绑定，否则绑定到 `bind_host` 上的空闲端口。
    pub async fn open_contact(network: &Network, contact: Contact) -> Result<Self> {
        let shared = network.shared().clone();
        let name = contact.name().to_owned();
        if !name.is_empty() && shared.local_port(&name).is_some() {
            return Err(CoreError::new(
                codes::PORT_ALREADY_OPEN,
                format!("port {name} is already open in this network"),
            ));
        }

        let bind = if contact.has_socket() {
            contact.socket_address()
        } else {
            format!("{}:0", shared.config.bind_host)
        };
        let listener = TcpListener::bind(&bind).await?;
        let address = listener.local_addr();
        let host = address.ip().to_string();
        let carrier = if contact.carrier().is_empty() {
            shared.config.default_carrier.clone()
        } else {
            contact.carrier().to_owned()
        };
        let contact = if name.is_empty() {
            Contact::socket(host, address.port(), carrier)
        } else {
            Contact::new(name.clone(), host, address.port(), carrier)?
        };
        let local_key = contact.socket_address();
        let local = shared.hub.bind(local_key.clone());

        let (inbound_tx, inbound_rx) = inbound_queue(shared.config.inbound_capacity);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let closed = CancellationSignal::new();
        let inner = Arc::new(PortInner {
            shared: shared.clone(),
            name: name.clone(),
            contact: contact.clone(),
            local_key,
            outputs: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
            next_input: AtomicU64::new(0),
            inbound_tx,
            inbound_rx: AsyncMutex::new(Some(inbound_rx)),
            reply_slot: Mutex::new(ReplySlot::Idle),
            events,
            outgoing_envelope: Mutex::new(None),
            last_envelope: Mutex::new(None),
            callback: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: closed.clone(),
        });

        if !name.is_empty() {
            shared.resolver.register(contact.clone()).await?;
            shared.ports.insert(name.clone(), Arc::downgrade(&inner));
        }
        let span = info_span!("acceptor", port = %contact);
        tokio::spawn(accept_loop(Arc::downgrade(&inner), listener, local, closed).instrument(span));
        info!(%contact, "port opened");
        Ok(Self { inner })
    }

    /// 端口名；匿名端口为空串。
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 端口的实际地址。
    pub fn contact(&self) -> &Contact {
        &self.inner.contact
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::new(
                codes::PORT_CLOSED,
                format!("port {} is closed", self.inner.contact),
            ));
        }
        Ok(())
    }

    fn ensure_polling(&self) -> Result<()> {
        self.ensure_open()?;
        if self.inner.callback.load(Ordering::Acquire) {
            return Err(CoreError::new(
                codes::PORT_CALLBACK_MODE,
                format!("port {} delivers through a reader callback", self.inner.contact),
            ));
        }
        Ok(())
    }

    /// 新增到 `to` 的输出连接；已存在时直接返回其路由。
    ///
    /// # 契约（What）
    /// - 解析失败返回 `NameNotFound`，握手失败返回 `HandshakeFailed`，均不留下连接；
    /// - 成功后发出 `Outgoing` 建立事件。
    pub async fn add_output(&self, to: &str, carrier: Option<&str>) -> Result<Route> {
        self.ensure_open()?;
        let existing = self
            .inner
            .outputs
            .lock()
            .iter()
            .find(|output| {
                output.route().to_name() == to
                    && carrier.is_none_or(|carrier| output.route().carrier() == carrier)
            })
            .map(|output| output.route().clone());
        if let Some(route) = existing {
            debug!(%route, "output already present");
            return Ok(route);
        }

        let route = Route::new(self.name(), to, carrier.unwrap_or_default());
        let output = OutputConnection::open(self.inner.shared.clone(), route.clone()).await?;
        self.inner.outputs.lock().push(output);
        info!(%route, "output added");
        self.inner.emit(PortInfo::outgoing(route.clone(), true));
        Ok(route)
    }

    /// 删除到 `to` 的输出连接；不存在时返回 `false`。
    pub async fn remove_output(&self, to: &str) -> bool {
        let removed: Vec<Arc<OutputConnection>> = {
            let mut outputs = self.inner.outputs.lock();
            let (removed, kept) = outputs
                .drain(..)
                .partition(|output| output.route().to_name() == to);
            *outputs = kept;
            removed
        };
        for output in &removed {
            output.close().await;
            self.inner.emit(PortInfo::outgoing(output.route().clone(), false));
        }
        !removed.is_empty()
    }

    /// 关闭来源为 `source` 的输入连接；不存在时返回 `false`。
    pub fn remove_input(&self, source: &str) -> bool {
        self.inner.drop_inputs(source)
    }

    pub fn outputs(&self) -> Vec<Route> {
        self.inner
            .outputs
            .lock()
            .iter()
            .map(|output| output.route().clone())
            .collect()
    }

    pub fn inputs(&self) -> Vec<Route> {
        self.inner
            .inputs
            .lock()
            .iter()
            .map(|handle| handle.route.clone())
            .collect()
    }

    fn outgoing_envelope(&self) -> Option<String> {
        self.inner
            .outgoing_envelope
            .lock()
            .as_ref()
            .map(Envelope::to_text)
    }

    /// 扇出写入所有输出连接。
    ///
    /// # 逻辑（How）
    /// - 各连接并发发送，全部完成后汇总；
    /// - 失败的匿名连接被移除，命名连接保留到下一次写入时重连。
    pub async fn write(&self, bottle: &Bottle) -> Result<WriteSummary> {
        self.ensure_open()?;
        let outputs = self.inner.outputs.lock().clone();
        let envelope = self.outgoing_envelope();
        let results = join_all(
            outputs
                .iter()
                .map(|output| output.send(bottle, envelope.as_deref(), false)),
        )
        .await;

        let mut summary = WriteSummary::default();
        for (output, result) in outputs.iter().zip(results) {
            match result {
                Ok(_) => summary.delivered += 1,
                Err(err) => {
                    summary.failed += 1;
                    self.inner.output_failed(output, &err);
                }
            }
        }
        Ok(summary)
    }

    /// 只写到目标为 `to` 的输出连接。
    pub async fn write_to(&self, to: &str, bottle: &Bottle) -> Result<()> {
        self.ensure_open()?;
        let output = self
            .inner
            .outputs
            .lock()
            .iter()
            .find(|output| output.route().to_name() == to)
            .cloned()
            .ok_or_else(|| no_connection(self.name(), to))?;
        let envelope = self.outgoing_envelope();
        match output.send(bottle, envelope.as_deref(), false).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.inner.output_failed(&output, &err);
                Err(err)
            }
        }
    }

    /// 写到唯一的输出连接并等待回复。
    ///
    /// # 契约（What）
    /// - 没有输出连接返回 `NO_CONNECTION`，多于一条返回配置错误；
    /// - 载体不支持回复时返回 `REPLY_UNSUPPORTED`，超过 `max_message_bytes` 时返回
    ///   `WIRE_TOO_LARGE`，两种情况下连接都保持不变。
    pub async fn write_with_reply(&self, bottle: &Bottle) -> Result<Bottle> {
        self.ensure_open()?;
        let output = {
            let outputs = self.inner.outputs.lock();
            match outputs.as_slice() {
                [] => return Err(no_connection(self.name(), "any port")),
                [output] => output.clone(),
                _ => {
                    return Err(CoreError::config(format!(
                        "port {} has {} outputs, a reply needs exactly one",
                        self.inner.contact,
                        outputs.len()
                    )));
                }
            }
        };
        let envelope = self.outgoing_envelope();
        match output.send(bottle, envelope.as_deref(), true).await {
            Ok(reply) => Ok(reply.unwrap_or_default()),
            Err(err) => {
                self.inner.output_failed(&output, &err);
                Err(err)
            }
        }
    }

    /// 取下一条消息；端口关闭时返回 `None`。
    async fn next_delivery(&self) -> Result<Option<Delivery>> {
        let closed = self.inner.closed.clone();
        let mut receiver = tokio::select! {
            biased;
            _ = closed.cancelled() => return Ok(None),
            receiver = self.inner.inbound_rx.lock() => receiver,
        };
        let Some(receiver) = receiver.as_mut() else {
            return Err(CoreError::new(
                codes::PORT_CALLBACK_MODE,
                "inbound queue belongs to the reader callback",
            ));
        };
        Ok(tokio::select! {
            biased;
            _ = closed.cancelled() => None,
            delivery = receiver.recv() => delivery,
        })
    }

    fn unpack(&self, delivery: Delivery) -> (Bottle, Replier) {
        let (bottle, envelope, replier) = delivery.into_parts();
        *self.inner.last_envelope.lock() = envelope;
        (bottle, replier)
    }

    /// 阻塞读取；关闭后返回 `Ok(None)`。请求回复的消息自动得到空回复。
    pub async fn read(&self) -> Result<Option<Bottle>> {
        self.ensure_polling()?;
        let Some(delivery) = self.next_delivery().await? else {
            return Ok(None);
        };
        let (bottle, _replier) = self.unpack(delivery);
        Ok(Some(bottle))
    }

    /// 非阻塞读取；队列为空或另一读者正持有队列时返回 `None`。
    pub fn try_read(&self) -> Result<Option<Bottle>> {
        self.ensure_polling()?;
        let delivery = match self.inner.inbound_rx.try_lock() {
            Ok(mut receiver) => receiver.as_mut().and_then(InboundReceiver::try_recv),
            Err(_) => None,
        };
        Ok(delivery.map(|delivery| self.unpack(delivery).0))
    }

    /// 读取并把回复义务留在端口内，由 [`reply`](Self::reply) 履行。
    ///
    /// 仍有未回复的请求，或另一个 `read_request` 正在等待时，返回 `REPLY_PENDING`。
    pub async fn read_request(&self) -> Result<Option<Bottle>> {
        self.ensure_polling()?;
        let reading = {
            let mut slot = self.inner.reply_slot.lock();
            if matches!(*slot, ReplySlot::Pending(_) | ReplySlot::Reading) {
                return Err(CoreError::violation(
                    codes::REPLY_PENDING,
                    "previous request has not been replied to",
                ));
            }
            *slot = ReplySlot::Reading;
            ReadingSlot {
                slot: &self.inner.reply_slot,
                armed: true,
            }
        };
        let Some(delivery) = self.next_delivery().await? else {
            return Ok(None);
        };
        let (bottle, replier) = self.unpack(delivery);
        reading.fill(replier);
        Ok(Some(bottle))
    }

    /// 回复最近一次 `read_request` 取到的消息。
    pub fn reply(&self, bottle: &Bottle) -> Result<()> {
        let mut slot = self.inner.reply_slot.lock();
        match std::mem::replace(&mut *slot, ReplySlot::Answered) {
            ReplySlot::Pending(mut replier) => replier.reply(bottle),
            ReplySlot::Answered => Err(CoreError::violation(
                codes::REPLY_TWICE,
                "the last request was already replied to",
            )),
            previous @ (ReplySlot::Idle | ReplySlot::Reading) => {
                *slot = previous;
                Err(CoreError::protocol_violation("no request is waiting for a reply"))
            }
        }
    }

    /// 读取并交出回复句柄。
    pub async fn read_with_replier(&self) -> Result<Option<(Bottle, Replier)>> {
        self.ensure_polling()?;
        Ok(self
            .next_delivery()
            .await?
            .map(|delivery| self.unpack(delivery)))
    }

    /// 切换到回调模式：之后每条消息都交给 `reader`，读取方法返回 `PORT_CALLBACK_MODE`。
    pub async fn set_reader(&self, reader: Arc<dyn PortReader>) -> Result<()> {
        self.ensure_open()?;
        if self.inner.callback.swap(true, Ordering::AcqRel) {
            return Err(CoreError::new(
                codes::PORT_CALLBACK_MODE,
                format!("port {} already has a reader", self.inner.contact),
            ));
        }
        let Some(mut receiver) = self.inner.inbound_rx.lock().await.take() else {
            return Err(CoreError::new(
                codes::PORT_CALLBACK_MODE,
                "inbound queue already taken",
            ));
        };
        let closed = self.inner.closed.clone();
        let span = info_span!("delivery", port = %self.inner.contact);
        tokio::spawn(
            async move {
                loop {
                    let delivery = tokio::select! {
                        biased;
                        _ = closed.cancelled() => break,
                        delivery = receiver.recv() => delivery,
                    };
                    let Some(delivery) = delivery else {
                        break;
                    };
                    reader.on_read(delivery).await;
                }
                receiver.close();
                debug!("delivery task stopped");
            }
            .instrument(span),
        );
        Ok(())
    }

    /// 之后写出的消息都携带 `envelope`；`None` 取消。
    pub fn set_envelope(&self, envelope: Option<Envelope>) {
        *self.inner.outgoing_envelope.lock() = envelope;
    }

    /// 最近一次读取到的信封。
    pub fn envelope(&self) -> Option<Envelope> {
        self.inner.last_envelope.lock().clone()
    }

    /// 订阅连接事件。
    pub fn subscribe(&self) -> broadcast::Receiver<PortInfo> {
        self.inner.events.subscribe()
    }

    /// 关闭端口：注销名字，关闭所有连接，唤醒阻塞的读者。
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.closed.cancel();
        inner.shared.hub.unbind(&inner.local_key);

        if !inner.name.is_empty() {
            let me = Arc::as_ptr(inner);
            inner
                .shared
                .ports
                .remove_if(&inner.name, |_, weak| std::ptr::eq(weak.as_ptr(), me));
            if let Err(err) = inner.shared.resolver.unregister(&inner.name).await {
                warn!(port = %inner.name, error = %err, "name unregistration failed");
            }
        }

        if let Some(receiver) = inner.inbound_rx.lock().await.as_mut() {
            receiver.close();
            while receiver.try_recv().is_some() {}
        }

        let outputs = std::mem::take(&mut *inner.outputs.lock());
        join_all(outputs.iter().map(|output| output.close())).await;
        for output in &outputs {
            inner.emit(PortInfo::outgoing(output.route().clone(), false));
        }
        for handle in inner.inputs.lock().iter() {
            handle.cancel.cancel();
        }
        *inner.reply_slot.lock() = ReplySlot::Idle;
        info!(contact = %inner.contact, "port closed");
    }
}
