//! # 投递模型
//!
//! ## 意图（Why）
//! - 输入连接的读任务与端口的读者之间只隔一个队列：队列元素 [`Delivery`] 自带负载、
//!   信封、来源路由与（可选的）回复通道，读者无需再回头访问连接；
//! - [`Replier`] 把“回复恰好一次”的约束落在类型上：未使用即丢弃时自动回复空 bottle，
//!   写方永远不会因读方遗忘回复而挂起。
//!
//! ## 逻辑（How）
//! - 回复经 `oneshot` 交回读任务，由读任务按载体格式写回，并在回复之后发送确认；
//! - 入站队列按 `inbound_capacity` 选择有界或无界 `mpsc`，有界时读任务在 `send`
//!   上等待，背压经由迟到的确认传回写方。

use std::fmt;

use bytes::Bytes;
use portwire_core::error::{CoreError, Result, codes};
use portwire_core::{Bottle, ConnectionWriter, Envelope, Portable, Route};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// 把 bottle 编码为载体所需语法的块序列。
pub(crate) fn encode_bottle(bottle: &Bottle, text_mode: bool) -> Result<Vec<Bytes>> {
    let mut writer = ConnectionWriter::new(text_mode);
    bottle.write(&mut writer)?;
    Ok(writer.into_blocks())
}

/// 回复句柄。
///
/// # 契约（What）
/// - [`reply`](Self::reply) 最多成功一次，第二次返回 `REPLY_TWICE`；
/// - 未回复即丢弃时发送空 bottle；
/// - 对不要求回复的消息，句柄接受回复但直接丢弃。
pub struct Replier {
    tx: Option<oneshot::Sender<Vec<Bytes>>>,
    text_mode: bool,
    answered: bool,
    route: Route,
}

impl Replier {
    pub(crate) fn new(tx: oneshot::Sender<Vec<Bytes>>, text_mode: bool, route: Route) -> Self {
        Self {
            tx: Some(tx),
            text_mode,
            answered: false,
            route,
        }
    }

    /// 对方并不等待回复时使用的句柄。
    pub(crate) fn detached(route: Route) -> Self {
        Self {
            tx: None,
            text_mode: false,
            answered: false,
            route,
        }
    }

    /// 写方是否在等待这条回复。
    pub fn is_expected(&self) -> bool {
        self.tx.is_some()
    }

    /// 回复来源路由。
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// 发送回复。
    pub fn reply(&mut self, bottle: &Bottle) -> Result<()> {
        if self.answered {
            return Err(CoreError::violation(
                codes::REPLY_TWICE,
                format!("reply on {} was already sent", self.route),
            ));
        }
        self.answered = true;
        let Some(tx) = self.tx.take() else {
            trace!(route = %self.route, "reply discarded, writer did not ask for one");
            return Ok(());
        };
        let blocks = encode_bottle(bottle, self.text_mode)?;
        tx.send(blocks).map_err(|_| {
            CoreError::new(
                codes::CONNECTION_CLOSED,
                format!("connection {} closed before the reply", self.route),
            )
        })
    }
}

impl Drop for Replier {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let blocks = encode_bottle(&Bottle::new(), self.text_mode).unwrap_or_default();
            // 读任务可能已随连接退出，此时无人等待
            let _ = tx.send(blocks);
        }
    }
}

impl fmt::Debug for Replier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replier")
            .field("route", &self.route)
            .field("expected", &self.tx.is_some())
            .field("answered", &self.answered)
            .finish()
    }
}

/// 交给读者的一条消息。
#[derive(Debug)]
pub struct Delivery {
    bottle: Bottle,
    envelope: Option<Envelope>,
    source: Route,
    replier: Option<Replier>,
}

impl Delivery {
    pub(crate) fn new(
        bottle: Bottle,
        envelope: Option<Envelope>,
        source: Route,
        replier: Option<Replier>,
    ) -> Self {
        Self {
            bottle,
            envelope,
            source,
            replier,
        }
    }

    pub fn bottle(&self) -> &Bottle {
        &self.bottle
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        self.envelope.as_ref()
    }

    /// 消息所经输入连接的路由。
    pub fn source(&self) -> &Route {
        &self.source
    }

    /// 写方是否在等待回复。
    pub fn wants_reply(&self) -> bool {
        self.replier.as_ref().is_some_and(Replier::is_expected)
    }

    /// 取走回复句柄；之后丢弃 `Delivery` 不再自动回复。
    pub fn take_replier(&mut self) -> Option<Replier> {
        self.replier.take()
    }

    /// 拆成负载、信封与回复句柄；不需要回复时句柄为丢弃型。
    pub fn into_parts(mut self) -> (Bottle, Option<Envelope>, Replier) {
        let replier = self
            .replier
            .take()
            .unwrap_or_else(|| Replier::detached(self.source.clone()));
        (self.bottle, self.envelope, replier)
    }
}

/// 入站队列的发送端。
#[derive(Clone, Debug)]
pub(crate) enum InboundSender {
    Bounded(mpsc::Sender<Delivery>),
    Unbounded(mpsc::UnboundedSender<Delivery>),
}

/// 入站队列的接收端。
#[derive(Debug)]
pub(crate) enum InboundReceiver {
    Bounded(mpsc::Receiver<Delivery>),
    Unbounded(mpsc::UnboundedReceiver<Delivery>),
}

/// `capacity == 0` 表示无界。
pub(crate) fn inbound_queue(capacity: usize) -> (InboundSender, InboundReceiver) {
    if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (InboundSender::Unbounded(tx), InboundReceiver::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        (InboundSender::Bounded(tx), InboundReceiver::Bounded(rx))
    }
}

impl InboundSender {
    /// 推入一条消息；队列已关闭时原样交回。
    pub(crate) async fn push(&self, delivery: Delivery) -> std::result::Result<(), Delivery> {
        match self {
            InboundSender::Bounded(tx) => tx.send(delivery).await.map_err(|err| err.0),
            InboundSender::Unbounded(tx) => tx.send(delivery).map_err(|err| err.0),
        }
    }
}

impl InboundReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Delivery> {
        match self {
            InboundReceiver::Bounded(rx) => rx.recv().await,
            InboundReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    pub(crate) fn try_recv(&mut self) -> Option<Delivery> {
        match self {
            InboundReceiver::Bounded(rx) => rx.try_recv().ok(),
            InboundReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    /// 拒绝后续推入；已排队的消息随接收端一起释放。
    pub(crate) fn close(&mut self) {
        match self {
            InboundReceiver::Bounded(rx) => rx.close(),
            InboundReceiver::Unbounded(rx) => rx.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portwire_core::{ConnectionReader, Value};

    fn route() -> Route {
        Route::new("/w", "/r", "tcp")
    }

    fn decode(blocks: &[Bytes]) -> Bottle {
        let mut reader = ConnectionReader::from_blocks(blocks, false);
        let mut bottle = Bottle::new();
        bottle.read(&mut reader).expect("解码回复");
        bottle
    }

    #[test]
    fn reply_exactly_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut replier = Replier::new(tx, false, route());
        replier.reply(&Bottle::new().with("ok")).expect("第一次回复");
        let err = replier.reply(&Bottle::new()).expect_err("第二次回复");
        assert_eq!(err.code(), codes::REPLY_TWICE);
        let blocks = rx.try_recv().expect("回复已送达");
        assert_eq!(decode(&blocks).get(0).and_then(Value::as_str), Some("ok"));
    }

    #[test]
    fn dropped_replier_sends_empty_bottle() {
        let (tx, mut rx) = oneshot::channel();
        drop(Replier::new(tx, false, route()));
        let blocks = rx.try_recv().expect("丢弃时自动回复");
        assert!(decode(&blocks).is_empty());
    }

    #[test]
    fn detached_replier_swallows_reply() {
        let mut replier = Replier::detached(route());
        assert!(!replier.is_expected());
        replier.reply(&Bottle::new().with(1)).expect("丢弃型句柄接受回复");
        assert!(replier.reply(&Bottle::new()).is_err());
    }

    #[tokio::test]
    async fn bounded_queue_refuses_after_close() {
        let (tx, mut rx) = inbound_queue(1);
        tx.push(Delivery::new(Bottle::new(), None, route(), None))
            .await
            .expect("入队");
        assert!(rx.try_recv().is_some());
        rx.close();
        assert!(
            tx.push(Delivery::new(Bottle::new(), None, route(), None))
                .await
                .is_err()
        );
    }
}
