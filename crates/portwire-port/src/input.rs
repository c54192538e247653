//! # 输入连接
//!
//! ## 意图（Why）
//! - 端口监听器接受的每个通道都由一个独立任务服务：握手、逐条读取、投递、回应；
//!   不同输入连接互不阻塞，同一连接上的消息严格按到达顺序投递。
//!
//! ## 逻辑（How）
//! 1. 接受任务在 TCP 监听器与进程内监听器上同时等待，每个新通道派生一个服务任务；
//! 2. 服务任务完成服务端握手后登记到端口（同名旧输入先被关闭），随后进入读循环；
//! 3. 数据消息先推入端口队列，推入成功后才发送确认；请求回复的消息在回复写回之前
//!    不读取下一条（`AwaitingReply`）；
//! 4. 管理与路由命令就地执行，结果作为回复写回。
//!
//! ## 契约（What）
//! - 协议违规与 IO 错误只关闭本连接，并以 `Misc` 事件通知端口观察者；
//! - 对端正常关闭不产生 `Misc` 事件。

use std::sync::Weak;

use portwire_carriers::handshake::{self, Established};
use portwire_core::error::{ErrorKind, Result, codes};
use portwire_core::{Bottle, CommandKey, Envelope, PortInfo, Route};
use portwire_transport::{BoxStream, CancellationSignal, LocalListener, TcpListener};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::admin::{self, AdminRequest};
use crate::connection::{decode_bottle, within};
use crate::delivery::{Delivery, Replier, encode_bottle};
use crate::port::{Port, PortInner};
use crate::protocol::{Phase, ProtocolState};

/// 端口上一条输入连接的登记项。
#[derive(Debug)]
pub(crate) struct InputHandle {
    pub(crate) id: u64,
    pub(crate) route: Route,
    pub(crate) cancel: CancellationSignal,
}

/// 接受循环：端口关闭或被释放时退出。
pub(crate) async fn accept_loop(
    port: Weak<PortInner>,
    tcp: TcpListener,
    mut local: LocalListener,
    closed: CancellationSignal,
) {
    loop {
        let stream: BoxStream = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            accepted = tcp.accept(Some(&closed)) => match accepted {
                Ok((channel, peer)) => {
                    debug!(%peer, "tcp connection accepted");
                    Box::new(channel) as BoxStream
                }
                Err(err) if matches!(err.kind(), ErrorKind::Closed) => break,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            },
            accepted = local.accept(Some(&closed)) => match accepted {
                Ok(channel) => Box::new(channel) as BoxStream,
                Err(_) => break,
            },
        };
        let Some(inner) = port.upgrade() else {
            break;
        };
        tokio::spawn(serve(Port::from_inner(inner), stream).in_current_span());
    }
    debug!(key = local.key(), "acceptor stopped");
}

/// 单条输入连接的完整生命周期。
async fn serve(port: Port, stream: BoxStream) {
    let shared = port.shared().clone();
    let accepted = within(
        Some(shared.config.connect_timeout()),
        codes::HANDSHAKE_FAILED,
        "inbound handshake",
        handshake::accept(&shared.registry, &shared.options, stream),
    )
    .await;
    let session = match accepted {
        Ok(session) => session,
        Err(err) => {
            warn!(port = port.name(), error = %err, "inbound handshake failed");
            return;
        }
    };

    let route = Route::new(
        session.sender.clone(),
        port.name().to_owned(),
        session.carrier.name().to_owned(),
    );
    let cancel = CancellationSignal::new();
    let id = port.inner().attach_input(route.clone(), cancel.clone());
    let span = info_span!("input", route = %route);
    read_loop(&port, session, &route, &cancel)
        .instrument(span)
        .await;
    port.inner().detach_input(id, &route);
}

enum Flow {
    Continue,
    Quit,
}

async fn read_loop(
    port: &Port,
    mut session: Established,
    route: &Route,
    cancel: &CancellationSignal,
) {
    let closed = port.inner().closed.clone();
    let mut state = ProtocolState::new();
    let mut failure = None;
    if let Err(err) = state.advance(Phase::Established) {
        failure = Some(err);
    }

    while failure.is_none() {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = closed.cancelled() => break,
            frame = session.carrier.read(session.stream.as_mut()) => frame,
        };
        let outcome = match frame {
            Ok(frame) => handle_frame(port, &mut session, route, &mut state, cancel, frame).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(err) => failure = Some(err),
        }
    }

    if state.phase().is_open() {
        let _ = state.advance(Phase::Closing);
    }
    let _ = session.stream.shutdown().await;
    match failure {
        Some(err) if matches!(err.kind(), ErrorKind::Closed) => {
            info!(%route, "input closed by peer");
            state.close();
        }
        Some(err) => {
            warn!(%route, error = %err, "input connection failed");
            port.inner()
                .emit(PortInfo::misc(route.clone(), format!("input failed: {err}")));
            state.fail(err.code());
        }
        None => {
            info!(%route, "input closed");
            state.close();
        }
    }
}

async fn handle_frame(
    port: &Port,
    session: &mut Established,
    route: &Route,
    state: &mut ProtocolState,
    cancel: &CancellationSignal,
    frame: portwire_carriers::Frame,
) -> Result<Flow> {
    let caps = session.carrier.capabilities();
    let key = frame.command.key();
    if key.carries_data() {
        let bottle = decode_bottle(&frame.blocks, caps.text_mode)?;
        let envelope = frame
            .command
            .envelope()
            .map(Envelope::from_text)
            .transpose()?;

        if frame.command.wants_reply() && caps.supports_reply {
            state.advance(Phase::AwaitingReply)?;
            let (tx, rx) = oneshot::channel();
            let replier = Replier::new(tx, caps.text_mode, route.clone());
            let delivery = Delivery::new(bottle, envelope, route.clone(), Some(replier));
            if !port.inner().deliver(delivery, cancel).await {
                return Ok(Flow::Quit);
            }
            let closed = port.inner().closed.clone();
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Flow::Quit),
                _ = closed.cancelled() => return Ok(Flow::Quit),
                reply = rx => reply,
            };
            let blocks = match reply {
                Ok(blocks) => blocks,
                Err(_) => encode_bottle(&Bottle::new(), caps.text_mode)?,
            };
            session
                .carrier
                .respond(session.stream.as_mut(), Some(blocks.as_slice()))
                .await?;
        } else {
            state.advance(Phase::Streaming)?;
            let delivery = Delivery::new(bottle, envelope, route.clone(), None);
            if !port.inner().deliver(delivery, cancel).await {
                return Ok(Flow::Quit);
            }
            session.carrier.respond(session.stream.as_mut(), None).await?;
        }
        state.advance(Phase::Streaming)?;
        return Ok(Flow::Continue);
    }

    let request = match key {
        CommandKey::Quit => return Ok(Flow::Quit),
        CommandKey::Admin => {
            AdminRequest::from_bottle(&decode_bottle(&frame.blocks, caps.text_mode)?)
        }
        _ => AdminRequest::from_command(&frame.command),
    };
    let reply = match request {
        Ok(request) => admin::execute(port, request).await,
        Err(err) => Err(err),
    };
    let reply = admin::reply_bottle(reply);
    let blocks = encode_bottle(&reply, caps.text_mode)?;
    let reply = caps.supports_reply.then_some(blocks.as_slice());
    session.carrier.respond(session.stream.as_mut(), reply).await?;
    Ok(Flow::Continue)
}

/// 端口一侧对输入连接的登记与投递。
impl PortInner {
    /// 登记输入；同名的旧输入立即关闭并移出列表。
    pub(crate) fn attach_input(&self, route: Route, cancel: CancellationSignal) -> u64 {
        let id = self.next_input_id();
        {
            let mut inputs = self.inputs.lock();
            if !route.from_name().is_empty() {
                inputs.retain(|existing| {
                    let duplicate = existing.route.from_name() == route.from_name();
                    if duplicate {
                        info!(route = %existing.route, "replacing duplicate input");
                        existing.cancel.cancel();
                    }
                    !duplicate
                });
            }
            inputs.push(InputHandle {
                id,
                route: route.clone(),
                cancel,
            });
        }
        info!(%route, "input connected");
        self.emit(PortInfo::incoming(route, true));
        id
    }

    pub(crate) fn detach_input(&self, id: u64, route: &Route) {
        self.inputs.lock().retain(|handle| handle.id != id);
        self.emit(PortInfo::incoming(route.clone(), false));
    }

    /// 关闭所有来源为 `source` 的输入。
    pub(crate) fn drop_inputs(&self, source: &str) -> bool {
        let inputs = self.inputs.lock();
        let mut found = false;
        for handle in inputs.iter().filter(|handle| handle.route.from_name() == source) {
            handle.cancel.cancel();
            found = true;
        }
        found
    }

    /// 推入入站队列；端口关闭或连接被取消时返回 `false`。
    pub(crate) async fn deliver(&self, delivery: Delivery, cancel: &CancellationSignal) -> bool {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            _ = cancel.cancelled() => false,
            pushed = self.inbound_tx.push(delivery) => pushed.is_ok(),
        }
    }
}
