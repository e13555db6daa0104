/// 连接
///
/// 每条连接是所属反应器线程上的一个本地任务（Actor 模式），从创建到销毁都不会迁移。
/// 反应器通过命令通道与连接交互；入站调用的响应者也持有同一通道的发送端，
/// 因此服务可以在任意线程上回复。
///
/// 客户端方向连接发送请求、读取响应；服务端方向连接读取请求、发送响应。

pub mod pending;
pub mod state;

pub use pending::PendingCalls;
pub use state::{ConnectionShared, ConnectionState, Direction};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{
    call::{CallResponder, InboundCall, OutboundCall},
    config::MessengerConfig,
    connectivity::ConnectivityPolicy,
    endpoint::{Endpoint, Protocol},
    error::{CloseReason, RpcError},
    frame::{FrameDecoder, RequestFrame, ResponseFrame},
    protocol::{BoxedStream, ConnectionContext},
    reactor::ReactorStats,
    service::InboundDispatcher,
    status::{Status, StatusCode},
    CallId, ConnectionId,
};

/// 发给连接任务的命令
#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    /// 发送出站调用
    Queue(OutboundCall),
    /// 回复入站调用
    Respond {
        call_id: CallId,
        result: Result<Bytes, Status>,
    },
    /// 关闭连接
    Close(CloseReason),
    /// 状态快照
    Dump(oneshot::Sender<ConnectionDump>),
}

/// 连接状态快照
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDump {
    pub id: ConnectionId,
    pub remote: Endpoint,
    pub protocol: String,
    pub direction: Direction,
    pub state: ConnectionState,
    pub idle_ms: u64,
    /// 已发出、等待响应的调用
    pub outbound_call_ids: Vec<CallId>,
    /// 已分发、尚未回复的入站调用
    pub inbound_call_ids: Vec<CallId>,
    /// 建连期间排队的调用数
    pub queued_calls: usize,
    pub context: serde_json::Value,
}

/// 连接运行所需的反应器资源
#[derive(Clone)]
pub(crate) struct ConnectionEnv {
    pub config: Arc<MessengerConfig>,
    pub policy: Arc<ConnectivityPolicy>,
    pub dispatcher: Arc<InboundDispatcher>,
    pub stats: Arc<ReactorStats>,
    /// 连接结束时通知反应器
    pub closed: mpsc::UnboundedSender<ConnectionId>,
}

/// 反应器持有的连接句柄
pub(crate) struct ConnectionHandle {
    pub id: ConnectionId,
    pub remote: Endpoint,
    pub protocol: Protocol,
    pub direction: Direction,
    pub shared: Rc<ConnectionShared>,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl ConnectionHandle {
    /// 连接任务已退出时把命令原样还回
    pub fn send(&self, command: ConnectionCommand) -> Result<(), ConnectionCommand> {
        self.commands.send(command).map_err(|e| e.0)
    }
}

/// 建连结果：字节流与已完成握手的上下文
pub(crate) type Established = Result<(BoxedStream, Box<dyn ConnectionContext>), RpcError>;

pub(crate) struct Connection {
    id: ConnectionId,
    remote: Endpoint,
    protocol: Protocol,
    direction: Direction,
    shared: Rc<ConnectionShared>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    responder_tx: mpsc::UnboundedSender<ConnectionCommand>,
    env: ConnectionEnv,
    pending: PendingCalls,
    inflight: HashSet<CallId>,
    queued: VecDeque<OutboundCall>,
    decoder: FrameDecoder,
    outbox: BytesMut,
    context: Option<Box<dyn ConnectionContext>>,
    close_reason: Option<CloseReason>,
    aborted: bool,
    drain_deadline: Option<Instant>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        remote: Endpoint,
        protocol: Protocol,
        direction: Direction,
        env: ConnectionEnv,
    ) -> (Self, ConnectionHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Rc::new(ConnectionShared::new());
        let handle = ConnectionHandle {
            id,
            remote,
            protocol,
            direction,
            shared: shared.clone(),
            commands: tx.clone(),
        };
        let connection = Self {
            id,
            remote,
            protocol,
            direction,
            shared,
            commands: rx,
            responder_tx: tx,
            decoder: FrameDecoder::new(env.config.max_frame_size),
            env,
            pending: PendingCalls::new(),
            inflight: HashSet::new(),
            queued: VecDeque::new(),
            outbox: BytesMut::with_capacity(8192),
            context: None,
            close_reason: None,
            aborted: false,
            drain_deadline: None,
        };
        (connection, handle)
    }

    /// 客户端连接：等待 IO 线程池建连和握手，期间到达的调用按序排队
    pub async fn run_outbound(mut self, establish: JoinHandle<Established>) {
        if let Some(stream) = self.await_established(establish).await {
            self.run_open(stream).await;
        }
    }

    /// 服务端连接：握手已在 IO 线程池上完成
    pub async fn run_inbound(mut self, stream: BoxedStream, context: Box<dyn ConnectionContext>) {
        self.context = Some(context);
        self.run_open(stream).await;
    }

    async fn await_established(&mut self, mut establish: JoinHandle<Established>) -> Option<BoxedStream> {
        loop {
            let draining = self.drain_deadline.is_some();
            let deadline = self.drain_deadline.unwrap_or_else(far_future);

            tokio::select! {
                joined = &mut establish => {
                    let result = joined.unwrap_or_else(|e| Err(RpcError::connectivity(
                        Some(self.remote.addr()),
                        format!("connect task failed: {}", e),
                    )));
                    match result {
                        Ok((stream, context)) => {
                            self.context = Some(context);
                            return Some(stream);
                        }
                        Err(error) => {
                            tracing::warn!("⚠️ {} connect to {} failed: {}", self.id, self.remote, error);
                            self.finish_with_error(CloseReason::Error(error.to_string()), as_connectivity(error, self.remote));
                            return None;
                        }
                    }
                }
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Queue(call)) => {
                        if self.close_reason.is_some() {
                            let error = self.close_error();
                            call.complete(Err(error));
                        } else {
                            self.queued.push_back(call);
                            self.update_outstanding();
                        }
                    }
                    Some(ConnectionCommand::Close(reason)) => {
                        if is_graceful(&reason) {
                            // 建连完成后发出排队的调用再排空
                            if self.close_reason.is_none() {
                                self.close_reason = Some(reason);
                                self.drain_deadline = Some(Instant::now() + self.env.config.shutdown_drain_timeout);
                            }
                        } else {
                            establish.abort();
                            self.finish(reason);
                            return None;
                        }
                    }
                    Some(ConnectionCommand::Dump(tx)) => {
                        let _ = tx.send(self.dump());
                    }
                    Some(ConnectionCommand::Respond { call_id, .. }) => {
                        tracing::warn!("⚠️ {} got a response for {} while connecting", self.id, call_id);
                    }
                    None => {
                        establish.abort();
                        self.finish(CloseReason::Shutdown);
                        return None;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if draining => {
                    establish.abort();
                    tracing::warn!("⚠️ {} still connecting to {} at drain deadline", self.id, self.remote);
                    let reason = self.close_reason.clone().unwrap_or(CloseReason::Shutdown);
                    self.finish(reason);
                    return None;
                }
            }
        }
    }

    async fn run_open(&mut self, stream: BoxedStream) {
        if let Err(error) = self.shared.transition(ConnectionState::Open) {
            tracing::error!("❌ {} cannot open: {}", self.id, error);
            self.finish(CloseReason::Error(error.to_string()));
            return;
        }
        self.shared.touch();
        self.env.stats.record_connection_opened();
        tracing::info!(
            "🔗 {} open: {} {}://{}",
            self.id,
            self.direction,
            self.protocol,
            self.remote
        );

        let (mut reader, mut writer) = tokio::io::split(stream);

        while let Some(call) = self.queued.pop_front() {
            self.send_call(call);
        }
        if let Some(reason) = self.close_reason.take() {
            self.begin_close(reason);
        }

        let reason = loop {
            if let Some(reason) = self.finished_reason() {
                break reason;
            }

            let reading = self.wants_read();
            let writing = !self.outbox.is_empty();
            let draining = self.drain_deadline.is_some();
            let deadline = self.drain_deadline.unwrap_or_else(far_future);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.begin_close(CloseReason::Shutdown),
                },
                read = self.decoder.fill_from(&mut reader), if reading => match read {
                    Ok(0) => self.abort_with(CloseReason::Normal),
                    Ok(_) => {
                        self.shared.touch();
                        self.process_frames();
                    }
                    Err(e) => {
                        tracing::error!("❌ {} read from {} failed: {}", self.id, self.remote, e);
                        self.abort_with(CloseReason::Error(format!("read failed: {}", e)));
                    }
                },
                written = writer.write_buf(&mut self.outbox), if writing => match written {
                    Ok(_) => self.shared.touch(),
                    Err(e) => {
                        tracing::error!("❌ {} write to {} failed: {}", self.id, self.remote, e);
                        self.abort_with(CloseReason::Error(format!("write failed: {}", e)));
                    }
                },
                _ = tokio::time::sleep_until(deadline), if draining => {
                    tracing::warn!(
                        "⚠️ {} drain deadline reached with {} pending, {} in flight",
                        self.id,
                        self.pending.len(),
                        self.inflight.len()
                    );
                    let reason = self.close_reason.clone().unwrap_or(CloseReason::Shutdown);
                    self.abort_with(reason);
                }
            }
        };

        if !self.aborted {
            let _ = writer.shutdown().await;
        }
        self.finish(reason);
    }

    fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Queue(call) => {
                if self.shared.state().is_terminating() {
                    let error = self.close_error();
                    call.complete(Err(error));
                } else {
                    self.send_call(call);
                }
            }
            ConnectionCommand::Respond { call_id, result } => self.send_response(call_id, result),
            ConnectionCommand::Close(reason) => self.begin_close(reason),
            ConnectionCommand::Dump(tx) => {
                let _ = tx.send(self.dump());
            }
        }
    }

    fn send_call(&mut self, call: OutboundCall) {
        if self.direction != Direction::Client {
            debug_assert!(false, "outbound call queued on a server connection");
            call.complete(Err(RpcError::illegal_state("outbound call queued on a server connection")));
            return;
        }

        // 写出前再检查一次连通性
        if let Err(error) = self.env.policy.check(self.remote.addr()) {
            call.complete(Err(error));
            self.abort_with(CloseReason::ConnectivityBroken);
            return;
        }

        let call_id = self.pending.register(call);
        let frame = match self.pending.get(call_id).map(OutboundCall::to_request_frame) {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                self.pending.complete(call_id, Err(error));
                return;
            }
            None => return,
        };

        if let Err(error) = self.encode_request(&frame) {
            self.pending.complete(call_id, Err(error));
            return;
        }

        self.env.stats.record_call_sent();
        self.update_outstanding();
        tracing::debug!(
            "📤 {} call {} {}.{} ({} bytes)",
            self.id,
            call_id,
            frame.service,
            frame.method,
            frame.payload.len()
        );
    }

    fn encode_request(&mut self, frame: &RequestFrame) -> Result<(), RpcError> {
        let max = self.env.config.max_frame_size;
        if frame.body_len() > max {
            return Err(RpcError::protocol_error(
                self.protocol.name(),
                format!("request of {} bytes exceeds max frame size {}", frame.body_len(), max),
            ));
        }
        frame.encode(&mut self.outbox)?;
        Ok(())
    }

    fn send_response(&mut self, call_id: CallId, result: Result<Bytes, Status>) {
        if !self.inflight.remove(&call_id) {
            tracing::warn!("⚠️ {} response for unknown inbound call {}", self.id, call_id);
            return;
        }
        self.update_outstanding();

        if self.aborted || self.shared.state() == ConnectionState::Closed {
            return;
        }
        if self.env.policy.is_blocked(&self.remote.ip()) {
            self.abort_with(CloseReason::ConnectivityBroken);
            return;
        }

        let mut frame = match result {
            Ok(payload) => ResponseFrame::success(call_id, payload),
            Err(status) => ResponseFrame::failure(call_id, &status),
        };
        let max = self.env.config.max_frame_size;
        if frame.body_len() > max {
            tracing::warn!("⚠️ {} response for {} exceeds max frame size", self.id, call_id);
            frame = ResponseFrame::failure(
                call_id,
                &Status::new(
                    StatusCode::ProtocolError,
                    format!("response exceeds max frame size {}", max),
                ),
            );
        }
        if let Err(error) = frame.encode(&mut self.outbox) {
            tracing::error!("❌ {} failed to encode response {}: {}", self.id, call_id, error);
            return;
        }
        tracing::debug!("📤 {} response {} ({})", self.id, call_id, frame.code);
    }

    fn process_frames(&mut self) {
        while !self.aborted {
            let body = match self.decoder.next_frame() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(error) => {
                    tracing::error!("❌ {} bad frame from {}: {}", self.id, self.remote, error);
                    self.abort_with(CloseReason::Error(error.to_string()));
                    break;
                }
            };

            let handled = match self.direction {
                Direction::Client => self.on_response(body),
                Direction::Server => self.on_request(body),
            };
            if let Err(error) = handled {
                tracing::error!("❌ {} protocol error from {}: {}", self.id, self.remote, error);
                self.abort_with(CloseReason::Error(error.to_string()));
            }
        }
    }

    fn on_response(&mut self, body: Bytes) -> Result<(), RpcError> {
        let frame = ResponseFrame::decode(body)?;
        let call_id = frame.call_id;
        let result = frame.into_result().map_err(RpcError::from_status);
        self.env.stats.record_response_received();
        self.pending.complete(call_id, result);
        self.update_outstanding();
        Ok(())
    }

    fn on_request(&mut self, body: Bytes) -> Result<(), RpcError> {
        let frame = RequestFrame::decode(body)?;
        let call_id = frame.call_id;
        if !self.inflight.insert(call_id) {
            return Err(RpcError::protocol_error(
                self.protocol.name(),
                format!("duplicate in-flight call id {}", call_id),
            ));
        }
        self.update_outstanding();
        self.env.stats.record_inbound_dispatched();
        tracing::debug!("📥 {} call {} {}.{}", self.id, call_id, frame.service, frame.method);

        let responder = CallResponder::new(call_id, self.responder_tx.clone());
        let call = InboundCall::new(frame, self.remote, responder);
        self.env.dispatcher.queue_inbound_call(call);
        Ok(())
    }

    /// 优雅关闭：停止接收新工作，排空在途调用，直到排空或截止时间
    fn begin_close(&mut self, reason: CloseReason) {
        if !is_graceful(&reason) {
            self.abort_with(reason);
            return;
        }
        if self.shared.state() != ConnectionState::Open {
            return;
        }
        if let Err(error) = self.shared.transition(ConnectionState::Closing) {
            tracing::error!("❌ {}: {}", self.id, error);
        }
        tracing::debug!("{} closing: {}", self.id, reason);
        self.close_reason = Some(reason);
        self.drain_deadline = Some(Instant::now() + self.env.config.shutdown_drain_timeout);
    }

    /// 立即关闭
    fn abort_with(&mut self, reason: CloseReason) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        if self.shared.state() == ConnectionState::Open {
            let _ = self.shared.transition(ConnectionState::Closing);
        }
        self.close_reason = Some(reason);
    }

    fn finished_reason(&self) -> Option<CloseReason> {
        let reason = || self.close_reason.clone().unwrap_or(CloseReason::Normal);
        if self.aborted {
            return Some(reason());
        }
        let drained = self.pending.is_empty() && self.inflight.is_empty() && self.outbox.is_empty();
        if self.shared.state() == ConnectionState::Closing && drained {
            return Some(reason());
        }
        None
    }

    fn wants_read(&self) -> bool {
        if self.aborted {
            return false;
        }
        match self.shared.state() {
            ConnectionState::Open => true,
            // 客户端在排空期间仍需读取响应
            ConnectionState::Closing => self.direction == Direction::Client && !self.pending.is_empty(),
            _ => false,
        }
    }

    fn finish(&mut self, reason: CloseReason) {
        self.close_reason = Some(reason.clone());
        let error = self.close_error();
        self.finish_with_error(reason, error);
    }

    fn finish_with_error(&mut self, reason: CloseReason, error: RpcError) {
        if self.shared.state() != ConnectionState::Closed {
            let _ = self.shared.transition(ConnectionState::Closed);
        }

        let mut failed = self.pending.fail_all(&error);
        for call in self.queued.drain(..) {
            call.complete(Err(error.clone()));
            failed += 1;
        }
        self.inflight.clear();
        self.update_outstanding();
        self.env.stats.record_connection_closed();

        if failed > 0 {
            tracing::warn!("🔌 {} to {} closed: {} ({} calls failed)", self.id, self.remote, reason, failed);
        } else {
            tracing::info!("🔌 {} to {} closed: {}", self.id, self.remote, reason);
        }
        let _ = self.env.closed.send(self.id);
    }

    fn close_error(&self) -> RpcError {
        let reason = self.close_reason.clone().unwrap_or(CloseReason::Normal);
        RpcError::connectivity(
            Some(self.remote.addr()),
            format!("{} closed: {}", self.id, reason),
        )
    }

    fn update_outstanding(&self) {
        self.shared
            .set_outstanding(self.pending.len() + self.inflight.len() + self.queued.len());
    }

    fn dump(&self) -> ConnectionDump {
        let mut inbound_call_ids: Vec<_> = self.inflight.iter().copied().collect();
        inbound_call_ids.sort_by_key(|id| id.as_u32());
        ConnectionDump {
            id: self.id,
            remote: self.remote,
            protocol: self.protocol.name().to_string(),
            direction: self.direction,
            state: self.shared.state(),
            idle_ms: self.shared.idle_for(Instant::now()).as_millis() as u64,
            outbound_call_ids: self.pending.call_ids(),
            inbound_call_ids,
            queued_calls: self.queued.len(),
            context: self
                .context
                .as_ref()
                .map(|context| context.dump())
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

fn is_graceful(reason: &CloseReason) -> bool {
    matches!(reason, CloseReason::Normal | CloseReason::Idle | CloseReason::Shutdown)
}

fn as_connectivity(error: RpcError, remote: Endpoint) -> RpcError {
    match error {
        RpcError::Connectivity { .. } => error,
        other => RpcError::connectivity(Some(remote.addr()), other.to_string()),
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365)
}
