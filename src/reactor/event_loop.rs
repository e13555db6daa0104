/// 反应器事件循环
///
/// 单线程协作式：同一时刻只有一个任务触碰连接表、定时器轮和连接状态单元。

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use super::{timer::TimerWheel, ReactorContext, ReactorDump, ReactorStats, ReactorTask};
use crate::{
    call::OutboundCall,
    connection::{Connection, ConnectionCommand, ConnectionEnv, ConnectionHandle, Direction, Established},
    endpoint::{ConnectionKey, Endpoint, Protocol},
    error::{CloseReason, RpcError},
    protocol::{BoxedStream, ConnectionContext, StreamFactory},
    scheduler::{TaskCallback, TaskOutcome},
    ConnectionId, ScheduledTaskId,
};

const STOP_GRACE: Duration = Duration::from_millis(250);

pub(crate) struct Reactor {
    index: usize,
    tasks: flume::Receiver<ReactorTask>,
    context: ReactorContext,
    stats: Arc<ReactorStats>,
    env: ConnectionEnv,
    wheel: TimerWheel,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    outbound: HashMap<ConnectionKey, ConnectionId>,
    closed_rx: mpsc::UnboundedReceiver<ConnectionId>,
}

impl Reactor {
    pub fn new(
        index: usize,
        tasks: flume::Receiver<ReactorTask>,
        context: ReactorContext,
        stats: Arc<ReactorStats>,
    ) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let env = ConnectionEnv {
            config: context.config.clone(),
            policy: context.policy.clone(),
            dispatcher: context.dispatcher.clone(),
            stats: stats.clone(),
            closed: closed_tx,
        };
        Self {
            index,
            tasks,
            context,
            stats,
            env,
            wheel: TimerWheel::new(),
            connections: HashMap::new(),
            outbound: HashMap::new(),
            closed_rx,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.context.config.coarse_timer_granularity);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_deadline = self.wheel.next_deadline();
            let has_timer = next_deadline.is_some();
            let deadline = next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                task = self.tasks.recv_async() => match task {
                    Ok(ReactorTask::Stop) | Err(_) => break,
                    Ok(task) => self.handle_task(task),
                },
                Some(id) = self.closed_rx.recv() => self.remove_connection(id),
                _ = tokio::time::sleep_until(deadline), if has_timer => self.fire_due_tasks(),
                _ = ticker.tick() => self.scan_idle(),
            }
        }

        self.stop().await;
    }

    fn handle_task(&mut self, task: ReactorTask) {
        match task {
            ReactorTask::QueueOutbound(call) => self.queue_outbound(call),
            ReactorTask::RegisterInbound {
                stream,
                remote,
                protocol,
                context,
            } => self.register_inbound(stream, remote, protocol, context),
            ReactorTask::Schedule { id, deadline, callback } => self.wheel.insert(id, deadline, callback),
            ReactorTask::AbortTask(id) => self.abort_task(id),
            ReactorTask::RemoveTask(id) => {
                if self.wheel.remove(id).is_some() {
                    tracing::debug!("⏰ {} removed on reactor {}", id, self.index);
                }
            }
            ReactorTask::CloseConnectionsTo(ip) => self.close_connections_to(ip),
            ReactorTask::Dump(tx) => self.dump(tx),
            ReactorTask::Stop => {}
        }
    }

    fn queue_outbound(&mut self, call: OutboundCall) {
        let remote = call.remote();
        if let Err(error) = self.context.policy.check(remote.addr()) {
            tracing::debug!("🚫 call to {} rejected: connectivity broken", remote);
            call.complete(Err(error));
            return;
        }

        let key = ConnectionKey::new(remote, call.protocol());
        let existing = self
            .outbound
            .get(&key)
            .and_then(|id| self.connections.get(id))
            .filter(|handle| !handle.shared.state().is_terminating());

        let call = match existing {
            Some(handle) => match handle.send(ConnectionCommand::Queue(call)) {
                Ok(()) => return,
                Err(ConnectionCommand::Queue(call)) => call,
                Err(_) => return,
            },
            None => call,
        };

        self.outbound.remove(&key);
        self.connect(key, call);
    }

    fn connect(&mut self, key: ConnectionKey, call: OutboundCall) {
        let factory = match self.context.stream_factories.get(key.protocol) {
            Ok(factory) => factory,
            Err(error) => {
                call.complete(Err(error));
                return;
            }
        };

        let id = self.next_connection_id();
        let (connection, handle) = Connection::new(id, key.remote, key.protocol, Direction::Client, self.env.clone());
        let establish = self.spawn_establish(factory, key.remote);
        // 新连接的接收端一定存在
        let _ = handle.send(ConnectionCommand::Queue(call));
        tokio::task::spawn_local(connection.run_outbound(establish));

        tracing::debug!("🔌 reactor {} connecting {} to {}", self.index, id, key);
        self.outbound.insert(key, id);
        self.connections.insert(id, handle);
    }

    /// 建连和握手交给 IO 线程池
    fn spawn_establish(
        &self,
        factory: Arc<dyn StreamFactory>,
        remote: Endpoint,
    ) -> tokio::task::JoinHandle<Established> {
        let context_factory = self.context.context_factory.clone();
        let addr = remote.addr();
        let timeout = self.context.config.connect_timeout;
        let bind = self.context.config.outbound_bind_for(&addr);

        self.context.io_pool.spawn(async move {
            let establish = async move {
                let mut stream = factory
                    .connect(addr, bind)
                    .await
                    .map_err(|e| RpcError::connectivity(Some(addr), format!("connect failed: {}", e)))?;
                let mut context = context_factory.new_context(Direction::Client);
                context.client_handshake(&mut stream).await?;
                Ok::<_, RpcError>((stream, context))
            };
            match tokio::time::timeout(timeout, establish).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::connectivity(
                    Some(addr),
                    format!("connect timed out after {:?}", timeout),
                )),
            }
        })
    }

    fn register_inbound(
        &mut self,
        stream: BoxedStream,
        remote: Endpoint,
        protocol: Protocol,
        context: Box<dyn ConnectionContext>,
    ) {
        let id = self.next_connection_id();
        let (connection, handle) = Connection::new(id, remote, protocol, Direction::Server, self.env.clone());
        tokio::task::spawn_local(connection.run_inbound(stream, context));
        tracing::debug!("🔗 reactor {} accepted {} from {}", self.index, id, remote);
        self.connections.insert(id, handle);
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.context.connection_ids.fetch_add(1, Ordering::Relaxed))
    }

    fn remove_connection(&mut self, id: ConnectionId) {
        if let Some(handle) = self.connections.remove(&id) {
            self.forget_outbound(&handle);
        }
    }

    /// 只在键仍指向该连接时移除
    fn forget_outbound(&mut self, handle: &ConnectionHandle) {
        if handle.direction != Direction::Client {
            return;
        }
        let key = ConnectionKey::new(handle.remote, handle.protocol);
        if self.outbound.get(&key) == Some(&handle.id) {
            self.outbound.remove(&key);
        }
    }

    fn fire_due_tasks(&mut self) {
        for (id, callback) in self.wheel.pop_due(Instant::now()) {
            self.resolve_task(id, callback, false);
        }
    }

    fn abort_task(&mut self, id: ScheduledTaskId) {
        if let Some(callback) = self.wheel.remove(id) {
            self.resolve_task(id, callback, true);
        }
    }

    /// 认领并执行任务回调；`cancel` 为 true 时即使仍是 Pending 也以 Cancelled 执行
    fn resolve_task(&self, id: ScheduledTaskId, callback: TaskCallback, cancel: bool) {
        match self.context.scheduler.claim(id) {
            TaskOutcome::FiredOk if !cancel => {
                self.stats.record_task_fired();
                tracing::debug!("⏰ {} fired on reactor {}", id, self.index);
                callback(Ok(()));
            }
            TaskOutcome::FiredOk | TaskOutcome::FiredCancelled => {
                self.stats.record_task_cancelled();
                tracing::debug!("⏰ {} cancelled on reactor {}", id, self.index);
                callback(Err(RpcError::cancelled(format!("{} aborted", id))));
            }
            TaskOutcome::NotFound => {}
        }
    }

    fn scan_idle(&mut self) {
        let now = Instant::now();
        let keepalive = self.context.config.connection_keepalive_time;
        let idle: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|handle| handle.shared.is_idle(now, keepalive))
            .map(|handle| handle.id)
            .collect();

        for id in idle {
            if let Some(handle) = self.connections.remove(&id) {
                tracing::debug!("💤 reactor {} evicting idle {} to {}", self.index, id, handle.remote);
                let _ = handle.send(ConnectionCommand::Close(CloseReason::Idle));
                // 不再复用，新调用会建立新连接
                self.forget_outbound(&handle);
                self.connections.insert(id, handle);
            }
        }
    }

    fn close_connections_to(&mut self, ip: IpAddr) {
        let matching: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|handle| handle.remote.ip() == ip)
            .map(|handle| handle.id)
            .collect();

        for id in matching {
            if let Some(handle) = self.connections.remove(&id) {
                tracing::info!("🚫 reactor {} closing {} to {}: connectivity broken", self.index, id, handle.remote);
                let _ = handle.send(ConnectionCommand::Close(CloseReason::ConnectivityBroken));
                self.forget_outbound(&handle);
                self.connections.insert(id, handle);
            }
        }
    }

    fn dump(&self, tx: oneshot::Sender<ReactorDump>) {
        let requests: Vec<_> = self
            .connections
            .values()
            .filter_map(|handle| {
                let (dump_tx, dump_rx) = oneshot::channel();
                handle.send(ConnectionCommand::Dump(dump_tx)).ok().map(|_| dump_rx)
            })
            .collect();
        let reactor_index = self.index;
        let scheduled_tasks = self.wheel.len();

        tokio::task::spawn_local(async move {
            let mut connections = Vec::with_capacity(requests.len());
            for request in requests {
                if let Ok(dump) = request.await {
                    connections.push(dump);
                }
            }
            connections.sort_by_key(|dump| dump.id);
            let _ = tx.send(ReactorDump {
                reactor_index,
                connections,
                scheduled_tasks,
            });
        });
    }

    /// 停止：取消剩余任务，排空连接
    async fn stop(&mut self) {
        tracing::info!(
            "🛑 reactor {} stopping: {} connections, {} scheduled tasks",
            self.index,
            self.connections.len(),
            self.wheel.len()
        );

        for (id, callback) in self.wheel.drain() {
            self.resolve_task(id, callback, true);
        }

        // 闸门关闭后 Stop 是最后一条消息，这里只是兜底
        while let Ok(task) = self.tasks.try_recv() {
            self.reject_task(task);
        }

        for handle in self.connections.values() {
            let _ = handle.send(ConnectionCommand::Close(CloseReason::Shutdown));
        }
        self.outbound.clear();

        // 连接在自己的排空截止时间失败剩余调用，这里多等一个余量让它们先完成
        let config = &self.context.config;
        let deadline = Instant::now() + config.shutdown_drain_timeout + config.coarse_timer_granularity + STOP_GRACE;
        while !self.connections.is_empty() {
            match tokio::time::timeout_at(deadline, self.closed_rx.recv()).await {
                Ok(Some(id)) => {
                    self.connections.remove(&id);
                }
                Ok(None) | Err(_) => break,
            }
        }

        if !self.connections.is_empty() {
            tracing::warn!(
                "⚠️ reactor {} stopped with {} undrained connections",
                self.index,
                self.connections.len()
            );
        }
    }

    fn reject_task(&mut self, task: ReactorTask) {
        match task {
            ReactorTask::QueueOutbound(call) => {
                call.complete(Err(RpcError::service_unavailable("messenger is shutting down")));
            }
            ReactorTask::Schedule { id, callback, .. } => self.resolve_task(id, callback, true),
            other => tracing::debug!("reactor {} dropped {:?} during stop", self.index, other),
        }
    }
}
