/// Messenger：节点间 RPC 的统一入口
///
/// 持有反应器池、IO 线程池、接入器、服务注册表、连通性黑名单和调度器。
///
/// 所有权：`Messenger` 是唯一的所有者，析构时执行关闭。反应器线程只持有子组件，
/// 需要回指 Messenger 的代码（服务、回调、`Proxy`）使用弱引用的 `MessengerHandle`。

pub mod builder;

pub use builder::MessengerBuilder;

use parking_lot::Mutex;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::{
    acceptor::{Acceptor, AcceptorEnv},
    call::{InboundCall, OutboundCall},
    config::MessengerConfig,
    connectivity::ConnectivityPolicy,
    endpoint::{reactor_index_for, Endpoint, Protocol},
    error::RpcError,
    io_pool::IoThreadPool,
    protocol::{ConnectionContextFactory, StreamFactory, StreamFactoryRegistry},
    proxy::{Proxy, ProxyContext},
    reactor::{self, ReactorContext, ReactorDump, ReactorPool, ReactorStatsSnapshot, ReactorTask},
    scheduler::{Scheduler, SchedulerTable},
    service::{InboundDispatcher, RpcService, ServiceRegistry},
    ScheduledTaskId,
};

static MESSENGER_IDS: AtomicU64 = AtomicU64::new(1);

/// `dump_running_rpcs` 的结果
#[derive(Debug, Clone, Serialize)]
pub struct DumpRunningRpcs {
    pub messenger: String,
    pub reactors: Vec<ReactorDump>,
    pub services: Vec<String>,
    pub blocked_peers: Vec<IpAddr>,
    pub pending_scheduled_tasks: usize,
}

impl DumpRunningRpcs {
    pub fn num_connections(&self) -> usize {
        self.reactors.iter().map(|reactor| reactor.connections.len()).sum()
    }
}

pub(crate) struct MessengerInner {
    id: u64,
    config: Arc<MessengerConfig>,
    closing: Arc<AtomicBool>,
    registry: Arc<ServiceRegistry>,
    dispatcher: Arc<InboundDispatcher>,
    policy: Arc<ConnectivityPolicy>,
    scheduler: Scheduler,
    pool: Arc<ReactorPool>,
    io_pool: Arc<IoThreadPool>,
    stream_factories: Arc<StreamFactoryRegistry>,
    context_factory: Arc<dyn ConnectionContextFactory>,
    listen_protocol: Protocol,
    acceptors: Mutex<Vec<Arc<Acceptor>>>,
    accepted: Arc<AtomicU64>,
    /// 关闭时取走并 join；持锁期间并发的关闭调用会等待
    reactor_threads: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl MessengerInner {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn queue_outbound_call(&self, call: OutboundCall) {
        if self.is_closing() {
            call.complete(Err(RpcError::service_unavailable("messenger is shutting down")));
            return;
        }
        let reactor = reactor_index_for(&call.remote(), self.pool.len());
        if let Err(ReactorTask::QueueOutbound(call)) = self.pool.post(reactor, ReactorTask::QueueOutbound(call)) {
            call.complete(Err(RpcError::service_unavailable("messenger is shutting down")));
        }
    }

    fn schedule_on_reactor<F>(&self, delay: Duration, callback: F) -> Result<ScheduledTaskId, RpcError>
    where
        F: FnOnce(Result<(), RpcError>) + Send + 'static,
    {
        if self.is_closing() {
            return Err(RpcError::service_unavailable("messenger is shutting down"));
        }
        self.scheduler.schedule_on_reactor(delay, Box::new(callback))
    }

    fn shutdown(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            tracing::info!("🛑 messenger {} shutting down", self.config.name);
        }

        for acceptor in self.acceptors.lock().drain(..) {
            acceptor.stop();
        }
        self.registry.unregister_all();
        self.pool.close();

        // 在自己的反应器线程上不能 join 自己，只发信号；线程由所有者稍后回收
        if let Some(index) = reactor::current_reactor(self.id) {
            tracing::debug!("shutdown requested from reactor {}, not joining", index);
            return;
        }

        let mut threads = self.reactor_threads.lock();
        if let Some(handles) = threads.take() {
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("❌ reactor thread of {} panicked", self.config.name);
                }
            }
            self.io_pool.shutdown();
            tracing::info!("✅ messenger {} stopped", self.config.name);
        }
    }
}

/// Messenger 所有者
pub struct Messenger {
    inner: Arc<MessengerInner>,
}

impl Messenger {
    pub fn builder(name: impl Into<String>) -> MessengerBuilder {
        MessengerBuilder::new(name)
    }

    pub(crate) fn start(builder: MessengerBuilder) -> Result<Self, RpcError> {
        let MessengerBuilder {
            config,
            stream_factories,
            listen_protocol,
            context_factory,
        } = builder;

        let id = MESSENGER_IDS.fetch_add(1, Ordering::Relaxed);
        let config = Arc::new(config);
        let io_pool = Arc::new(IoThreadPool::new(&config.name, config.io_threads)?);
        let closing = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(ServiceRegistry::new());
        let dispatcher = Arc::new(InboundDispatcher::new(registry.clone(), closing.clone()));
        let policy = Arc::new(ConnectivityPolicy::new());
        let table = Arc::new(SchedulerTable::new());
        let stream_factories = Arc::new(stream_factories);

        let context = ReactorContext {
            messenger_id: id,
            config: config.clone(),
            policy: policy.clone(),
            dispatcher: dispatcher.clone(),
            scheduler: table.clone(),
            io_pool: io_pool.clone(),
            stream_factories: stream_factories.clone(),
            context_factory: context_factory.clone(),
            connection_ids: Arc::new(AtomicU64::new(1)),
        };
        let (pool, threads) = reactor::start_reactors(context)?;
        let pool = Arc::new(pool);

        tracing::info!(
            "🚀 messenger {} started: {} reactors, {} io threads, listen protocol {}",
            config.name,
            config.num_reactors,
            config.io_threads,
            listen_protocol
        );

        Ok(Self {
            inner: Arc::new(MessengerInner {
                id,
                config,
                closing,
                registry,
                dispatcher,
                policy,
                scheduler: Scheduler::new(table, pool.clone()),
                pool,
                io_pool,
                stream_factories,
                context_factory,
                listen_protocol,
                acceptors: Mutex::new(Vec::new()),
                accepted: Arc::new(AtomicU64::new(0)),
                reactor_threads: Mutex::new(Some(threads)),
            }),
        })
    }

    /// 不延长生命周期的句柄
    pub fn handle(&self) -> MessengerHandle {
        MessengerHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// 指向远端服务的代理
    pub fn proxy(&self, remote: Endpoint, service: impl Into<String>) -> Proxy {
        Proxy::new(Arc::new(self.handle()), remote, service)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.inner.config
    }

    pub fn num_reactors(&self) -> usize {
        self.inner.pool.len()
    }

    pub fn default_protocol(&self) -> Protocol {
        self.inner.listen_protocol
    }

    pub fn is_closing(&self) -> bool {
        self.inner.is_closing()
    }

    pub fn outbound_address_v4(&self) -> Option<IpAddr> {
        self.inner.config.outbound_address_v4
    }

    pub fn outbound_address_v6(&self) -> Option<IpAddr> {
        self.inner.config.outbound_address_v6
    }

    // ---- 接入 ----

    /// 用监听协议的流工厂绑定地址
    pub fn listen_address(&self, endpoint: Endpoint) -> Result<Endpoint, RpcError> {
        let factory = self.inner.stream_factories.get(self.inner.listen_protocol)?;
        self.listen_address_with(factory.as_ref(), endpoint)
    }

    /// 用指定的流工厂绑定地址，返回实际绑定的端点
    pub fn listen_address_with(&self, factory: &dyn StreamFactory, endpoint: Endpoint) -> Result<Endpoint, RpcError> {
        let inner = &self.inner;
        if inner.is_closing() {
            return Err(RpcError::service_unavailable("messenger is shutting down"));
        }

        let mut acceptors = inner.acceptors.lock();
        if endpoint.port() != 0 && acceptors.iter().any(|acceptor| acceptor.endpoint() == endpoint) {
            return Err(RpcError::already_exists(format!("listen address {}", endpoint)));
        }

        let env = AcceptorEnv {
            policy: inner.policy.clone(),
            pool: inner.pool.clone(),
            io_pool: inner.io_pool.clone(),
            context_factory: inner.context_factory.clone(),
            handshake_timeout: inner.config.connect_timeout,
            accepted: inner.accepted.clone(),
        };
        let acceptor = Acceptor::bind(factory, endpoint, env)?;
        let bound = acceptor.endpoint();
        acceptors.push(Arc::new(acceptor));

        tracing::info!("✅ {} bound {}://{}", inner.config.name, factory.protocol(), bound);
        Ok(bound)
    }

    /// 开始 accept，重复调用无副作用
    pub fn start_acceptor(&self) -> Result<(), RpcError> {
        if self.inner.is_closing() {
            return Err(RpcError::service_unavailable("messenger is shutting down"));
        }
        let acceptors = self.inner.acceptors.lock();
        if acceptors.is_empty() {
            return Err(RpcError::illegal_state("no listen address bound"));
        }
        for acceptor in acceptors.iter() {
            acceptor.start()?;
        }
        Ok(())
    }

    /// 停止并释放所有接入器，已建立的连接保持不变
    pub fn shutdown_acceptor(&self) {
        for acceptor in self.inner.acceptors.lock().drain(..) {
            acceptor.stop();
        }
    }

    pub fn listen_endpoints(&self) -> Vec<Endpoint> {
        self.inner.acceptors.lock().iter().map(|acceptor| acceptor.endpoint()).collect()
    }

    pub fn num_connections_accepted(&self) -> u64 {
        self.inner.accepted.load(Ordering::Relaxed)
    }

    // ---- 服务 ----

    pub fn register_service(&self, name: &str, service: Arc<dyn RpcService>) -> Result<(), RpcError> {
        if self.inner.is_closing() {
            return Err(RpcError::service_unavailable("messenger is shutting down"));
        }
        self.inner.registry.register(name, service)
    }

    pub fn unregister_service(&self, name: &str) -> Result<(), RpcError> {
        self.inner.registry.unregister(name)
    }

    pub fn unregister_all_services(&self) {
        self.inner.registry.unregister_all();
    }

    pub fn rpc_service(&self, name: &str) -> Option<Arc<dyn RpcService>> {
        self.inner.registry.get(name)
    }

    // ---- 调用 ----

    /// 排队出站调用，不阻塞；失败经由回调报告
    pub fn queue_outbound_call(&self, call: OutboundCall) {
        self.inner.queue_outbound_call(call);
    }

    /// 在当前线程上同步分发入站调用
    pub fn queue_inbound_call(&self, call: InboundCall) {
        self.inner.dispatcher.queue_inbound_call(call);
    }

    pub fn handle_call(&self, call: InboundCall) {
        self.queue_inbound_call(call);
    }

    // ---- 调度 ----

    /// `delay` 之后在所属反应器线程上以 OK 执行 `callback`
    ///
    /// 返回错误时回调不会执行。
    pub fn schedule_on_reactor<F>(&self, delay: Duration, callback: F) -> Result<ScheduledTaskId, RpcError>
    where
        F: FnOnce(Result<(), RpcError>) + Send + 'static,
    {
        self.inner.schedule_on_reactor(delay, callback)
    }

    pub fn remove_scheduled_task(&self, id: ScheduledTaskId) -> Result<(), RpcError> {
        self.inner.scheduler.remove_scheduled_task(id)
    }

    pub fn abort_on_reactor(&self, id: ScheduledTaskId) -> Result<(), RpcError> {
        self.inner.scheduler.abort_on_reactor(id)
    }

    pub fn scheduled_task_reactor(&self, id: ScheduledTaskId) -> usize {
        self.inner.scheduler.reactor_for(id)
    }

    // ---- 连通性 ----

    /// 阻断与该 IP 的连通性，并关闭已建立的连接
    pub fn break_connectivity_with(&self, ip: IpAddr) {
        if self.inner.policy.break_with(ip) {
            tracing::info!("🚫 {} broke connectivity with {}", self.inner.config.name, ip);
        }
        self.inner.pool.broadcast(|| ReactorTask::CloseConnectionsTo(ip));
    }

    pub fn restore_connectivity_with(&self, ip: IpAddr) {
        if self.inner.policy.restore_with(ip) {
            tracing::info!("✅ {} restored connectivity with {}", self.inner.config.name, ip);
        }
    }

    pub fn blocked_peers(&self) -> Vec<IpAddr> {
        self.inner.policy.blocked_peers()
    }

    // ---- 观测 ----

    pub fn reactor_stats(&self) -> Vec<ReactorStatsSnapshot> {
        self.inner.pool.stats()
    }

    /// 各反应器的连接和调用快照
    pub async fn dump_running_rpcs(&self) -> Result<DumpRunningRpcs, RpcError> {
        let inner = &self.inner;
        let mut requests = Vec::with_capacity(inner.pool.len());
        for index in 0..inner.pool.len() {
            let (tx, rx) = oneshot::channel();
            if inner.pool.post(index, ReactorTask::Dump(tx)).is_err() {
                return Err(RpcError::service_unavailable("messenger is shutting down"));
            }
            requests.push(rx);
        }

        let mut reactors = Vec::with_capacity(requests.len());
        for dump in futures::future::join_all(requests).await {
            reactors.push(dump.map_err(|_| RpcError::service_unavailable("reactor stopped before dumping"))?);
        }

        Ok(DumpRunningRpcs {
            messenger: inner.config.name.clone(),
            reactors,
            services: inner.registry.service_names(),
            blocked_peers: inner.policy.blocked_peers(),
            pending_scheduled_tasks: inner.scheduler.pending_count(),
        })
    }

    // ---- 关闭 ----

    /// 关闭：停止接入、注销服务、排空连接并回收反应器线程
    ///
    /// 幂等，可从任意线程调用。在反应器线程上调用时只发出停止信号，不等待。
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl ProxyContext for Messenger {
    fn queue_outbound_call(&self, call: OutboundCall) {
        Messenger::queue_outbound_call(self, call);
    }

    fn queue_inbound_call(&self, call: InboundCall) {
        Messenger::queue_inbound_call(self, call);
    }

    fn default_protocol(&self) -> Protocol {
        Messenger::default_protocol(self)
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("name", &self.inner.config.name)
            .field("num_reactors", &self.inner.pool.len())
            .field("closing", &self.inner.is_closing())
            .finish()
    }
}

/// Messenger 的弱引用句柄
///
/// 可在服务和回调中持有；Messenger 析构后所有操作返回 `ServiceUnavailable`。
#[derive(Clone)]
pub struct MessengerHandle {
    inner: Weak<MessengerInner>,
}

impl MessengerHandle {
    fn upgrade(&self) -> Result<Arc<MessengerInner>, RpcError> {
        self.inner
            .upgrade()
            .ok_or_else(|| RpcError::service_unavailable("messenger has been dropped"))
    }

    pub fn is_closing(&self) -> bool {
        self.upgrade().map(|inner| inner.is_closing()).unwrap_or(true)
    }

    pub fn schedule_on_reactor<F>(&self, delay: Duration, callback: F) -> Result<ScheduledTaskId, RpcError>
    where
        F: FnOnce(Result<(), RpcError>) + Send + 'static,
    {
        self.upgrade()?.schedule_on_reactor(delay, callback)
    }

    pub fn remove_scheduled_task(&self, id: ScheduledTaskId) -> Result<(), RpcError> {
        self.upgrade()?.scheduler.remove_scheduled_task(id)
    }

    pub fn abort_on_reactor(&self, id: ScheduledTaskId) -> Result<(), RpcError> {
        self.upgrade()?.scheduler.abort_on_reactor(id)
    }

    /// 与 `Messenger::shutdown` 相同
    pub fn shutdown(&self) {
        if let Ok(inner) = self.upgrade() {
            inner.shutdown();
        }
    }
}

impl ProxyContext for MessengerHandle {
    fn queue_outbound_call(&self, call: OutboundCall) {
        match self.upgrade() {
            Ok(inner) => inner.queue_outbound_call(call),
            Err(error) => call.complete(Err(error)),
        }
    }

    fn queue_inbound_call(&self, call: InboundCall) {
        match self.upgrade() {
            Ok(inner) => inner.dispatcher.queue_inbound_call(call),
            Err(error) => call.respond_failure(error),
        }
    }

    fn default_protocol(&self) -> Protocol {
        self.upgrade()
            .map(|inner| inner.listen_protocol)
            .unwrap_or(crate::endpoint::TCP_PROTOCOL)
    }
}

impl std::fmt::Debug for MessengerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessengerHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
