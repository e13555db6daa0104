/// 服务注册表
///
/// 入站分发每次调用都会查表，注册/注销则很少发生。写者在互斥锁下修改规范表，
/// 然后用 crossbeam epoch 原子替换出一份不可变快照；读者只做一次原子加载，不加锁。

use crossbeam::epoch::{self, Atomic, Owned};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::{call::InboundCall, error::RpcError};

/// RPC 服务
///
/// `queue_inbound_call` 在反应器线程上同步调用，耗时的处理应自行转交到其他线程，
/// 再通过 `InboundCall::respond_*` 回复。
pub trait RpcService: Send + Sync + 'static {
    /// 处理一次调用
    fn handle(&self, call: InboundCall);

    /// 入站调用入口，默认直接处理
    fn queue_inbound_call(&self, call: InboundCall) {
        self.handle(call);
    }

    /// 注销或 Messenger 关闭时调用
    fn shutdown(&self) {}
}

/// 闭包服务
pub struct FnService<F> {
    handler: F,
}

impl<F> RpcService for FnService<F>
where
    F: Fn(InboundCall) + Send + Sync + 'static,
{
    fn handle(&self, call: InboundCall) {
        (self.handler)(call)
    }
}

/// 用闭包构造服务
pub fn service_fn<F>(handler: F) -> Arc<FnService<F>>
where
    F: Fn(InboundCall) + Send + Sync + 'static,
{
    Arc::new(FnService { handler })
}

type ServiceMap = HashMap<String, Arc<dyn RpcService>>;

/// 写时复制的服务注册表
pub struct ServiceRegistry {
    /// 规范表，写者串行化
    canonical: Mutex<ServiceMap>,
    /// 读者看到的不可变快照
    snapshot: Atomic<ServiceMap>,
    /// 快照版本，每次发布加一
    version: AtomicU64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            canonical: Mutex::new(HashMap::new()),
            snapshot: Atomic::new(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    /// 无锁读取
    pub fn get(&self, name: &str) -> Option<Arc<dyn RpcService>> {
        let guard = epoch::pin();
        let current = self.snapshot.load(Ordering::Acquire, &guard);
        // SAFETY: 快照只通过 defer_destroy 回收，pin 期间不会被释放
        unsafe { current.as_ref() }.and_then(|map| map.get(name).cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn register(&self, name: &str, service: Arc<dyn RpcService>) -> Result<(), RpcError> {
        let mut canonical = self.canonical.lock();
        if canonical.contains_key(name) {
            return Err(RpcError::already_exists(format!("service {}", name)));
        }
        canonical.insert(name.to_string(), service);
        self.publish(&canonical);
        tracing::info!("📋 service registered: {}", name);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<(), RpcError> {
        let removed = {
            let mut canonical = self.canonical.lock();
            let removed = canonical
                .remove(name)
                .ok_or_else(|| RpcError::not_found(format!("service {}", name)))?;
            self.publish(&canonical);
            removed
        };
        removed.shutdown();
        tracing::info!("📋 service unregistered: {}", name);
        Ok(())
    }

    /// 原子地清空所有服务
    pub fn unregister_all(&self) {
        let removed = {
            let mut canonical = self.canonical.lock();
            let removed: Vec<_> = canonical.drain().collect();
            self.publish(&canonical);
            removed
        };
        for (name, service) in removed {
            service.shutdown();
            tracing::debug!("service {} shut down", name);
        }
    }

    /// 当前已注册的服务名
    pub fn service_names(&self) -> Vec<String> {
        let guard = epoch::pin();
        let current = self.snapshot.load(Ordering::Acquire, &guard);
        let mut names: Vec<String> = unsafe { current.as_ref() }
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// 发布新快照，调用方必须持有规范表锁
    fn publish(&self, canonical: &ServiceMap) {
        let guard = epoch::pin();
        let previous = self
            .snapshot
            .swap(Owned::new(canonical.clone()), Ordering::AcqRel, &guard);
        if !previous.is_null() {
            // SAFETY: 旧快照已从原子指针上摘下，等所有读者离开 epoch 后回收
            unsafe { guard.defer_destroy(previous) };
        }
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        // SAFETY: &mut self 保证没有并发读者
        unsafe {
            let guard = epoch::unprotected();
            let current = self.snapshot.load(Ordering::Relaxed, guard);
            if !current.is_null() {
                drop(current.into_owned());
            }
        }
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.service_names())
            .field("version", &self.version())
            .finish()
    }
}

/// 入站分发器
///
/// 在反应器线程上同步执行查表和服务入口。
pub struct InboundDispatcher {
    registry: Arc<ServiceRegistry>,
    closing: Arc<AtomicBool>,
}

impl InboundDispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, closing: Arc<AtomicBool>) -> Self {
        Self { registry, closing }
    }

    pub fn queue_inbound_call(&self, call: InboundCall) {
        if self.closing.load(Ordering::Acquire) {
            call.respond_failure(RpcError::service_unavailable("messenger is shutting down"));
            return;
        }

        match self.registry.get(call.service()) {
            Some(service) => service.queue_inbound_call(call),
            None => {
                tracing::debug!(
                    "inbound call {} from {} targets unknown service {}",
                    call.call_id(),
                    call.remote(),
                    call.service()
                );
                let service = call.service().to_string();
                call.respond_failure(RpcError::service_not_found(service));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        call::CallResponder,
        connection::ConnectionCommand,
        frame::RequestFrame,
        status::StatusCode,
        CallId,
    };
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct Counting {
        hits: AtomicUsize,
        shut_down: AtomicBool,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            })
        }
    }

    impl RpcService for Counting {
        fn handle(&self, call: InboundCall) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let payload = call.payload().clone();
            call.respond_success(payload);
        }

        fn shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    fn inbound(service: &str) -> (InboundCall, mpsc::UnboundedReceiver<ConnectionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let frame = RequestFrame::new(CallId::new(1), service, "m", Bytes::from_static(b"body"));
        let call = InboundCall::new(
            frame,
            "127.0.0.1:9000".parse().unwrap(),
            CallResponder::new(CallId::new(1), tx),
        );
        (call, rx)
    }

    fn response_code(rx: &mut mpsc::UnboundedReceiver<ConnectionCommand>) -> StatusCode {
        match rx.try_recv() {
            Ok(ConnectionCommand::Respond { result: Ok(_), .. }) => StatusCode::Ok,
            Ok(ConnectionCommand::Respond { result: Err(status), .. }) => status.code,
            _ => panic!("expected a response"),
        }
    }

    #[test]
    fn test_register_duplicate() {
        let registry = ServiceRegistry::new();
        registry.register("echo", Counting::new()).unwrap();
        let err = registry.register("echo", Counting::new()).unwrap_err();
        assert!(matches!(err, RpcError::AlreadyExists { .. }));
        assert_eq!(registry.version(), 1);
    }

    #[test]
    fn test_unregister_missing() {
        let registry = ServiceRegistry::new();
        assert!(registry.unregister("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_unregister_stops_routing() {
        let registry = Arc::new(ServiceRegistry::new());
        let service = Counting::new();
        registry.register("echo", service.clone()).unwrap();
        let dispatcher = InboundDispatcher::new(registry.clone(), Arc::new(AtomicBool::new(false)));

        let (call, mut rx) = inbound("echo");
        dispatcher.queue_inbound_call(call);
        assert_eq!(response_code(&mut rx), StatusCode::Ok);

        registry.unregister("echo").unwrap();
        assert!(service.shut_down.load(Ordering::SeqCst));

        let (call, mut rx) = inbound("echo");
        dispatcher.queue_inbound_call(call);
        assert_eq!(response_code(&mut rx), StatusCode::ServiceNotFound);
        assert_eq!(service.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_all() {
        let registry = ServiceRegistry::new();
        let a = Counting::new();
        let b = Counting::new();
        registry.register("a", a.clone()).unwrap();
        registry.register("b", b.clone()).unwrap();
        assert_eq!(registry.service_names(), vec!["a".to_string(), "b".to_string()]);

        registry.unregister_all();
        assert!(registry.service_names().is_empty());
        assert!(a.shut_down.load(Ordering::SeqCst));
        assert!(b.shut_down.load(Ordering::SeqCst));
    }

    #[test]
    fn test_closing_rejects_inbound() {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register("echo", Counting::new()).unwrap();
        let dispatcher = InboundDispatcher::new(registry, Arc::new(AtomicBool::new(true)));

        let (call, mut rx) = inbound("echo");
        dispatcher.queue_inbound_call(call);
        assert_eq!(response_code(&mut rx), StatusCode::ServiceUnavailable);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_snapshots() {
        let registry = Arc::new(ServiceRegistry::new());
        let mut readers = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            readers.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let _ = registry.get("svc-7");
                }
            }));
        }
        for i in 0..50 {
            registry.register(&format!("svc-{}", i), Counting::new()).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert!(registry.contains("svc-7"));
        assert_eq!(registry.service_names().len(), 50);
    }
}
