/// 调用方代理
///
/// `Proxy` 只依赖 `ProxyContext::queue_outbound_call` 这一个契约点，
/// 因此既能挂在 Messenger 上，也能在测试里挂在桩实现上。

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::{
    call::{InboundCall, OutboundCall},
    endpoint::{Endpoint, Protocol},
    error::RpcError,
    reactor::on_reactor_thread,
};

/// 代理上下文
pub trait ProxyContext: Send + Sync {
    /// 排队出站调用，失败经由回调异步报告
    fn queue_outbound_call(&self, call: OutboundCall);

    /// 分发入站调用
    fn queue_inbound_call(&self, call: InboundCall);

    /// 同步处理入站调用
    fn handle(&self, call: InboundCall) {
        self.queue_inbound_call(call);
    }

    /// 新代理默认使用的协议
    fn default_protocol(&self) -> Protocol;
}

/// 面向单个远端服务的代理
#[derive(Clone)]
pub struct Proxy {
    context: Arc<dyn ProxyContext>,
    remote: Endpoint,
    service: String,
    protocol: Protocol,
}

impl Proxy {
    pub fn new(context: Arc<dyn ProxyContext>, remote: Endpoint, service: impl Into<String>) -> Self {
        let protocol = context.default_protocol();
        Self {
            context,
            remote,
            service: service.into(),
            protocol,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// 异步请求，回调在反应器线程上执行
    pub fn async_request<F>(&self, method: &str, payload: Bytes, callback: F)
    where
        F: FnOnce(Result<Bytes, RpcError>) + Send + 'static,
    {
        let call = OutboundCall::new(self.remote, self.service.clone(), method, payload, callback)
            .with_protocol(self.protocol);
        self.context.queue_outbound_call(call);
    }

    /// 在异步上下文中等待结果
    pub async fn call(&self, method: &str, payload: Bytes) -> Result<Bytes, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.async_request(method, payload, move |result| {
            let _ = tx.send(result);
        });
        rx.await
            .map_err(|_| RpcError::cancelled("response channel closed"))?
    }

    /// 阻塞等待结果
    ///
    /// 在反应器线程上调用会阻塞自己的回调，直接返回 `IllegalState`。
    pub fn sync_request(&self, method: &str, payload: Bytes, timeout: Duration) -> Result<Bytes, RpcError> {
        if on_reactor_thread() {
            return Err(RpcError::illegal_state(format!(
                "sync_request {}.{} on a reactor thread",
                self.service, method
            )));
        }
        let (tx, rx) = flume::bounded(1);
        self.async_request(method, payload, move |result| {
            let _ = tx.send(result);
        });
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(flume::RecvTimeoutError::Timeout) => {
                Err(RpcError::timeout_error(format!("{}.{}", self.service, method), timeout))
            }
            Err(flume::RecvTimeoutError::Disconnected) => {
                Err(RpcError::cancelled("response channel closed"))
            }
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("remote", &self.remote)
            .field("service", &self.service)
            .field("protocol", &self.protocol)
            .finish()
    }
}
