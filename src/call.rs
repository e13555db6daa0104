/// 调用记录
///
/// - `OutboundCall`：客户端发起的调用，回调恰好执行一次（成功、连通性失败或取消）
/// - `InboundCall`：服务端收到的调用，响应经由所属连接写回

use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::{
    connection::ConnectionCommand,
    endpoint::{Endpoint, Protocol, TCP_PROTOCOL},
    error::RpcError,
    frame::RequestFrame,
    status::{Status, StatusCode},
    CallId,
};

/// 调用结果回调，在反应器线程上执行
pub type ResponseCallback = Box<dyn FnOnce(Result<Bytes, RpcError>) + Send + 'static>;

/// 出站调用
pub struct OutboundCall {
    remote: Endpoint,
    protocol: Protocol,
    service: String,
    method: String,
    payload: Bytes,
    call_id: Option<CallId>,
    callback: Option<ResponseCallback>,
    created_at: Instant,
}

impl OutboundCall {
    pub fn new<F>(
        remote: Endpoint,
        service: impl Into<String>,
        method: impl Into<String>,
        payload: Bytes,
        callback: F,
    ) -> Self
    where
        F: FnOnce(Result<Bytes, RpcError>) + Send + 'static,
    {
        Self {
            remote,
            protocol: TCP_PROTOCOL,
            service: service.into(),
            method: method.into(),
            payload,
            call_id: None,
            callback: Some(Box::new(callback)),
            created_at: Instant::now(),
        }
    }

    /// 指定线协议（默认 tcp）
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// 连接分配的调用 ID，排队前为 None
    pub fn call_id(&self) -> Option<CallId> {
        self.call_id
    }

    pub(crate) fn assign_call_id(&mut self, call_id: CallId) {
        debug_assert!(self.call_id.is_none(), "call id assigned twice");
        self.call_id = Some(call_id);
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn to_request_frame(&self) -> Result<RequestFrame, RpcError> {
        let call_id = self
            .call_id
            .ok_or_else(|| RpcError::illegal_state("outbound call encoded before call id assignment"))?;
        Ok(RequestFrame::new(
            call_id,
            self.service.clone(),
            self.method.clone(),
            self.payload.clone(),
        ))
    }

    /// 完成调用，消费调用记录
    pub fn complete(mut self, result: Result<Bytes, RpcError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for OutboundCall {
    fn drop(&mut self) {
        // 调用记录被丢弃时仍需给调用方一个结果
        if let Some(callback) = self.callback.take() {
            tracing::debug!(
                "outbound call {}.{} to {} dropped before completion",
                self.service,
                self.method,
                self.remote
            );
            callback(Err(RpcError::cancelled("call dropped before completion")));
        }
    }
}

impl std::fmt::Debug for OutboundCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundCall")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .field("service", &self.service)
            .field("method", &self.method)
            .field("payload_len", &self.payload.len())
            .field("call_id", &self.call_id)
            .finish()
    }
}

/// 入站调用的响应通道
#[derive(Debug)]
pub struct CallResponder {
    call_id: CallId,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl CallResponder {
    pub(crate) fn new(call_id: CallId, commands: mpsc::UnboundedSender<ConnectionCommand>) -> Self {
        Self { call_id, commands }
    }

    /// 返回 false 表示连接已关闭，响应被丢弃
    fn send(self, result: Result<Bytes, Status>) -> bool {
        self.commands
            .send(ConnectionCommand::Respond {
                call_id: self.call_id,
                result,
            })
            .is_ok()
    }
}

/// 入站调用
pub struct InboundCall {
    call_id: CallId,
    service: String,
    method: String,
    payload: Bytes,
    remote: Endpoint,
    received_at: Instant,
    responder: Option<CallResponder>,
}

impl InboundCall {
    pub(crate) fn new(frame: RequestFrame, remote: Endpoint, responder: CallResponder) -> Self {
        Self {
            call_id: frame.call_id,
            service: frame.service,
            method: frame.method,
            payload: frame.payload,
            remote,
            received_at: Instant::now(),
            responder: Some(responder),
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    pub fn elapsed(&self) -> Duration {
        self.received_at.elapsed()
    }

    /// 成功响应
    pub fn respond_success(mut self, payload: Bytes) {
        self.respond(Ok(payload));
    }

    /// 失败响应
    pub fn respond_failure(mut self, error: RpcError) {
        self.respond(Err(error.to_status()));
    }

    fn respond(&mut self, result: Result<Bytes, Status>) {
        if let Some(responder) = self.responder.take() {
            if !responder.send(result) {
                tracing::debug!(
                    "response for call {} from {} dropped: connection closed",
                    self.call_id,
                    self.remote
                );
            }
        }
    }
}

impl Drop for InboundCall {
    fn drop(&mut self) {
        if self.responder.is_some() {
            tracing::warn!(
                "⚠️ inbound call {}.{} ({}) dropped without response",
                self.service,
                self.method,
                self.call_id
            );
            self.respond(Err(Status::new(
                StatusCode::RemoteError,
                "call dropped without response",
            )));
        }
    }
}

impl std::fmt::Debug for InboundCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundCall")
            .field("call_id", &self.call_id)
            .field("service", &self.service)
            .field("method", &self.method)
            .field("payload_len", &self.payload.len())
            .field("remote", &self.remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn endpoint() -> Endpoint {
        "127.0.0.1:7100".parse().unwrap()
    }

    #[test]
    fn test_outbound_call_fires_once() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let call = OutboundCall::new(endpoint(), "echo", "ping", Bytes::from_static(b"x"), move |r| {
            sink.lock().unwrap().push(r);
        });
        call.complete(Ok(Bytes::from_static(b"pong")));

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], Ok(Bytes::from_static(b"pong")));
    }

    #[test]
    fn test_dropped_outbound_call_is_cancelled() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let call = OutboundCall::new(endpoint(), "echo", "ping", Bytes::new(), move |r| {
            sink.lock().unwrap().push(r);
        });
        drop(call);

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_request_frame_requires_call_id() {
        let mut call = OutboundCall::new(endpoint(), "echo", "ping", Bytes::new(), |_| {});
        assert!(call.to_request_frame().is_err());
        call.assign_call_id(CallId::new(3));
        let frame = call.to_request_frame().unwrap();
        assert_eq!(frame.call_id, CallId::new(3));
        assert_eq!(frame.service, "echo");
    }

    #[test]
    fn test_inbound_call_drop_sends_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let frame = RequestFrame::new(CallId::new(5), "echo", "ping", Bytes::new());
        let call = InboundCall::new(frame, endpoint(), CallResponder::new(CallId::new(5), tx));
        drop(call);

        match rx.try_recv() {
            Ok(ConnectionCommand::Respond { call_id, result }) => {
                assert_eq!(call_id, CallId::new(5));
                assert_eq!(result.unwrap_err().code, StatusCode::RemoteError);
            }
            other => panic!("unexpected command: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_inbound_call_responds_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let frame = RequestFrame::new(CallId::new(1), "echo", "ping", Bytes::from_static(b"a"));
        let call = InboundCall::new(frame, endpoint(), CallResponder::new(CallId::new(1), tx));
        let payload = call.payload().clone();
        call.respond_success(payload);

        assert!(matches!(
            rx.try_recv(),
            Ok(ConnectionCommand::Respond { result: Ok(_), .. })
        ));
        assert!(rx.try_recv().is_err());
    }
}
