//! 集成测试公共工具

#![allow(dead_code)]

use bytes::Bytes;
use msgrpc::{service_fn, Endpoint, InboundCall, Messenger, MessengerBuilder, RpcError};
use std::sync::mpsc;
use std::time::Duration;

pub const ECHO_SERVICE: &str = "tserver";
pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// 测试用的小规模构建器
pub fn small_builder(name: &str) -> MessengerBuilder {
    Messenger::builder(name)
        .set_num_reactors(2)
        .set_io_threads(2)
        .set_coarse_timer_granularity(Duration::from_millis(20))
        .set_shutdown_drain_timeout(Duration::from_millis(500))
}

/// 监听回环地址的随机端口并开始 accept
pub fn listen(messenger: &Messenger) -> Endpoint {
    let endpoint = messenger
        .listen_address("127.0.0.1:0".parse().unwrap())
        .expect("listen");
    messenger.start_acceptor().expect("start acceptor");
    endpoint
}

/// 注册回显服务的服务端
pub fn echo_server(name: &str) -> (Messenger, Endpoint) {
    let server = small_builder(name).build().expect("build server");
    server
        .register_service(
            ECHO_SERVICE,
            service_fn(|call: InboundCall| {
                let payload = call.payload().clone();
                call.respond_success(payload);
            }),
        )
        .expect("register echo");
    let endpoint = listen(&server);
    (server, endpoint)
}

/// 阻塞发起一次调用并等待回调
pub fn call_blocking(
    messenger: &Messenger,
    remote: Endpoint,
    service: &str,
    method: &str,
    payload: &'static [u8],
) -> Result<Bytes, RpcError> {
    let (tx, rx) = mpsc::channel();
    messenger.queue_outbound_call(msgrpc::OutboundCall::new(
        remote,
        service,
        method,
        Bytes::from_static(payload),
        move |result| {
            let _ = tx.send(result);
        },
    ));
    rx.recv_timeout(WAIT).expect("callback never fired")
}

pub fn thread_name() -> String {
    std::thread::current().name().unwrap_or_default().to_string()
}
