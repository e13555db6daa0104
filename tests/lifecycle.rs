/// 生命周期测试
///
/// 测试目标：
/// 1. 并发重复关闭安全且都会返回
/// 2. 在反应器回调里关闭不会死锁
/// 3. 关闭后的新工作以 ServiceUnavailable 失败
/// 4. 空闲连接按保活时间回收，之后的调用建立新连接

mod common;

use common::*;
use msgrpc::{Messenger, RpcError};
use std::sync::{mpsc, Arc};
use std::time::Duration;

#[test]
fn test_concurrent_double_shutdown() {
    init_tracing();
    let (server, endpoint) = echo_server("life-double-server");
    let client = Arc::new(small_builder("life-double-client").build().unwrap());
    assert_eq!(call_blocking(&client, endpoint, ECHO_SERVICE, "echo", b"hi").unwrap(), "hi");

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            std::thread::spawn(move || client.shutdown())
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(client.is_closing());
    client.shutdown();

    let err = call_blocking(&client, endpoint, ECHO_SERVICE, "echo", b"late").unwrap_err();
    assert!(matches!(err, RpcError::ServiceUnavailable { .. }));

    server.shutdown();
    assert!(server.listen_address("127.0.0.1:0".parse().unwrap()).is_err());
}

#[test]
fn test_shutdown_from_reactor_callback() {
    init_tracing();
    let messenger = small_builder("life-inside").build().unwrap();
    let handle = messenger.handle();
    let (tx, rx) = mpsc::channel();

    messenger
        .schedule_on_reactor(Duration::from_millis(10), move |status| {
            assert!(status.is_ok());
            handle.shutdown();
            let _ = tx.send(handle.is_closing());
        })
        .unwrap();

    assert!(rx.recv_timeout(WAIT).unwrap());
    assert!(messenger.is_closing());
    // 所有者随后回收线程
    messenger.shutdown();
}

#[test]
fn test_handle_outlives_messenger() {
    init_tracing();
    let messenger = small_builder("life-handle").build().unwrap();
    let handle = messenger.handle();
    drop(messenger);

    assert!(handle.is_closing());
    let err = handle
        .schedule_on_reactor(Duration::from_millis(1), |_| {})
        .unwrap_err();
    assert!(matches!(err, RpcError::ServiceUnavailable { .. }));
}

#[test]
fn test_shutdown_fails_calls_in_flight() {
    init_tracing();
    let server = small_builder("life-drain-server").build().unwrap();
    // 永不回复的服务
    let parked = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let parked = parked.clone();
        server
            .register_service(
                "parking",
                msgrpc::service_fn(move |call| parked.lock().push(call)),
            )
            .unwrap();
    }
    let endpoint = listen(&server);
    let client: Messenger = small_builder("life-drain-client").build().unwrap();

    let (tx, rx) = mpsc::channel();
    client.queue_outbound_call(msgrpc::OutboundCall::new(
        endpoint,
        "parking",
        "hold",
        bytes::Bytes::new(),
        move |result| {
            let _ = tx.send(result);
        },
    ));
    let deadline = std::time::Instant::now() + WAIT;
    while parked.lock().is_empty() {
        assert!(std::time::Instant::now() < deadline, "call never reached the service");
        std::thread::sleep(Duration::from_millis(10));
    }

    // 排空超时后以连通性错误失败
    client.shutdown();
    let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
    assert!(err.is_connectivity(), "{:?}", err);
}

#[test]
fn test_idle_connections_are_evicted() {
    init_tracing();
    let (_server, endpoint) = echo_server("life-idle-server");
    let client = small_builder("life-idle-client")
        .set_connection_keepalive_time(Duration::from_millis(200))
        .set_coarse_timer_granularity(Duration::from_millis(20))
        .build()
        .unwrap();

    assert_eq!(call_blocking(&client, endpoint, ECHO_SERVICE, "echo", b"1").unwrap(), "1");
    std::thread::sleep(Duration::from_millis(600));

    let closed: u64 = client.reactor_stats().iter().map(|s| s.connections_closed).sum();
    assert_eq!(closed, 1);

    assert_eq!(call_blocking(&client, endpoint, ECHO_SERVICE, "echo", b"2").unwrap(), "2");
    let opened: u64 = client.reactor_stats().iter().map(|s| s.connections_opened).sum();
    assert_eq!(opened, 2);
}
