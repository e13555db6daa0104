/// 延迟任务测试
///
/// 测试目标：
/// 1. 到期后在所属反应器线程上以 OK 触发
/// 2. 中止：回调以 Cancelled 执行；移除：回调不执行
/// 3. 已触发的任务再中止/移除返回 NotFound
/// 4. 关闭时剩余任务以 Cancelled 执行

mod common;

use common::*;
use msgrpc::RpcError;
use std::sync::mpsc;
use std::time::{Duration, Instant};

#[test]
fn test_task_fires_on_its_reactor() {
    init_tracing();
    let messenger = small_builder("sched-fire").set_num_reactors(3).build().unwrap();
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();

    let id = messenger
        .schedule_on_reactor(Duration::from_millis(50), move |status| {
            let _ = tx.send((status, thread_name(), started.elapsed()));
        })
        .unwrap();

    let (status, thread, elapsed) = rx.recv_timeout(WAIT).unwrap();
    assert!(status.is_ok());
    assert!(elapsed >= Duration::from_millis(50), "fired early: {:?}", elapsed);
    let reactor = messenger.scheduled_task_reactor(id);
    assert_eq!(thread, format!("sched-fire-reactor-{}", reactor));
    assert_eq!(reactor as u64, id.as_u64() % 3);

    // 已触发
    assert!(messenger.abort_on_reactor(id).unwrap_err().is_not_found());
    assert!(messenger.remove_scheduled_task(id).unwrap_err().is_not_found());
    assert_eq!(messenger.reactor_stats()[reactor].tasks_fired, 1);
}

#[test]
fn test_tasks_fire_in_deadline_order() {
    init_tracing();
    let messenger = small_builder("sched-order").set_num_reactors(1).build().unwrap();
    let (tx, rx) = mpsc::channel();

    for (tag, delay) in [(3u32, 90u64), (1, 30), (2, 60)] {
        let tx = tx.clone();
        messenger
            .schedule_on_reactor(Duration::from_millis(delay), move |status| {
                assert!(status.is_ok());
                let _ = tx.send(tag);
            })
            .unwrap();
    }

    let fired: Vec<u32> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(fired, vec![1, 2, 3]);
}

#[test]
fn test_abort_runs_callback_cancelled() {
    init_tracing();
    let messenger = small_builder("sched-abort").build().unwrap();
    let (tx, rx) = mpsc::channel();

    let id = messenger
        .schedule_on_reactor(Duration::from_secs(60), move |status| {
            let _ = tx.send(status);
        })
        .unwrap();
    messenger.abort_on_reactor(id).unwrap();

    let status = rx.recv_timeout(WAIT).unwrap();
    assert!(status.unwrap_err().is_cancelled());
    assert!(messenger.abort_on_reactor(id).unwrap_err().is_not_found());
    assert!(messenger.remove_scheduled_task(id).unwrap_err().is_not_found());
}

#[test]
fn test_abort_midway_through_delay() {
    init_tracing();
    let messenger = small_builder("sched-midway").build().unwrap();
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();

    let id = messenger
        .schedule_on_reactor(Duration::from_millis(50), move |status| {
            let _ = tx.send((status, started.elapsed()));
        })
        .unwrap();
    std::thread::sleep(Duration::from_millis(10));
    messenger.abort_on_reactor(id).unwrap();

    let (status, elapsed) = rx.recv_timeout(WAIT).unwrap();
    assert!(status.unwrap_err().is_cancelled());
    // 中止后立即回调，不等原定的到期时间
    assert!(elapsed < Duration::from_millis(50), "fired at {:?}", elapsed);
    // 恰好一次：回调执行后发送端随之销毁
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(200)),
        Err(mpsc::RecvTimeoutError::Disconnected)
    );
}

#[test]
fn test_remove_suppresses_callback() {
    init_tracing();
    let messenger = small_builder("sched-remove").build().unwrap();
    let (tx, rx) = mpsc::channel::<Result<(), RpcError>>();

    let id = messenger
        .schedule_on_reactor(Duration::from_millis(100), move |status| {
            let _ = tx.send(status);
        })
        .unwrap();
    messenger.remove_scheduled_task(id).unwrap();

    // 回调随定时器条目一起销毁，发送端被丢弃
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(400)),
        Err(mpsc::RecvTimeoutError::Disconnected)
    );
    assert!(messenger.remove_scheduled_task(id).unwrap_err().is_not_found());
}

#[test]
fn test_abort_and_fire_race_resolves_once() {
    init_tracing();
    let messenger = small_builder("sched-race").build().unwrap();
    let (tx, rx) = mpsc::channel();

    let mut ids = Vec::new();
    for _ in 0..50 {
        let tx = tx.clone();
        let id = messenger
            .schedule_on_reactor(Duration::from_millis(5), move |status| {
                let _ = tx.send(status.is_ok());
            })
            .unwrap();
        ids.push(id);
    }
    std::thread::sleep(Duration::from_millis(5));
    let aborted = ids
        .iter()
        .filter(|id| messenger.abort_on_reactor(**id).is_ok())
        .count();

    let outcomes: Vec<bool> = (0..50).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(outcomes.iter().filter(|ok| !**ok).count(), aborted);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_shutdown_cancels_remaining_tasks() {
    init_tracing();
    let messenger = small_builder("sched-shutdown").build().unwrap();
    let (tx, rx) = mpsc::channel();

    for _ in 0..4 {
        let tx = tx.clone();
        messenger
            .schedule_on_reactor(Duration::from_secs(3600), move |status| {
                let _ = tx.send(status);
            })
            .unwrap();
    }
    messenger.shutdown();

    for _ in 0..4 {
        assert!(rx.recv_timeout(WAIT).unwrap().unwrap_err().is_cancelled());
    }

    let err = messenger
        .schedule_on_reactor(Duration::from_millis(1), |_| panic!("must not run"))
        .unwrap_err();
    assert!(matches!(err, RpcError::ServiceUnavailable { .. }));
}
