/// 反应器
///
/// 固定数量的反应器线程，每个线程运行一个 tokio current_thread 运行时加 `LocalSet`。
/// 反应器独占一部分连接和一个粗粒度定时器轮；所有跨线程请求都经由 flume 队列投递。
///
/// 线程名为 `<messenger>-reactor-<idx>`。

pub mod event_loop;
pub mod task;
pub mod timer;

pub(crate) use task::ReactorTask;

use parking_lot::RwLock;
use serde::Serialize;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::{
    config::MessengerConfig,
    connection::ConnectionDump,
    connectivity::ConnectivityPolicy,
    error::RpcError,
    io_pool::IoThreadPool,
    protocol::{ConnectionContextFactory, StreamFactoryRegistry},
    scheduler::SchedulerTable,
    service::InboundDispatcher,
};

thread_local! {
    /// (messenger id, reactor index) of the reactor running on this thread
    static CURRENT_REACTOR: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// 当前线程是否为指定 Messenger 的反应器线程
pub(crate) fn current_reactor(messenger_id: u64) -> Option<usize> {
    CURRENT_REACTOR.with(|current| match current.get() {
        Some((id, index)) if id == messenger_id => Some(index),
        _ => None,
    })
}

/// 当前线程是否为任意反应器线程
pub fn on_reactor_thread() -> bool {
    CURRENT_REACTOR.with(|current| current.get().is_some())
}

/// 反应器统计
#[derive(Debug, Default)]
pub struct ReactorStats {
    calls_sent: AtomicU64,
    responses_received: AtomicU64,
    inbound_dispatched: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    tasks_fired: AtomicU64,
    tasks_cancelled: AtomicU64,
}

impl ReactorStats {
    pub fn record_call_sent(&self) {
        self.calls_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inbound_dispatched(&self) {
        self.inbound_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_fired(&self) {
        self.tasks_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, reactor_index: usize) -> ReactorStatsSnapshot {
        ReactorStatsSnapshot {
            reactor_index,
            calls_sent: self.calls_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            inbound_dispatched: self.inbound_dispatched.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            tasks_fired: self.tasks_fired.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// 统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReactorStatsSnapshot {
    pub reactor_index: usize,
    pub calls_sent: u64,
    pub responses_received: u64,
    pub inbound_dispatched: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub tasks_fired: u64,
    pub tasks_cancelled: u64,
}

/// 单个反应器的运行快照
#[derive(Debug, Clone, Serialize)]
pub struct ReactorDump {
    pub reactor_index: usize,
    pub connections: Vec<ConnectionDump>,
    pub scheduled_tasks: usize,
}

/// 反应器线程共享的只读资源
///
/// 只持有子组件，不持有 Messenger 本身，反应器线程因此不会延长 Messenger 的生命周期。
#[derive(Clone)]
pub(crate) struct ReactorContext {
    pub messenger_id: u64,
    pub config: Arc<MessengerConfig>,
    pub policy: Arc<ConnectivityPolicy>,
    pub dispatcher: Arc<InboundDispatcher>,
    pub scheduler: Arc<SchedulerTable>,
    pub io_pool: Arc<IoThreadPool>,
    pub stream_factories: Arc<StreamFactoryRegistry>,
    pub context_factory: Arc<dyn ConnectionContextFactory>,
    pub connection_ids: Arc<AtomicU64>,
}

/// 反应器队列集合
///
/// `open` 闸门保证关闭之后不会再有消息排在 `Stop` 之后：投递持读锁检查闸门，
/// 关闭持写锁翻转闸门再发送 `Stop`。
pub(crate) struct ReactorPool {
    senders: Vec<flume::Sender<ReactorTask>>,
    stats: Vec<Arc<ReactorStats>>,
    open: RwLock<bool>,
}

impl ReactorPool {
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// 投递任务；池已关闭或反应器已退出时原样还回
    pub fn post(&self, index: usize, task: ReactorTask) -> Result<(), ReactorTask> {
        let open = self.open.read();
        if !*open {
            return Err(task);
        }
        match self.senders.get(index) {
            Some(sender) => sender.send(task).map_err(|e| e.into_inner()),
            None => Err(task),
        }
    }

    /// 向每个反应器投递一条消息
    pub fn broadcast(&self, mut make: impl FnMut() -> ReactorTask) -> usize {
        (0..self.len())
            .filter(|&index| self.post(index, make()).is_ok())
            .count()
    }

    /// 关闭闸门并通知所有反应器停止，只有第一次调用返回 true
    pub fn close(&self) -> bool {
        let mut open = self.open.write();
        if !*open {
            return false;
        }
        *open = false;
        for sender in &self.senders {
            let _ = sender.send(ReactorTask::Stop);
        }
        true
    }

    pub fn stats(&self) -> Vec<ReactorStatsSnapshot> {
        self.stats
            .iter()
            .enumerate()
            .map(|(index, stats)| stats.snapshot(index))
            .collect()
    }
}

#[cfg(test)]
impl ReactorPool {
    /// 不启动线程的队列集合，测试直接读取接收端
    pub(crate) fn with_queues(count: usize) -> (Self, Vec<flume::Receiver<ReactorTask>>) {
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..count {
            let (tx, rx) = flume::unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        let pool = Self {
            senders,
            stats: (0..count).map(|_| Arc::new(ReactorStats::default())).collect(),
            open: RwLock::new(true),
        };
        (pool, receivers)
    }
}

/// 启动所有反应器线程
pub(crate) fn start_reactors(context: ReactorContext) -> Result<(ReactorPool, Vec<JoinHandle<()>>), RpcError> {
    let count = context.config.num_reactors;
    let mut senders = Vec::with_capacity(count);
    let mut stats = Vec::with_capacity(count);
    let mut handles = Vec::with_capacity(count);

    for index in 0..count {
        let (tx, rx) = flume::unbounded();
        let reactor_stats = Arc::new(ReactorStats::default());

        let spawned = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RpcError::config_error("num_reactors", format!("failed to build reactor runtime: {}", e)))
            .and_then(|runtime| {
                let context = context.clone();
                let reactor_stats = reactor_stats.clone();
                std::thread::Builder::new()
                    .name(format!("{}-reactor-{}", context.config.name, index))
                    .spawn(move || run_reactor_thread(index, runtime, rx, context, reactor_stats))
                    .map_err(|e| RpcError::config_error("num_reactors", format!("failed to spawn reactor thread: {}", e)))
            });

        match spawned {
            Ok(handle) => {
                senders.push(tx);
                stats.push(reactor_stats);
                handles.push(handle);
            }
            Err(error) => {
                tracing::error!("❌ reactor {} failed to start: {}", index, error);
                for sender in &senders {
                    let _ = sender.send(ReactorTask::Stop);
                }
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(error);
            }
        }
    }

    let pool = ReactorPool {
        senders,
        stats,
        open: RwLock::new(true),
    };
    Ok((pool, handles))
}

fn run_reactor_thread(
    index: usize,
    runtime: tokio::runtime::Runtime,
    tasks: flume::Receiver<ReactorTask>,
    context: ReactorContext,
    stats: Arc<ReactorStats>,
) {
    CURRENT_REACTOR.with(|current| current.set(Some((context.messenger_id, index))));
    tracing::debug!("🚀 reactor {} started", index);

    let local = tokio::task::LocalSet::new();
    let reactor = event_loop::Reactor::new(index, tasks, context, stats);
    local.block_on(&runtime, reactor.run());

    // 本地任务（连接）随 LocalSet 一起销毁
    drop(local);
    drop(runtime);
    CURRENT_REACTOR.with(|current| current.set(None));
    tracing::debug!("reactor {} exited", index);
}
