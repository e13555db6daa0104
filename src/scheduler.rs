/// 跨反应器的延迟任务
///
/// 任务 ID 单调递增，`reactor = task_id % num_reactors`。回调只在所属反应器线程上执行。
///
/// 取消是尽力而为的：中止、移除与定时器触发之间存在竞争，由共享的认领表裁决，
/// 保证每个任务恰好一个终态：
/// - 定时器先认领：以 OK 触发，之后的中止/移除返回 NotFound
/// - 中止先认领：回调以 Cancelled 执行（由中止消息或定时器触发，谁先到谁执行）
/// - 移除先认领：回调永不执行

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    error::RpcError,
    reactor::{ReactorPool, ReactorTask},
    ScheduledTaskId,
};

/// 任务回调，OK 表示按时触发
pub type TaskCallback = Box<dyn FnOnce(Result<(), RpcError>) + Send + 'static>;

/// 任务在反应器上触发时的三态结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// 正常触发
    FiredOk,
    /// 已被中止，以 Cancelled 触发
    FiredCancelled,
    /// 已移除或已处理，不触发
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskClaim {
    Pending,
    Aborted,
}

/// 任务认领表，所有线程共享
#[derive(Debug)]
pub struct SchedulerTable {
    next_id: AtomicU64,
    claims: Mutex<HashMap<ScheduledTaskId, TaskClaim>>,
}

impl SchedulerTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn allocate(&self) -> ScheduledTaskId {
        let id = ScheduledTaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.claims.lock().insert(id, TaskClaim::Pending);
        id
    }

    /// 调度失败时撤销
    pub fn forget(&self, id: ScheduledTaskId) {
        self.claims.lock().remove(&id);
    }

    /// Pending -> Aborted
    pub fn mark_aborted(&self, id: ScheduledTaskId) -> Result<(), RpcError> {
        let mut claims = self.claims.lock();
        match claims.get_mut(&id) {
            Some(claim @ TaskClaim::Pending) => {
                *claim = TaskClaim::Aborted;
                Ok(())
            }
            Some(TaskClaim::Aborted) => Err(RpcError::not_found(format!("{} already aborted", id))),
            None => Err(RpcError::not_found(format!("{} not pending", id))),
        }
    }

    /// 移除尚未触发的任务
    pub fn remove_pending(&self, id: ScheduledTaskId) -> Result<(), RpcError> {
        let mut claims = self.claims.lock();
        match claims.get(&id) {
            Some(TaskClaim::Pending) => {
                claims.remove(&id);
                Ok(())
            }
            Some(TaskClaim::Aborted) => Err(RpcError::not_found(format!("{} already aborted", id))),
            None => Err(RpcError::not_found(format!("{} not pending", id))),
        }
    }

    /// 反应器触发任务前认领，认领后条目即被删除
    pub fn claim(&self, id: ScheduledTaskId) -> TaskOutcome {
        match self.claims.lock().remove(&id) {
            Some(TaskClaim::Pending) => TaskOutcome::FiredOk,
            Some(TaskClaim::Aborted) => TaskOutcome::FiredCancelled,
            None => TaskOutcome::NotFound,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.claims.lock().len()
    }
}

impl Default for SchedulerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// 调度器：把任务投递到反应器
pub struct Scheduler {
    table: Arc<SchedulerTable>,
    pool: Arc<ReactorPool>,
}

impl Scheduler {
    pub(crate) fn new(table: Arc<SchedulerTable>, pool: Arc<ReactorPool>) -> Self {
        Self { table, pool }
    }

    pub fn reactor_for(&self, id: ScheduledTaskId) -> usize {
        (id.as_u64() % self.pool.len() as u64) as usize
    }

    /// `delay` 之后在所属反应器线程上以 OK 触发 `callback`
    ///
    /// 返回错误时回调不会执行。
    pub fn schedule_on_reactor(&self, delay: Duration, callback: TaskCallback) -> Result<ScheduledTaskId, RpcError> {
        let id = self.table.allocate();
        let reactor = self.reactor_for(id);
        let task = ReactorTask::Schedule {
            id,
            deadline: Instant::now() + delay,
            callback,
        };
        if self.pool.post(reactor, task).is_err() {
            self.table.forget(id);
            return Err(RpcError::service_unavailable("messenger is shutting down"));
        }
        tracing::debug!("⏰ {} scheduled on reactor {} after {:?}", id, reactor, delay);
        Ok(id)
    }

    /// 移除尚未触发的任务，回调不再执行
    pub fn remove_scheduled_task(&self, id: ScheduledTaskId) -> Result<(), RpcError> {
        self.table.remove_pending(id)?;
        // 反应器已停止时定时器条目随之销毁
        let _ = self.pool.post(self.reactor_for(id), ReactorTask::RemoveTask(id));
        Ok(())
    }

    /// 中止任务：若尚未触发，回调以 Cancelled 执行
    pub fn abort_on_reactor(&self, id: ScheduledTaskId) -> Result<(), RpcError> {
        self.table.mark_aborted(id)?;
        // 投递失败说明反应器正在停止，停止时会以 Cancelled 触发所有剩余任务
        let _ = self.pool.post(self.reactor_for(id), ReactorTask::AbortTask(id));
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.table.pending_count()
    }
}
