/// 反应器本地的定时器轮
///
/// 按 `(fire_time, task_id)` 排序，同一时刻到期的任务按 ID 顺序触发。
/// 只在反应器线程上访问。

use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

use crate::{scheduler::TaskCallback, ScheduledTaskId};

#[derive(Default)]
pub(crate) struct TimerWheel {
    entries: BTreeMap<(Instant, ScheduledTaskId), TaskCallback>,
    deadlines: HashMap<ScheduledTaskId, Instant>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ScheduledTaskId, deadline: Instant, callback: TaskCallback) {
        if let Some(previous) = self.deadlines.insert(id, deadline) {
            debug_assert!(false, "{} scheduled twice", id);
            self.entries.remove(&(previous, id));
        }
        self.entries.insert((deadline, id), callback);
    }

    pub fn remove(&mut self, id: ScheduledTaskId) -> Option<TaskCallback> {
        let deadline = self.deadlines.remove(&id)?;
        self.entries.remove(&(deadline, id))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// 取出所有到期任务，按触发顺序
    pub fn pop_due(&mut self, now: Instant) -> Vec<(ScheduledTaskId, TaskCallback)> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), callback) = entry.remove_entry();
            self.deadlines.remove(&id);
            due.push((id, callback));
        }
        due
    }

    /// 取出全部任务（反应器停止时）
    pub fn drain(&mut self) -> Vec<(ScheduledTaskId, TaskCallback)> {
        self.deadlines.clear();
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|((_, id), callback)| (id, callback))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
