/// 反应器任务队列消息
///
/// 所有跨线程请求都以消息形式投递到目标反应器的队列，按 FIFO 处理。
/// 连接状态从不被其他线程直接修改。

use std::net::IpAddr;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::{
    call::OutboundCall,
    endpoint::{Endpoint, Protocol},
    protocol::{BoxedStream, ConnectionContext},
    scheduler::TaskCallback,
    ScheduledTaskId,
};

use super::ReactorDump;

pub(crate) enum ReactorTask {
    /// 出站调用，复用或新建到目标的连接
    QueueOutbound(OutboundCall),
    /// 已完成握手的入站连接
    RegisterInbound {
        stream: BoxedStream,
        remote: Endpoint,
        protocol: Protocol,
        context: Box<dyn ConnectionContext>,
    },
    /// 延迟任务
    Schedule {
        id: ScheduledTaskId,
        deadline: Instant,
        callback: TaskCallback,
    },
    /// 中止延迟任务，回调以 Cancelled 执行
    AbortTask(ScheduledTaskId),
    /// 移除延迟任务，回调不执行
    RemoveTask(ScheduledTaskId),
    /// 关闭与该 IP 的所有连接
    CloseConnectionsTo(IpAddr),
    /// 连接与调用快照
    Dump(oneshot::Sender<ReactorDump>),
    /// 停止：排空连接、取消剩余任务后退出
    Stop,
}

impl ReactorTask {
    pub fn name(&self) -> &'static str {
        match self {
            ReactorTask::QueueOutbound(_) => "queue_outbound",
            ReactorTask::RegisterInbound { .. } => "register_inbound",
            ReactorTask::Schedule { .. } => "schedule",
            ReactorTask::AbortTask(_) => "abort_task",
            ReactorTask::RemoveTask(_) => "remove_task",
            ReactorTask::CloseConnectionsTo(_) => "close_connections_to",
            ReactorTask::Dump(_) => "dump",
            ReactorTask::Stop => "stop",
        }
    }
}

impl std::fmt::Debug for ReactorTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
