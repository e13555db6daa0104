/// msgrpc - 基于反应器的节点间 RPC 消息层
///
/// 固定数量的反应器线程承载所有连接；同一远端的调用总是经由同一个反应器，
/// 因此保持提交顺序。提供延迟任务调度、服务注册表，以及用于测试网络分区的
/// 连通性黑名单。

pub mod acceptor;
pub mod call;
pub mod config;
pub mod connection;
pub mod connectivity;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod io_pool;
pub mod messenger;
pub mod protocol;
pub mod proxy;
pub mod reactor;
pub mod scheduler;
pub mod service;
pub mod status;

use serde::Serialize;

/// 连接内的调用 ID，线上为 u32
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CallId(u32);

impl CallId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// 延迟任务 ID，进程内单调递增
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ScheduledTaskId(u64);

impl ScheduledTaskId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ScheduledTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// 连接 ID，Messenger 内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

// 重新导出核心类型
pub use call::{InboundCall, OutboundCall, ResponseCallback};
pub use config::{ConfigError, MessengerConfig};
pub use endpoint::{reactor_index_for, Endpoint, Protocol, TCP_PROTOCOL};
pub use error::{CloseReason, RpcError};
pub use messenger::{DumpRunningRpcs, Messenger, MessengerBuilder, MessengerHandle};
pub use protocol::{
    ConnectionContext, ConnectionContextFactory, StandardConnectionContextFactory, StreamFactory, TcpStreamFactory,
};
pub use proxy::{Proxy, ProxyContext};
pub use reactor::{ReactorDump, ReactorStatsSnapshot};
pub use service::{service_fn, FnService, RpcService, ServiceRegistry};
pub use status::{Status, StatusCode};
