/// 连通性故障注入
///
/// 测试用的覆盖层：被阻断的地址在建连前和写出前都会被检查，调用以
/// `RpcError::Connectivity` 失败。正常运行时集合为空，热路径只读一个原子标志。

use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::RpcError;

#[derive(Debug, Default)]
pub struct ConnectivityPolicy {
    /// 快速路径：集合非空时为 true
    any_blocked: AtomicBool,
    blocked: RwLock<HashSet<IpAddr>>,
}

impl ConnectivityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// 阻断与 `ip` 的连通性，返回是否新加入
    pub fn break_with(&self, ip: IpAddr) -> bool {
        let mut blocked = self.blocked.write();
        let inserted = blocked.insert(ip);
        self.any_blocked.store(true, Ordering::Release);
        if inserted {
            tracing::info!("🚫 connectivity broken with {}", ip);
        }
        inserted
    }

    /// 恢复与 `ip` 的连通性，返回是否确实移除
    pub fn restore_with(&self, ip: IpAddr) -> bool {
        let mut blocked = self.blocked.write();
        let removed = blocked.remove(&ip);
        self.any_blocked.store(!blocked.is_empty(), Ordering::Release);
        if removed {
            tracing::info!("✅ connectivity restored with {}", ip);
        }
        removed
    }

    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        if !self.any_blocked.load(Ordering::Acquire) {
            return false;
        }
        self.blocked.read().contains(ip)
    }

    /// 被阻断时返回确定性的连通性错误
    pub fn check(&self, remote: std::net::SocketAddr) -> Result<(), RpcError> {
        if self.is_blocked(&remote.ip()) {
            return Err(RpcError::connectivity(
                Some(remote),
                "connectivity with peer is broken",
            ));
        }
        Ok(())
    }

    pub fn blocked_peers(&self) -> Vec<IpAddr> {
        let mut peers: Vec<IpAddr> = self.blocked.read().iter().copied().collect();
        peers.sort();
        peers
    }
}
