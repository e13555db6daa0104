/// 接入器
///
/// 绑定监听地址，在 IO 线程池上运行 accept 循环。每个接入的 socket 先完成服务端握手，
/// 再按对端地址哈希交给对应的反应器。停止接入器只释放监听 socket，已建立的连接不受影响。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{
    connection::Direction,
    connectivity::ConnectivityPolicy,
    endpoint::{reactor_index_for, Endpoint, Protocol},
    error::RpcError,
    io_pool::IoThreadPool,
    protocol::{ConnectionContextFactory, RpcListener, StreamFactory},
    reactor::{ReactorPool, ReactorTask},
};

/// 接入器共享资源
#[derive(Clone)]
pub(crate) struct AcceptorEnv {
    pub policy: Arc<ConnectivityPolicy>,
    pub pool: Arc<ReactorPool>,
    pub io_pool: Arc<IoThreadPool>,
    pub context_factory: Arc<dyn ConnectionContextFactory>,
    pub handshake_timeout: Duration,
    pub accepted: Arc<AtomicU64>,
}

enum AcceptorState {
    /// 已绑定，尚未开始 accept
    Bound(Box<dyn RpcListener>),
    Running(CancellationToken),
    Stopped,
}

pub struct Acceptor {
    endpoint: Endpoint,
    protocol: Protocol,
    state: Mutex<AcceptorState>,
    env: AcceptorEnv,
}

impl Acceptor {
    /// 绑定监听地址，端口为 0 时返回实际绑定的端点
    pub(crate) fn bind(
        factory: &dyn StreamFactory,
        endpoint: Endpoint,
        env: AcceptorEnv,
    ) -> Result<Self, RpcError> {
        let listener = env
            .io_pool
            .enter(|| factory.bind(endpoint.addr()))
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    RpcError::already_exists(format!("listen address {}", endpoint))
                } else {
                    RpcError::from(e)
                }
            })?;
        let bound = Endpoint::new(listener.local_addr()?);

        Ok(Self {
            endpoint: bound,
            protocol: factory.protocol(),
            state: Mutex::new(AcceptorState::Bound(listener)),
            env,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), AcceptorState::Running(_))
    }

    /// 开始 accept，重复调用无副作用
    pub fn start(&self) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        let listener = match std::mem::replace(&mut *state, AcceptorState::Stopped) {
            AcceptorState::Bound(listener) => listener,
            AcceptorState::Running(token) => {
                *state = AcceptorState::Running(token);
                return Ok(());
            }
            AcceptorState::Stopped => {
                return Err(RpcError::illegal_state(format!("acceptor on {} already stopped", self.endpoint)));
            }
        };

        let token = CancellationToken::new();
        let accept_loop = AcceptLoop {
            endpoint: self.endpoint,
            protocol: self.protocol,
            listener,
            env: self.env.clone(),
        };
        self.env.io_pool.spawn(accept_loop.run(token.clone()));
        *state = AcceptorState::Running(token);

        tracing::info!("🚀 acceptor started on {}://{}", self.protocol, self.endpoint);
        Ok(())
    }

    /// 停止 accept 并释放监听 socket，重复调用无副作用
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), AcceptorState::Stopped);
        match previous {
            AcceptorState::Running(token) => {
                token.cancel();
                tracing::info!("🛑 acceptor on {} stopped", self.endpoint);
            }
            AcceptorState::Bound(listener) => drop(listener),
            AcceptorState::Stopped => {}
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acceptor")
            .field("endpoint", &self.endpoint)
            .field("protocol", &self.protocol)
            .field("running", &self.is_running())
            .finish()
    }
}

struct AcceptLoop {
    endpoint: Endpoint,
    protocol: Protocol,
    listener: Box<dyn RpcListener>,
    env: AcceptorEnv,
}

impl AcceptLoop {
    async fn run(mut self, token: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if self.env.policy.is_blocked(&peer.ip()) {
                        tracing::debug!("🚫 {} dropped inbound connection from {}", self.endpoint, peer);
                        continue;
                    }
                    self.env.accepted.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(handshake(stream, Endpoint::new(peer), self.protocol, self.env.clone()));
                }
                Err(e) => {
                    tracing::error!("❌ accept on {} failed: {}", self.endpoint, e);
                    // 文件描述符耗尽之类的错误不会马上恢复
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        tracing::debug!("accept loop on {} exited", self.endpoint);
    }
}

async fn handshake(mut stream: crate::protocol::BoxedStream, remote: Endpoint, protocol: Protocol, env: AcceptorEnv) {
    let mut context = env.context_factory.new_context(Direction::Server);
    let result = tokio::time::timeout(env.handshake_timeout, context.server_handshake(&mut stream)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!("⚠️ handshake with {} failed: {}", remote, e);
            return;
        }
        Err(_) => {
            tracing::warn!("⚠️ handshake with {} timed out after {:?}", remote, env.handshake_timeout);
            return;
        }
    }

    let reactor = reactor_index_for(&remote, env.pool.len());
    let task = ReactorTask::RegisterInbound {
        stream,
        remote,
        protocol,
        context,
    };
    if env.pool.post(reactor, task).is_err() {
        tracing::debug!("inbound connection from {} dropped: messenger shutting down", remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessengerConfig;
    use crate::protocol::{StandardConnectionContextFactory, TcpStreamFactory};

    fn env() -> AcceptorEnv {
        let config = MessengerConfig::new("acceptor-test");
        AcceptorEnv {
            policy: Arc::new(ConnectivityPolicy::new()),
            pool: Arc::new(ReactorPool::with_queues(1).0),
            io_pool: Arc::new(IoThreadPool::new(&config.name, 1).unwrap()),
            context_factory: Arc::new(StandardConnectionContextFactory),
            handshake_timeout: config.connect_timeout,
            accepted: Arc::new(AtomicU64::new(0)),
        }
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let factory = TcpStreamFactory::new();
        let acceptor = Acceptor::bind(&factory, "127.0.0.1:0".parse().unwrap(), env()).unwrap();
        assert_ne!(acceptor.endpoint().port(), 0);
        assert!(!acceptor.is_running());
    }

    #[test]
    fn test_bind_twice_fails() {
        let factory = TcpStreamFactory::new();
        let env = env();
        let first = Acceptor::bind(&factory, "127.0.0.1:0".parse().unwrap(), env.clone()).unwrap();
        let err = Acceptor::bind(&factory, first.endpoint(), env).unwrap_err();
        assert!(matches!(err, RpcError::AlreadyExists { .. }));
    }

    #[test]
    fn test_start_stop_idempotent() {
        let factory = TcpStreamFactory::new();
        let acceptor = Acceptor::bind(&factory, "127.0.0.1:0".parse().unwrap(), env()).unwrap();
        acceptor.start().unwrap();
        acceptor.start().unwrap();
        assert!(acceptor.is_running());
        acceptor.stop();
        acceptor.stop();
        assert!(!acceptor.is_running());
        assert!(acceptor.start().is_err());
    }
}
