/// 字节流工厂
///
/// 每个 `Protocol` 对应一个 `StreamFactory`，负责出站建连与入站监听。
/// 只提供明文 TCP；其他传输通过实现该 trait 接入。

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket};

use crate::{
    endpoint::{Protocol, TCP_PROTOCOL},
    error::RpcError,
};

/// 连接底层字节流
pub trait RpcStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RpcStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn RpcStream>;

/// 监听器
#[async_trait]
pub trait RpcListener: Send + 'static {
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// 流工厂
#[async_trait]
pub trait StreamFactory: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    /// 建立出站连接，`bind` 为可选的本地地址
    async fn connect(&self, remote: SocketAddr, bind: Option<SocketAddr>) -> io::Result<BoxedStream>;

    /// 绑定监听地址，必须在 IO 池的运行时上下文中调用
    fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn RpcListener>>;
}

/// 明文 TCP
#[derive(Debug, Clone)]
pub struct TcpStreamFactory {
    nodelay: bool,
}

impl TcpStreamFactory {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpStreamFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamFactory for TcpStreamFactory {
    fn protocol(&self) -> Protocol {
        TCP_PROTOCOL
    }

    async fn connect(&self, remote: SocketAddr, bind: Option<SocketAddr>) -> io::Result<BoxedStream> {
        let socket = match remote {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        if let Some(local) = bind {
            socket.bind(local)?;
        }
        let stream = socket.connect(remote).await?;
        stream.set_nodelay(self.nodelay)?;
        tracing::debug!("🔌 TCP connected: {} -> {}", stream.local_addr()?, remote);
        Ok(Box::new(stream))
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn RpcListener>> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        tracing::info!("✅ TCP listening on {}", listener.local_addr()?);
        Ok(Box::new(TcpRpcListener {
            listener,
            nodelay: self.nodelay,
        }))
    }
}

struct TcpRpcListener {
    listener: TcpListener,
    nodelay: bool,
}

#[async_trait]
impl RpcListener for TcpRpcListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(self.nodelay)?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// 按协议索引的流工厂，构建后只读
#[derive(Clone, Default)]
pub struct StreamFactoryRegistry {
    factories: HashMap<Protocol, Arc<dyn StreamFactory>>,
}

impl StreamFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 默认注册 TCP
    pub fn with_tcp() -> Self {
        let mut registry = Self::new();
        registry
            .factories
            .insert(TCP_PROTOCOL, Arc::new(TcpStreamFactory::new()));
        registry
    }

    /// 同一协议重复注册会替换旧工厂，返回是否替换
    pub fn insert(&mut self, factory: Arc<dyn StreamFactory>) -> bool {
        self.factories.insert(factory.protocol(), factory).is_some()
    }

    pub fn get(&self, protocol: Protocol) -> Result<Arc<dyn StreamFactory>, RpcError> {
        self.factories
            .get(&protocol)
            .cloned()
            .ok_or_else(|| RpcError::not_found(format!("stream factory for protocol {}", protocol)))
    }

    pub fn contains(&self, protocol: Protocol) -> bool {
        self.factories.contains_key(&protocol)
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<_> = self.factories.keys().copied().collect();
        protocols.sort();
        protocols
    }
}

impl std::fmt::Debug for StreamFactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFactoryRegistry")
            .field("protocols", &self.protocols())
            .finish()
    }
}
