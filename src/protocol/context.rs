/// 连接上下文
///
/// 每条连接在进入 Open 之前由 `ConnectionContextFactory` 创建一个上下文并完成握手。
/// 握手在 IO 线程池上执行，反应器线程只等待结果。
///
/// 标准上下文的连接头：客户端先写 4 字节魔数 `MRPC` 和 1 字节版本号，
/// 服务端读到其他内容直接拒绝连接。

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::stream::BoxedStream;
use crate::{connection::Direction, error::RpcError};

pub const PROTOCOL_VERSION: u8 = 0x01;
pub const CONNECTION_HEADER: [u8; 5] = [b'M', b'R', b'P', b'C', PROTOCOL_VERSION];

/// 每连接的协议状态
#[async_trait]
pub trait ConnectionContext: Send + 'static {
    fn name(&self) -> &'static str;

    /// 客户端握手
    async fn client_handshake(&mut self, stream: &mut BoxedStream) -> Result<(), RpcError>;

    /// 服务端握手
    async fn server_handshake(&mut self, stream: &mut BoxedStream) -> Result<(), RpcError>;

    /// 用于 dump_running_rpcs 的状态快照
    fn dump(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// 上下文工厂
pub trait ConnectionContextFactory: Send + Sync + 'static {
    fn new_context(&self, direction: Direction) -> Box<dyn ConnectionContext>;
}

/// 标准上下文：固定连接头，无认证
#[derive(Debug)]
pub struct StandardConnectionContext {
    direction: Direction,
    handshake_done: bool,
    peer_version: Option<u8>,
}

impl StandardConnectionContext {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            handshake_done: false,
            peer_version: None,
        }
    }
}

#[async_trait]
impl ConnectionContext for StandardConnectionContext {
    fn name(&self) -> &'static str {
        "standard"
    }

    async fn client_handshake(&mut self, stream: &mut BoxedStream) -> Result<(), RpcError> {
        stream.write_all(&CONNECTION_HEADER).await?;
        stream.flush().await?;
        self.handshake_done = true;
        Ok(())
    }

    async fn server_handshake(&mut self, stream: &mut BoxedStream) -> Result<(), RpcError> {
        let mut header = [0u8; CONNECTION_HEADER.len()];
        stream.read_exact(&mut header).await?;

        if header[..4] != CONNECTION_HEADER[..4] {
            return Err(RpcError::protocol_error(
                self.name(),
                format!("bad connection header magic: {:02x?}", &header[..4]),
            ));
        }
        let version = header[4];
        if version != PROTOCOL_VERSION {
            return Err(RpcError::protocol_error(
                self.name(),
                format!("unsupported protocol version {} (expected {})", version, PROTOCOL_VERSION),
            ));
        }

        self.peer_version = Some(version);
        self.handshake_done = true;
        Ok(())
    }

    fn dump(&self) -> serde_json::Value {
        json!({
            "context": self.name(),
            "direction": self.direction,
            "handshake_done": self.handshake_done,
            "peer_version": self.peer_version,
        })
    }
}

/// 标准上下文工厂
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardConnectionContextFactory;

impl ConnectionContextFactory for StandardConnectionContextFactory {
    fn new_context(&self, direction: Direction) -> Box<dyn ConnectionContext> {
        Box::new(StandardConnectionContext::new(direction))
    }
}
