/// 协议抽象层
///
/// - `stream`：按协议创建字节流（建连、监听）
/// - `context`：每连接的协议状态与握手

pub mod context;
pub mod stream;

pub use context::{
    ConnectionContext, ConnectionContextFactory, StandardConnectionContext,
    StandardConnectionContextFactory, CONNECTION_HEADER, PROTOCOL_VERSION,
};
pub use stream::{BoxedStream, RpcListener, RpcStream, StreamFactory, StreamFactoryRegistry, TcpStreamFactory};
