/// Messenger 构建器
///
/// 所有配置都在构建时确定：反应器数量、保活时间、定时器精度、流工厂、监听协议、
/// 连接上下文工厂。构建完成后反应器线程即已启动。

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use super::Messenger;
use crate::{
    config::MessengerConfig,
    endpoint::{Protocol, TCP_PROTOCOL},
    error::RpcError,
    protocol::{
        ConnectionContextFactory, StandardConnectionContextFactory, StreamFactory, StreamFactoryRegistry,
        TcpStreamFactory,
    },
};

pub struct MessengerBuilder {
    pub(super) config: MessengerConfig,
    pub(super) stream_factories: StreamFactoryRegistry,
    pub(super) listen_protocol: Protocol,
    pub(super) context_factory: Arc<dyn ConnectionContextFactory>,
}

impl MessengerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: MessengerConfig::new(name),
            stream_factories: StreamFactoryRegistry::new(),
            listen_protocol: TCP_PROTOCOL,
            context_factory: Arc::new(StandardConnectionContextFactory),
        }
    }

    /// 整体替换配置（例如从 TOML 加载），实例名以配置为准
    pub fn with_config(mut self, config: MessengerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn set_num_reactors(mut self, num_reactors: usize) -> Self {
        self.config.num_reactors = num_reactors;
        self
    }

    pub fn set_connection_keepalive_time(mut self, keepalive: Duration) -> Self {
        self.config.connection_keepalive_time = keepalive;
        self
    }

    pub fn set_coarse_timer_granularity(mut self, granularity: Duration) -> Self {
        self.config.coarse_timer_granularity = granularity;
        self
    }

    pub fn set_io_threads(mut self, threads: usize) -> Self {
        self.config.io_threads = threads;
        self
    }

    pub fn set_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn set_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.config.max_frame_size = max_frame_size;
        self
    }

    pub fn set_shutdown_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_drain_timeout = timeout;
        self
    }

    /// 出站连接的本地绑定地址，按地址族分别设置
    pub fn set_outbound_address(mut self, address: IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => self.config.outbound_address_v4 = Some(address),
            IpAddr::V6(_) => self.config.outbound_address_v6 = Some(address),
        }
        self
    }

    pub fn use_connection_context_factory(mut self, factory: Arc<dyn ConnectionContextFactory>) -> Self {
        self.context_factory = factory;
        self
    }

    pub fn use_default_connection_context_factory(mut self) -> Self {
        self.context_factory = Arc::new(StandardConnectionContextFactory);
        self
    }

    /// 注册流工厂，同一协议后注册的覆盖先注册的
    pub fn add_stream_factory(mut self, factory: Arc<dyn StreamFactory>) -> Self {
        let protocol = factory.protocol();
        if self.stream_factories.insert(factory) {
            tracing::debug!("stream factory for {} replaced", protocol);
        }
        self
    }

    pub fn set_listen_protocol(mut self, protocol: Protocol) -> Self {
        self.listen_protocol = protocol;
        self
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    /// 校验配置并启动反应器
    pub fn build(mut self) -> Result<Messenger, RpcError> {
        self.config.validate()?;

        if !self.stream_factories.contains(TCP_PROTOCOL) {
            self.stream_factories.insert(Arc::new(TcpStreamFactory::new()));
        }
        if !self.stream_factories.contains(self.listen_protocol) {
            return Err(RpcError::config_error(
                "listen_protocol",
                format!("no stream factory registered for {}", self.listen_protocol),
            ));
        }

        Messenger::start(self)
    }
}
