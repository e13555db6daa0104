/// Messenger 配置
///
/// 构建期配置，不提供命令行入口。所有时长在序列化时以毫秒表示，
/// 方便直接写进 TOML/JSON 配置文件。

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// 配置错误
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': {value} - {reason}. Suggestion: {suggestion}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
        suggestion: String,
    },

    #[error("Missing required field: {field}. {suggestion}")]
    MissingField { field: String, suggestion: String },

    #[error("Invalid address for '{field}': {address} - {reason}")]
    InvalidAddress {
        field: String,
        address: String,
        reason: String,
    },

    #[error("Configuration conflict: {message}")]
    Conflict { message: String },
}

impl ConfigError {
    /// 出错的字段名
    pub fn field(&self) -> &str {
        match self {
            ConfigError::InvalidValue { field, .. }
            | ConfigError::MissingField { field, .. }
            | ConfigError::InvalidAddress { field, .. } => field,
            ConfigError::Conflict { .. } => "config",
        }
    }

    fn invalid(field: &str, value: impl ToString, reason: &str, suggestion: &str) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
            suggestion: suggestion.to_string(),
        }
    }
}

/// Messenger 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// 实例名，用作线程名前缀与日志标识
    pub name: String,
    /// 反应器数量，构建后固定
    pub num_reactors: usize,
    /// 空闲连接保活时间
    #[serde(with = "millis")]
    pub connection_keepalive_time: Duration,
    /// 粗粒度定时器精度（空闲扫描间隔）
    #[serde(with = "millis")]
    pub coarse_timer_granularity: Duration,
    /// IO 线程池大小（建连、握手）
    pub io_threads: usize,
    /// 建连超时
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// 单帧最大字节数
    pub max_frame_size: usize,
    /// 关闭时排空在途调用的最长等待
    #[serde(with = "millis")]
    pub shutdown_drain_timeout: Duration,
    /// 出站 IPv4 连接的本地绑定地址
    pub outbound_address_v4: Option<IpAddr>,
    /// 出站 IPv6 连接的本地绑定地址
    pub outbound_address_v6: Option<IpAddr>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            name: "messenger".to_string(),
            num_reactors: 4,
            connection_keepalive_time: Duration::from_secs(65),
            coarse_timer_granularity: Duration::from_millis(100),
            io_threads: 4,
            connect_timeout: Duration::from_secs(15),
            max_frame_size: 8 * 1024 * 1024,
            shutdown_drain_timeout: Duration::from_secs(5),
            outbound_address_v4: None,
            outbound_address_v6: None,
        }
    }
}

impl MessengerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// 验证配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "name".to_string(),
                suggestion: "give the messenger a name such as \"tserver\"".to_string(),
            });
        }

        if self.num_reactors == 0 {
            return Err(ConfigError::invalid(
                "num_reactors",
                self.num_reactors,
                "must be > 0",
                "use the number of cores, e.g. 4",
            ));
        }

        if self.io_threads == 0 {
            return Err(ConfigError::invalid(
                "io_threads",
                self.io_threads,
                "must be > 0",
                "set a small pool such as 4",
            ));
        }

        if self.coarse_timer_granularity.is_zero() {
            return Err(ConfigError::invalid(
                "coarse_timer_granularity",
                "0ms",
                "must be > 0",
                "use 100ms",
            ));
        }

        if self.connection_keepalive_time < self.coarse_timer_granularity {
            return Err(ConfigError::Conflict {
                message: format!(
                    "connection_keepalive_time ({:?}) is shorter than coarse_timer_granularity ({:?})",
                    self.connection_keepalive_time, self.coarse_timer_granularity
                ),
            });
        }

        if self.connect_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "connect_timeout",
                "0ms",
                "must be > 0",
                "use a few seconds, e.g. 15s",
            ));
        }

        // 至少要放得下 call_id + 两个长度字段
        if self.max_frame_size < 8 || self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::invalid(
                "max_frame_size",
                self.max_frame_size,
                "must be within [8, u32::MAX]",
                "use 8 MiB",
            ));
        }

        if let Some(addr) = self.outbound_address_v4 {
            if !addr.is_ipv4() {
                return Err(ConfigError::InvalidAddress {
                    field: "outbound_address_v4".to_string(),
                    address: addr.to_string(),
                    reason: "expected an IPv4 address".to_string(),
                });
            }
        }

        if let Some(addr) = self.outbound_address_v6 {
            if !addr.is_ipv6() {
                return Err(ConfigError::InvalidAddress {
                    field: "outbound_address_v6".to_string(),
                    address: addr.to_string(),
                    reason: "expected an IPv6 address".to_string(),
                });
            }
        }

        Ok(())
    }

    /// 出站连接应绑定的本地地址（端口由系统分配）
    pub fn outbound_bind_for(&self, remote: &SocketAddr) -> Option<SocketAddr> {
        let ip = match remote {
            SocketAddr::V4(_) => self.outbound_address_v4,
            SocketAddr::V6(_) => self.outbound_address_v6,
        }?;
        Some(SocketAddr::new(ip, 0))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MessengerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_reactors, 4);
        assert_eq!(config.connection_keepalive_time, Duration::from_secs(65));
        assert_eq!(config.max_frame_size, 8 * 1024 * 1024);
    }

    #[test]
    fn test_zero_reactors_rejected() {
        let config = MessengerConfig {
            num_reactors: 0,
            ..MessengerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), "num_reactors");
    }

    #[test]
    fn test_keepalive_shorter_than_granularity() {
        let config = MessengerConfig {
            connection_keepalive_time: Duration::from_millis(10),
            coarse_timer_granularity: Duration::from_millis(100),
            ..MessengerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Conflict { .. })));
    }

    #[test]
    fn test_outbound_address_family_checked() {
        let config = MessengerConfig {
            outbound_address_v4: Some("::1".parse().unwrap()),
            ..MessengerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), "outbound_address_v4");
    }

    #[test]
    fn test_outbound_bind_matches_family() {
        let config = MessengerConfig {
            outbound_address_v4: Some("127.0.0.2".parse().unwrap()),
            ..MessengerConfig::default()
        };
        let v4: SocketAddr = "10.0.0.1:7100".parse().unwrap();
        let v6: SocketAddr = "[::1]:7100".parse().unwrap();
        assert_eq!(config.outbound_bind_for(&v4), Some("127.0.0.2:0".parse().unwrap()));
        assert_eq!(config.outbound_bind_for(&v6), None);
    }

    #[test]
    fn test_load_from_toml() {
        let text = r#"
            name = "tserver"
            num_reactors = 8
            connection_keepalive_time = 2000
            coarse_timer_granularity = 50
        "#;
        let config: MessengerConfig = toml::from_str(text).unwrap();
        assert_eq!(config.name, "tserver");
        assert_eq!(config.num_reactors, 8);
        assert_eq!(config.connection_keepalive_time, Duration::from_secs(2));
        assert_eq!(config.coarse_timer_granularity, Duration::from_millis(50));
        // 未写的字段取默认值
        assert_eq!(config.io_threads, 4);
        assert!(config.validate().is_ok());
    }
}
