use std::net::SocketAddr;
use std::time::Duration;

use crate::status::{Status, StatusCode};

/// 连接关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 对端正常关闭
    Normal,
    /// 空闲超时 (connection_keepalive_time)
    Idle,
    /// 连通性被人为阻断
    ConnectivityBroken,
    /// Messenger 正在关闭
    Shutdown,
    /// 错误
    Error(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Normal => f.write_str("closed by peer"),
            CloseReason::Idle => f.write_str("idle timeout"),
            CloseReason::ConnectivityBroken => f.write_str("connectivity broken"),
            CloseReason::Shutdown => f.write_str("messenger shutdown"),
            CloseReason::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

fn fmt_remote(remote: &Option<SocketAddr>) -> String {
    remote.map(|r| format!(" ({})", r)).unwrap_or_default()
}

/// 统一 RPC 错误类型
///
/// 所有公开操作都返回 `Result<T, RpcError>`，不会用 panic 表达控制流。
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// 注销不存在的服务、移除已触发的任务、中止不存在的任务
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// 重复注册服务、重复绑定监听地址
    #[error("Already exists: {what}")]
    AlreadyExists { what: String },

    /// 连通性错误：黑名单地址或 socket 故障
    #[error("Connectivity error{}: {reason}", fmt_remote(.remote))]
    Connectivity {
        remote: Option<SocketAddr>,
        reason: String,
    },

    /// 任务在触发前被中止
    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    /// 入站调用的目标服务未注册，回报给调用方
    #[error("Service not found: {service}")]
    ServiceNotFound { service: String },

    /// Messenger 已关闭，不再接受新工作
    #[error("Service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    /// 远端返回的非 OK 状态
    #[error("Remote error: {status}")]
    Remote { status: Status },

    /// 帧格式或握手错误
    #[error("Protocol error ({protocol}): {reason}")]
    Protocol { protocol: String, reason: String },

    /// 配置相关错误
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration { field: String, reason: String },

    /// 超时错误
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    /// 违反调用约定（release 构建下降级为错误）
    #[error("Illegal state: {reason}")]
    IllegalState { reason: String },
}

/// 便利构造函数
impl RpcError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    pub fn connectivity(remote: Option<SocketAddr>, reason: impl Into<String>) -> Self {
        Self::Connectivity {
            remote,
            reason: reason.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn service_not_found(service: impl Into<String>) -> Self {
        Self::ServiceNotFound {
            service: service.into(),
        }
    }

    pub fn service_unavailable(reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            reason: reason.into(),
        }
    }

    pub fn protocol_error(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }

    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    pub fn illegal_state(reason: impl Into<String>) -> Self {
        Self::IllegalState {
            reason: reason.into(),
        }
    }
}

impl RpcError {
    /// 判断错误是否可重试
    ///
    /// 本库不做自动重试，这只是给调用方的提示。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Connectivity { .. } | RpcError::Timeout { .. } | RpcError::ServiceUnavailable { .. }
        )
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        self.status_code().as_str()
    }

    /// 映射到线上状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            RpcError::NotFound { .. } => StatusCode::NotFound,
            RpcError::AlreadyExists { .. } => StatusCode::AlreadyPresent,
            RpcError::Connectivity { .. } => StatusCode::NetworkError,
            RpcError::Cancelled { .. } => StatusCode::Aborted,
            RpcError::ServiceNotFound { .. } => StatusCode::ServiceNotFound,
            RpcError::ServiceUnavailable { .. } => StatusCode::ServiceUnavailable,
            RpcError::Remote { status } => status.code,
            RpcError::Protocol { .. } => StatusCode::ProtocolError,
            RpcError::Configuration { .. } => StatusCode::InvalidArgument,
            RpcError::Timeout { .. } => StatusCode::TimedOut,
            RpcError::IllegalState { .. } => StatusCode::IllegalState,
        }
    }

    /// 转换为响应帧里的状态对象
    pub fn to_status(&self) -> Status {
        match self {
            RpcError::Remote { status } => status.clone(),
            RpcError::ServiceNotFound { service } => Status::new(StatusCode::ServiceNotFound, service.clone()),
            other => Status::new(other.status_code(), other.to_string()),
        }
    }

    /// 从远端状态还原错误
    ///
    /// 调用方能直接匹配 `ServiceNotFound`，其余状态保留为 `Remote`。
    pub fn from_status(status: Status) -> Self {
        match status.code {
            StatusCode::ServiceNotFound => RpcError::ServiceNotFound {
                service: status.message,
            },
            _ => RpcError::Remote { status },
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, RpcError::Connectivity { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RpcError::Cancelled { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::NotFound { .. })
    }
}

/// 从标准IO错误转换
impl From<std::io::Error> for RpcError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::AddrInUse => RpcError::AlreadyExists {
                what: format!("address in use: {}", error),
            },
            std::io::ErrorKind::TimedOut => RpcError::Timeout {
                operation: format!("io: {}", error),
                duration: Duration::ZERO,
            },
            _ => RpcError::Connectivity {
                remote: None,
                reason: format!("IO error: {}", error),
            },
        }
    }
}

impl From<crate::config::ConfigError> for RpcError {
    fn from(error: crate::config::ConfigError) -> Self {
        RpcError::Configuration {
            field: error.field().to_string(),
            reason: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_keeps_service_not_found() {
        let err = RpcError::service_not_found("missing");
        let status = err.to_status();
        assert_eq!(status.code, StatusCode::ServiceNotFound);
        assert_eq!(RpcError::from_status(status), err);
    }

    #[test]
    fn test_other_errors_become_remote() {
        let err = RpcError::cancelled("aborted by caller");
        let restored = RpcError::from_status(err.to_status());
        assert_eq!(restored.status_code(), StatusCode::Aborted);
        assert!(matches!(restored, RpcError::Remote { .. }));
    }

    #[test]
    fn test_io_error_mapping() {
        let err: RpcError = std::io::Error::new(std::io::ErrorKind::AddrInUse, "busy").into();
        assert!(matches!(err, RpcError::AlreadyExists { .. }));

        let err: RpcError = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_connectivity());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_connectivity_display() {
        let addr: SocketAddr = "127.0.0.1:7100".parse().unwrap();
        let err = RpcError::connectivity(Some(addr), "blocked");
        assert_eq!(err.to_string(), "Connectivity error (127.0.0.1:7100): blocked");
        assert_eq!(err.error_code(), "NETWORK_ERROR");
    }
}
