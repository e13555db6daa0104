/// 线上状态对象
///
/// 响应帧里携带的 `{code, message}`，`code = 0` 保留给 OK。

use serde::{Deserialize, Serialize};

/// 状态码 - 在线上以 u16 大端序传输
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum StatusCode {
    Ok = 0,
    NotFound = 1,
    AlreadyPresent = 2,
    NetworkError = 3,
    Aborted = 4,
    ServiceNotFound = 5,
    ServiceUnavailable = 6,
    RemoteError = 7,
    ProtocolError = 8,
    InvalidArgument = 9,
    TimedOut = 10,
    IllegalState = 11,
}

/// 未知状态码原样作为错误返回，由调用方决定如何保留
impl TryFrom<u16> for StatusCode {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => StatusCode::Ok,
            1 => StatusCode::NotFound,
            2 => StatusCode::AlreadyPresent,
            3 => StatusCode::NetworkError,
            4 => StatusCode::Aborted,
            5 => StatusCode::ServiceNotFound,
            6 => StatusCode::ServiceUnavailable,
            7 => StatusCode::RemoteError,
            8 => StatusCode::ProtocolError,
            9 => StatusCode::InvalidArgument,
            10 => StatusCode::TimedOut,
            11 => StatusCode::IllegalState,
            unknown => return Err(unknown),
        })
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> Self {
        code as u16
    }
}

impl StatusCode {
    pub fn is_ok(&self) -> bool {
        *self == StatusCode::Ok
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyPresent => "ALREADY_PRESENT",
            StatusCode::NetworkError => "NETWORK_ERROR",
            StatusCode::Aborted => "ABORTED",
            StatusCode::ServiceNotFound => "SERVICE_NOT_FOUND",
            StatusCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            StatusCode::RemoteError => "REMOTE_ERROR",
            StatusCode::ProtocolError => "PROTOCOL_ERROR",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::TimedOut => "TIMED_OUT",
            StatusCode::IllegalState => "ILLEGAL_STATE",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 状态对象
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}
