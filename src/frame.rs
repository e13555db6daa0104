/// 线上帧格式
///
/// 所有整数均为大端序。
///
/// 请求帧：
/// ```text
/// u32 total_len | u32 call_id | u16 service_len | service | u16 method_len | method | payload
/// ```
/// 响应帧：
/// ```text
/// u32 total_len | u32 call_id | u16 status_code | payload (OK) 或 状态消息 (非 OK)
/// ```
/// `total_len` 不包含自身的 4 字节。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    status::{Status, StatusCode},
    CallId,
};

/// 长度前缀大小
pub const LENGTH_PREFIX_LEN: usize = 4;
/// 请求帧体的最小长度：call_id + 两个长度字段
const MIN_REQUEST_BODY: usize = 4 + 2 + 2;
/// 响应帧体的最小长度：call_id + 状态码
const MIN_RESPONSE_BODY: usize = 4 + 2;

/// 帧错误类型
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too large: {len} bytes (limit {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("Name too long: {field} has {len} bytes")]
    NameTooLong { field: &'static str, len: usize },
}

impl From<FrameError> for crate::error::RpcError {
    fn from(error: FrameError) -> Self {
        crate::error::RpcError::protocol_error("frame", error.to_string())
    }
}

/// 请求帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub call_id: CallId,
    pub service: String,
    pub method: String,
    pub payload: Bytes,
}

impl RequestFrame {
    pub fn new(call_id: CallId, service: impl Into<String>, method: impl Into<String>, payload: Bytes) -> Self {
        Self {
            call_id,
            service: service.into(),
            method: method.into(),
            payload,
        }
    }

    /// 帧体长度（不含长度前缀）
    pub fn body_len(&self) -> usize {
        MIN_REQUEST_BODY + self.service.len() + self.method.len() + self.payload.len()
    }

    /// 编码为完整帧（含长度前缀）
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let service_len = name_len("service", &self.service)?;
        let method_len = name_len("method", &self.method)?;
        let body_len = self.body_len();
        let total = u32::try_from(body_len).map_err(|_| FrameError::FrameTooLarge {
            len: body_len,
            max: u32::MAX as usize,
        })?;

        dst.reserve(LENGTH_PREFIX_LEN + body_len);
        dst.put_u32(total);
        dst.put_u32(self.call_id.as_u32());
        dst.put_u16(service_len);
        dst.put_slice(self.service.as_bytes());
        dst.put_u16(method_len);
        dst.put_slice(self.method.as_bytes());
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// 从帧体解码（长度前缀已被 `FrameDecoder` 剥离）
    pub fn decode(mut body: Bytes) -> Result<Self, FrameError> {
        if body.len() < MIN_REQUEST_BODY {
            return Err(FrameError::InvalidFrame(format!(
                "request body too short: {} bytes",
                body.len()
            )));
        }

        let call_id = CallId::new(body.get_u32());
        let service = take_name(&mut body, "service")?;
        if body.len() < 2 {
            return Err(FrameError::InvalidFrame("missing method length".to_string()));
        }
        let method = take_name(&mut body, "method")?;

        Ok(Self {
            call_id,
            service,
            method,
            payload: body,
        })
    }
}

/// 响应帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub call_id: CallId,
    pub code: StatusCode,
    /// OK 时是负载，否则是 UTF-8 状态消息
    pub body: Bytes,
}

impl ResponseFrame {
    pub fn success(call_id: CallId, payload: Bytes) -> Self {
        Self {
            call_id,
            code: StatusCode::Ok,
            body: payload,
        }
    }

    pub fn failure(call_id: CallId, status: &Status) -> Self {
        Self {
            call_id,
            code: status.code,
            body: Bytes::copy_from_slice(status.message.as_bytes()),
        }
    }

    pub fn body_len(&self) -> usize {
        MIN_RESPONSE_BODY + self.body.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body_len = self.body_len();
        let total = u32::try_from(body_len).map_err(|_| FrameError::FrameTooLarge {
            len: body_len,
            max: u32::MAX as usize,
        })?;

        dst.reserve(LENGTH_PREFIX_LEN + body_len);
        dst.put_u32(total);
        dst.put_u32(self.call_id.as_u32());
        dst.put_u16(u16::from(self.code));
        dst.put_slice(&self.body);
        Ok(())
    }

    pub fn decode(mut body: Bytes) -> Result<Self, FrameError> {
        if body.len() < MIN_RESPONSE_BODY {
            return Err(FrameError::InvalidFrame(format!(
                "response body too short: {} bytes",
                body.len()
            )));
        }
        let call_id = CallId::new(body.get_u32());
        match StatusCode::try_from(body.get_u16()) {
            Ok(code) => Ok(Self { call_id, code, body }),
            // 未知状态码按远端错误处理，原始数值保留在消息里
            Err(raw) => {
                let message = format!("unknown status code {}: {}", raw, String::from_utf8_lossy(&body));
                Ok(Self {
                    call_id,
                    code: StatusCode::RemoteError,
                    body: Bytes::from(message),
                })
            }
        }
    }

    /// 拆分为调用结果
    pub fn into_result(self) -> Result<Bytes, Status> {
        if self.code.is_ok() {
            Ok(self.body)
        } else {
            let message = String::from_utf8_lossy(&self.body).into_owned();
            Err(Status::new(self.code, message))
        }
    }
}

fn name_len(field: &'static str, name: &str) -> Result<u16, FrameError> {
    u16::try_from(name.len()).map_err(|_| FrameError::NameTooLong {
        field,
        len: name.len(),
    })
}

fn take_name(body: &mut Bytes, field: &'static str) -> Result<String, FrameError> {
    let len = body.get_u16() as usize;
    if body.len() < len {
        return Err(FrameError::InvalidFrame(format!(
            "{} length {} exceeds remaining {} bytes",
            field,
            len,
            body.len()
        )));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidUtf8 { field })
}

/// 读缓冲统计
#[derive(Debug, Default, Clone, Copy)]
pub struct DecoderStats {
    /// 读取次数
    pub reads: u64,
    /// 解析出的帧数
    pub frames: u64,
    /// 总字节读取量
    pub bytes_read: u64,
}

/// 流式帧解码器
///
/// 特性：
/// 1. 零拷贝切分帧体
/// 2. 半包时保留数据等待下一次读取
/// 3. 超过上限的帧直接报错，不等待帧体到齐
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
    target_capacity: usize,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self::with_capacity(max_frame_size, 8192)
    }

    pub fn with_capacity(max_frame_size: usize, initial_capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(initial_capacity),
            max_frame_size,
            target_capacity: initial_capacity,
            stats: DecoderStats::default(),
        }
    }

    /// 追加原始字节（测试与非 socket 来源使用）
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.stats.bytes_read += data.len() as u64;
    }

    /// 尝试切出下一个完整帧体
    ///
    /// 返回：
    /// - Ok(Some(body)) - 一个完整帧体（不含长度前缀）
    /// - Ok(None) - 数据不足
    /// - Err(error) - 帧超限
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.buffer.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
        if body_len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                len: body_len,
                max: self.max_frame_size,
            });
        }

        if self.buffer.len() < LENGTH_PREFIX_LEN + body_len {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX_LEN);
        let body = self.buffer.split_to(body_len).freeze();
        self.stats.frames += 1;
        Ok(Some(body))
    }

    /// 从流中读取更多数据，返回 0 表示对端关闭
    pub async fn fill_from<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if self.buffer.capacity() - self.buffer.len() < 4096 {
            self.buffer.reserve(self.target_capacity);
        }
        let n = reader.read_buf(&mut self.buffer).await?;
        self.stats.reads += 1;
        self.stats.bytes_read += n as u64;
        Ok(n)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout_is_big_endian() {
        let frame = RequestFrame::new(CallId::new(0x0102_0304), "echo", "ping", Bytes::from_static(b"hi"));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();

        // 4 + 4 + 2 + 4 + 2 + 4 + 2
        assert_eq!(buf.len(), 22);
        assert_eq!(&buf[0..4], &[0, 0, 0, 18]);
        assert_eq!(&buf[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[8..10], &[0, 4]);
        assert_eq!(&buf[10..14], b"echo");
        assert_eq!(&buf[14..16], &[0, 4]);
        assert_eq!(&buf[16..20], b"ping");
        assert_eq!(&buf[20..22], b"hi");
    }

    #[test]
    fn test_response_layout() {
        let status = Status::new(StatusCode::ServiceNotFound, "missing");
        let frame = ResponseFrame::failure(CallId::new(7), &status);
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();

        assert_eq!(&buf[0..4], &[0, 0, 0, 13]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 7]);
        assert_eq!(&buf[8..10], &[0, 5]);
        assert_eq!(&buf[10..], b"missing");
    }

    #[test]
    fn test_decoder_handles_partial_frames() {
        let frame = RequestFrame::new(CallId::new(9), "svc", "m", Bytes::from_static(b"payload"));
        let mut encoded = BytesMut::new();
        frame.encode(&mut encoded).unwrap();

        let mut decoder = FrameDecoder::new(1024);
        decoder.extend_from_slice(&encoded[..5]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.extend_from_slice(&encoded[5..]);
        let body = decoder.next_frame().unwrap().expect("complete frame");
        assert_eq!(RequestFrame::decode(body).unwrap(), frame);
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.stats().frames, 1);
    }

    #[test]
    fn test_decoder_splits_pipelined_frames() {
        let mut encoded = BytesMut::new();
        for id in 1..=3u32 {
            ResponseFrame::success(CallId::new(id), Bytes::from(vec![id as u8; id as usize]))
                .encode(&mut encoded)
                .unwrap();
        }

        let mut decoder = FrameDecoder::new(1024);
        decoder.extend_from_slice(&encoded);
        let mut ids = Vec::new();
        while let Some(body) = decoder.next_frame().unwrap() {
            let response = ResponseFrame::decode(body).unwrap();
            assert_eq!(response.body.len(), response.call_id.as_u32() as usize);
            ids.push(response.call_id.as_u32());
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_decoder_rejects_oversized_frame() {
        let mut decoder = FrameDecoder::new(16);
        decoder.extend_from_slice(&[0, 0, 1, 0]);
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::FrameTooLarge { len: 256, max: 16 })
        );
    }

    #[test]
    fn test_truncated_request_body() {
        let mut body = BytesMut::new();
        body.put_u32(1);
        body.put_u16(10);
        body.put_slice(b"abc");
        body.put_u16(0);
        assert!(matches!(
            RequestFrame::decode(body.freeze()),
            Err(FrameError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_failure_response_into_result() {
        let status = Status::new(StatusCode::Aborted, "stop");
        let mut buf = BytesMut::new();
        ResponseFrame::failure(CallId::new(3), &status).encode(&mut buf).unwrap();

        let mut decoder = FrameDecoder::new(1024);
        decoder.extend_from_slice(&buf);
        let response = ResponseFrame::decode(decoder.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(response.into_result(), Err(status));
    }

    #[test]
    fn test_unknown_status_code_is_kept_in_message() {
        let mut body = BytesMut::new();
        body.put_u32(5);
        body.put_u16(42);
        body.put_slice(b"quota exceeded");

        let response = ResponseFrame::decode(body.freeze()).unwrap();
        assert_eq!(response.call_id, CallId::new(5));
        assert_eq!(
            response.into_result(),
            Err(Status::new(
                StatusCode::RemoteError,
                "unknown status code 42: quota exceeded"
            ))
        );
    }
}
