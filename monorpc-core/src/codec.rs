//! Length-delimited wire framing.
//!
//! ```text
//! u32  body_length
//! u8   kind            0 request, 1 response
//! u8   status          0 for requests
//! u64  correlation_id
//! u16  service_length, service     (requests only)
//! u16  method_length,  method      (requests only)
//! ...  payload, or UTF-8 error text when status != 0
//! ```
//!
//! All integers are big endian.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use monoio_codec::{Decoded, Decoder, Encoder};

use crate::{config::DEFAULT_MAX_FRAME_LENGTH, message::MethodId, CorrelationId};

const LENGTH_FIELD_LEN: usize = 4;
// kind + status + correlation id
const FIXED_HEADER_LEN: usize = 1 + 1 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
}

impl TryFrom<u8> for FrameKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Request),
            1 => Ok(FrameKind::Response),
            n => Err(CodecError::Malformed(format!("unknown frame kind {n}"))),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(value: FrameKind) -> Self {
        match value {
            FrameKind::Request => 0,
            FrameKind::Response => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    UnknownMethod,
    HandlerFailed,
    Overloaded,
    BadPayload,
}

impl TryFrom<u8> for Status {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::UnknownMethod),
            2 => Ok(Status::HandlerFailed),
            3 => Ok(Status::Overloaded),
            4 => Ok(Status::BadPayload),
            n => Err(CodecError::Malformed(format!("unknown status {n}"))),
        }
    }
}

impl From<Status> for u8 {
    fn from(value: Status) -> Self {
        match value {
            Status::Ok => 0,
            Status::UnknownMethod => 1,
            Status::HandlerFailed => 2,
            Status::Overloaded => 3,
            Status::BadPayload => 4,
        }
    }
}

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub correlation_id: CorrelationId,
    pub kind: FrameKind,
    pub status: Status,
    /// Present on requests only.
    pub method: Option<MethodId>,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(correlation_id: CorrelationId, method: MethodId, payload: Bytes) -> Self {
        Self {
            correlation_id,
            kind: FrameKind::Request,
            status: Status::Ok,
            method: Some(method),
            payload,
        }
    }

    pub fn response(correlation_id: CorrelationId, payload: Bytes) -> Self {
        Self {
            correlation_id,
            kind: FrameKind::Response,
            status: Status::Ok,
            method: None,
            payload,
        }
    }

    pub fn error(correlation_id: CorrelationId, status: Status, text: impl Into<String>) -> Self {
        Self {
            correlation_id,
            kind: FrameKind::Response,
            status,
            method: None,
            payload: Bytes::from(text.into()),
        }
    }

    /// The error text of a non-ok response.
    pub fn error_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {len} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

fn read_name(body: &mut Bytes, what: &str) -> Result<String, CodecError> {
    if body.remaining() < 2 {
        return Err(CodecError::Malformed(format!("truncated {what} length")));
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len {
        return Err(CodecError::Malformed(format!("truncated {what}")));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| CodecError::Malformed(format!("{what} is not valid utf-8")))
}

fn name_len(name: &str, what: &str) -> Result<u16, CodecError> {
    u16::try_from(name.len())
        .map_err(|_| CodecError::Malformed(format!("{what} longer than {} bytes", u16::MAX)))
}

fn write_name(dst: &mut BytesMut, name: &str, len: u16) {
    dst.put_u16(len);
    dst.put_slice(name.as_bytes());
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Frame>, Self::Error> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(Decoded::Insufficient);
        }
        let body_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if body_len > self.max_frame_length {
            return Err(CodecError::FrameTooLarge {
                len: body_len,
                max: self.max_frame_length,
            });
        }
        if body_len < FIXED_HEADER_LEN {
            return Err(CodecError::Malformed(format!(
                "body of {body_len} bytes is shorter than the header"
            )));
        }
        if src.len() < LENGTH_FIELD_LEN + body_len {
            src.reserve(LENGTH_FIELD_LEN + body_len - src.len());
            return Ok(Decoded::Insufficient);
        }

        src.advance(LENGTH_FIELD_LEN);
        let mut body = src.split_to(body_len).freeze();
        let kind = FrameKind::try_from(body.get_u8())?;
        let status = Status::try_from(body.get_u8())?;
        let correlation_id = body.get_u64();
        let method = match kind {
            FrameKind::Request => {
                if status != Status::Ok {
                    return Err(CodecError::Malformed(format!(
                        "request {correlation_id} carries status {status:?}"
                    )));
                }
                let service = read_name(&mut body, "service name")?;
                let method = read_name(&mut body, "method name")?;
                Some(MethodId::new(service, method))
            }
            FrameKind::Response => None,
        };
        Ok(Decoded::Some(Frame {
            correlation_id,
            kind,
            status,
            method,
            payload: body,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // names are checked before anything is written, so a rejected frame
        // leaves `dst` untouched
        let names = match (&item.kind, &item.method) {
            (FrameKind::Request, Some(method)) => Some((
                name_len(&method.service, "service name")?,
                name_len(&method.method, "method name")?,
            )),
            (FrameKind::Request, None) => {
                return Err(CodecError::Malformed(format!(
                    "request {} without method",
                    item.correlation_id
                )))
            }
            (FrameKind::Response, _) => None,
        };
        let names_len = names.map_or(0, |(service, method)| {
            4 + usize::from(service) + usize::from(method)
        });
        let body_len = FIXED_HEADER_LEN + names_len + item.payload.len();
        if body_len > self.max_frame_length {
            return Err(CodecError::FrameTooLarge {
                len: body_len,
                max: self.max_frame_length,
            });
        }

        dst.reserve(LENGTH_FIELD_LEN + body_len);
        dst.put_u32(body_len as u32);
        dst.put_u8(item.kind.into());
        dst.put_u8(item.status.into());
        dst.put_u64(item.correlation_id);
        if let (Some((service_len, method_len)), Some(method)) = (names, &item.method) {
            write_name(dst, &method.service, service_len);
            write_name(dst, &method.method, method_len);
        }
        dst.put_slice(&item.payload);
        Ok(())
    }
}
