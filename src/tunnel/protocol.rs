//! Frame protocol spoken between the tunnel client and the proxy.
//!
//! Every frame is encoded as `u8 kind` + `u32be body_len` + `body`. Integers in
//! the body are `u64be`; strings and payloads are `u32be len` + bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const KIND_DIAL_REQUEST: u8 = 1;
const KIND_DIAL_RESPONSE: u8 = 2;
const KIND_DATA: u8 = 3;
const KIND_CLOSE_REQUEST: u8 = 4;
const KIND_CLOSE_RESPONSE: u8 = 5;

const HEADER_BYTES: usize = 5;

pub const MAX_FRAME_BYTES: u32 = 1 << 20; // 1 MiB body
pub const MAX_DATA_PAYLOAD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame kind {0}")]
    BadKind(u8),
    #[error("frame too large: {0}")]
    FrameTooLarge(u32),
    #[error("truncated frame body")]
    Truncated,
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    DialRequest {
        protocol: String,
        address: String,
        correlator: u64,
    },
    DialResponse {
        correlator: u64,
        /// Empty on success.
        error: String,
        connection_id: u64,
    },
    Data {
        connection_id: u64,
        payload: Bytes,
    },
    CloseRequest {
        connection_id: u64,
    },
    CloseResponse {
        connection_id: u64,
        error: String,
    },
}

impl Frame {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::DialRequest { .. } => "dial_request",
            Frame::DialResponse { .. } => "dial_response",
            Frame::Data { .. } => "data",
            Frame::CloseRequest { .. } => "close_request",
            Frame::CloseResponse { .. } => "close_response",
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Frame::DialRequest { .. } => KIND_DIAL_REQUEST,
            Frame::DialResponse { .. } => KIND_DIAL_RESPONSE,
            Frame::Data { .. } => KIND_DATA,
            Frame::CloseRequest { .. } => KIND_CLOSE_REQUEST,
            Frame::CloseResponse { .. } => KIND_CLOSE_RESPONSE,
        }
    }
}

/// Appends the encoded frame (header included) to `out`.
pub fn encode_frame(frame: &Frame, out: &mut BytesMut) -> Result<(), ProtocolError> {
    let start = out.len();
    out.put_u8(frame.kind());
    out.put_u32(0); // patched below

    match frame {
        Frame::DialRequest {
            protocol,
            address,
            correlator,
        } => {
            put_bytes(out, protocol.as_bytes());
            put_bytes(out, address.as_bytes());
            out.put_u64(*correlator);
        }
        Frame::DialResponse {
            correlator,
            error,
            connection_id,
        } => {
            out.put_u64(*correlator);
            put_bytes(out, error.as_bytes());
            out.put_u64(*connection_id);
        }
        Frame::Data {
            connection_id,
            payload,
        } => {
            out.put_u64(*connection_id);
            put_bytes(out, payload);
        }
        Frame::CloseRequest { connection_id } => {
            out.put_u64(*connection_id);
        }
        Frame::CloseResponse {
            connection_id,
            error,
        } => {
            out.put_u64(*connection_id);
            put_bytes(out, error.as_bytes());
        }
    }

    let body_len = out.len() - start - HEADER_BYTES;
    let n: u32 = body_len.try_into().unwrap_or(u32::MAX);
    if n > MAX_FRAME_BYTES {
        out.truncate(start);
        return Err(ProtocolError::FrameTooLarge(n));
    }
    out[start + 1..start + HEADER_BYTES].copy_from_slice(&n.to_be_bytes());
    Ok(())
}

/// Decodes a frame body previously announced with `kind`.
pub fn decode_body(kind: u8, mut body: Bytes) -> Result<Frame, ProtocolError> {
    let frame = match kind {
        KIND_DIAL_REQUEST => Frame::DialRequest {
            protocol: get_string(&mut body, "protocol")?,
            address: get_string(&mut body, "address")?,
            correlator: get_u64(&mut body)?,
        },
        KIND_DIAL_RESPONSE => Frame::DialResponse {
            correlator: get_u64(&mut body)?,
            error: get_string(&mut body, "error")?,
            connection_id: get_u64(&mut body)?,
        },
        KIND_DATA => Frame::Data {
            connection_id: get_u64(&mut body)?,
            payload: get_bytes(&mut body)?,
        },
        KIND_CLOSE_REQUEST => Frame::CloseRequest {
            connection_id: get_u64(&mut body)?,
        },
        KIND_CLOSE_RESPONSE => Frame::CloseResponse {
            connection_id: get_u64(&mut body)?,
            error: get_string(&mut body, "error")?,
        },
        other => return Err(ProtocolError::BadKind(other)),
    };
    Ok(frame)
}

/// Writes one frame and flushes. `buf` is scratch space reused across calls.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &Frame,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    buf.clear();
    buf.reserve(frame_size_hint(frame));
    encode_frame(frame, buf)?;
    w.write_all(buf).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` when the peer ends the stream cleanly
/// between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<Frame>, ProtocolError> {
    let kind = match r.read_u8().await {
        Ok(k) => k,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let n = r.read_u32().await?;
    if n > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(n));
    }

    let mut body = vec![0u8; n as usize];
    r.read_exact(&mut body).await?;
    decode_body(kind, Bytes::from(body)).map(Some)
}

fn frame_size_hint(frame: &Frame) -> usize {
    let var = match frame {
        Frame::DialRequest {
            protocol, address, ..
        } => protocol.len() + address.len(),
        Frame::DialResponse { error, .. } | Frame::CloseResponse { error, .. } => error.len(),
        Frame::Data { payload, .. } => payload.len(),
        Frame::CloseRequest { .. } => 0,
    };
    HEADER_BYTES + 24 + var
}

fn put_bytes(out: &mut BytesMut, b: &[u8]) {
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    out.put_u32(n);
    out.put_slice(b);
}

fn get_u64(body: &mut Bytes) -> Result<u64, ProtocolError> {
    if body.remaining() < 8 {
        return Err(ProtocolError::Truncated);
    }
    Ok(body.get_u64())
}

fn get_bytes(body: &mut Bytes) -> Result<Bytes, ProtocolError> {
    if body.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let n = body.get_u32() as usize;
    if body.remaining() < n {
        return Err(ProtocolError::Truncated);
    }
    Ok(body.split_to(n))
}

fn get_string(body: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    let b = get_bytes(body)?;
    String::from_utf8(b.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}
