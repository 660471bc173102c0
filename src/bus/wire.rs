//! Relay wire protocol.
//!
//! Requests and responses are length-prefixed frames over TCP:
//!
//! ```text
//! request:  [opcode u8][body_len u32 le][body bytes]
//! response: [status u8][body_len u32 le][body bytes]
//! ```
//!
//! Bodies are JSON. On `Status::Ok` the response body is the typed reply;
//! on `Status::Error` or `Status::BadRequest` it is a UTF-8 message.
//! Frames above [`MAX_FRAME`] are refused on both ends.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bus::store::{Entry, Fields};

/// Upper bound on a frame body. A full sensor stream read stays well
/// under this; anything larger is a protocol violation.
pub const MAX_FRAME: usize = 4 * 1024 * 1024;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Ping = 0,
    Publish = 1,
    Read = 2,
    Tail = 3,
    Last = 4,
    HbSet = 5,
    HbCheck = 6,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Opcode::Ping),
            1 => Some(Opcode::Publish),
            2 => Some(Opcode::Read),
            3 => Some(Opcode::Tail),
            4 => Some(Opcode::Last),
            5 => Some(Opcode::HbSet),
            6 => Some(Opcode::HbCheck),
            _ => None,
        }
    }
}

/// Response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Request handled; body is the typed reply.
    Ok = 0,
    /// Relay-side failure; body is a message. Safe to retry.
    Error = 1,
    /// The request itself was invalid; body is a message. Retrying the
    /// same bytes will fail again.
    BadRequest = 2,
}

impl Status {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Status::Ok),
            1 => Some(Status::Error),
            2 => Some(Status::BadRequest),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishReq {
    pub stream: String,
    pub fields: Fields,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResp {
    pub id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadReq {
    pub stream: String,
    /// Entries strictly after this id.
    pub after: u64,
    pub limit: u32,
    /// How long the relay may hold the request waiting for data. Zero
    /// returns immediately.
    pub block_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResp {
    pub entries: Vec<Entry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TailReq {
    pub stream: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TailResp {
    pub id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LastReq {
    pub stream: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LastResp {
    pub entry: Option<Entry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HbSetReq {
    pub key: String,
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HbCheckReq {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HbCheckResp {
    pub alive: bool,
}

/// A response before framing: status byte plus raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: Status,
    pub payload: Vec<u8>,
}

impl RawResponse {
    /// Ok response carrying `value` as JSON. Serialization failure turns
    /// into an Error response rather than a dropped connection.
    pub fn ok<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(payload) => Self {
                status: Status::Ok,
                payload,
            },
            Err(e) => Self::error(format!("encode reply: {e}")),
        }
    }

    pub fn empty() -> Self {
        Self {
            status: Status::Ok,
            payload: Vec::new(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            payload: msg.into().into_bytes(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: Status::BadRequest,
            payload: msg.into().into_bytes(),
        }
    }

    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    op: Opcode,
    body: &[u8],
) -> io::Result<()> {
    if body.len() > MAX_FRAME {
        return Err(invalid_data(format!("request body {} bytes", body.len())));
    }
    let mut frame = Vec::with_capacity(5 + body.len());
    frame.push(op as u8);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await
}

pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(Opcode, Vec<u8>)> {
    let mut head = [0u8; 5];
    reader.read_exact(&mut head).await?;
    let op = Opcode::from_u8(head[0])
        .ok_or_else(|| invalid_data(format!("unknown opcode {}", head[0])))?;
    let body = read_body(reader, [head[1], head[2], head[3], head[4]]).await?;
    Ok((op, body))
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    resp: &RawResponse,
) -> io::Result<()> {
    if resp.payload.len() > MAX_FRAME {
        return Err(invalid_data(format!(
            "response body {} bytes",
            resp.payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(5 + resp.payload.len());
    frame.push(resp.status as u8);
    frame.extend_from_slice(&(resp.payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&resp.payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<RawResponse> {
    let mut head = [0u8; 5];
    reader.read_exact(&mut head).await?;
    let status = Status::from_u8(head[0])
        .ok_or_else(|| invalid_data(format!("unknown status {}", head[0])))?;
    let payload = read_body(reader, [head[1], head[2], head[3], head[4]]).await?;
    Ok(RawResponse { status, payload })
}

async fn read_body<R: AsyncRead + Unpin>(reader: &mut R, len_le: [u8; 4]) -> io::Result<Vec<u8>> {
    let len = u32::from_le_bytes(len_le) as usize;
    if len > MAX_FRAME {
        return Err(invalid_data(format!("frame body {len} bytes")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
