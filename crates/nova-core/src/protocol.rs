use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::function::FileMap;

/// Upper bound on a single frame body. Larger frames are rejected before
/// any allocation happens.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Agent message types carried in the frame envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Init = 1,
    Exec = 2,
    Resp = 3,
    Ping = 4,
    Stop = 5,
    Reload = 6,
    Stream = 7,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MsgType::Init),
            2 => Some(MsgType::Exec),
            3 => Some(MsgType::Resp),
            4 => Some(MsgType::Ping),
            5 => Some(MsgType::Stop),
            6 => Some(MsgType::Reload),
            7 => Some(MsgType::Stream),
            _ => None,
        }
    }
}

/// Runtime binding sent once per connection before any request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitPayload {
    pub runtime: String,
    pub handler: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecPayload {
    pub request_id: String,
    pub input: Value,
    pub timeout_s: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespPayload {
    pub request_id: String,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadPayload {
    pub files: FileMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPayload {
    pub request_id: String,
    #[serde(default)]
    pub data: Value,
    pub is_last: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One decoded agent message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Init(InitPayload),
    Exec(ExecPayload),
    Resp(RespPayload),
    Ping,
    Stop,
    Reload(ReloadPayload),
    Stream(StreamPayload),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Init(_) => MsgType::Init,
            Message::Exec(_) => MsgType::Exec,
            Message::Resp(_) => MsgType::Resp,
            Message::Ping => MsgType::Ping,
            Message::Stop => MsgType::Stop,
            Message::Reload(_) => MsgType::Reload,
            Message::Stream(_) => MsgType::Stream,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: u8,
    payload: Value,
}

/// Encode a message as a complete frame: 4-byte big-endian length + JSON body.
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = match msg {
        Message::Init(p) => serde_json::to_value(p),
        Message::Exec(p) => serde_json::to_value(p),
        Message::Resp(p) => serde_json::to_value(p),
        Message::Ping | Message::Stop => Ok(Value::Object(Default::default())),
        Message::Reload(p) => serde_json::to_value(p),
        Message::Stream(p) => serde_json::to_value(p),
    }
    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let body = serde_json::to_vec(&Envelope {
        msg_type: msg.msg_type() as u8,
        payload,
    })
    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized(body.len()));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame from a byte slice. Returns the message and the number of
/// bytes consumed. A slice shorter than the declared frame fails with
/// `Truncated`.
pub fn decode(bytes: &[u8]) -> Result<(Message, usize), ProtocolError> {
    if bytes.len() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized(len));
    }
    if bytes.len() < 4 + len {
        return Err(ProtocolError::Truncated);
    }
    let msg = decode_body(&bytes[4..4 + len])?;
    Ok((msg, 4 + len))
}

fn decode_body(body: &[u8]) -> Result<Message, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let msg_type = MsgType::from_u8(envelope.msg_type)
        .ok_or(ProtocolError::UnknownType(envelope.msg_type))?;

    let malformed = |e: serde_json::Error| ProtocolError::Malformed(e.to_string());
    Ok(match msg_type {
        MsgType::Init => Message::Init(serde_json::from_value(envelope.payload).map_err(malformed)?),
        MsgType::Exec => Message::Exec(serde_json::from_value(envelope.payload).map_err(malformed)?),
        MsgType::Resp => Message::Resp(serde_json::from_value(envelope.payload).map_err(malformed)?),
        MsgType::Ping => Message::Ping,
        MsgType::Stop => Message::Stop,
        MsgType::Reload => {
            Message::Reload(serde_json::from_value(envelope.payload).map_err(malformed)?)
        }
        MsgType::Stream => {
            Message::Stream(serde_json::from_value(envelope.payload).map_err(malformed)?)
        }
    })
}

/// Write one framed message to an async stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), ProtocolError> {
    let frame = encode(msg)?;
    writer.write_all(&frame).await.map_err(ProtocolError::Io)?;
    writer.flush().await.map_err(ProtocolError::Io)?;
    Ok(())
}

/// Read one framed message from an async stream.
///
/// EOF before the length prefix or mid-frame surfaces as an `Io` error with
/// `UnexpectedEof`, which the client classifies as a broken connection.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, ProtocolError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(ProtocolError::Io)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized(len));
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(ProtocolError::Io)?;
    decode_body(&body)
}

#[derive(Debug)]
pub enum ProtocolError {
    Truncated,
    Oversized(usize),
    UnknownType(u8),
    Malformed(String),
    Io(std::io::Error),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Truncated => write!(f, "truncated frame"),
            ProtocolError::Oversized(len) => {
                write!(f, "frame of {} bytes exceeds limit of {}", len, MAX_FRAME_LEN)
            }
            ProtocolError::UnknownType(t) => write!(f, "unknown message type: {}", t),
            ProtocolError::Malformed(msg) => write!(f, "malformed frame body: {}", msg),
            ProtocolError::Io(e) => write!(f, "frame IO error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}
