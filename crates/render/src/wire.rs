//! Worker wire protocol
//!
//! Render workers talk to the coordinating process over their stdin and
//! stdout. Every message is one frame:
//!
//! ```text
//! u32 LE header length | JSON header | u32 LE payload length | payload
//! ```
//!
//! Requests carry a JSON-encoded [`PageSnapshot`] as payload, replies carry
//! raw RGBA pixels. Nothing but owned bytes crosses the process boundary.

use crate::artifact::Bitmap;
use crate::page::{Generation, PageId, PageSnapshot};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Largest accepted JSON header
pub const MAX_HEADER_LEN: u32 = 1 << 20;

/// Largest accepted payload
pub const MAX_PAYLOAD_LEN: u32 = 1 << 30;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("stream ended in the middle of a frame")]
    Truncated,

    #[error("{what} of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { what: &'static str, len: u64, limit: u32 },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Header of a render request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub job_id: u64,
    pub page_id: PageId,
    pub generation: Generation,
    pub scale: f32,
}

/// A render request: header plus the serialized page snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub header: RequestHeader,
    pub payload: Vec<u8>,
}

impl RenderRequest {
    pub fn new(
        job_id: u64,
        snapshot: &PageSnapshot,
        generation: Generation,
        scale: f32,
    ) -> Result<Self, WireError> {
        Ok(Self {
            header: RequestHeader { job_id, page_id: snapshot.page_id, generation, scale },
            payload: serde_json::to_vec(snapshot)?,
        })
    }

    /// Decode the page snapshot carried in the payload
    pub fn snapshot(&self) -> Result<PageSnapshot, WireError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Rendered,
    Failed,
}

/// Header of a worker reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyHeader {
    pub job_id: u64,
    pub status: ReplyStatus,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Decoded worker reply
#[derive(Debug, Clone, PartialEq)]
pub enum RenderReply {
    Rendered { job_id: u64, bitmap: Bitmap },
    /// The renderer rejected the snapshot; retrying it cannot succeed
    Failed { job_id: u64, message: String },
}

impl RenderReply {
    pub fn job_id(&self) -> u64 {
        match self {
            RenderReply::Rendered { job_id, .. } | RenderReply::Failed { job_id, .. } => *job_id,
        }
    }
}

pub fn write_request<W: Write>(writer: &mut W, request: &RenderRequest) -> Result<(), WireError> {
    let header = serde_json::to_vec(&request.header)?;
    write_frame(writer, &header, &request.payload)
}

/// Read the next request; `Ok(None)` when the stream ended cleanly
pub fn read_request<R: Read>(reader: &mut R) -> Result<Option<RenderRequest>, WireError> {
    let Some((header, payload)) = read_frame(reader)? else {
        return Ok(None);
    };
    let header: RequestHeader = serde_json::from_slice(&header)?;
    Ok(Some(RenderRequest { header, payload }))
}

pub fn write_reply<W: Write>(writer: &mut W, reply: &RenderReply) -> Result<(), WireError> {
    let (header, payload): (ReplyHeader, &[u8]) = match reply {
        RenderReply::Rendered { job_id, bitmap } => (
            ReplyHeader {
                job_id: *job_id,
                status: ReplyStatus::Rendered,
                width: bitmap.width,
                height: bitmap.height,
                message: None,
            },
            &bitmap.pixels,
        ),
        RenderReply::Failed { job_id, message } => (
            ReplyHeader {
                job_id: *job_id,
                status: ReplyStatus::Failed,
                width: 0,
                height: 0,
                message: Some(message.clone()),
            },
            &[],
        ),
    };

    let header = serde_json::to_vec(&header)?;
    write_frame(writer, &header, payload)
}

/// Read the next reply; `Ok(None)` when the stream ended cleanly
pub fn read_reply<R: Read>(reader: &mut R) -> Result<Option<RenderReply>, WireError> {
    let Some((header, payload)) = read_frame(reader)? else {
        return Ok(None);
    };
    let header: ReplyHeader = serde_json::from_slice(&header)?;

    let reply = match header.status {
        ReplyStatus::Rendered => {
            let bitmap = Bitmap::new(header.width, header.height, payload).ok_or_else(|| {
                WireError::Malformed(format!(
                    "pixel buffer does not match {}x{}",
                    header.width, header.height
                ))
            })?;
            RenderReply::Rendered { job_id: header.job_id, bitmap }
        }
        ReplyStatus::Failed => RenderReply::Failed {
            job_id: header.job_id,
            message: header.message.unwrap_or_else(|| "render failed".to_string()),
        },
    };
    Ok(Some(reply))
}

fn write_frame<W: Write>(writer: &mut W, header: &[u8], payload: &[u8]) -> Result<(), WireError> {
    let header_len = checked_len("header", header.len(), MAX_HEADER_LEN)?;
    let payload_len = checked_len("payload", payload.len(), MAX_PAYLOAD_LEN)?;

    writer.write_all(&header_len.to_le_bytes())?;
    writer.write_all(header)?;
    writer.write_all(&payload_len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(Vec<u8>, Vec<u8>)>, WireError> {
    let Some(header_len) = read_len(reader, true)? else {
        return Ok(None);
    };
    let header_len = checked_len("header", header_len as usize, MAX_HEADER_LEN)?;
    let header = read_body(reader, header_len)?;

    let payload_len = read_len(reader, false)?.ok_or(WireError::Truncated)?;
    let payload_len = checked_len("payload", payload_len as usize, MAX_PAYLOAD_LEN)?;
    let payload = read_body(reader, payload_len)?;

    Ok(Some((header, payload)))
}

fn checked_len(what: &'static str, len: usize, limit: u32) -> Result<u32, WireError> {
    if len > limit as usize {
        return Err(WireError::FrameTooLarge { what, len: len as u64, limit });
    }
    Ok(len as u32)
}

fn read_len<R: Read>(reader: &mut R, eof_ok: bool) -> Result<Option<u32>, WireError> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 && eof_ok => return Ok(None),
            Ok(0) => return Err(WireError::Truncated),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(Some(u32::from_le_bytes(buf)))
}

fn read_body<R: Read>(reader: &mut R, len: u32) -> Result<Vec<u8>, WireError> {
    // Grow with the data actually received rather than trusting the length prefix
    let mut body = Vec::with_capacity((len as usize).min(64 * 1024));
    reader.take(len as u64).read_to_end(&mut body)?;
    if body.len() != len as usize {
        return Err(WireError::Truncated);
    }
    Ok(body)
}
