//! Bus frames
//!
//! Each frame is a JSON object tagged by `type`, carried in a
//! length-delimited frame (4-byte big-endian length prefix).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LengthDelimitedCodec;

use docstore_common::error::ProtocolError;

use crate::router::ReplyError;

/// Default maximum frame length (8MB)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Client → server: dispatch a pattern
    Request { inbox: u64, pattern: Value },
    /// Client → server: stop a streaming reply
    Unsubscribe { inbox: u64 },
    /// Server → client: one reply for an inbox
    Reply {
        inbox: u64,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<ReplyError>,
        #[serde(rename = "final")]
        is_final: bool,
    },
    /// Server → client: a streaming reply has ended
    End { inbox: u64 },
}

impl Frame {
    pub fn reply(inbox: u64, result: Result<Value, ReplyError>, is_final: bool) -> Self {
        match result {
            Ok(result) => Frame::Reply {
                inbox,
                result,
                error: None,
                is_final,
            },
            Err(error) => Frame::Reply {
                inbox,
                result: Value::Null,
                error: Some(error),
                is_final,
            },
        }
    }

    pub fn inbox(&self) -> u64 {
        match self {
            Frame::Request { inbox, .. }
            | Frame::Unsubscribe { inbox }
            | Frame::Reply { inbox, .. }
            | Frame::End { inbox } => *inbox,
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::InvalidFormat(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::InvalidFormat(e.to_string()))
    }
}

/// Best-effort inbox of a frame that failed to decode
pub fn recover_inbox(bytes: &[u8]) -> Option<u64> {
    serde_json::from_slice::<Value>(bytes)
        .ok()?
        .get("inbox")?
        .as_u64()
}

/// Length-delimited codec with the given frame limit
pub fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}
