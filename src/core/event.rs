//! Semantic classification of decoded frame payloads.

use std::error::Error as StdError;
use std::fmt;
use std::str::Utf8Error;

use chrono::{DateTime, Utc};

use crate::api::{parse_backend_timestamp, StreamFrame};

/// One semantic unit of an in-flight assistant turn. Constructed by
/// [`interpret_frame`], folded once by the accumulator, never stored.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental slice of output text; appended to the running body.
    Token { text: String },
    /// The full reasoning trace so far; replaces the previous trace.
    Thinking { text: String },
    /// The authoritative final payload; supersedes all accumulated tokens.
    Result {
        content: String,
        timestamp: DateTime<Utc>,
    },
    /// A backend-reported failure that ends the turn.
    Error { message: String },
}

/// Malformed frame or payload. Non-fatal: the stream continues with the
/// next frame, and the orchestrator logs what was dropped.
#[derive(Debug)]
pub enum DecodeError {
    InvalidUtf8(Utf8Error),
    MissingDataField { frame: String },
    Payload { payload: String, source: serde_json::Error },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidUtf8(source) => {
                write!(f, "frame is not valid UTF-8: {source}")
            }
            DecodeError::MissingDataField { frame } => {
                write!(f, "frame has no data field: {frame:?}")
            }
            DecodeError::Payload { payload, source } => {
                write!(f, "unrecognized frame payload {payload:?}: {source}")
            }
        }
    }
}

impl StdError for DecodeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            DecodeError::InvalidUtf8(source) => Some(source),
            DecodeError::MissingDataField { .. } => None,
            DecodeError::Payload { source, .. } => Some(source),
        }
    }
}

/// Parse one frame payload into a [`StreamEvent`].
///
/// Classification fails closed: payloads that are not JSON, or whose `type`
/// is not one of the four recognized discriminators, come back as a
/// [`DecodeError`] rather than a guess. A `result` frame with an
/// unparseable timestamp still finalizes the turn; the fold falls back to
/// the local clock rather than discarding the final content.
pub fn interpret_frame(payload: &str) -> Result<StreamEvent, DecodeError> {
    let frame: StreamFrame =
        serde_json::from_str(payload).map_err(|source| DecodeError::Payload {
            payload: payload.to_string(),
            source,
        })?;

    Ok(match frame {
        StreamFrame::Token { content } => StreamEvent::Token { text: content },
        StreamFrame::Thinking { content } => StreamEvent::Thinking { text: content },
        StreamFrame::Result { data } => StreamEvent::Result {
            timestamp: parse_backend_timestamp(&data.timestamp).unwrap_or_else(Utc::now),
            content: data.content,
        },
        StreamFrame::Error { message } => StreamEvent::Error { message },
    })
}
