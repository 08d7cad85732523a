//! Wire payloads for the LIA backend endpoints.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request body shared by the streaming and single-shot chat endpoints.
#[derive(Serialize, Clone, Debug)]
pub struct ChatRequest {
    pub message: String,
    pub mode: String,
    pub thinking_mode: bool,
}

/// One decoded streaming frame payload, tagged by its `type` field.
///
/// The backend emits more frame types than these (`status`, `intent`,
/// `done`); deserialization fails closed on them and the caller reports a
/// decode error instead of guessing at a meaning.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Token { content: String },
    Thinking { content: String },
    Result { data: ResultPayload },
    Error { message: String },
}

/// Payload of a `result` frame. The backend sends a full chat message here;
/// only the fields the client folds into the transcript are kept.
#[derive(Deserialize, Debug)]
pub struct ResultPayload {
    pub content: String,
    pub timestamp: String,
}

/// Single-shot `/api/chat` response body.
#[derive(Deserialize, Debug)]
pub struct ChatReply {
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

/// Parse a backend timestamp leniently.
///
/// The backend produces Python `datetime.isoformat()` strings, which carry
/// no UTC offset. RFC 3339 is accepted first for forward compatibility;
/// offset-less values are interpreted as UTC.
pub fn parse_backend_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stream_frames_deserialize_by_type_tag() {
        let token: StreamFrame =
            serde_json::from_str(r#"{"type":"token","content":"Hi"}"#).expect("token frame");
        assert!(matches!(token, StreamFrame::Token { content } if content == "Hi"));

        let result: StreamFrame = serde_json::from_str(
            r#"{"type":"result","data":{"role":"assistant","content":"done","timestamp":"2024-05-01T12:00:00.000001","command_result":{"success":true}}}"#,
        )
        .expect("result frame");
        match result {
            StreamFrame::Result { data } => assert_eq!(data.content, "done"),
            other => panic!("expected result frame, got {:?}", other),
        }
    }

    #[test]
    fn unknown_frame_types_fail_to_deserialize() {
        for payload in [
            r#"{"type":"status","message":"Processing..."}"#,
            r#"{"type":"intent","data":{"command_type":"chat"}}"#,
            r#"{"type":"done"}"#,
        ] {
            assert!(serde_json::from_str::<StreamFrame>(payload).is_err());
        }
    }

    #[test]
    fn backend_timestamps_parse_with_and_without_offset() {
        let naive = parse_backend_timestamp("2024-05-01T12:30:45.500000").expect("naive form");
        assert_eq!(
            naive,
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap()
                + chrono::Duration::milliseconds(500)
        );

        let rfc3339 = parse_backend_timestamp("2024-05-01T12:30:45+02:00").expect("rfc3339 form");
        assert_eq!(rfc3339, Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 45).unwrap());

        assert!(parse_backend_timestamp("yesterday").is_none());
    }
}
