//! Streaming transport: one tokio task per turn reading the backend's
//! event stream and forwarding interpreted updates over a channel.
//!
//! Updates are tagged with the stream id they belong to so the orchestrator
//! can drop output from a cancelled or superseded turn.

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::api::{ChatReply, ChatRequest};
use crate::core::event::{interpret_frame, StreamEvent};
use crate::core::sse::FrameDecoder;
use crate::utils::url::construct_api_url;

pub const STREAM_ENDPOINT: &str = "api/chat/stream/v2";
pub const CHAT_ENDPOINT: &str = "api/chat";

#[derive(Clone, Debug)]
pub enum StreamUpdate {
    /// A successfully decoded semantic event.
    Event(StreamEvent),
    /// A malformed frame was dropped; the stream keeps going.
    DecodeFailure(String),
    /// The transport failed; the turn is over.
    TransportError(String),
    /// The backend closed the stream.
    End,
}

pub struct StreamParams {
    pub client: reqwest::Client,
    pub base_url: String,
    pub request: ChatRequest,
    pub cancel_token: tokio_util::sync::CancellationToken,
    pub stream_id: u64,
}

#[derive(Clone)]
pub struct ChatStreamService {
    tx: mpsc::UnboundedSender<(StreamUpdate, u64)>,
}

impl ChatStreamService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(StreamUpdate, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn spawn_stream(&self, params: StreamParams) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let StreamParams {
                client,
                base_url,
                request,
                cancel_token,
                stream_id,
            } = params;

            tokio::select! {
                _ = run_stream(client, base_url, request, &tx, stream_id, &cancel_token) => {}
                _ = cancel_token.cancelled() => {}
            }
        });
    }

    #[cfg(test)]
    pub fn send_for_test(&self, update: StreamUpdate, stream_id: u64) {
        let _ = self.tx.send((update, stream_id));
    }
}

async fn run_stream(
    client: reqwest::Client,
    base_url: String,
    request: ChatRequest,
    tx: &mpsc::UnboundedSender<(StreamUpdate, u64)>,
    stream_id: u64,
    cancel_token: &tokio_util::sync::CancellationToken,
) {
    let url = construct_api_url(&base_url, STREAM_ENDPOINT);
    let response = match client.post(url).json(&request).send().await {
        Ok(response) => response,
        Err(err) => {
            let _ = tx.send((
                StreamUpdate::TransportError(format_backend_error(&err.to_string())),
                stream_id,
            ));
            let _ = tx.send((StreamUpdate::End, stream_id));
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        let _ = tx.send((
            StreamUpdate::TransportError(format!(
                "{} ({status})",
                format_backend_error(&body)
            )),
            stream_id,
        ));
        let _ = tx.send((StreamUpdate::End, stream_id));
        return;
    }

    let mut stream = response.bytes_stream();
    let mut decoder = FrameDecoder::new();

    while let Some(chunk) = stream.next().await {
        if cancel_token.is_cancelled() {
            return;
        }

        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = tx.send((
                    StreamUpdate::TransportError(format_backend_error(&err.to_string())),
                    stream_id,
                ));
                let _ = tx.send((StreamUpdate::End, stream_id));
                return;
            }
        };

        for payload in decoder.push(&chunk) {
            let update = match payload.and_then(|text| interpret_frame(&text)) {
                Ok(event) => StreamUpdate::Event(event),
                Err(err) => StreamUpdate::DecodeFailure(err.to_string()),
            };
            let _ = tx.send((update, stream_id));
        }
    }

    // Any bytes still buffered never reached a delimiter; they are a
    // truncated frame and go down with the decoder.
    let _ = tx.send((StreamUpdate::End, stream_id));
}

/// Single-shot chat request; the reply is directly usable as a finalized
/// assistant message. Failures come back already formatted for display.
pub async fn send_chat(
    client: &reqwest::Client,
    base_url: &str,
    request: &ChatRequest,
) -> Result<ChatReply, String> {
    let url = construct_api_url(base_url, CHAT_ENDPOINT);
    let response = client
        .post(url)
        .json(request)
        .send()
        .await
        .map_err(|err| format_backend_error(&err.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        return Err(format!("{} ({status})", format_backend_error(&body)));
    }

    response
        .json::<ChatReply>()
        .await
        .map_err(|err| format_backend_error(&err.to_string()))
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| value.get("detail").and_then(|v| v.as_str()).map(str::to_owned))
        .or_else(|| value.get("message").and_then(|v| v.as_str()).map(str::to_owned));

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

/// Format a backend failure for display in the transcript. JSON bodies are
/// summarized from their `error.message`/`detail`/`message` fields when one
/// exists; anything else is shown verbatim.
pub fn format_backend_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "Backend error: <empty>".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value) {
            if !summary.is_empty() {
                return format!("Backend error: {summary}");
            }
        }
    }

    format!("Backend error: {trimmed}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_summarize_json_bodies() {
        assert_eq!(
            format_backend_error(r#"{"detail":"Too many requests, please slow down."}"#),
            "Backend error: Too many requests, please slow down."
        );
        assert_eq!(
            format_backend_error(r#"{"error":{"message":"model   overloaded"}}"#),
            "Backend error: model overloaded"
        );
        assert_eq!(
            format_backend_error(r#"{"message":"boom"}"#),
            "Backend error: boom"
        );
    }

    #[test]
    fn backend_errors_fall_back_to_the_raw_body() {
        assert_eq!(
            format_backend_error("connection refused"),
            "Backend error: connection refused"
        );
        assert_eq!(
            format_backend_error(r#"{"status":"failed"}"#),
            "Backend error: {\"status\":\"failed\"}"
        );
        assert_eq!(format_backend_error("   "), "Backend error: <empty>");
    }

    #[test]
    fn decoder_and_interpreter_reconstruct_a_real_frame_mix() {
        // Byte-for-byte what the backend emits for a short thinking-mode
        // turn, including the frame types the client does not recognize.
        let raw = concat!(
            "data: {\"type\":\"status\",\"message\":\"Processing...\"}\n\n",
            "data: {\"type\":\"thinking\",\"content\":\"adding two numbers\"}\n\n",
            "data: {\"type\":\"token\",\"content\":\"4\"}\n\n",
            "data: {\"type\":\"result\",\"data\":{\"role\":\"assistant\",\"content\":\"The answer is 4.\",\"timestamp\":\"2024-05-01T12:00:00\"}}\n\n",
            "data: {\"type\":\"done\"}\n\n",
        )
        .as_bytes();

        let mut decoder = FrameDecoder::new();
        let mut events = Vec::new();
        let mut failures = 0;
        // Chunked awkwardly on purpose.
        for chunk in raw.chunks(7) {
            for payload in decoder.push(chunk) {
                match payload.and_then(|text| interpret_frame(&text)) {
                    Ok(event) => events.push(event),
                    Err(_) => failures += 1,
                }
            }
        }

        assert_eq!(failures, 2, "status and done frames fail closed");
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::Thinking { text } if text == "adding two numbers"));
        assert!(matches!(&events[1], StreamEvent::Token { text } if text == "4"));
        assert!(
            matches!(&events[2], StreamEvent::Result { content, .. } if content == "The answer is 4.")
        );
    }

    #[tokio::test]
    async fn updates_carry_their_stream_id() {
        let (service, mut rx) = ChatStreamService::new();
        service.send_for_test(
            StreamUpdate::Event(StreamEvent::Token {
                text: "4".to_string(),
            }),
            7,
        );
        service.send_for_test(StreamUpdate::End, 7);

        let (update, id) = rx.recv().await.expect("token update");
        assert_eq!(id, 7);
        assert!(matches!(update, StreamUpdate::Event(StreamEvent::Token { .. })));

        let (update, id) = rx.recv().await.expect("end update");
        assert_eq!(id, 7);
        assert!(matches!(update, StreamUpdate::End));
    }
}
