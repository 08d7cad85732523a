//! The orchestrator: user input in, transport out, stream updates folded
//! into the active session.
//!
//! One turn may be in flight at a time; submissions while a turn is
//! streaming are rejected. All folding happens on the caller's task in
//! response to the next awaited update, so nothing here needs a lock.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{parse_backend_timestamp, ChatRequest};
use crate::core::accumulator::{Folded, MessageAccumulator};
use crate::core::chat_stream::{send_chat, ChatStreamService, StreamParams, StreamUpdate};
use crate::core::connectivity::{ConnectivityProbe, ConnectivityStatus};
use crate::core::event::StreamEvent;
use crate::core::message::{Message, Role};
use crate::core::session::{SessionStore, StoreError};
use chrono::Utc;

/// Rendered content of the placeholder assistant message that holds a
/// turn's slot until the first byte arrives.
pub const PROCESSING_PLACEHOLDER: &str = "Processing...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    AwaitingFirstByte,
    Streaming,
    Finalized,
    Failed,
}

/// What a [`submit`](ChatController::submit) call turned into.
#[derive(Debug, PartialEq, Eq)]
pub enum Submission {
    /// A stream is in flight; pump [`next_update`](ChatController::next_update)
    /// until it reports [`TurnUpdate::Finished`].
    Streaming,
    /// The single-shot path already finalized the turn.
    Complete,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// A previous turn is still streaming. Policy decision: reject, don't
    /// queue.
    TurnInFlight,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::TurnInFlight => {
                write!(f, "a response is still streaming; wait for it to finish")
            }
        }
    }
}

impl std::error::Error for SubmitError {}

/// View-facing notification produced by folding one stream update.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnUpdate {
    /// An incremental slice of output text arrived.
    Token(String),
    /// The reasoning trace was replaced.
    Thinking(String),
    /// The whole rendered body changed (result, error, or truncation).
    Rendered(String),
    /// A malformed frame was dropped; informational only.
    DecodeFailure(String),
    /// The turn is over and the message is immutable.
    Finished,
}

struct ActiveTurn {
    session_id: u64,
    stream_id: u64,
    accumulator: MessageAccumulator,
    phase: TurnPhase,
    cancel_token: CancellationToken,
}

pub struct ChatController {
    store: SessionStore,
    probe: ConnectivityProbe,
    stream_service: ChatStreamService,
    updates: mpsc::UnboundedReceiver<(StreamUpdate, u64)>,
    client: reqwest::Client,
    base_url: String,
    mode: String,
    thinking_mode: bool,
    streaming: bool,
    turn: Option<ActiveTurn>,
    next_stream_id: u64,
}

impl ChatController {
    pub fn new(
        store: SessionStore,
        client: reqwest::Client,
        base_url: impl Into<String>,
        mode: impl Into<String>,
        thinking_mode: bool,
        streaming: bool,
    ) -> Self {
        let base_url = base_url.into();
        let (stream_service, updates) = ChatStreamService::new();
        Self {
            probe: ConnectivityProbe::new(client.clone(), base_url.clone()),
            store,
            stream_service,
            updates,
            client,
            base_url,
            mode: mode.into(),
            thinking_mode,
            streaming,
            turn: None,
            next_stream_id: 0,
        }
    }

    // --- reactive state the presentation layer subscribes to ---

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn session_store(&self) -> &SessionStore {
        &self.store
    }

    pub fn connectivity(&self) -> ConnectivityStatus {
        self.probe.status()
    }

    pub fn is_loading(&self) -> bool {
        self.turn.is_some()
    }

    pub fn phase(&self) -> TurnPhase {
        self.turn
            .as_ref()
            .map(|turn| turn.phase)
            .unwrap_or(TurnPhase::Idle)
    }

    pub async fn probe_connectivity(&mut self) -> ConnectivityStatus {
        self.probe.probe().await
    }

    // --- commands ---

    pub async fn new_session(&mut self) -> u64 {
        self.discard_in_flight_turn();
        self.store.create_session().await
    }

    /// Switch the presented session. Discards the in-flight turn's output
    /// rather than letting it write into a session the user left.
    pub fn switch_session(&mut self, id: u64) {
        if self.store.active_id() != Some(id) {
            self.discard_in_flight_turn();
        }
        self.store.switch_to(id);
    }

    pub async fn delete_session(&mut self, id: u64) -> Result<(), StoreError> {
        if self.turn.as_ref().is_some_and(|turn| turn.session_id == id) {
            self.discard_in_flight_turn();
        }
        self.store.delete_session(id).await
    }

    /// Submit one user turn. Appends the user message (creating a session
    /// when none is active) and either opens a stream or completes the
    /// whole turn as a single request.
    pub async fn submit(&mut self, text: &str) -> Result<Submission, SubmitError> {
        if self.turn.is_some() {
            return Err(SubmitError::TurnInFlight);
        }

        if self.streaming {
            let (stream_id, cancel_token) = self.begin_streaming_turn(text).await;
            self.stream_service.spawn_stream(StreamParams {
                client: self.client.clone(),
                base_url: self.base_url.clone(),
                request: self.request_for(text),
                cancel_token,
                stream_id,
            });
            Ok(Submission::Streaming)
        } else {
            self.submit_single_shot(text).await;
            Ok(Submission::Complete)
        }
    }

    /// Await and fold the next stream update. Stale updates (from a
    /// cancelled or superseded stream) are dropped without surfacing.
    /// Only meaningful while a turn is in flight.
    pub async fn next_update(&mut self) -> TurnUpdate {
        loop {
            match self.updates.recv().await {
                Some((update, stream_id)) => {
                    if let Some(turn_update) = self.apply_update(update, stream_id).await {
                        return turn_update;
                    }
                }
                // The controller holds a sender clone, so this only
                // happens at teardown.
                None => return TurnUpdate::Finished,
            }
        }
    }

    // --- internals ---

    fn request_for(&self, text: &str) -> ChatRequest {
        ChatRequest {
            message: text.to_string(),
            mode: self.mode.clone(),
            thinking_mode: self.thinking_mode,
        }
    }

    /// Append the user message and the processing placeholder, creating a
    /// session when none is active, and register the turn.
    async fn begin_streaming_turn(&mut self, text: &str) -> (u64, CancellationToken) {
        let session_id = match self.store.active_id() {
            Some(id) => id,
            None => self.store.create_session().await,
        };

        self.append_or_warn(session_id, Message::user(text)).await;
        self.append_or_warn(session_id, Message::assistant(PROCESSING_PLACEHOLDER))
            .await;

        self.next_stream_id += 1;
        let stream_id = self.next_stream_id;
        let cancel_token = CancellationToken::new();
        self.turn = Some(ActiveTurn {
            session_id,
            stream_id,
            accumulator: MessageAccumulator::new(),
            phase: TurnPhase::AwaitingFirstByte,
            cancel_token: cancel_token.clone(),
        });
        (stream_id, cancel_token)
    }

    async fn submit_single_shot(&mut self, text: &str) {
        let session_id = match self.store.active_id() {
            Some(id) => id,
            None => self.store.create_session().await,
        };
        self.append_or_warn(session_id, Message::user(text)).await;

        let request = self.request_for(text);
        let reply = send_chat(&self.client, &self.base_url, &request).await;

        let message = match reply {
            Ok(reply) => {
                self.probe.note_success();
                Message {
                    role: Role::Assistant,
                    content: reply.content,
                    timestamp: parse_backend_timestamp(&reply.timestamp).unwrap_or_else(Utc::now),
                    reasoning: None,
                }
            }
            Err(formatted) => {
                self.probe.note_failure();
                Message::assistant(formatted)
            }
        };
        self.append_or_warn(session_id, message).await;
    }

    async fn append_or_warn(&mut self, session_id: u64, message: Message) {
        if let Err(err) = self.store.append_message(session_id, message).await {
            warn!("dropping message append: {err}");
        }
    }

    fn discard_in_flight_turn(&mut self) {
        if let Some(turn) = self.turn.take() {
            debug!(
                "discarding in-flight turn for session {}",
                turn.session_id
            );
            turn.cancel_token.cancel();
        }
    }

    /// Fold one `(update, stream_id)` pair. Returns `None` when the update
    /// was stale or produced nothing the view needs to hear about.
    async fn apply_update(
        &mut self,
        update: StreamUpdate,
        stream_id: u64,
    ) -> Option<TurnUpdate> {
        let turn = self.turn.as_ref()?;
        if turn.stream_id != stream_id {
            return None;
        }

        // The owning session must still exist and still be presented;
        // otherwise the fold would write into a stale or absent target.
        let session_id = turn.session_id;
        if self.store.active_id() != Some(session_id) || self.store.find(session_id).is_none() {
            debug!("session {session_id} no longer active; discarding turn output");
            self.discard_in_flight_turn();
            return None;
        }

        match update {
            StreamUpdate::Event(event) => self.fold_event(event).await,
            StreamUpdate::DecodeFailure(reason) => {
                warn!("dropped malformed frame: {reason}");
                Some(TurnUpdate::DecodeFailure(reason))
            }
            StreamUpdate::TransportError(formatted) => {
                let turn = self.turn.as_mut()?;
                turn.phase = TurnPhase::Failed;
                let folded = turn.accumulator.fail(formatted);
                self.probe.note_failure();
                self.write_fold(session_id, &folded).await;
                Some(TurnUpdate::Rendered(folded.content))
            }
            StreamUpdate::End => {
                let turn = self.turn.as_mut()?;
                if !turn.accumulator.is_finalized() {
                    // Silent truncation: keep whatever accumulated rather
                    // than leaving the placeholder forever.
                    turn.phase = TurnPhase::Finalized;
                    let folded = turn.accumulator.finish();
                    self.write_fold(session_id, &folded).await;
                }
                self.turn = None;
                Some(TurnUpdate::Finished)
            }
        }
    }

    async fn fold_event(&mut self, event: StreamEvent) -> Option<TurnUpdate> {
        let turn = self.turn.as_mut()?;
        if turn.accumulator.is_finalized() {
            // Cannot occur under correct backend behavior; ignore rather
            // than corrupt the finished message.
            return None;
        }

        if turn.phase == TurnPhase::AwaitingFirstByte {
            turn.phase = TurnPhase::Streaming;
        }

        let session_id = turn.session_id;
        let view_update = match &event {
            StreamEvent::Token { text } => TurnUpdate::Token(text.clone()),
            StreamEvent::Thinking { text } => TurnUpdate::Thinking(text.clone()),
            _ => TurnUpdate::Rendered(String::new()),
        };

        let folded = turn.accumulator.fold(event);
        if folded.finalized {
            turn.phase = TurnPhase::Finalized;
            self.probe.note_success();
        }
        self.write_fold(session_id, &folded).await;

        Some(match view_update {
            TurnUpdate::Rendered(_) => TurnUpdate::Rendered(folded.content),
            other => other,
        })
    }

    /// Overwrite the streaming assistant message with the fold result. A
    /// not-found answer means the session vanished mid-fold; the turn is
    /// discarded, never retried.
    async fn write_fold(&mut self, session_id: u64, folded: &Folded) {
        let result = self
            .store
            .rewrite_tail(
                session_id,
                folded.content.clone(),
                folded.reasoning.clone(),
                folded.timestamp,
            )
            .await;
        if let Err(err) = result {
            warn!("discarding fold output: {err}");
            self.discard_in_flight_turn();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::persistence::MemoryStore;
    use chrono::TimeZone;

    async fn controller() -> ChatController {
        let store = SessionStore::open(Box::new(MemoryStore::new())).await;
        ChatController::new(
            store,
            reqwest::Client::new(),
            "http://localhost:8000",
            "local",
            true,
            true,
        )
    }

    fn token(text: &str) -> StreamUpdate {
        StreamUpdate::Event(StreamEvent::Token {
            text: text.to_string(),
        })
    }

    #[tokio::test]
    async fn submission_appends_user_message_and_placeholder() {
        let mut ctl = controller().await;
        let (stream_id, _) = ctl.begin_streaming_turn("2+2?").await;
        assert_eq!(stream_id, 1);
        assert_eq!(ctl.phase(), TurnPhase::AwaitingFirstByte);

        let messages = ctl.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "2+2?");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, PROCESSING_PLACEHOLDER);
    }

    #[tokio::test]
    async fn streamed_turn_folds_to_the_final_result() {
        let mut ctl = controller().await;
        let (id, _) = ctl.begin_streaming_turn("2+2?").await;
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        ctl.apply_update(
            StreamUpdate::Event(StreamEvent::Thinking {
                text: "adding two numbers".to_string(),
            }),
            id,
        )
        .await;
        assert_eq!(ctl.phase(), TurnPhase::Streaming);

        ctl.apply_update(token("4"), id).await;
        assert_eq!(
            ctl.messages()[1].content,
            "> adding two numbers\n\n4"
        );

        ctl.apply_update(
            StreamUpdate::Event(StreamEvent::Result {
                content: "The answer is 4.".to_string(),
                timestamp: t,
            }),
            id,
        )
        .await;
        let update = ctl.apply_update(StreamUpdate::End, id).await;
        assert_eq!(update, Some(TurnUpdate::Finished));

        let session = ctl.session_store().active_session().expect("active session");
        let tail = session.messages.last().expect("assistant message");
        assert_eq!(tail.content, "The answer is 4.");
        assert_eq!(tail.timestamp, t);
        assert!(session.updated_at >= t);
        assert_eq!(ctl.phase(), TurnPhase::Idle);
        assert_eq!(ctl.connectivity(), ConnectivityStatus::Connected);
    }

    #[tokio::test]
    async fn result_is_idempotent_against_late_events() {
        let mut ctl = controller().await;
        let (id, _) = ctl.begin_streaming_turn("2+2?").await;
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        ctl.apply_update(
            StreamUpdate::Event(StreamEvent::Result {
                content: "final".to_string(),
                timestamp: t,
            }),
            id,
        )
        .await;
        ctl.apply_update(token(" late"), id).await;
        assert_eq!(ctl.messages()[1].content, "final");
    }

    #[tokio::test]
    async fn truncated_streams_finalize_with_partial_content() {
        let mut ctl = controller().await;
        let (id, _) = ctl.begin_streaming_turn("2+2?").await;

        ctl.apply_update(token("4"), id).await;
        let update = ctl.apply_update(StreamUpdate::End, id).await;
        assert_eq!(update, Some(TurnUpdate::Finished));

        assert_eq!(ctl.messages()[1].content, "4");
        assert!(!ctl.is_loading());
    }

    #[tokio::test]
    async fn transport_errors_fail_the_turn_and_flip_connectivity() {
        let mut ctl = controller().await;
        let (id, _) = ctl.begin_streaming_turn("2+2?").await;

        let update = ctl
            .apply_update(
                StreamUpdate::TransportError("Backend error: connection refused".to_string()),
                id,
            )
            .await;
        assert_eq!(ctl.phase(), TurnPhase::Failed);
        assert_eq!(
            update,
            Some(TurnUpdate::Rendered(
                "Backend error: connection refused".to_string()
            ))
        );
        assert_eq!(ctl.connectivity(), ConnectivityStatus::Disconnected);

        ctl.apply_update(StreamUpdate::End, id).await;
        assert_eq!(ctl.messages()[1].content, "Backend error: connection refused");
        assert_eq!(ctl.phase(), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn decode_failures_do_not_interrupt_the_stream() {
        let mut ctl = controller().await;
        let (id, _) = ctl.begin_streaming_turn("2+2?").await;

        let update = ctl
            .apply_update(StreamUpdate::DecodeFailure("bad frame".to_string()), id)
            .await;
        assert_eq!(update, Some(TurnUpdate::DecodeFailure("bad frame".to_string())));
        // Still awaiting the first successfully decoded frame.
        assert_eq!(ctl.phase(), TurnPhase::AwaitingFirstByte);

        ctl.apply_update(token("ok"), id).await;
        assert_eq!(ctl.messages()[1].content, "ok");
    }

    #[tokio::test]
    async fn stale_stream_ids_are_dropped() {
        let mut ctl = controller().await;
        let (id, _) = ctl.begin_streaming_turn("2+2?").await;

        assert!(ctl.apply_update(token("ghost"), id + 10).await.is_none());
        assert_eq!(ctl.messages()[1].content, PROCESSING_PLACEHOLDER);
    }

    #[tokio::test]
    async fn submissions_while_streaming_are_rejected() {
        let mut ctl = controller().await;
        ctl.begin_streaming_turn("first").await;
        assert_eq!(
            ctl.submit("second").await,
            Err(SubmitError::TurnInFlight)
        );
    }

    #[tokio::test]
    async fn deleting_the_owning_session_discards_the_turn() {
        let mut ctl = controller().await;
        let (id, _) = ctl.begin_streaming_turn("2+2?").await;
        let session_id = ctl.session_store().active_id().expect("active session");

        ctl.delete_session(session_id).await.expect("delete");
        assert!(ctl.messages().is_empty());
        assert!(!ctl.is_loading());

        // Folds for the stale turn are dropped without a crash.
        assert!(ctl.apply_update(token("late"), id).await.is_none());
        assert!(ctl.session_store().active_id().is_none());
    }

    #[tokio::test]
    async fn switching_away_discards_the_turn() {
        let mut ctl = controller().await;
        let first = ctl.new_session().await;
        let second = ctl.new_session().await;
        assert_eq!(ctl.session_store().active_id(), Some(second));

        let (id, _) = ctl.begin_streaming_turn("streaming here").await;
        ctl.switch_session(first);

        assert!(ctl.apply_update(token("late"), id).await.is_none());
        assert!(!ctl.is_loading());
        // The abandoned session keeps its placeholder untouched.
        let abandoned = ctl.session_store().find(second).expect("session kept");
        assert_eq!(
            abandoned.messages.last().expect("tail").content,
            PROCESSING_PLACEHOLDER
        );
    }
}
