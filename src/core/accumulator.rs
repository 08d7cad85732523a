//! Folds stream events into the one assistant message of an active turn.

use chrono::{DateTime, Utc};

use crate::core::chat_stream::format_backend_error;
use crate::core::event::StreamEvent;

/// Snapshot handed back after every fold. The caller overwrites the
/// assistant message with these fields; it never appends.
#[derive(Debug, Clone, PartialEq)]
pub struct Folded {
    pub content: String,
    pub reasoning: Option<String>,
    /// Authoritative timestamp from a `result` frame, when one arrived.
    pub timestamp: Option<DateTime<Utc>>,
    pub finalized: bool,
}

#[derive(Default)]
pub struct MessageAccumulator {
    tokens: String,
    reasoning: String,
    final_content: Option<String>,
    final_timestamp: Option<DateTime<Utc>>,
    finalized: bool,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Whether any output has accumulated. Used to decide if a truncated
    /// stream left anything worth keeping over the placeholder.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.reasoning.is_empty() && self.final_content.is_none()
    }

    /// Fold one event. Events arriving after finalization cannot occur
    /// under correct backend behavior; they are ignored rather than allowed
    /// to corrupt the finished message.
    pub fn fold(&mut self, event: StreamEvent) -> Folded {
        if self.finalized {
            return self.snapshot();
        }

        match event {
            StreamEvent::Token { text } => {
                self.tokens.push_str(&text);
            }
            StreamEvent::Thinking { text } => {
                // The backend resends the whole running trace each time.
                self.reasoning = text;
            }
            StreamEvent::Result { content, timestamp } => {
                self.final_content = Some(content);
                self.final_timestamp = Some(timestamp);
                self.finalized = true;
            }
            StreamEvent::Error { message } => {
                self.final_content = Some(format_backend_error(&message));
                self.finalized = true;
            }
        }

        self.snapshot()
    }

    /// Mark the turn finished with whatever has accumulated. Covers streams
    /// that end without a `result` or `error` frame, so a truncated reply
    /// is never left stuck on the processing placeholder.
    pub fn finish(&mut self) -> Folded {
        self.finalized = true;
        self.snapshot()
    }

    /// Finalize with an already formatted failure body. Used for transport
    /// failures, which arrive formatted for display; backend `error` frames
    /// go through [`fold`](Self::fold) instead.
    pub fn fail(&mut self, formatted: String) -> Folded {
        if !self.finalized {
            self.final_content = Some(formatted);
            self.finalized = true;
        }
        self.snapshot()
    }

    fn snapshot(&self) -> Folded {
        Folded {
            content: self.rendered(),
            reasoning: (!self.reasoning.is_empty()).then(|| self.reasoning.clone()),
            timestamp: self.final_timestamp,
            finalized: self.finalized,
        }
    }

    /// The full rendered body: the final content verbatim once one exists,
    /// otherwise the reasoning trace as a quoted block above the token
    /// buffer.
    fn rendered(&self) -> String {
        if let Some(content) = &self.final_content {
            return content.clone();
        }

        if self.reasoning.is_empty() {
            self.tokens.clone()
        } else {
            let quoted: Vec<String> = self
                .reasoning
                .lines()
                .map(|line| format!("> {line}"))
                .collect();
            format!("{}\n\n{}", quoted.join("\n"), self.tokens)
        }
    }
}
