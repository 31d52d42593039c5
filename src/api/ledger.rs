//! The ordered expectation ledger behind the control-plane mock.
//!
//! All request handling funnels through [`Ledger::accept`] under one lock, so
//! the cursor only ever advances in arrival order.

use std::io::Write;

use pretty_assertions::Comparison;
use serde_json::json;

use super::protocol::ProtocolError;
use crate::model::{Message, MessageKind};

/// Where live messages are streamed when no expectations are set.
pub type StreamSink = Box<dyn Write + Send>;

/// Lifecycle of the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting and asserting messages.
    Listening,
    /// The coordinator has closed the ledger; late messages are errors.
    Completing,
    /// The HTTP server is shut down.
    Stopped,
}

/// Outcome of a single request, mapped to an HTTP status by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    UnknownKind,
    Malformed,
    Closed,
}

pub struct Ledger {
    phase: Phase,
    expectations: Vec<Message>,
    cursor: usize,
    errors: Vec<ProtocolError>,
    recorded: Vec<Message>,
    processed_commit: Option<String>,
    sink: Option<StreamSink>,
}

impl Ledger {
    /// Expectations are compared in hashed form, same as recorded output.
    pub fn new(expectations: Vec<Message>, sink: Option<StreamSink>) -> Self {
        Self {
            phase: Phase::Listening,
            expectations: expectations.iter().map(Message::with_hashed_files).collect(),
            cursor: 0,
            errors: Vec::new(),
            recorded: Vec::new(),
            processed_commit: None,
            sink,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn has_expectations(&self) -> bool {
        !self.expectations.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn errors(&self) -> &[ProtocolError] {
        &self.errors
    }

    pub fn recorded(&self) -> &[Message] {
        &self.recorded
    }

    pub fn processed_commit(&self) -> Option<&str> {
        self.processed_commit.as_deref()
    }

    /// Handle one request addressed to `kind_segment` with `body`.
    pub fn accept(&mut self, kind_segment: &str, body: &[u8]) -> Outcome {
        if self.phase != Phase::Listening {
            self.push_error(ProtocolError::AfterCompletion {
                kind: kind_segment.to_string(),
            });
            return Outcome::Closed;
        }

        let kind: MessageKind = match kind_segment.parse() {
            Ok(kind) => kind,
            Err(_) => {
                self.push_error(ProtocolError::UnknownKind(kind_segment.to_string()));
                return Outcome::UnknownKind;
            }
        };

        let message = match Message::decode(kind, body) {
            Ok(message) => message,
            Err(e) => {
                self.push_error(ProtocolError::Decode {
                    kind,
                    reason: e.to_string(),
                });
                // The slot this message would have filled is spent.
                if kind != MessageKind::IncrementMetric && self.cursor < self.expectations.len() {
                    self.cursor += 1;
                }
                return Outcome::Malformed;
            }
        };

        if kind == MessageKind::IncrementMetric {
            self.stream(&message);
            return Outcome::Accepted;
        }

        let recorded = message.with_hashed_files();
        if let Some(commit) = recorded.processed_commit() {
            self.processed_commit = Some(commit.to_string());
        }
        self.recorded.push(recorded.clone());

        if self.has_expectations() {
            self.assert_next(recorded);
        } else {
            self.stream(&message);
        }
        Outcome::Accepted
    }

    /// Record a request whose body could not be read.
    pub fn reject_body(&mut self, reason: String) {
        self.push_error(ProtocolError::Body(reason));
    }

    fn assert_next(&mut self, actual: Message) {
        let position = self.cursor;
        let Some(expected) = self.expectations.get(position) else {
            self.push_error(ProtocolError::MissingExpectation {
                kind: actual.kind(),
            });
            return;
        };
        self.cursor += 1;

        if expected.kind() != actual.kind() {
            let err = ProtocolError::TypeMismatch {
                position,
                expected: expected.kind(),
                actual: actual.kind(),
            };
            self.push_error(err);
            return;
        }

        if *expected != actual {
            let err = ProtocolError::PayloadMismatch {
                position,
                kind: actual.kind(),
                diff: Comparison::new(expected, &actual).to_string(),
            };
            self.push_error(err);
        }
    }

    /// Close the ledger. Every unconsumed expectation becomes an error.
    pub fn complete(&mut self) {
        if self.phase != Phase::Listening {
            return;
        }
        self.phase = Phase::Completing;
        let unmet: Vec<ProtocolError> = self.expectations[self.cursor..]
            .iter()
            .enumerate()
            .map(|(offset, exp)| ProtocolError::UnmetExpectation {
                position: self.cursor + offset,
                kind: exp.kind(),
            })
            .collect();
        for err in unmet {
            self.push_error(err);
        }
    }

    pub fn mark_stopped(&mut self) {
        self.phase = Phase::Stopped;
    }

    fn stream(&mut self, message: &Message) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let data = match message.data_json() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode streamed message");
                return;
            }
        };
        let line = json!({"type": message.kind().as_str(), "data": data});
        if let Err(e) = writeln!(sink, "{line}").and_then(|_| sink.flush()) {
            tracing::warn!(error = %e, "Failed to stream message");
        }
    }

    fn push_error(&mut self, err: ProtocolError) {
        let flat: String = err
            .to_string()
            .chars()
            .filter(|c| *c != '\n' && *c != '\r')
            .collect();
        tracing::warn!("{}", flat);
        self.errors.push(err);
    }
}
