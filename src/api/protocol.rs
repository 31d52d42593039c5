//! Protocol errors raised while intercepting updater calls.

use crate::model::MessageKind;

/// A single problem with the updater's control-plane traffic.
///
/// These accumulate over a run; none is fatal on its own.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected output type: {0}")]
    UnknownKind(String),

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("failed to decode {kind}: {reason}")]
    Decode { kind: MessageKind, reason: String },

    #[error("missing expectation for {kind}")]
    MissingExpectation { kind: MessageKind },

    #[error("type was unexpected at position {position}: expected {expected} got {actual}")]
    TypeMismatch {
        position: usize,
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error("unexpected body for {kind} at position {position}\n{diff}")]
    PayloadMismatch {
        position: usize,
        kind: MessageKind,
        diff: String,
    },

    #[error("expectation not met at position {position}: {kind}")]
    UnmetExpectation { position: usize, kind: MessageKind },

    #[error("{kind} received after the run completed")]
    AfterCompletion { kind: String },
}

impl ProtocolError {
    /// Position in the expectation list this error refers to, if any.
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::TypeMismatch { position, .. }
            | Self::PayloadMismatch { position, .. }
            | Self::UnmetExpectation { position, .. } => Some(*position),
            _ => None,
        }
    }
}
