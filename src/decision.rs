//! Decider output and the caller-facing command outcome.

use serde::{Deserialize, Serialize};

use crate::event::{EventDraft, StoredEvent};

/// Why a decider declined a command.
///
/// Rejections are reported to the caller and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Stable machine-readable reason, e.g. `"CHARACTER_NOT_FOUND"`.
    pub code: String,
    pub message: String,
}

impl Rejection {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Output of a decider for a single command.
///
/// A decision with any rejection is a full failure: none of its events are
/// appended. Several events in one decision are appended atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub events: Vec<EventDraft>,
    pub rejections: Vec<Rejection>,
}

impl Decision {
    /// Accept the command with the given events.
    pub fn accept(events: Vec<EventDraft>) -> Self {
        Self {
            events,
            rejections: Vec::new(),
        }
    }

    /// Accept the command with a single event.
    pub fn emit(event: EventDraft) -> Self {
        Self::accept(vec![event])
    }

    /// Reject the command with one reason.
    pub fn reject(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            events: Vec::new(),
            rejections: vec![Rejection::new(code, message)],
        }
    }

    /// Accepted without effect.
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn is_rejected(&self) -> bool {
        !self.rejections.is_empty()
    }
}

/// Result of a command that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Events were appended; empty when the decider chose a no-op.
    Accepted(Vec<StoredEvent>),
    /// The decider declined; nothing was appended.
    Rejected(Vec<Rejection>),
}

impl Outcome {
    pub fn events(&self) -> &[StoredEvent] {
        match self {
            Outcome::Accepted(events) => events,
            Outcome::Rejected(_) => &[],
        }
    }

    pub fn rejections(&self) -> &[Rejection] {
        match self {
            Outcome::Accepted(_) => &[],
            Outcome::Rejected(rejections) => rejections,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted(_))
    }
}
