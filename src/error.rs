//! Crate-level error types.
//!
//! Failures are grouped by where they happen. Validation errors and domain
//! rejections stay on the synchronous request path; apply errors feed the
//! outbox retry machinery; integrity failures are their own class so they
//! are never mistaken for a projection that merely needs a replay.

use std::io;

/// A command or event failed structural validation.
///
/// Raised before any durable effect. Only the first violation is reported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid command {command_type:?}: {reason}")]
    InvalidCommand { command_type: String, reason: String },

    #[error("invalid event {event_type:?}: {reason}")]
    InvalidEvent { event_type: String, reason: String },

    /// An event's owner does not match the command that emitted it.
    #[error("event {event_type:?} violates ownership: {reason}")]
    OwnershipMismatch { event_type: String, reason: String },
}

impl ValidationError {
    pub(crate) fn command(command_type: &str, reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            command_type: command_type.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn event(event_type: &str, reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            event_type: event_type.to_owned(),
            reason: reason.into(),
        }
    }
}

/// The registry or projection dispatch table could not be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("type name must not be empty")]
    EmptyType,

    #[error("command type {0:?} registered twice")]
    DuplicateCommand(String),

    #[error("event type {0:?} registered twice")]
    DuplicateEvent(String),

    #[error("handler registered twice for event type {0:?}")]
    DuplicateHandler(String),

    #[error("handler registered for unknown event type {0:?}")]
    UnknownEventHandler(String),

    #[error("namespace {namespace:?} registered with versions {first:?} and {second:?}")]
    NamespaceVersionConflict {
        namespace: String,
        first: String,
        second: String,
    },

    #[error("handler for {event_type:?} registered under the wrong owner")]
    HandlerOwnerMismatch { event_type: String },

    /// Must-apply event types with no projection handler.
    #[error("must-apply event types without a projection handler: {0:?}")]
    UncoveredEvents(Vec<String>),
}

/// Failure reported by a fold or projection handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("payload decode failed: {err}"))
    }
}

/// Key ring lookup failed while signing or verifying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("signing key {0:?} is not in the key ring")]
    UnknownKey(String),

    #[error("key ring has no active key")]
    NoActiveKey,
}

/// Event journal read or write failure.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid campaign id {0:?}")]
    InvalidCampaignId(String),

    /// A committed line in the middle of the log cannot be parsed.
    #[error("journal for campaign {campaign_id} is corrupt at line {line}: {reason}")]
    Corrupt {
        campaign_id: String,
        line: usize,
        reason: String,
    },

    #[error("sequence gap in campaign {campaign_id}: expected seq {expected}, found {found}")]
    SequenceGap {
        campaign_id: String,
        expected: u64,
        found: u64,
    },

    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// Aggregate state could not be reconstructed.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("event type {event_type:?} at seq {seq} is not registered")]
    UnknownEvent { seq: u64, event_type: String },

    #[error("fold failed at seq {seq} ({event_type}): {source}")]
    Fold {
        seq: u64,
        event_type: String,
        source: HandlerError,
    },

    #[error("snapshot I/O error: {0}")]
    Snapshot(#[from] io::Error),
}

/// A projection could not apply an event.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// Plugin-owned event whose namespace has no handler table.
    #[error("unroutable event {event_type:?} at seq {seq}: no handlers for namespace {namespace:?}")]
    Unroutable {
        seq: u64,
        event_type: String,
        namespace: String,
    },

    /// Must-apply event with no handler.
    #[error("unhandled must-apply event {event_type:?} at seq {seq}")]
    Unhandled { seq: u64, event_type: String },

    #[error("out-of-order apply for campaign {campaign_id}: expected seq {expected}, got {found}")]
    OutOfOrder {
        campaign_id: String,
        expected: u64,
        found: u64,
    },

    #[error("handler for {event_type:?} failed at seq {seq}: {source}")]
    Handler {
        seq: u64,
        event_type: String,
        source: HandlerError,
    },

    #[error("projection store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("reading the event to apply failed: {0}")]
    Journal(#[from] JournalError),

    /// The journal holds no event at this seq.
    #[error("no journaled event ({campaign_id}, {seq})")]
    EventMissing { campaign_id: String, seq: u64 },

    #[error("apply timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ApplyError {
    /// Whether retrying cannot help: the event has no route or handler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApplyError::Unroutable { .. } | ApplyError::Unhandled { .. })
    }
}

/// Outbox persistence or state-transition failure.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("outbox item ({campaign_id}, {seq}) not found")]
    NotFound { campaign_id: String, seq: u64 },

    #[error("outbox item ({campaign_id}, {seq}) is {status}, expected {expected}")]
    InvalidState {
        campaign_id: String,
        seq: u64,
        status: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// A replay run aborted.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("replay gap in campaign {campaign_id}: expected seq {expected}, found {found}")]
    SequenceGap {
        campaign_id: String,
        expected: u64,
        found: u64,
    },

    #[error("replay failed at seq {seq}: {source}")]
    Apply { seq: u64, source: ApplyError },

    #[error("replay failed at seq {seq}: {source}")]
    Load { seq: u64, source: LoadError },

    #[error("checkpoint I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ReplayError {
    /// The sequence number the run stopped at, when known.
    pub fn failed_at(&self) -> Option<u64> {
        match self {
            ReplayError::SequenceGap { expected, .. } => Some(*expected),
            ReplayError::Apply { seq, .. } | ReplayError::Load { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

/// Failure of an operator maintenance task.
///
/// Integrity failures and projection mismatches are separate variants:
/// the first means the journal cannot be trusted, the second that a
/// derived view needs a rebuild.
#[derive(Debug, thiserror::Error)]
pub enum MaintenanceError {
    #[error("campaign {campaign_id} failed integrity verification at seq {at_seq}: {reason}")]
    Integrity {
        campaign_id: String,
        at_seq: u64,
        reason: String,
    },

    #[error(
        "projection {projection} of campaign {campaign_id} differs from a replay \
         (stored through seq {stored_seq}, replayed through seq {replayed_seq})"
    )]
    ProjectionMismatch {
        campaign_id: String,
        projection: &'static str,
        stored_seq: u64,
        replayed_seq: u64,
    },

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Error returned by [`CampaignStore::execute`](crate::CampaignStore::execute).
///
/// Domain rejections are not errors; they arrive as
/// [`Outcome::Rejected`](crate::Outcome::Rejected).
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The campaign failed integrity verification and is not served.
    #[error("campaign {campaign_id} is quarantined: integrity failure at seq {at_seq}")]
    Quarantined { campaign_id: String, at_seq: u64 },

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The campaign actor exited before replying.
    #[error("campaign actor is no longer running")]
    ActorGone,
}

/// Error returned by store-level operations other than `execute`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("campaign {campaign_id} is quarantined: integrity failure at seq {at_seq}")]
    Quarantined { campaign_id: String, at_seq: u64 },

    #[error(transparent)]
    Maintenance(#[from] MaintenanceError),

    #[error("store builder is missing {0}")]
    Incomplete(&'static str),

    #[error("outbox worker already started")]
    WorkerRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_type_and_reason() {
        let err = ValidationError::command("note.add", "payload must be an object");
        assert_eq!(
            err.to_string(),
            "invalid command \"note.add\": payload must be an object"
        );
    }

    #[test]
    fn fatal_apply_errors() {
        let unhandled = ApplyError::Unhandled {
            seq: 4,
            event_type: "x".into(),
        };
        assert!(unhandled.is_fatal());

        let io = ApplyError::Io(io::Error::other("disk full"));
        assert!(!io.is_fatal());

        let handler = ApplyError::Handler {
            seq: 1,
            event_type: "x".into(),
            source: HandlerError::new("boom"),
        };
        assert!(!handler.is_fatal());
    }

    #[test]
    fn replay_error_reports_failed_seq() {
        let err = ReplayError::Apply {
            seq: 9,
            source: ApplyError::Unhandled {
                seq: 9,
                event_type: "x".into(),
            },
        };
        assert_eq!(err.failed_at(), Some(9));

        let gap = ReplayError::SequenceGap {
            campaign_id: "c".into(),
            expected: 3,
            found: 5,
        };
        assert_eq!(gap.failed_at(), Some(3));
    }

    #[test]
    fn handler_error_from_serde() {
        let err: HandlerError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(err.to_string().starts_with("payload decode failed"));
    }

    #[test]
    fn journal_error_io_from_conversion() {
        let err = JournalError::from(io::Error::new(io::ErrorKind::NotFound, "file missing"));
        assert!(err.to_string().contains("file missing"));
    }

    // Errors cross the actor channel and tokio tasks.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ExecuteError>();
            assert_send_sync::<StoreError>();
            assert_send_sync::<ApplyError>();
            assert_send_sync::<ReplayError>();
            assert_send_sync::<MaintenanceError>();
        }
    };
}
