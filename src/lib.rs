//! Event-sourced campaign storage: an append-only, hash-chained journal per
//! campaign, per-campaign command actors, projections fed through a
//! durable outbox, and replay tooling.

mod actor;
mod aggregate;
pub use aggregate::{AggregateLoader, AggregateState, Loaded};
mod canonical;
pub use canonical::{canonicalize, to_canonical_string};
mod checkpoint;
pub use checkpoint::{Checkpoint, CheckpointStore, OUTBOX_CONSUMER};
mod command;
pub use command::{ActorType, Command};
mod config;
pub use config::{IntegrityPolicy, OutboxConfig, StoreConfig};
mod decision;
pub use decision::{Decision, Outcome, Rejection};
mod error;
pub use error::{
    ApplyError, ExecuteError, HandlerError, IntegrityError, JournalError, LoadError, MaintenanceError,
    OutboxError, RegistryError, ReplayError, StoreError, ValidationError,
};
mod event;
pub use event::{EventDraft, Intent, PendingEvent, StoredEvent};
mod integrity;
pub use integrity::{ChainVerifier, Corruption, GENESIS_HASH, IntegrityReport, KeyRing, chain_hash, content_hash};
mod journal;
pub use journal::{Journal, JournalHead};
mod maintenance;
pub use maintenance::{CampaignReport, Maintenance, ScanIssue, ScanReport};
mod outbox;
pub use outbox::{Outbox, OutboxItem, OutboxStats, OutboxStatus, backoff_delay};
mod projection;
pub use projection::{
    ApplyFn, ApplyOutcome, Projection, ProjectionApplier, ProjectionApplierBuilder, ProjectionDocument,
    ProjectionStore,
};
mod registry;
pub use registry::{
    Addressing, CommandDefinition, DecideFn, EventDefinition, FoldFn, Namespace, Owner, PayloadValidator, Registry,
    RegistryBuilder, validate_as,
};
mod replay;
pub use replay::{REPLAY_CONSUMER, ReplayMode, ReplayReport, ReplayRequest, ReplayRunner, ReplayStatus};
mod snapshot;
pub use snapshot::Snapshot;
mod storage;
pub use storage::StoreLayout;
mod store;
pub use store::{CampaignStore, CampaignStoreBuilder, Quarantine};
mod worker;
pub use worker::{OutboxWorker, WorkerHandle};
