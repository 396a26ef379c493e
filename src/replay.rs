//! Checkpointed replay of a campaign's journal into a projection or into
//! aggregate state.
//!
//! A run starts at `max(checkpoint, after_seq, snapshot seq)`, walks the
//! journal in ascending pages and persists the consumer's checkpoint after
//! every event, so a crashed run resumes where it stopped. A sequence gap
//! or an unroutable must-apply event aborts the run at that seq.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::aggregate::{AggregateState, Loaded};
use crate::checkpoint::CheckpointStore;
use crate::error::ReplayError;
use crate::event::StoredEvent;
use crate::journal::Journal;
use crate::projection::{ApplyOutcome, Projection, ProjectionApplier, ProjectionDocument, ProjectionStore};
use crate::registry::Registry;
use crate::snapshot::{
    delete_projection_snapshots, load_aggregate_snapshot, load_projection_snapshot, save_aggregate_snapshot,
    save_projection_snapshot,
};

/// Consumer name used by operator-triggered replays.
pub const REPLAY_CONSUMER: &str = "replay";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Re-derive the projection document.
    Projection,
    /// Re-fold decision-time state and refresh the aggregate snapshot.
    Aggregate,
}

/// Parameters of one replay run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRequest {
    /// Checkpoint owner. Independent consumers keep independent progress.
    pub consumer: String,
    /// Lower bound, exclusive.
    pub after_seq: u64,
    /// Upper bound, inclusive. `None` means the journal head.
    pub until_seq: Option<u64>,
    pub use_snapshot: bool,
    pub mode: ReplayMode,
    /// Fold into scratch state; write nothing.
    pub dry_run: bool,
}

impl ReplayRequest {
    pub fn projection(consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            after_seq: 0,
            until_seq: None,
            use_snapshot: false,
            mode: ReplayMode::Projection,
            dry_run: false,
        }
    }

    pub fn aggregate(consumer: impl Into<String>) -> Self {
        Self {
            mode: ReplayMode::Aggregate,
            ..Self::projection(consumer)
        }
    }

    pub fn window(mut self, after_seq: u64, until_seq: Option<u64>) -> Self {
        self.after_seq = after_seq;
        self.until_seq = until_seq;
        self
    }

    pub fn with_snapshot(mut self) -> Self {
        self.use_snapshot = true;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Lifecycle of the most recent run per `(consumer, campaign)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed {
        at_seq: Option<u64>,
    },
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub campaign_id: String,
    pub consumer: String,
    pub mode: ReplayMode,
    pub dry_run: bool,
    /// Seq the run started after.
    pub start_seq: u64,
    /// Last seq processed; equal to `start_seq` when nothing was processed.
    pub end_seq: u64,
    /// Events applied or folded.
    pub applied: u64,
    /// Audit-only events and events the projection already reflected.
    pub skipped: u64,
    /// Seq of the snapshot the run started from, if any.
    pub snapshot_seq: Option<u64>,
    pub snapshots_written: u64,
}

impl ReplayReport {
    fn new(campaign_id: &str, request: &ReplayRequest) -> Self {
        Self {
            campaign_id: campaign_id.to_owned(),
            consumer: request.consumer.clone(),
            mode: request.mode,
            dry_run: request.dry_run,
            start_seq: 0,
            end_seq: 0,
            applied: 0,
            skipped: 0,
            snapshot_seq: None,
            snapshots_written: 0,
        }
    }
}

/// Replays journals into projections and aggregate state.
pub struct ReplayRunner<S, P> {
    journal: Arc<Journal>,
    registry: Arc<Registry<S>>,
    applier: Arc<ProjectionApplier<P>>,
    projections: Arc<ProjectionStore<P>>,
    checkpoints: Arc<CheckpointStore>,
    page_size: usize,
    projection_snapshot_interval: u64,
    status: Mutex<HashMap<(String, String), ReplayStatus>>,
}

impl<S: AggregateState, P: Projection> ReplayRunner<S, P> {
    pub fn new(
        journal: Arc<Journal>,
        registry: Arc<Registry<S>>,
        applier: Arc<ProjectionApplier<P>>,
        projections: Arc<ProjectionStore<P>>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            journal,
            registry,
            applier,
            projections,
            checkpoints,
            page_size: 256,
            projection_snapshot_interval: 0,
            status: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Write a projection snapshot every `interval` applied events. `0`
    /// disables snapshots.
    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.projection_snapshot_interval = interval;
        self
    }

    pub fn status(&self, consumer: &str, campaign_id: &str) -> ReplayStatus {
        let status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status
            .get(&(consumer.to_owned(), campaign_id.to_owned()))
            .copied()
            .unwrap_or_default()
    }

    fn set_status(&self, consumer: &str, campaign_id: &str, value: ReplayStatus) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        status.insert((consumer.to_owned(), campaign_id.to_owned()), value);
    }

    /// Run one replay.
    ///
    /// # Errors
    ///
    /// [`ReplayError::SequenceGap`] on a missing seq, [`ReplayError::Apply`]
    /// or [`ReplayError::Load`] when an event cannot be applied; both carry
    /// the failing seq. The checkpoint keeps the last event that succeeded.
    pub fn run(&self, campaign_id: &str, request: &ReplayRequest) -> Result<ReplayReport, ReplayError> {
        let _span = tracing::info_span!(
            "replay",
            campaign_id = %campaign_id,
            consumer = %request.consumer,
            mode = ?request.mode,
            dry_run = request.dry_run,
        )
        .entered();

        self.set_status(&request.consumer, campaign_id, ReplayStatus::Running);
        let result = match request.mode {
            ReplayMode::Projection => self.run_projection(campaign_id, request),
            ReplayMode::Aggregate => self.run_aggregate(campaign_id, request),
        };

        match &result {
            Ok(report) => {
                self.set_status(&request.consumer, campaign_id, ReplayStatus::Completed);
                tracing::info!(
                    start_seq = report.start_seq,
                    end_seq = report.end_seq,
                    applied = report.applied,
                    skipped = report.skipped,
                    "replay completed"
                );
            }
            Err(e) => {
                let at_seq = e.failed_at();
                self.set_status(&request.consumer, campaign_id, ReplayStatus::Failed { at_seq });
                tracing::error!(at_seq = ?at_seq, error = %e, "replay failed");
            }
        }
        result
    }

    /// Discard the projection, its snapshots and the replay checkpoint,
    /// then replay the whole journal.
    pub fn rebuild(&self, campaign_id: &str) -> Result<ReplayReport, ReplayError> {
        self.projections.reset(campaign_id)?;
        delete_projection_snapshots::<P>(self.journal.layout(), campaign_id)?;
        self.checkpoints.reset(REPLAY_CONSUMER, campaign_id)?;
        tracing::info!(campaign_id = %campaign_id, projection = P::NAME, "projection discarded for rebuild");
        self.run(campaign_id, &ReplayRequest::projection(REPLAY_CONSUMER))
    }

    /// Fold events `1..=until` (or the whole journal) into a fresh
    /// projection without touching storage.
    pub fn scratch(&self, campaign_id: &str, until_seq: Option<u64>) -> Result<(P, u64), ReplayError> {
        let until = self.resolve_until(campaign_id, until_seq)?;
        let mut state = P::default();
        let end = self.walk(campaign_id, 0, until, |event| {
            self.applier
                .apply(&mut state, event)
                .map(|_| ())
                .map_err(|source| ReplayError::Apply { seq: event.seq, source })
        })?;
        Ok((state, end))
    }

    /// Fold aggregate state up to `until_seq`, optionally starting from the
    /// aggregate snapshot.
    pub fn fold_aggregate(
        &self,
        campaign_id: &str,
        until_seq: Option<u64>,
        use_snapshot: bool,
    ) -> Result<Loaded<S>, ReplayError> {
        let until = self.resolve_until(campaign_id, until_seq)?;
        let mut loaded = Loaded {
            state: S::default(),
            seq: 0,
            from_snapshot: None,
        };
        if use_snapshot
            && let Some(snap) = load_aggregate_snapshot::<S>(self.journal.layout(), campaign_id)?
            && snap.seq <= until
        {
            loaded = Loaded {
                state: snap.state,
                seq: snap.seq,
                from_snapshot: Some(snap.seq),
            };
        }
        loaded.seq = self.walk(campaign_id, loaded.seq, until, |event| {
            self.registry
                .fold(&mut loaded.state, event)
                .map_err(|source| ReplayError::Load { seq: event.seq, source })
        })?;
        Ok(loaded)
    }

    fn resolve_until(&self, campaign_id: &str, until_seq: Option<u64>) -> Result<u64, ReplayError> {
        let head = self.journal.head(campaign_id)?.last_seq;
        Ok(until_seq.map_or(head, |until| until.min(head)))
    }

    /// Visit events in `(after, until]` in order. Returns the last seq seen.
    fn walk(
        &self,
        campaign_id: &str,
        after: u64,
        until: u64,
        mut visit: impl FnMut(&StoredEvent) -> Result<(), ReplayError>,
    ) -> Result<u64, ReplayError> {
        let mut cursor = after;
        while cursor < until {
            let page = self.journal.list_events(campaign_id, cursor, self.page_size)?;
            if page.is_empty() {
                break;
            }
            for event in &page {
                if event.seq > until {
                    return Ok(cursor);
                }
                if event.seq != cursor + 1 {
                    return Err(ReplayError::SequenceGap {
                        campaign_id: campaign_id.to_owned(),
                        expected: cursor + 1,
                        found: event.seq,
                    });
                }
                visit(event)?;
                cursor = event.seq;
            }
        }
        Ok(cursor)
    }

    fn run_projection(&self, campaign_id: &str, request: &ReplayRequest) -> Result<ReplayReport, ReplayError> {
        let until = self.resolve_until(campaign_id, request.until_seq)?;
        let layout = self.journal.layout();
        let mut report = ReplayReport::new(campaign_id, request);

        let snapshot = if request.use_snapshot {
            load_projection_snapshot::<P>(layout, campaign_id, until)?
        } else {
            None
        };
        report.snapshot_seq = snapshot.as_ref().map(|s| s.seq);

        if request.dry_run {
            let (mut state, from) = match snapshot {
                Some(snap) => (snap.state, snap.seq),
                None => (P::default(), 0),
            };
            report.start_seq = from.max(request.after_seq);
            report.end_seq = self.walk(campaign_id, report.start_seq, until, |event| {
                match self.applier.apply(&mut state, event) {
                    Ok(ApplyOutcome::Applied) => report.applied += 1,
                    Ok(_) => report.skipped += 1,
                    Err(source) => return Err(ReplayError::Apply { seq: event.seq, source }),
                }
                Ok(())
            })?;
            return Ok(report);
        }

        if let Some(snap) = snapshot
            && snap.seq > self.projections.load(campaign_id)?.last_seq
        {
            let doc = ProjectionDocument {
                state: snap.state,
                last_seq: snap.seq,
            };
            self.projections.save(campaign_id, &doc)?;
            tracing::debug!(seq = doc.last_seq, "projection restored from snapshot");
        }

        let checkpoint = self.checkpoints.load(&request.consumer, campaign_id)?;
        report.start_seq = checkpoint
            .max(request.after_seq)
            .max(report.snapshot_seq.unwrap_or(0));

        report.end_seq = self.walk(campaign_id, report.start_seq, until, |event| {
            let outcome = self
                .projections
                .apply_event(&self.applier, event)
                .map_err(|source| ReplayError::Apply { seq: event.seq, source })?;
            match outcome {
                ApplyOutcome::Applied => report.applied += 1,
                ApplyOutcome::Skipped | ApplyOutcome::AlreadyApplied => report.skipped += 1,
            }
            self.checkpoints.advance(&request.consumer, campaign_id, event.seq)?;

            if self.projection_snapshot_interval > 0 && event.seq % self.projection_snapshot_interval == 0 {
                let doc = self.projections.load(campaign_id)?;
                if doc.last_seq == event.seq {
                    save_projection_snapshot(layout, campaign_id, &doc.state, doc.last_seq)?;
                    report.snapshots_written += 1;
                }
            }
            Ok(())
        })?;
        Ok(report)
    }

    fn run_aggregate(&self, campaign_id: &str, request: &ReplayRequest) -> Result<ReplayReport, ReplayError> {
        let until = self.resolve_until(campaign_id, request.until_seq)?;
        let mut report = ReplayReport::new(campaign_id, request);

        // Folding needs the full prefix, so the fold starts at the snapshot
        // (or seq 1). The checkpoint and `after_seq` only bound what is
        // reported and checkpointed.
        let mut loaded = Loaded {
            state: S::default(),
            seq: 0,
            from_snapshot: None,
        };
        if request.use_snapshot
            && let Some(snap) = load_aggregate_snapshot::<S>(self.journal.layout(), campaign_id)?
            && snap.seq <= until
        {
            report.snapshot_seq = Some(snap.seq);
            loaded = Loaded {
                state: snap.state,
                seq: snap.seq,
                from_snapshot: Some(snap.seq),
            };
        }

        let checkpoint = if request.dry_run {
            0
        } else {
            self.checkpoints.load(&request.consumer, campaign_id)?
        };
        report.start_seq = checkpoint.max(request.after_seq).max(loaded.seq);

        loaded.seq = self.walk(campaign_id, loaded.seq, until, |event| {
            self.registry
                .fold(&mut loaded.state, event)
                .map_err(|source| ReplayError::Load { seq: event.seq, source })?;
            if event.seq > report.start_seq {
                report.applied += 1;
                if !request.dry_run {
                    self.checkpoints.advance(&request.consumer, campaign_id, event.seq)?;
                }
            }
            Ok(())
        })?;
        report.end_seq = loaded.seq.max(report.start_seq);

        if !request.dry_run && loaded.seq > 0 {
            save_aggregate_snapshot(self.journal.layout(), campaign_id, &loaded.state, loaded.seq)?;
            report.snapshots_written += 1;
        }
        Ok(report)
    }
}
