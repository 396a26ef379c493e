//! Background delivery of outbox items to the projection store.
//!
//! [`OutboxWorker`] holds everything needed to apply one queued event:
//! it reads the event from the journal, applies it through the
//! [`ProjectionStore`], and records the outcome in the [`Outbox`]. The
//! same worker serves the inline path right after an append and the
//! background loop started by
//! [`CampaignStore::start_worker`](crate::CampaignStore::start_worker).
//!
//! The loop wakes on a timer or when signalled, claims a batch of due
//! items, applies them with bounded concurrency and a per-item timeout,
//! and checks for shutdown between batches.
//!
//! Items of quarantined campaigns are never applied. They stay queued
//! until the campaign verifies again.

use std::io;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinSet;

use crate::checkpoint::{CheckpointStore, OUTBOX_CONSUMER};
use crate::config::OutboxConfig;
use crate::error::{ApplyError, OutboxError};
use crate::journal::Journal;
use crate::outbox::{Outbox, OutboxItem};
use crate::projection::{ApplyOutcome, Projection, ProjectionApplier, ProjectionStore};
use crate::store::Quarantines;

/// Applies outbox items to one projection.
pub struct OutboxWorker<P> {
    journal: Arc<Journal>,
    outbox: Arc<Outbox>,
    projections: Arc<ProjectionStore<P>>,
    applier: Arc<ProjectionApplier<P>>,
    checkpoints: Arc<CheckpointStore>,
    config: OutboxConfig,
    quarantines: Quarantines,
    wake: Arc<Notify>,
}

impl<P> Clone for OutboxWorker<P> {
    fn clone(&self) -> Self {
        Self {
            journal: Arc::clone(&self.journal),
            outbox: Arc::clone(&self.outbox),
            projections: Arc::clone(&self.projections),
            applier: Arc::clone(&self.applier),
            checkpoints: Arc::clone(&self.checkpoints),
            config: self.config.clone(),
            quarantines: self.quarantines.clone(),
            wake: Arc::clone(&self.wake),
        }
    }
}

impl<P: Projection> OutboxWorker<P> {
    pub fn new(
        journal: Arc<Journal>,
        outbox: Arc<Outbox>,
        projections: Arc<ProjectionStore<P>>,
        applier: Arc<ProjectionApplier<P>>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        let config = outbox.config().clone();
        Self {
            journal,
            outbox,
            projections,
            applier,
            checkpoints,
            config,
            quarantines: Quarantines::default(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn with_quarantines(mut self, quarantines: Quarantines) -> Self {
        self.quarantines = quarantines;
        self
    }

    /// Signal the background loop that new items may be due.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Read the journaled event for `(campaign_id, seq)` and apply it.
    pub fn apply(&self, campaign_id: &str, seq: u64) -> Result<ApplyOutcome, ApplyError> {
        let event = self
            .journal
            .list_events(campaign_id, seq.saturating_sub(1), 1)?
            .into_iter()
            .next()
            .filter(|e| e.seq == seq)
            .ok_or_else(|| ApplyError::EventMissing {
                campaign_id: campaign_id.to_owned(),
                seq,
            })?;
        self.projections.apply_event(&self.applier, &event)
    }

    /// Record the result of applying a claimed item.
    ///
    /// Success completes the item and advances the `outbox` checkpoint.
    /// Fatal errors dead-letter it at once; others schedule a retry.
    pub fn settle(
        &self,
        item: &OutboxItem,
        result: Result<ApplyOutcome, ApplyError>,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        match result {
            Ok(outcome) => {
                self.outbox.complete(&item.campaign_id, item.seq)?;
                if let Err(e) = self.checkpoints.advance(OUTBOX_CONSUMER, &item.campaign_id, item.seq) {
                    tracing::warn!(
                        campaign_id = %item.campaign_id,
                        seq = item.seq,
                        error = %e,
                        "failed to advance outbox checkpoint"
                    );
                }
                tracing::debug!(
                    campaign_id = %item.campaign_id,
                    seq = item.seq,
                    outcome = ?outcome,
                    "outbox item applied"
                );
            }
            Err(e) if e.is_fatal() => {
                self.outbox.fail_fatal(&item.campaign_id, item.seq, &e.to_string(), now)?;
            }
            Err(e) => {
                metrics::counter!("campaign_es_apply_failures_total").increment(1);
                self.outbox.fail(&item.campaign_id, item.seq, &e.to_string(), now)?;
            }
        }
        Ok(())
    }

    /// Claim and apply one specific item on the caller's thread.
    ///
    /// Returns `Ok(false)` when the item is not claimable (another item of
    /// the campaign is ahead of it or in flight, or the campaign is
    /// quarantined); the background loop delivers it later.
    pub fn deliver_now(&self, campaign_id: &str, seq: u64) -> Result<bool, OutboxError> {
        if self.quarantines.contains(campaign_id) {
            return Ok(false);
        }
        let Some(item) = self.outbox.claim_item(campaign_id, seq, Utc::now())? else {
            return Ok(false);
        };
        let result = self.apply(campaign_id, seq);
        let applied = result.is_ok();
        self.settle(&item, result, Utc::now())?;
        Ok(applied)
    }

    /// Recover expired leases, then claim and apply one batch.
    ///
    /// Returns the number of items claimed. Waits for every item of the
    /// batch before returning.
    pub async fn run_once(&self) -> Result<usize, OutboxError> {
        let now = Utc::now();
        let worker = self.clone();
        let claimed = tokio::task::spawn_blocking(move || {
            worker.outbox.recover_expired_leases(now)?;
            let quarantines = &worker.quarantines;
            worker
                .outbox
                .claim_due_where(now, worker.config.batch_size, |id| !quarantines.contains(id))
        })
        .await
        .map_err(|e| io::Error::other(format!("outbox claim task failed: {e}")))??;

        let count = claimed.len();
        if count == 0 {
            return Ok(0);
        }

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for item in claimed {
            let worker = self.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                worker.process(item).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "failed to record outbox result"),
                Err(e) => tracing::error!(error = %e, "outbox apply task failed"),
            }
        }
        Ok(count)
    }

    async fn process(self, item: OutboxItem) -> Result<(), OutboxError> {
        // Quarantined after the claim.
        if self.quarantines.contains(&item.campaign_id) {
            return tokio::task::spawn_blocking(move || {
                self.outbox.release(&item.campaign_id, item.seq, Utc::now()).map(drop)
            })
            .await
            .map_err(|e| io::Error::other(format!("outbox release task failed: {e}")))?;
        }
        let timeout = self.config.apply_timeout;
        let worker = self.clone();
        let (campaign_id, seq) = (item.campaign_id.clone(), item.seq);
        let apply = tokio::task::spawn_blocking(move || worker.apply(&campaign_id, seq));

        let result = match tokio::time::timeout(timeout, apply).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(ApplyError::Io(io::Error::other(format!("apply task failed: {e}")))),
            // The blocking apply may still finish; the projection
            // watermark makes a later retry a no-op if it does.
            Err(_) => Err(ApplyError::Timeout(timeout)),
        };

        tokio::task::spawn_blocking(move || self.settle(&item, result, Utc::now()))
            .await
            .map_err(|e| io::Error::other(format!("outbox settle task failed: {e}")))?
    }

    /// Start the background loop on the current Tokio runtime.
    pub fn spawn(&self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = self.clone();
        let task = tokio::spawn(async move { worker.run_loop(shutdown_rx).await });
        WorkerHandle {
            shutdown_tx,
            wake: Arc::clone(&self.wake),
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    async fn run_loop(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            projection = P::NAME,
            concurrency = self.config.concurrency,
            "outbox worker started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.run_once().await {
                // A full batch likely left more work behind.
                Ok(n) if n > 0 => continue,
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "outbox batch failed"),
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
                _ = shutdown_rx.changed() => {}
            }
        }
        tracing::info!(projection = P::NAME, "outbox worker stopped");
    }
}

/// Control handle for a running outbox worker.
///
/// Dropping the handle does not stop the worker; call
/// [`shutdown`](WorkerHandle::shutdown).
#[derive(Clone)]
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    wake: Arc<Notify>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("shutdown_requested", &*self.shutdown_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stop after the current batch and wait for the loop to exit.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| io::Error::other(format!("outbox worker task failed: {e}"))),
            None => Ok(()),
        }
    }
}
