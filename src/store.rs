//! Top-level entry point that wires the journal, campaign actors, the
//! outbox and its worker, projections and replay into one
//! [`CampaignStore`].
//!
//! The store is opened via [`CampaignStoreBuilder`]. Opening verifies the
//! integrity of every campaign journal, quarantines the ones that fail and
//! reconciles the outbox against the journal heads.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError};

use chrono::Utc;
use tokio::sync::RwLock;

use crate::actor::{ActorContext, CampaignHandle, spawn_actor};
use crate::aggregate::{AggregateLoader, AggregateState, Loaded};
use crate::checkpoint::CheckpointStore;
use crate::command::Command;
use crate::config::{IntegrityPolicy, StoreConfig};
use crate::decision::Outcome;
use crate::error::{ExecuteError, StoreError};
use crate::event::StoredEvent;
use crate::integrity::{IntegrityReport, KeyRing};
use crate::journal::Journal;
use crate::maintenance::Maintenance;
use crate::outbox::{Outbox, OutboxItem, OutboxStats};
use crate::projection::{Projection, ProjectionApplierBuilder, ProjectionDocument, ProjectionStore};
use crate::registry::Registry;
use crate::replay::{ReplayReport, ReplayRequest, ReplayRunner};
use crate::storage::StoreLayout;
use crate::worker::{OutboxWorker, WorkerHandle};

/// Why a campaign is not being served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quarantine {
    /// First seq that failed verification.
    pub at_seq: u64,
    pub reason: String,
    pub policy: IntegrityPolicy,
}

impl Quarantine {
    pub fn allows_reads(&self) -> bool {
        self.policy == IntegrityPolicy::ReadOnlyQuarantine
    }
}

/// Quarantined campaigns, shared by the store, its outbox worker and
/// maintenance so none of them writes derived state for a campaign whose
/// journal failed verification.
#[derive(Debug, Clone, Default)]
pub(crate) struct Quarantines(Arc<std::sync::RwLock<HashMap<String, Quarantine>>>);

impl Quarantines {
    pub(crate) fn get(&self, campaign_id: &str) -> Option<Quarantine> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(campaign_id)
            .cloned()
    }

    pub(crate) fn contains(&self, campaign_id: &str) -> bool {
        self.0.read().unwrap_or_else(PoisonError::into_inner).contains_key(campaign_id)
    }

    pub(crate) fn insert(&self, campaign_id: &str, quarantine: Quarantine) {
        self.0
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(campaign_id.to_owned(), quarantine);
    }

    pub(crate) fn remove(&self, campaign_id: &str) -> Option<Quarantine> {
        self.0.write().unwrap_or_else(PoisonError::into_inner).remove(campaign_id)
    }

    /// Sorted by campaign id.
    pub(crate) fn entries(&self) -> Vec<(String, Quarantine)> {
        let map = self.0.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<_> = map.iter().map(|(id, q)| (id.clone(), q.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

type HandleCache = HashMap<String, CampaignHandle>;

/// The campaign event store.
///
/// Commands go through [`execute`](CampaignStore::execute), which routes
/// them to the campaign's actor. Reads go straight to storage.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct CampaignStore<S, P> {
    layout: StoreLayout,
    config: Arc<StoreConfig>,
    registry: Arc<Registry<S>>,
    journal: Arc<Journal>,
    loader: AggregateLoader<S>,
    outbox: Arc<Outbox>,
    projections: Arc<ProjectionStore<P>>,
    worker: OutboxWorker<P>,
    replay: Arc<ReplayRunner<S, P>>,
    maintenance: Arc<Maintenance<S, P>>,
    actor_ctx: Arc<ActorContext<S, P>>,
    actors: Arc<RwLock<HandleCache>>,
    quarantines: Quarantines,
    worker_handle: Arc<tokio::sync::Mutex<Option<WorkerHandle>>>,
}

impl<S, P> std::fmt::Debug for CampaignStore<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampaignStore")
            .field("base_dir", &self.layout.base_dir())
            .finish()
    }
}

impl<S: AggregateState, P: Projection> CampaignStore<S, P> {
    /// Start configuring a store rooted at `base_dir`.
    pub fn builder(base_dir: impl Into<PathBuf>) -> CampaignStoreBuilder<S, P> {
        CampaignStoreBuilder::new(base_dir)
    }

    /// Execute a command against its campaign.
    ///
    /// The command is normalized and validated, then handed to the
    /// campaign's actor, which decides, validates the emitted events and
    /// appends them in one atomic batch.
    ///
    /// Dropping the returned future before the actor appends leaves no
    /// trace. Once the append has started it completes regardless.
    ///
    /// # Errors
    ///
    /// [`ExecuteError::Validation`] for malformed commands or events,
    /// [`ExecuteError::Quarantined`] when the campaign failed integrity
    /// verification, [`ExecuteError::Journal`] when the append fails.
    /// Domain rejections are returned as [`Outcome::Rejected`].
    pub async fn execute(&self, cmd: Command) -> Result<Outcome, ExecuteError> {
        let cmd = self.registry.validate_command(cmd)?;
        if let Some(q) = self.quarantine(&cmd.campaign_id) {
            return Err(ExecuteError::Quarantined {
                campaign_id: cmd.campaign_id,
                at_seq: q.at_seq,
            });
        }

        // One retry covers an actor that idled out between lookup and send.
        for _ in 0..2 {
            let handle = self.actor(&cmd.campaign_id).await?;
            if let Some(reply) = handle.submit(cmd.clone()).await {
                return reply.await.map_err(|_| ExecuteError::ActorGone)?;
            }
            self.actors.write().await.remove(&cmd.campaign_id);
        }
        Err(ExecuteError::ActorGone)
    }

    async fn actor(&self, campaign_id: &str) -> io::Result<CampaignHandle> {
        // Fast path: check cache with read lock.
        {
            let actors = self.actors.read().await;
            if let Some(handle) = actors.get(campaign_id)
                && handle.is_alive()
            {
                return Ok(handle.clone());
            }
        }

        let mut actors = self.actors.write().await;
        // Another caller may have spawned it while we waited for the lock.
        if let Some(handle) = actors.get(campaign_id)
            && handle.is_alive()
        {
            return Ok(handle.clone());
        }
        tracing::debug!(campaign_id = %campaign_id, "spawning campaign actor");
        let handle = spawn_actor(campaign_id, Arc::clone(&self.actor_ctx))?;
        actors.insert(campaign_id.to_owned(), handle.clone());
        Ok(handle)
    }

    /// Page through a campaign's events in seq order.
    pub async fn list_events(
        &self,
        campaign_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        self.check_readable(campaign_id)?;
        let journal = Arc::clone(&self.journal);
        let id = campaign_id.to_owned();
        blocking(move || Ok(journal.list_events(&id, after_seq, limit)?)).await
    }

    /// The stored projection document: state plus `last_seq` watermark.
    pub async fn projection(&self, campaign_id: &str) -> Result<ProjectionDocument<P>, StoreError> {
        self.check_readable(campaign_id)?;
        let projections = Arc::clone(&self.projections);
        let id = campaign_id.to_owned();
        blocking(move || Ok(projections.load(&id)?)).await
    }

    /// Decision-time state folded from the journal, starting from the
    /// aggregate snapshot when one is usable.
    pub async fn aggregate_state(&self, campaign_id: &str) -> Result<Loaded<S>, StoreError> {
        self.check_readable(campaign_id)?;
        let loader = self.loader.clone();
        let id = campaign_id.to_owned();
        blocking(move || Ok(loader.load(&id)?)).await
    }

    /// Campaigns that have at least one journaled event.
    pub async fn campaigns(&self) -> Result<Vec<String>, StoreError> {
        let journal = Arc::clone(&self.journal);
        blocking(move || Ok(journal.list_campaigns()?)).await
    }

    /// Run one replay; see [`ReplayRunner::run`].
    ///
    /// A quarantined campaign only accepts dry runs, and only under
    /// [`IntegrityPolicy::ReadOnlyQuarantine`].
    pub async fn replay(&self, campaign_id: &str, request: ReplayRequest) -> Result<ReplayReport, StoreError> {
        if request.dry_run {
            self.check_readable(campaign_id)?;
        } else {
            self.check_writable(campaign_id)?;
        }
        let replay = Arc::clone(&self.replay);
        let id = campaign_id.to_owned();
        blocking(move || Ok(replay.run(&id, &request)?)).await
    }

    pub fn replay_runner(&self) -> &ReplayRunner<S, P> {
        &self.replay
    }

    /// Maintenance tasks. They block; call them from blocking contexts.
    pub fn maintenance(&self) -> Arc<Maintenance<S, P>> {
        Arc::clone(&self.maintenance)
    }

    /// Re-verify one campaign and update its quarantine entry.
    ///
    /// A campaign that now verifies is released; one that fails is
    /// quarantined under the configured policy.
    pub async fn verify(&self, campaign_id: &str) -> Result<IntegrityReport, StoreError> {
        let journal = Arc::clone(&self.journal);
        let id = campaign_id.to_owned();
        let report = blocking(move || Ok(journal.verify_integrity(&id)?)).await?;
        match &report {
            IntegrityReport::Ok { .. } => {
                if self.quarantines.remove(campaign_id).is_some() {
                    tracing::info!(campaign_id = %campaign_id, "campaign released from quarantine");
                }
            }
            IntegrityReport::Corrupted { at_seq, reason } => self.quarantine_campaign(campaign_id, *at_seq, reason),
        }
        Ok(report)
    }

    /// Discard and rebuild a campaign's projection from its journal.
    ///
    /// Refused while the campaign is quarantined, under either policy.
    pub async fn rebuild_projection(&self, campaign_id: &str) -> Result<ReplayReport, StoreError> {
        self.check_writable(campaign_id)?;
        let maintenance = Arc::clone(&self.maintenance);
        let id = campaign_id.to_owned();
        blocking(move || Ok(maintenance.rebuild(&id)?)).await
    }

    /// Quarantine entry for a campaign, if it has one.
    pub fn quarantine(&self, campaign_id: &str) -> Option<Quarantine> {
        self.quarantines.get(campaign_id)
    }

    pub fn quarantined(&self) -> Vec<(String, Quarantine)> {
        self.quarantines.entries()
    }

    fn quarantine_campaign(&self, campaign_id: &str, at_seq: u64, reason: &str) {
        tracing::error!(
            campaign_id = %campaign_id,
            at_seq,
            reason = %reason,
            policy = ?self.config.integrity_policy,
            "campaign failed integrity verification; quarantined"
        );
        metrics::counter!("campaign_es_integrity_failures_total").increment(1);
        self.quarantines.insert(
            campaign_id,
            Quarantine {
                at_seq,
                reason: reason.to_owned(),
                policy: self.config.integrity_policy,
            },
        );
    }

    fn check_readable(&self, campaign_id: &str) -> Result<(), StoreError> {
        match self.quarantine(campaign_id) {
            Some(q) if !q.allows_reads() => Err(StoreError::Quarantined {
                campaign_id: campaign_id.to_owned(),
                at_seq: q.at_seq,
            }),
            _ => Ok(()),
        }
    }

    /// Derived-state writes are refused for any quarantined campaign.
    fn check_writable(&self, campaign_id: &str) -> Result<(), StoreError> {
        match self.quarantine(campaign_id) {
            Some(q) => Err(StoreError::Quarantined {
                campaign_id: campaign_id.to_owned(),
                at_seq: q.at_seq,
            }),
            None => Ok(()),
        }
    }

    /// The durable apply queue, for inspection.
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn outbox_stats(&self) -> OutboxStats {
        self.outbox.stats(Utc::now())
    }

    /// Move a dead item back to pending and wake the worker.
    pub fn requeue_dead(&self, campaign_id: &str, seq: u64) -> Result<OutboxItem, StoreError> {
        let item = self.outbox.requeue_dead(campaign_id, seq, Utc::now())?;
        self.worker.wake();
        Ok(item)
    }

    /// Requeue up to `limit` dead items, oldest first.
    pub fn requeue_dead_batch(&self, limit: usize) -> Result<Vec<OutboxItem>, StoreError> {
        let items = self.outbox.requeue_dead_batch(limit, Utc::now())?;
        if !items.is_empty() {
            self.worker.wake();
        }
        Ok(items)
    }

    /// Process one batch of due outbox items on the caller's task.
    pub async fn run_outbox_once(&self) -> Result<usize, StoreError> {
        Ok(self.worker.run_once().await?)
    }

    /// Start the background outbox worker.
    ///
    /// Can only be called once per store. A second call returns
    /// [`StoreError::WorkerRunning`] without spawning another task.
    pub async fn start_worker(&self) -> Result<WorkerHandle, StoreError> {
        let mut guard = self.worker_handle.lock().await;
        if guard.is_some() {
            return Err(StoreError::WorkerRunning);
        }
        let handle = self.worker.spawn();
        *guard = Some(handle.clone());
        Ok(handle)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| StoreError::Io(io::Error::other(e)))?
}

/// Builder for [`CampaignStore`].
///
/// # Examples
///
/// ```no_run
/// # use campaign_es::*;
/// # async fn example<S: AggregateState, P: Projection>(registry: Registry<S>, handlers: ProjectionApplierBuilder<P>) -> Result<(), StoreError> {
/// let store = CampaignStore::builder("/var/lib/campaigns")
///     .registry(registry)
///     .projections(handlers)
///     .key_ring(KeyRing::new("2026-01", b"root secret"))
///     .open()
///     .await?;
/// # let _: CampaignStore<S, P> = store;
/// # Ok(())
/// # }
/// ```
pub struct CampaignStoreBuilder<S, P> {
    base_dir: PathBuf,
    registry: Option<Registry<S>>,
    projections: Option<ProjectionApplierBuilder<P>>,
    keys: Option<KeyRing>,
    config: StoreConfig,
}

impl<S: AggregateState, P: Projection> CampaignStoreBuilder<S, P> {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            registry: None,
            projections: None,
            keys: None,
            config: StoreConfig::default(),
        }
    }

    pub fn registry(mut self, registry: Registry<S>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Projection handler tables. Coverage against the registry is checked
    /// when the store opens.
    pub fn projections(mut self, handlers: ProjectionApplierBuilder<P>) -> Self {
        self.projections = Some(handlers);
        self
    }

    pub fn key_ring(mut self, keys: KeyRing) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Open the store.
    ///
    /// # Errors
    ///
    /// [`StoreError::Incomplete`] when the registry, handlers or key ring
    /// were not supplied, [`StoreError::Registry`] when a must-apply event
    /// has no projection handler, I/O errors from the storage directory.
    /// A campaign failing integrity verification is quarantined, not an
    /// error.
    pub async fn open(self) -> Result<CampaignStore<S, P>, StoreError> {
        tokio::task::spawn_blocking(move || self.open_blocking())
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))?
    }

    fn open_blocking(self) -> Result<CampaignStore<S, P>, StoreError> {
        let registry = Arc::new(self.registry.ok_or(StoreError::Incomplete("a registry"))?);
        let handlers = self.projections.ok_or(StoreError::Incomplete("projection handlers"))?;
        let keys = Arc::new(self.keys.ok_or(StoreError::Incomplete("a key ring"))?);
        let applier = Arc::new(handlers.build(&registry)?);
        let config = self.config;

        std::fs::create_dir_all(&self.base_dir)?;
        let layout = StoreLayout::new(self.base_dir);
        let journal = Arc::new(Journal::new(layout.clone(), keys).with_fsync(config.fsync));
        let outbox = Arc::new(Outbox::open(layout.clone(), config.outbox.clone())?);
        let projections = Arc::new(ProjectionStore::new(layout.clone()));
        let checkpoints = Arc::new(CheckpointStore::new(layout.clone()));
        let loader = AggregateLoader::new(Arc::clone(&journal), Arc::clone(&registry), config.page_size);
        let quarantines = Quarantines::default();

        let worker = OutboxWorker::new(
            Arc::clone(&journal),
            Arc::clone(&outbox),
            Arc::clone(&projections),
            Arc::clone(&applier),
            Arc::clone(&checkpoints),
        )
        .with_quarantines(quarantines.clone());
        let replay = Arc::new(
            ReplayRunner::new(
                Arc::clone(&journal),
                Arc::clone(&registry),
                Arc::clone(&applier),
                Arc::clone(&projections),
                checkpoints,
            )
            .with_page_size(config.page_size)
            .with_snapshot_interval(config.projection_snapshot_interval),
        );
        let maintenance = Arc::new(
            Maintenance::new(
                Arc::clone(&journal),
                Arc::clone(&registry),
                applier,
                Arc::clone(&projections),
                Arc::clone(&outbox),
                Arc::clone(&replay),
            )
            .with_page_size(config.page_size)
            .with_quarantines(quarantines.clone()),
        );
        let actor_ctx = Arc::new(ActorContext {
            registry: Arc::clone(&registry),
            journal: Arc::clone(&journal),
            loader: loader.clone(),
            outbox: Arc::clone(&outbox),
            worker: worker.clone(),
            snapshot_interval: config.snapshot_interval,
            inline_apply: config.inline_apply,
            idle_timeout: config.idle_timeout,
        });

        let store = CampaignStore {
            layout,
            config: Arc::new(config),
            registry,
            journal,
            loader,
            outbox,
            projections,
            worker,
            replay,
            maintenance,
            actor_ctx,
            actors: Arc::new(RwLock::new(HashMap::new())),
            quarantines,
            worker_handle: Arc::new(tokio::sync::Mutex::new(None)),
        };
        store.startup_checks()?;
        Ok(store)
    }
}

impl<S: AggregateState, P: Projection> CampaignStore<S, P> {
    /// Verify every journal, then re-enqueue anything appended but never
    /// applied.
    fn startup_checks(&self) -> Result<(), StoreError> {
        let campaigns = self.journal.list_campaigns()?;
        let now = Utc::now();
        let mut requeued = 0;
        for campaign_id in &campaigns {
            if let IntegrityReport::Corrupted { at_seq, reason } = self.journal.verify_integrity(campaign_id)? {
                self.quarantine_campaign(campaign_id, at_seq, &reason);
                continue;
            }
            let head = self.journal.head(campaign_id)?;
            let applied_through = match self.projections.load(campaign_id) {
                Ok(doc) => doc.last_seq,
                Err(e) => {
                    tracing::warn!(
                        campaign_id = %campaign_id,
                        error = %e,
                        "projection unreadable; rebuild it to resume delivery"
                    );
                    continue;
                }
            };
            requeued += self.outbox.reconcile(campaign_id, head.last_seq, applied_through, now)?;
        }
        tracing::info!(
            base_dir = %self.layout.base_dir().display(),
            campaigns = campaigns.len(),
            quarantined = self.quarantined().len(),
            requeued,
            "campaign store opened"
        );
        Ok(())
    }
}
