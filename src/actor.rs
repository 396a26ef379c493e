//! Per-campaign actor that serializes command execution.
//!
//! Each campaign with recent traffic has one actor running on its own
//! thread. The actor is the only code that appends to the campaign's
//! journal, so loading state, deciding, validating and appending happen
//! without interleaving. Different campaigns run in parallel.
//!
//! The actor caches the campaign's decision-time state between commands
//! and exits after `idle_timeout` without messages.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::aggregate::{AggregateLoader, AggregateState, Loaded};
use crate::command::Command;
use crate::decision::Outcome;
use crate::error::{ExecuteError, LoadError};
use crate::journal::Journal;
use crate::outbox::Outbox;
use crate::projection::Projection;
use crate::registry::Registry;
use crate::worker::OutboxWorker;

/// Shared services every campaign actor needs.
pub(crate) struct ActorContext<S, P> {
    pub registry: Arc<Registry<S>>,
    pub journal: Arc<Journal>,
    pub loader: AggregateLoader<S>,
    pub outbox: Arc<Outbox>,
    pub worker: OutboxWorker<P>,
    pub snapshot_interval: u64,
    pub inline_apply: bool,
    pub idle_timeout: Duration,
}

type ExecuteResult = Result<Outcome, ExecuteError>;

pub(crate) enum ActorMessage {
    Execute {
        cmd: Command,
        reply: oneshot::Sender<ExecuteResult>,
    },
    #[cfg(test)]
    Shutdown,
}

struct CampaignActor<S, P> {
    campaign_id: String,
    ctx: Arc<ActorContext<S, P>>,
    cached: Option<Loaded<S>>,
}

impl<S: AggregateState, P: Projection> CampaignActor<S, P> {
    /// Cached state, caught up with the journal head.
    fn current(&mut self) -> Result<&mut Loaded<S>, LoadError> {
        let head = self.ctx.journal.head(&self.campaign_id)?;
        let loaded = match self.cached.take() {
            Some(mut loaded) => {
                if loaded.seq < head.last_seq {
                    self.ctx.loader.catch_up(&self.campaign_id, &mut loaded)?;
                }
                loaded
            }
            None => self.ctx.loader.load(&self.campaign_id)?,
        };
        Ok(self.cached.insert(loaded))
    }

    /// `abandoned` reports whether the caller stopped waiting; it is checked
    /// once more right before the append, the last point where backing out
    /// leaves no trace.
    fn execute(&mut self, cmd: Command, abandoned: impl Fn() -> bool) -> ExecuteResult {
        let now = Utc::now();
        let ctx = Arc::clone(&self.ctx);
        let campaign_id = self.campaign_id.clone();
        let loaded = self.current()?;

        let decision = ctx.registry.decide(&loaded.state, &cmd, now);
        if decision.is_rejected() {
            tracing::debug!(rejections = decision.rejections.len(), "command rejected");
            return Ok(Outcome::Rejected(decision.rejections));
        }
        if decision.events.is_empty() {
            return Ok(Outcome::Accepted(Vec::new()));
        }

        let pending = decision
            .events
            .into_iter()
            .map(|draft| ctx.registry.validate_event(&cmd, draft, now))
            .collect::<Result<Vec<_>, _>>()?;

        if abandoned() {
            tracing::debug!("caller went away before append");
            return Err(ExecuteError::ActorGone);
        }
        let stored = ctx.journal.append(&campaign_id, pending)?;
        let seqs: Vec<u64> = stored.iter().map(|e| e.seq).collect();

        // From here on the events are committed; later failures are logged
        // and repaired by outbox reconciliation or a reload.
        if let Err(e) = ctx.outbox.enqueue(&campaign_id, &seqs, now) {
            tracing::error!(
                campaign_id = %campaign_id,
                error = %e,
                "failed to enqueue appended events; reconciliation will retry"
            );
        }

        let before = loaded.seq;
        match ctx.loader.fold_appended(loaded, &stored) {
            Ok(()) => {
                let interval = ctx.snapshot_interval;
                if interval > 0
                    && before / interval != loaded.seq / interval
                    && let Err(e) = ctx.loader.snapshot(&campaign_id, loaded)
                {
                    tracing::warn!(campaign_id = %campaign_id, error = %e, "aggregate snapshot failed");
                }
            }
            Err(e) => {
                tracing::error!(
                    campaign_id = %campaign_id,
                    error = %e,
                    "folding appended events failed; state will be reloaded"
                );
                self.cached = None;
            }
        }

        self.deliver(&seqs);
        Ok(Outcome::Accepted(stored))
    }

    /// Apply freshly appended events inline, leaving the rest to the worker.
    fn deliver(&self, seqs: &[u64]) {
        if self.ctx.inline_apply {
            for &seq in seqs {
                match self.ctx.worker.deliver_now(&self.campaign_id, seq) {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        tracing::warn!(campaign_id = %self.campaign_id, seq, error = %e, "inline apply failed");
                        break;
                    }
                }
            }
        }
        self.ctx.worker.wake();
    }
}

fn run_actor<S: AggregateState, P: Projection>(
    mut actor: CampaignActor<S, P>,
    mut rx: mpsc::Receiver<ActorMessage>,
) {
    // A private current-thread runtime drives the idle timer, since the
    // caller's runtime may not drive timers from this thread.
    let rt = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(campaign_id = %actor.campaign_id, error = %e, "actor runtime failed to start");
            return;
        }
    };
    let idle_timeout = actor.ctx.idle_timeout;

    loop {
        let msg = rt.block_on(async { tokio::time::timeout(idle_timeout, rx.recv()).await });
        match msg {
            Ok(Some(ActorMessage::Execute { cmd, reply })) => {
                let _span = tracing::info_span!(
                    "execute",
                    campaign_id = %actor.campaign_id,
                    command_type = %cmd.command_type,
                )
                .entered();
                if reply.is_closed() {
                    continue;
                }
                let result = actor.execute(cmd, || reply.is_closed());
                let _ = reply.send(result);
            }
            #[cfg(test)]
            Ok(Some(ActorMessage::Shutdown)) => break,
            Ok(None) => break,
            Err(_elapsed) => {
                tracing::debug!(campaign_id = %actor.campaign_id, "campaign actor idle, shutting down");
                break;
            }
        }
    }
}

/// Async handle to a running campaign actor.
#[derive(Clone)]
pub(crate) struct CampaignHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl CampaignHandle {
    /// Queue `cmd` with the actor. `None` means the actor had already exited
    /// and the command was never seen.
    pub async fn submit(&self, cmd: Command) -> Option<oneshot::Receiver<ExecuteResult>> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(ActorMessage::Execute { cmd, reply: tx }).await.ok()?;
        Some(rx)
    }

    #[cfg(test)]
    async fn execute(&self, cmd: Command) -> ExecuteResult {
        let rx = self.submit(cmd).await.ok_or(ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    #[cfg(test)]
    async fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown).await;
    }
}

/// Start an actor for `campaign_id` on a dedicated thread.
pub(crate) fn spawn_actor<S: AggregateState, P: Projection>(
    campaign_id: &str,
    ctx: Arc<ActorContext<S, P>>,
) -> io::Result<CampaignHandle> {
    let (tx, rx) = mpsc::channel::<ActorMessage>(32);
    let actor = CampaignActor {
        campaign_id: campaign_id.to_owned(),
        ctx,
        cached: None,
    };
    std::thread::Builder::new()
        .name(format!("campaign-{campaign_id}"))
        .spawn(move || run_actor(actor, rx))?;
    Ok(CampaignHandle { sender: tx })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::aggregate::test_fixtures::{CampaignState, CampaignView, applier, registry};
    use crate::checkpoint::CheckpointStore;
    use crate::config::OutboxConfig;
    use crate::integrity::KeyRing;
    use crate::projection::ProjectionStore;
    use crate::snapshot::load_aggregate_snapshot;
    use crate::storage::StoreLayout;

    struct Harness {
        _tmp: TempDir,
        layout: StoreLayout,
        ctx: Arc<ActorContext<CampaignState, CampaignView>>,
        projections: Arc<ProjectionStore<CampaignView>>,
    }

    fn harness(inline_apply: bool, idle_timeout: Duration) -> Harness {
        let tmp = TempDir::new().unwrap();
        let layout = StoreLayout::new(tmp.path());
        let journal = Arc::new(Journal::new(layout.clone(), Arc::new(KeyRing::new("k1", b"root"))).with_fsync(false));
        let reg = Arc::new(registry());
        let outbox = Arc::new(Outbox::open(layout.clone(), OutboxConfig::default()).unwrap());
        let projections = Arc::new(ProjectionStore::new(layout.clone()));
        let worker = OutboxWorker::new(
            Arc::clone(&journal),
            Arc::clone(&outbox),
            Arc::clone(&projections),
            Arc::new(applier(&reg)),
            Arc::new(CheckpointStore::new(layout.clone())),
        );
        let ctx = Arc::new(ActorContext {
            loader: AggregateLoader::new(Arc::clone(&journal), Arc::clone(&reg), 64),
            registry: reg,
            journal,
            outbox,
            worker,
            snapshot_interval: 3,
            inline_apply,
            idle_timeout,
        });
        Harness {
            _tmp: tmp,
            layout,
            ctx,
            projections,
        }
    }

    fn validated(h: &Harness, cmd: Command) -> Command {
        h.ctx.registry.validate_command(cmd).unwrap()
    }

    fn create(h: &Harness) -> Command {
        validated(
            h,
            Command::new("c-1", "character.create", json!({"character_id": "ch-1", "name": "Ash", "hp": 10})),
        )
    }

    fn damage(h: &Harness, amount: u32) -> Command {
        validated(
            h,
            Command::new("c-1", "character.damage", json!({"character_id": "ch-1", "amount": amount})),
        )
    }

    #[tokio::test]
    async fn execute_appends_and_applies_inline() {
        let h = harness(true, Duration::from_secs(60));
        let handle = spawn_actor("c-1", Arc::clone(&h.ctx)).unwrap();

        let outcome = handle.execute(create(&h)).await.unwrap();
        assert_eq!(outcome.events().len(), 1);
        let outcome = handle.execute(damage(&h, 3)).await.unwrap();
        assert_eq!(outcome.events()[0].seq, 2);

        let doc = h.projections.load("c-1").unwrap();
        assert_eq!(doc.last_seq, 2);
        assert_eq!(doc.state.characters["ch-1"].hp, 7);
        assert_eq!(h.ctx.outbox.stats(Utc::now()).depth(), 0);

        let state = h.ctx.loader.load("c-1").unwrap();
        assert_eq!(state.seq, 2);
        assert_eq!(state.state.characters["ch-1"].hp, 7);
    }

    #[tokio::test]
    async fn rejection_appends_nothing() {
        let h = harness(true, Duration::from_secs(60));
        let handle = spawn_actor("c-1", Arc::clone(&h.ctx)).unwrap();

        let outcome = handle.execute(damage(&h, 3)).await.unwrap();
        assert!(matches!(outcome, Outcome::Rejected(ref r) if r[0].code == "CHARACTER_NOT_FOUND"));
        assert_eq!(h.ctx.journal.head("c-1").unwrap().last_seq, 0);
    }

    #[tokio::test]
    async fn without_inline_apply_items_stay_queued() {
        let h = harness(false, Duration::from_secs(60));
        let handle = spawn_actor("c-1", Arc::clone(&h.ctx)).unwrap();
        handle.execute(create(&h)).await.unwrap();

        assert_eq!(h.projections.load("c-1").unwrap().last_seq, 0);
        assert_eq!(h.ctx.outbox.stats(Utc::now()).pending, 1);
    }

    #[tokio::test]
    async fn snapshot_written_when_crossing_interval() {
        let h = harness(true, Duration::from_secs(60));
        let handle = spawn_actor("c-1", Arc::clone(&h.ctx)).unwrap();
        handle.execute(create(&h)).await.unwrap();
        handle.execute(damage(&h, 1)).await.unwrap();
        assert!(load_aggregate_snapshot::<CampaignState>(&h.layout, "c-1").unwrap().is_none());

        handle.execute(damage(&h, 1)).await.unwrap();
        let snap = load_aggregate_snapshot::<CampaignState>(&h.layout, "c-1").unwrap().unwrap();
        assert_eq!(snap.seq, 3);
        assert_eq!(snap.state.characters["ch-1"].hp, 8);
    }

    #[tokio::test]
    async fn lethal_damage_emits_two_events_in_one_append() {
        let h = harness(true, Duration::from_secs(60));
        let handle = spawn_actor("c-1", Arc::clone(&h.ctx)).unwrap();
        handle.execute(create(&h)).await.unwrap();

        let outcome = handle.execute(damage(&h, 10)).await.unwrap();
        let types: Vec<_> = outcome.events().iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, ["character.damaged", "character.downed"]);
        assert!(h.projections.load("c-1").unwrap().state.characters["ch-1"].downed);
    }

    #[tokio::test]
    async fn idle_actor_exits_and_state_survives_respawn() {
        let h = harness(true, Duration::from_millis(100));
        let handle = spawn_actor("c-1", Arc::clone(&h.ctx)).unwrap();
        handle.execute(create(&h)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_alive());
        assert!(matches!(handle.execute(damage(&h, 1)).await, Err(ExecuteError::ActorGone)));

        let respawned = spawn_actor("c-1", Arc::clone(&h.ctx)).unwrap();
        respawned.execute(damage(&h, 4)).await.unwrap();
        let state = h.ctx.loader.load("c-1").unwrap();
        assert_eq!(state.state.characters["ch-1"].hp, 6);
        respawned.shutdown().await;
    }
}
