//! Durable apply queue between the journal and the projection store.
//!
//! Every appended event gets an [`OutboxItem`] keyed by `(campaign_id, seq)`.
//! Items move through:
//!
//! ```text
//! pending -> processing -> (deleted)
//!               |
//!               +-> failed -> processing -> ...
//!               +-> dead   (attempts exhausted, or a fatal apply error)
//! ```
//!
//! Within a campaign only the lowest outstanding seq is claimable, and at
//! most one item per campaign is in flight, so the projection sees events
//! in journal order. A dead item blocks its campaign until an operator
//! requeues it.
//!
//! Each campaign's queue is one JSON document written atomically. The
//! document carries an `enqueued_through` watermark; [`Outbox::reconcile`]
//! compares it with the journal head to recover events appended just
//! before a crash.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::OutboxConfig;
use crate::error::OutboxError;
use crate::storage::{StoreLayout, read_json_lenient, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Failed,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Dead => "dead",
        }
    }
}

/// One unit of projection work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub campaign_id: String,
    pub seq: u64,
    pub status: OutboxStatus,
    /// Failed attempts since the item was enqueued or last requeued.
    pub attempt_count: u32,
    /// Failed attempts over the item's whole life, including before requeues.
    #[serde(default)]
    pub total_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Queue depth by status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboxStats {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
    pub dead: usize,
    /// Age of the oldest pending or failed item.
    pub oldest_pending_age: Option<Duration>,
}

impl OutboxStats {
    pub fn depth(&self) -> usize {
        self.pending + self.processing + self.failed + self.dead
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CampaignQueue {
    campaign_id: String,
    /// Highest seq ever enqueued for this campaign.
    enqueued_through: u64,
    items: BTreeMap<u64, OutboxItem>,
}

impl CampaignQueue {
    /// The head item, if the campaign is not busy or blocked and it is due.
    fn due_head(&self, now: DateTime<Utc>) -> Option<&OutboxItem> {
        let head = self.items.values().next()?;
        match head.status {
            OutboxStatus::Pending | OutboxStatus::Failed if head.next_attempt_at <= now => Some(head),
            _ => None,
        }
    }

    fn processing_item(&mut self, seq: u64) -> Result<&mut OutboxItem, OutboxError> {
        let campaign_id = self.campaign_id.clone();
        let item = self
            .items
            .get_mut(&seq)
            .ok_or(OutboxError::NotFound { campaign_id, seq })?;
        if item.status != OutboxStatus::Processing {
            return Err(invalid_state(item, "processing"));
        }
        Ok(item)
    }
}

fn invalid_state(item: &OutboxItem, expected: &'static str) -> OutboxError {
    OutboxError::InvalidState {
        campaign_id: item.campaign_id.clone(),
        seq: item.seq,
        status: item.status.as_str().to_owned(),
        expected,
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

/// Delay before retry number `attempt` (1-based), without jitter.
pub fn backoff_delay(config: &OutboxConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    config
        .base_delay
        .saturating_mul(1u32 << exp)
        .min(config.max_delay)
}

fn with_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return delay;
    }
    let factor = rand::rng().random_range(0.0..=jitter);
    delay + delay.mul_f64(factor)
}

/// File-backed durable apply queue.
pub struct Outbox {
    layout: StoreLayout,
    config: OutboxConfig,
    campaigns: RwLock<HashMap<String, Arc<Mutex<CampaignQueue>>>>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("base_dir", &self.layout.base_dir())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Outbox {
    /// Load every persisted campaign queue.
    ///
    /// A corrupt queue document is discarded with a warning; the next
    /// [`reconcile`](Outbox::reconcile) re-enqueues its events from the
    /// journal, and the projection store skips any already applied.
    pub fn open(layout: StoreLayout, config: OutboxConfig) -> Result<Self, OutboxError> {
        let mut campaigns = HashMap::new();
        let entries = match fs::read_dir(layout.outbox_dir()) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        for entry in entries.into_iter().flatten() {
            let path = entry?.path();
            let Some(campaign_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };
            let queue = read_json_lenient::<CampaignQueue>(&path, "outbox queue")?.unwrap_or_else(|| CampaignQueue {
                campaign_id: campaign_id.to_owned(),
                ..CampaignQueue::default()
            });
            campaigns.insert(campaign_id.to_owned(), Arc::new(Mutex::new(queue)));
        }

        Ok(Self {
            layout,
            config,
            campaigns: RwLock::new(campaigns),
        })
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    fn slot(&self, campaign_id: &str) -> Arc<Mutex<CampaignQueue>> {
        if let Some(slot) = self
            .campaigns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(campaign_id)
        {
            return Arc::clone(slot);
        }
        let mut campaigns = self.campaigns.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(campaigns.entry(campaign_id.to_owned()).or_insert_with(|| {
            Arc::new(Mutex::new(CampaignQueue {
                campaign_id: campaign_id.to_owned(),
                ..CampaignQueue::default()
            }))
        }))
    }

    fn slots(&self) -> Vec<Arc<Mutex<CampaignQueue>>> {
        let campaigns = self.campaigns.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<&String> = campaigns.keys().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| campaigns.get(id).cloned()).collect()
    }

    /// Apply `f` to a copy of the campaign queue, persist it, then publish it.
    fn mutate<R>(
        &self,
        campaign_id: &str,
        f: impl FnOnce(&mut CampaignQueue) -> Result<R, OutboxError>,
    ) -> Result<R, OutboxError> {
        let slot = self.slot(campaign_id);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        let out = f(&mut next)?;
        write_json_atomic(&self.layout.outbox_path(campaign_id), &next)?;
        *guard = next;
        Ok(out)
    }

    /// Enqueue pending items for newly appended seqs.
    ///
    /// Seqs at or below the campaign's `enqueued_through` watermark are
    /// ignored, so enqueueing the same events twice is harmless.
    pub fn enqueue(&self, campaign_id: &str, seqs: &[u64], now: DateTime<Utc>) -> Result<usize, OutboxError> {
        if seqs.is_empty() {
            return Ok(0);
        }
        let added = self.mutate(campaign_id, |queue| {
            let mut added = 0;
            for &seq in seqs {
                if seq <= queue.enqueued_through || queue.items.contains_key(&seq) {
                    continue;
                }
                queue.items.insert(
                    seq,
                    OutboxItem {
                        campaign_id: campaign_id.to_owned(),
                        seq,
                        status: OutboxStatus::Pending,
                        attempt_count: 0,
                        total_attempts: 0,
                        next_attempt_at: now,
                        lease_expires_at: None,
                        last_error: None,
                        enqueued_at: now,
                        updated_at: now,
                    },
                );
                added += 1;
            }
            if let Some(&max) = seqs.iter().max() {
                queue.enqueued_through = queue.enqueued_through.max(max);
            }
            Ok(added)
        })?;
        metrics::counter!("campaign_es_outbox_enqueued_total").increment(added as u64);
        Ok(added)
    }

    /// Highest seq ever enqueued for a campaign.
    pub fn enqueued_through(&self, campaign_id: &str) -> u64 {
        let slot = self.slot(campaign_id);
        let queue = slot.lock().unwrap_or_else(PoisonError::into_inner);
        queue.enqueued_through
    }

    /// Enqueue events the journal holds but the queue never saw.
    ///
    /// Covers seqs in `(max(enqueued_through, applied_through), head_seq]`,
    /// where `applied_through` is what the projection already reflects.
    pub fn reconcile(
        &self,
        campaign_id: &str,
        head_seq: u64,
        applied_through: u64,
        now: DateTime<Utc>,
    ) -> Result<usize, OutboxError> {
        let from = self.enqueued_through(campaign_id).max(applied_through);
        if head_seq <= from {
            return Ok(0);
        }
        let missing: Vec<u64> = (from + 1..=head_seq).collect();
        let added = self.enqueue(campaign_id, &missing, now)?;
        if added > 0 {
            tracing::warn!(
                campaign_id = %campaign_id,
                from_seq = from + 1,
                to_seq = head_seq,
                "reconciled events missing from the outbox"
            );
        }
        Ok(added)
    }

    fn claim(&self, queue: &mut CampaignQueue, seq: u64, now: DateTime<Utc>) -> Option<OutboxItem> {
        let item = queue.items.get_mut(&seq)?;
        item.status = OutboxStatus::Processing;
        item.lease_expires_at = Some(now + to_chrono(self.config.lease));
        item.updated_at = now;
        Some(item.clone())
    }

    /// Claim up to `limit` due items, ordered by `(next_attempt_at, seq)`.
    ///
    /// Only each campaign's head item is eligible, and never while another
    /// item of that campaign is processing.
    pub fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxItem>, OutboxError> {
        self.claim_due_where(now, limit, |_| true)
    }

    /// [`claim_due`](Outbox::claim_due) restricted to campaigns accepted
    /// by `eligible`. Items of other campaigns are left untouched.
    pub fn claim_due_where(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        eligible: impl Fn(&str) -> bool,
    ) -> Result<Vec<OutboxItem>, OutboxError> {
        let mut candidates: Vec<(DateTime<Utc>, u64, String)> = Vec::new();
        for slot in self.slots() {
            let queue = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if !eligible(&queue.campaign_id) {
                continue;
            }
            if let Some(head) = queue.due_head(now) {
                candidates.push((head.next_attempt_at, head.seq, head.campaign_id.clone()));
            }
        }
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, seq, campaign_id) in candidates.into_iter().take(limit) {
            let item = self.mutate(&campaign_id, |queue| {
                // Re-check under the lock: an inline claim may have won.
                if queue.due_head(now).map(|h| h.seq) != Some(seq) {
                    return Ok(None);
                }
                Ok(self.claim(queue, seq, now))
            })?;
            claimed.extend(item);
        }
        Ok(claimed)
    }

    /// Claim one specific item if it is its campaign's head and not busy.
    ///
    /// Used by the inline apply path right after append; ignores
    /// `next_attempt_at`.
    pub fn claim_item(&self, campaign_id: &str, seq: u64, now: DateTime<Utc>) -> Result<Option<OutboxItem>, OutboxError> {
        self.mutate(campaign_id, |queue| {
            let Some(head) = queue.items.values().next() else {
                return Ok(None);
            };
            let claimable = head.seq == seq && matches!(head.status, OutboxStatus::Pending | OutboxStatus::Failed);
            if !claimable {
                return Ok(None);
            }
            Ok(self.claim(queue, seq, now))
        })
    }

    /// Hand a processing item back without counting an attempt.
    pub fn release(&self, campaign_id: &str, seq: u64, now: DateTime<Utc>) -> Result<OutboxItem, OutboxError> {
        self.mutate(campaign_id, |queue| {
            let item = queue.processing_item(seq)?;
            item.status = if item.attempt_count > 0 {
                OutboxStatus::Failed
            } else {
                OutboxStatus::Pending
            };
            item.lease_expires_at = None;
            item.updated_at = now;
            Ok(item.clone())
        })
    }

    /// Finish a processing item: it is removed from the queue.
    pub fn complete(&self, campaign_id: &str, seq: u64) -> Result<(), OutboxError> {
        self.mutate(campaign_id, |queue| {
            queue.processing_item(seq)?;
            queue.items.remove(&seq);
            Ok(())
        })?;
        metrics::counter!("campaign_es_outbox_completed_total").increment(1);
        Ok(())
    }

    /// Record a failed attempt and schedule a retry, or move to `dead` once
    /// `max_attempts` is reached.
    pub fn fail(&self, campaign_id: &str, seq: u64, error: &str, now: DateTime<Utc>) -> Result<OutboxItem, OutboxError> {
        let item = self.mutate(campaign_id, |queue| {
            let item = queue.processing_item(seq)?;
            item.attempt_count += 1;
            item.total_attempts += 1;
            item.last_error = Some(error.to_owned());
            item.lease_expires_at = None;
            item.updated_at = now;
            if item.attempt_count >= self.config.max_attempts {
                item.status = OutboxStatus::Dead;
            } else {
                item.status = OutboxStatus::Failed;
                let delay = with_jitter(backoff_delay(&self.config, item.attempt_count), self.config.jitter);
                item.next_attempt_at = now + to_chrono(delay);
            }
            Ok(item.clone())
        })?;

        if item.status == OutboxStatus::Dead {
            metrics::counter!("campaign_es_outbox_dead_total").increment(1);
            tracing::error!(
                campaign_id = %campaign_id,
                seq,
                attempts = item.attempt_count,
                error = %error,
                "outbox item dead-lettered after exhausting retries"
            );
        } else {
            metrics::counter!("campaign_es_outbox_failed_total").increment(1);
            tracing::warn!(
                campaign_id = %campaign_id,
                seq,
                attempt = item.attempt_count,
                next_attempt_at = %item.next_attempt_at,
                error = %error,
                "outbox apply failed; will retry"
            );
        }
        Ok(item)
    }

    /// Move a processing item straight to `dead`. For errors retrying
    /// cannot fix.
    pub fn fail_fatal(&self, campaign_id: &str, seq: u64, error: &str, now: DateTime<Utc>) -> Result<OutboxItem, OutboxError> {
        let item = self.mutate(campaign_id, |queue| {
            let item = queue.processing_item(seq)?;
            item.attempt_count += 1;
            item.total_attempts += 1;
            item.status = OutboxStatus::Dead;
            item.last_error = Some(error.to_owned());
            item.lease_expires_at = None;
            item.updated_at = now;
            Ok(item.clone())
        })?;
        metrics::counter!("campaign_es_outbox_dead_total").increment(1);
        tracing::error!(
            campaign_id = %campaign_id,
            seq,
            error = %error,
            "outbox item dead-lettered: fatal apply error"
        );
        Ok(item)
    }

    /// Return processing items whose lease has expired to the retry path.
    ///
    /// An expired lease counts as a failed attempt.
    pub fn recover_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<OutboxItem>, OutboxError> {
        let mut expired = Vec::new();
        for slot in self.slots() {
            let queue = slot.lock().unwrap_or_else(PoisonError::into_inner);
            expired.extend(
                queue
                    .items
                    .values()
                    .filter(|i| i.status == OutboxStatus::Processing && i.lease_expires_at.is_some_and(|t| t <= now))
                    .map(|i| (i.campaign_id.clone(), i.seq)),
            );
        }

        let mut recovered = Vec::with_capacity(expired.len());
        for (campaign_id, seq) in expired {
            match self.fail(&campaign_id, seq, "lease expired", now) {
                Ok(item) => recovered.push(item),
                // Completed or failed by its worker in the meantime.
                Err(OutboxError::NotFound { .. } | OutboxError::InvalidState { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Items with `status`, or all items, ordered by `(campaign_id, seq)`.
    pub fn list(&self, status: Option<OutboxStatus>) -> Vec<OutboxItem> {
        let mut items = Vec::new();
        for slot in self.slots() {
            let queue = slot.lock().unwrap_or_else(PoisonError::into_inner);
            items.extend(
                queue
                    .items
                    .values()
                    .filter(|i| status.is_none_or(|s| i.status == s))
                    .cloned(),
            );
        }
        items
    }

    pub fn get(&self, campaign_id: &str, seq: u64) -> Option<OutboxItem> {
        let slot = self.slot(campaign_id);
        let queue = slot.lock().unwrap_or_else(PoisonError::into_inner);
        queue.items.get(&seq).cloned()
    }

    /// Queue depth per status and oldest pending age. Also published as
    /// gauges.
    pub fn stats(&self, now: DateTime<Utc>) -> OutboxStats {
        let mut stats = OutboxStats::default();
        let mut oldest: Option<DateTime<Utc>> = None;
        for item in self.list(None) {
            match item.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::Dead => stats.dead += 1,
            }
            if matches!(item.status, OutboxStatus::Pending | OutboxStatus::Failed) {
                oldest = Some(oldest.map_or(item.enqueued_at, |o| o.min(item.enqueued_at)));
            }
        }
        stats.oldest_pending_age = oldest.map(|t| (now - t).to_std().unwrap_or_default());

        metrics::gauge!("campaign_es_outbox_depth", "status" => "pending").set(stats.pending as f64);
        metrics::gauge!("campaign_es_outbox_depth", "status" => "processing").set(stats.processing as f64);
        metrics::gauge!("campaign_es_outbox_depth", "status" => "failed").set(stats.failed as f64);
        metrics::gauge!("campaign_es_outbox_depth", "status" => "dead").set(stats.dead as f64);
        metrics::gauge!("campaign_es_outbox_oldest_pending_seconds")
            .set(stats.oldest_pending_age.map_or(0.0, |d| d.as_secs_f64()));
        stats
    }

    /// Put a dead item back in the queue with a fresh retry budget.
    pub fn requeue_dead(&self, campaign_id: &str, seq: u64, now: DateTime<Utc>) -> Result<OutboxItem, OutboxError> {
        let item = self.mutate(campaign_id, |queue| {
            let item = queue.items.get_mut(&seq).ok_or_else(|| OutboxError::NotFound {
                campaign_id: campaign_id.to_owned(),
                seq,
            })?;
            if item.status != OutboxStatus::Dead {
                return Err(invalid_state(item, "dead"));
            }
            item.status = OutboxStatus::Pending;
            item.attempt_count = 0;
            item.next_attempt_at = now;
            item.updated_at = now;
            Ok(item.clone())
        })?;
        tracing::info!(
            campaign_id = %campaign_id,
            seq,
            total_attempts = item.total_attempts,
            "dead outbox item requeued"
        );
        Ok(item)
    }

    /// Requeue up to `limit` dead items, ordered by `(campaign_id, seq)`.
    pub fn requeue_dead_batch(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxItem>, OutboxError> {
        self.list(Some(OutboxStatus::Dead))
            .into_iter()
            .take(limit)
            .map(|item| self.requeue_dead(&item.campaign_id, item.seq, now))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> OutboxConfig {
        OutboxConfig {
            jitter: 0.0,
            ..OutboxConfig::default()
        }
    }

    fn outbox(tmp: &TempDir) -> Outbox {
        Outbox::open(StoreLayout::new(tmp.path()), config()).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = config();
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(&config, 30), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let delay = Duration::from_secs(10);
        for _ in 0..50 {
            let jittered = with_jitter(delay, 0.2);
            assert!(jittered >= delay && jittered <= Duration::from_secs(12));
        }
    }

    #[test]
    fn enqueue_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let outbox = outbox(&tmp);
        assert_eq!(outbox.enqueue("c-1", &[1, 2], t0()).unwrap(), 2);
        assert_eq!(outbox.enqueue("c-1", &[1, 2], t0()).unwrap(), 0);
        assert_eq!(outbox.enqueued_through("c-1"), 2);
        assert_eq!(outbox.list(Some(OutboxStatus::Pending)).len(), 2);
    }

    #[test]
    fn only_head_of_campaign_is_claimed() {
        let tmp = TempDir::new().unwrap();
        let outbox = outbox(&tmp);
        outbox.enqueue("c-1", &[1, 2, 3], t0()).unwrap();
        outbox.enqueue("c-2", &[1], t0()).unwrap();

        let claimed = outbox.claim_due(t0(), 10).unwrap();
        let keys: Vec<_> = claimed.iter().map(|i| (i.campaign_id.as_str(), i.seq)).collect();
        assert_eq!(keys, [("c-1", 1), ("c-2", 1)]);

        // c-1 is busy until its head completes.
        assert!(outbox.claim_due(t0(), 10).unwrap().is_empty());
        outbox.complete("c-1", 1).unwrap();
        let next = outbox.claim_due(t0(), 10).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].seq, 2);
    }

    #[test]
    fn claim_respects_limit_and_due_time() {
        let tmp = TempDir::new().unwrap();
        let outbox = outbox(&tmp);
        outbox.enqueue("a", &[1], t0()).unwrap();
        outbox.enqueue("b", &[1], t0()).unwrap();
        outbox.enqueue("c", &[1], t0() + chrono::Duration::seconds(60)).unwrap();

        assert_eq!(outbox.claim_due(t0(), 1).unwrap().len(), 1);
        assert_eq!(outbox.claim_due(t0(), 10).unwrap().len(), 1);
        assert!(outbox.claim_due(t0(), 10).unwrap().is_empty());
    }

    #[test]
    fn filtered_claim_skips_campaigns_and_release_restores_status() {
        let tmp = TempDir::new().unwrap();
        let outbox = outbox(&tmp);
        outbox.enqueue("held", &[1], t0()).unwrap();
        outbox.enqueue("open", &[1], t0()).unwrap();

        let claimed = outbox.claim_due_where(t0(), 10, |id| id != "held").unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].campaign_id, "open");
        assert_eq!(outbox.get("held", 1).unwrap().status, OutboxStatus::Pending);

        let released = outbox.release("open", 1, t0()).unwrap();
        assert_eq!(released.status, OutboxStatus::Pending);
        assert_eq!(released.attempt_count, 0);
        assert!(released.lease_expires_at.is_none());

        outbox.claim_item("open", 1, t0()).unwrap().unwrap();
        outbox.fail("open", 1, "boom", t0()).unwrap();
        let later = t0() + chrono::Duration::seconds(3600);
        outbox.claim_item("open", 1, later).unwrap().unwrap();
        let released = outbox.release("open", 1, later).unwrap();
        assert_eq!(released.status, OutboxStatus::Failed);
        assert_eq!(released.attempt_count, 1);
        assert!(outbox.release("open", 1, later).is_err());
    }

    #[test]
    fn failure_schedules_retry_with_backoff() {
        let tmp = TempDir::new().unwrap();
        let outbox = outbox(&tmp);
        outbox.enqueue("c-1", &[1], t0()).unwrap();
        outbox.claim_due(t0(), 1).unwrap();

        let item = outbox.fail("c-1", 1, "disk full", t0()).unwrap();
        assert_eq!(item.status, OutboxStatus::Failed);
        assert_eq!(item.attempt_count, 1);
        assert_eq!(item.next_attempt_at, t0() + chrono::Duration::seconds(1));
        assert_eq!(item.last_error.as_deref(), Some("disk full"));

        assert!(outbox.claim_due(t0(), 1).unwrap().is_empty());
        assert_eq!(outbox.claim_due(t0() + chrono::Duration::seconds(1), 1).unwrap().len(), 1);
    }

    #[test]
    fn exhausted_attempts_go_dead_and_requeue_resets() {
        let tmp = TempDir::new().unwrap();
        let outbox = outbox(&tmp);
        outbox.enqueue("c-1", &[1], t0()).unwrap();

        let far = t0() + chrono::Duration::days(1);
        let mut last = None;
        for _ in 0..8 {
            assert_eq!(outbox.claim_due(far, 1).unwrap().len(), 1);
            last = Some(outbox.fail("c-1", 1, "boom", far).unwrap());
        }
        let dead = last.unwrap();
        assert_eq!(dead.status, OutboxStatus::Dead);
        assert_eq!(dead.attempt_count, 8);
        assert!(outbox.claim_due(far, 1).unwrap().is_empty());

        let requeued = outbox.requeue_dead("c-1", 1, far).unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.attempt_count, 0);
        assert_eq!(requeued.total_attempts, 8);

        outbox.claim_due(far, 1).unwrap();
        outbox.complete("c-1", 1).unwrap();
        assert!(outbox.get("c-1", 1).is_none());
    }

    #[test]
    fn dead_head_blocks_campaign() {
        let tmp = TempDir::new().unwrap();
        let outbox = outbox(&tmp);
        outbox.enqueue("c-1", &[1, 2], t0()).unwrap();
        outbox.claim_due(t0(), 1).unwrap();
        outbox.fail_fatal("c-1", 1, "unroutable", t0()).unwrap();

        assert!(outbox.claim_due(t0(), 10).unwrap().is_empty());
        assert_eq!(outbox.stats(t0()).dead, 1);
        assert_eq!(outbox.stats(t0()).pending, 1);
    }

    #[test]
    fn expired_lease_counts_as_attempt() {
        let tmp = TempDir::new().unwrap();
        let outbox = outbox(&tmp);
        outbox.enqueue("c-1", &[1], t0()).unwrap();
        outbox.claim_due(t0(), 1).unwrap();

        assert!(outbox.recover_expired_leases(t0()).unwrap().is_empty());
        let later = t0() + chrono::Duration::seconds(31);
        let recovered = outbox.recover_expired_leases(later).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, OutboxStatus::Failed);
        assert_eq!(recovered[0].last_error.as_deref(), Some("lease expired"));
    }

    #[test]
    fn complete_requires_processing() {
        let tmp = TempDir::new().unwrap();
        let outbox = outbox(&tmp);
        outbox.enqueue("c-1", &[1], t0()).unwrap();
        assert!(matches!(
            outbox.complete("c-1", 1),
            Err(OutboxError::InvalidState { expected: "processing", .. })
        ));
        assert!(matches!(outbox.complete("c-1", 9), Err(OutboxError::NotFound { .. })));
    }

    #[test]
    fn claim_item_only_claims_head() {
        let tmp = TempDir::new().unwrap();
        let outbox = outbox(&tmp);
        outbox.enqueue("c-1", &[1, 2], t0()).unwrap();
        assert!(outbox.claim_item("c-1", 2, t0()).unwrap().is_none());
        assert!(outbox.claim_item("c-1", 1, t0()).unwrap().is_some());
        assert!(outbox.claim_item("c-1", 1, t0()).unwrap().is_none());
    }

    #[test]
    fn reconcile_fills_gap_above_watermark() {
        let tmp = TempDir::new().unwrap();
        let outbox = outbox(&tmp);
        outbox.enqueue("c-1", &[1], t0()).unwrap();
        assert_eq!(outbox.reconcile("c-1", 3, 0, t0()).unwrap(), 2);
        assert_eq!(outbox.enqueued_through("c-1"), 3);
        // Projection already has everything up to 5.
        assert_eq!(outbox.reconcile("c-2", 5, 5, t0()).unwrap(), 0);
    }

    #[test]
    fn state_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let outbox = outbox(&tmp);
            outbox.enqueue("c-1", &[1, 2], t0()).unwrap();
            outbox.claim_due(t0(), 1).unwrap();
            outbox.fail("c-1", 1, "boom", t0()).unwrap();
        }
        let reopened = outbox(&tmp);
        let item = reopened.get("c-1", 1).unwrap();
        assert_eq!(item.status, OutboxStatus::Failed);
        assert_eq!(reopened.enqueued_through("c-1"), 2);
    }

    #[test]
    fn requeue_batch_and_stats() {
        let tmp = TempDir::new().unwrap();
        let outbox = outbox(&tmp);
        for campaign in ["a", "b"] {
            outbox.enqueue(campaign, &[1], t0()).unwrap();
        }
        for item in outbox.claim_due(t0(), 10).unwrap() {
            outbox.fail_fatal(&item.campaign_id, item.seq, "fatal", t0()).unwrap();
        }
        assert_eq!(outbox.stats(t0()).dead, 2);

        let requeued = outbox.requeue_dead_batch(1, t0()).unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].campaign_id, "a");

        let stats = outbox.stats(t0() + chrono::Duration::seconds(5));
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.oldest_pending_age, Some(Duration::from_secs(5)));
        assert_eq!(stats.depth(), 2);
    }
}
