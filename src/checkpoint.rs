//! Per-consumer, per-campaign progress markers.
//!
//! A checkpoint records the highest seq a consumer has durably processed
//! for one campaign. Checkpoints are derived data: a missing or corrupt
//! one means "start from the beginning", which is always safe because
//! projection application is idempotent.

use std::io;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{StoreLayout, check_campaign_id, read_json_lenient, remove_if_exists, write_json_atomic};

/// Consumer name used by the outbox worker.
pub const OUTBOX_CONSUMER: &str = "outbox";

/// Persisted progress of one consumer over one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub consumer: String,
    pub campaign_id: String,
    pub last_seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// File-backed checkpoint store.
#[derive(Debug)]
pub struct CheckpointStore {
    layout: StoreLayout,
    write_lock: Mutex<()>,
}

fn check_key(consumer: &str, campaign_id: &str) -> io::Result<()> {
    check_campaign_id(consumer)
        .and_then(|()| check_campaign_id(campaign_id))
        .map_err(|reason| io::Error::new(io::ErrorKind::InvalidInput, reason))
}

impl CheckpointStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self {
            layout,
            write_lock: Mutex::new(()),
        }
    }

    /// The full checkpoint record, if one exists.
    pub fn get(&self, consumer: &str, campaign_id: &str) -> io::Result<Option<Checkpoint>> {
        check_key(consumer, campaign_id)?;
        read_json_lenient(&self.layout.checkpoint_path(consumer, campaign_id), "checkpoint")
    }

    /// Last processed seq, or 0 when there is no usable checkpoint.
    pub fn load(&self, consumer: &str, campaign_id: &str) -> io::Result<u64> {
        Ok(self.get(consumer, campaign_id)?.map_or(0, |c| c.last_seq))
    }

    /// Move the checkpoint forward to `seq`.
    ///
    /// Never moves backwards: returns `Ok(false)` without writing when
    /// `seq` is not beyond the stored value.
    pub fn advance(&self, consumer: &str, campaign_id: &str, seq: u64) -> io::Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if seq <= self.load(consumer, campaign_id)? {
            return Ok(false);
        }
        let checkpoint = Checkpoint {
            consumer: consumer.to_owned(),
            campaign_id: campaign_id.to_owned(),
            last_seq: seq,
            updated_at: Utc::now(),
        };
        write_json_atomic(&self.layout.checkpoint_path(consumer, campaign_id), &checkpoint)?;
        Ok(true)
    }

    /// Forget a consumer's progress for a campaign.
    pub fn reset(&self, consumer: &str, campaign_id: &str) -> io::Result<()> {
        check_key(consumer, campaign_id)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        remove_if_exists(&self.layout.checkpoint_path(consumer, campaign_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_checkpoint_is_zero() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(StoreLayout::new(tmp.path()));
        assert_eq!(store.load("replay", "c-1").unwrap(), 0);
    }

    #[test]
    fn advance_is_monotonic() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(StoreLayout::new(tmp.path()));

        assert!(store.advance("replay", "c-1", 5).unwrap());
        assert!(!store.advance("replay", "c-1", 3).unwrap());
        assert!(!store.advance("replay", "c-1", 5).unwrap());
        assert_eq!(store.load("replay", "c-1").unwrap(), 5);
    }

    #[test]
    fn consumers_are_independent() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(StoreLayout::new(tmp.path()));
        store.advance("replay", "c-1", 5).unwrap();
        store.advance(OUTBOX_CONSUMER, "c-1", 2).unwrap();
        assert_eq!(store.load("replay", "c-1").unwrap(), 5);
        assert_eq!(store.load(OUTBOX_CONSUMER, "c-1").unwrap(), 2);
        assert_eq!(store.load("replay", "c-2").unwrap(), 0);
    }

    #[test]
    fn reset_then_restart() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(StoreLayout::new(tmp.path()));
        store.advance("replay", "c-1", 9).unwrap();
        store.reset("replay", "c-1").unwrap();
        assert_eq!(store.load("replay", "c-1").unwrap(), 0);
        assert!(store.advance("replay", "c-1", 1).unwrap());
    }

    #[test]
    fn corrupt_checkpoint_restarts_from_zero() {
        let tmp = TempDir::new().unwrap();
        let layout = StoreLayout::new(tmp.path());
        let path = layout.checkpoint_path("replay", "c-1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"garbage").unwrap();

        let store = CheckpointStore::new(layout);
        assert_eq!(store.load("replay", "c-1").unwrap(), 0);
    }

    #[test]
    fn unsafe_consumer_name_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(StoreLayout::new(tmp.path()));
        let err = store.advance("../evil", "c-1", 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
