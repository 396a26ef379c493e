//! Snapshot persistence for aggregate and projection state.
//!
//! Snapshots are caches. A missing, corrupt, or version-mismatched
//! snapshot is a miss and the caller replays from the journal instead.
//! Writes are atomic via temp-file rename.
//!
//! Aggregate snapshots hold one file per campaign. Projection snapshots
//! are kept per seq, so a windowed replay can start from the newest
//! snapshot at or before its upper bound.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::aggregate::AggregateState;
use crate::projection::Projection;
use crate::storage::{StoreLayout, read_json_lenient, remove_if_exists, write_json_atomic};

/// Projection snapshots retained per campaign.
const PROJECTION_SNAPSHOTS_KEPT: usize = 3;

/// A point-in-time copy of state with the seq it reflects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub struct Snapshot<T> {
    pub state: T,
    /// Last event folded into `state`.
    pub seq: u64,
    /// Schema version of `state` when written.
    #[serde(default)]
    pub version: u32,
}

fn load_versioned<T: DeserializeOwned>(path: &Path, version: u32) -> io::Result<Option<Snapshot<T>>> {
    let Some(snapshot) = read_json_lenient::<Snapshot<T>>(path, "snapshot")? else {
        return Ok(None);
    };
    if snapshot.version != version {
        tracing::debug!(
            path = %path.display(),
            found = snapshot.version,
            expected = version,
            "snapshot version mismatch; treating as cache miss"
        );
        return Ok(None);
    }
    Ok(Some(snapshot))
}

/// Save the aggregate snapshot for a campaign, replacing any older one.
///
/// # Errors
///
/// Returns `io::Error` if serialization, writing, or renaming fails.
pub fn save_aggregate_snapshot<S: AggregateState>(
    layout: &StoreLayout,
    campaign_id: &str,
    state: &S,
    seq: u64,
) -> io::Result<()> {
    let snapshot = Snapshot {
        state,
        seq,
        version: S::SNAPSHOT_VERSION,
    };
    write_json_atomic(&layout.aggregate_snapshot_path(campaign_id), &snapshot)
}

/// Load the aggregate snapshot for a campaign.
///
/// Returns `Ok(None)` if the file is missing, corrupt, or was written for
/// a different [`AggregateState::SNAPSHOT_VERSION`].
pub fn load_aggregate_snapshot<S: AggregateState>(
    layout: &StoreLayout,
    campaign_id: &str,
) -> io::Result<Option<Snapshot<S>>> {
    load_versioned(&layout.aggregate_snapshot_path(campaign_id), S::SNAPSHOT_VERSION)
}

fn projection_snapshot_seqs(dir: &Path) -> io::Result<Vec<u64>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut seqs: Vec<u64> = entries
        .filter_map(|entry| {
            let name = entry.ok()?.file_name();
            name.to_str()?.strip_suffix(".json")?.parse().ok()
        })
        .collect();
    seqs.sort_unstable();
    Ok(seqs)
}

/// Save a projection snapshot at `seq`, pruning the oldest beyond the
/// retention limit.
pub fn save_projection_snapshot<P: Projection>(
    layout: &StoreLayout,
    campaign_id: &str,
    state: &P,
    seq: u64,
) -> io::Result<()> {
    let dir = layout.projection_snapshots_dir(P::NAME, campaign_id);
    let snapshot = Snapshot {
        state,
        seq,
        version: P::VERSION,
    };
    write_json_atomic(&dir.join(format!("{seq:020}.json")), &snapshot)?;

    let seqs = projection_snapshot_seqs(&dir)?;
    if seqs.len() > PROJECTION_SNAPSHOTS_KEPT {
        for old in &seqs[..seqs.len() - PROJECTION_SNAPSHOTS_KEPT] {
            remove_if_exists(&dir.join(format!("{old:020}.json")))?;
        }
    }
    Ok(())
}

/// Load the newest usable projection snapshot with `seq <= at_or_before`.
///
/// Corrupt or version-mismatched snapshots are skipped in favour of older
/// ones.
pub fn load_projection_snapshot<P: Projection>(
    layout: &StoreLayout,
    campaign_id: &str,
    at_or_before: u64,
) -> io::Result<Option<Snapshot<P>>> {
    let dir = layout.projection_snapshots_dir(P::NAME, campaign_id);
    for seq in projection_snapshot_seqs(&dir)?.into_iter().rev() {
        if seq > at_or_before {
            continue;
        }
        if let Some(snapshot) = load_versioned::<P>(&dir.join(format!("{seq:020}.json")), P::VERSION)? {
            return Ok(Some(snapshot));
        }
    }
    Ok(None)
}

/// Remove every projection snapshot for a campaign.
pub fn delete_projection_snapshots<P: Projection>(layout: &StoreLayout, campaign_id: &str) -> io::Result<()> {
    match fs::remove_dir_all(layout.projection_snapshots_dir(P::NAME, campaign_id)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
