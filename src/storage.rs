//! On-disk directory layout and file helpers shared by every store.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Manages the on-disk directory layout for campaign data.
///
/// ```text
/// <base_dir>/
///     campaigns/
///         <campaign_id>/
///             events.jsonl        -- append-only journal, one line per append
///             snapshot.json       -- aggregate snapshot
///     outbox/
///         <campaign_id>.json      -- pending projection work
///     checkpoints/
///         <consumer>/
///             <campaign_id>.json
///     projections/
///         <projection_name>/
///             <campaign_id>/
///                 state.json
///                 snapshots/<seq>.json
/// ```
///
/// `StoreLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    base_dir: PathBuf,
}

impl StoreLayout {
    /// Create a layout rooted at `base_dir`. Nothing is created on disk yet.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/campaigns`
    pub fn campaigns_dir(&self) -> PathBuf {
        self.base_dir.join("campaigns")
    }

    /// `<base_dir>/campaigns/<campaign_id>`
    pub fn campaign_dir(&self, campaign_id: &str) -> PathBuf {
        self.campaigns_dir().join(campaign_id)
    }

    /// `<base_dir>/campaigns/<campaign_id>/events.jsonl`
    pub fn journal_path(&self, campaign_id: &str) -> PathBuf {
        self.campaign_dir(campaign_id).join("events.jsonl")
    }

    /// `<base_dir>/campaigns/<campaign_id>/snapshot.json`
    pub fn aggregate_snapshot_path(&self, campaign_id: &str) -> PathBuf {
        self.campaign_dir(campaign_id).join("snapshot.json")
    }

    /// `<base_dir>/outbox`
    pub fn outbox_dir(&self) -> PathBuf {
        self.base_dir.join("outbox")
    }

    /// `<base_dir>/outbox/<campaign_id>.json`
    pub fn outbox_path(&self, campaign_id: &str) -> PathBuf {
        self.outbox_dir().join(format!("{campaign_id}.json"))
    }

    /// `<base_dir>/checkpoints/<consumer>/<campaign_id>.json`
    pub fn checkpoint_path(&self, consumer: &str, campaign_id: &str) -> PathBuf {
        self.base_dir
            .join("checkpoints")
            .join(consumer)
            .join(format!("{campaign_id}.json"))
    }

    /// `<base_dir>/projections/<name>/<campaign_id>`
    pub fn projection_dir(&self, name: &str, campaign_id: &str) -> PathBuf {
        self.base_dir.join("projections").join(name).join(campaign_id)
    }

    /// `<base_dir>/projections/<name>/<campaign_id>/state.json`
    pub fn projection_state_path(&self, name: &str, campaign_id: &str) -> PathBuf {
        self.projection_dir(name, campaign_id).join("state.json")
    }

    /// `<base_dir>/projections/<name>/<campaign_id>/snapshots`
    pub fn projection_snapshots_dir(&self, name: &str, campaign_id: &str) -> PathBuf {
        self.projection_dir(name, campaign_id).join("snapshots")
    }

    /// Lists every campaign that has a journal file, sorted.
    ///
    /// Returns an empty vector if nothing has been written yet.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if reading the directory fails for a reason
    /// other than the directory not existing.
    pub fn list_campaigns(&self) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(self.campaigns_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let is_dir = entry.file_type().ok()?.is_dir();
                (is_dir && entry.path().join("events.jsonl").is_file())
                    .then(|| entry.file_name().to_string_lossy().into_owned())
            })
            .collect();

        ids.sort();
        Ok(ids)
    }
}

/// Checks that a campaign id can be used as a single path component.
///
/// Allowed: ASCII letters, digits, `-`, `_` and `.`, excluding `.` and `..`.
pub(crate) fn check_campaign_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("campaign_id is required".to_owned());
    }
    if id == "." || id == ".." {
        return Err(format!("campaign_id {id:?} is reserved"));
    }
    if id.len() > 128 {
        return Err("campaign_id is longer than 128 bytes".to_owned());
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(format!("campaign_id {id:?} contains unsupported characters"));
    }
    Ok(())
}

/// Write `bytes` to `path` atomically.
///
/// Writes a sibling `*.tmp` file, flushes it to disk, renames it over the
/// target so readers never see a partial file, then fsyncs the directory so
/// the rename itself survives a crash.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => sync_dir(dir),
        _ => Ok(()),
    }
}

/// Serialize `value` as pretty JSON and write it atomically.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(path, &json)
}

/// Read a JSON document, returning `Ok(None)` if the file does not exist.
///
/// # Errors
///
/// Decode failures surface as `io::ErrorKind::InvalidData`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {e}", path.display())))
}

/// Read a cached JSON document, treating a corrupt file as absent.
///
/// Used for snapshots and checkpoints, which can always be rebuilt.
pub(crate) fn read_json_lenient<T: DeserializeOwned>(path: &Path, what: &str) -> io::Result<Option<T>> {
    match read_json(path) {
        Ok(value) => Ok(value),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to deserialize {what}; treating as cache miss"
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Remove a file, ignoring a missing one.
pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// fsync a directory so a preceding create or rename is durable.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
