//! File-backed, append-only event journal with a per-campaign hash chain.
//!
//! Each campaign has one `events.jsonl` file. Every call to
//! [`Journal::append`] writes exactly one line holding a JSON array of the
//! events it sequenced, followed by `\n`, in a single write that is then
//! fsynced. A line without its trailing newline is a torn write: readers
//! ignore it and it is truncated when the campaign's log is first loaded,
//! so a multi-event append is either fully present or absent.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::JournalError;
use crate::event::{PendingEvent, StoredEvent};
use crate::integrity::{ChainVerifier, GENESIS_HASH, IntegrityReport, KeyRing, seal};
use crate::storage::{StoreLayout, check_campaign_id, sync_dir};

/// Position of the last committed event in a campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalHead {
    pub last_seq: u64,
    /// `chain_hash` of the last event, or the genesis hash when empty.
    pub chain_hash: String,
}

impl JournalHead {
    fn empty() -> Self {
        Self {
            last_seq: 0,
            chain_hash: GENESIS_HASH.to_owned(),
        }
    }
}

/// Byte range of one committed line and the seqs it holds.
#[derive(Debug, Clone, Copy)]
struct LineSpan {
    first_seq: u64,
    last_seq: u64,
    offset: u64,
    /// Including the trailing newline.
    len: u64,
}

#[derive(Debug)]
struct CampaignLog {
    head: JournalHead,
    committed_len: u64,
    lines: Vec<LineSpan>,
}

/// Per-campaign append-only event logs rooted at a [`StoreLayout`].
///
/// `Journal` is `Send + Sync`; appends to one campaign are serialized by a
/// per-campaign lock, appends to different campaigns proceed in parallel.
/// Reads seek straight to the lines they need through an in-memory line
/// index built on first access.
pub struct Journal {
    layout: StoreLayout,
    keys: Arc<KeyRing>,
    fsync: bool,
    logs: Mutex<HashMap<String, Arc<Mutex<Option<CampaignLog>>>>>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("base_dir", &self.layout.base_dir())
            .field("fsync", &self.fsync)
            .finish_non_exhaustive()
    }
}

impl Journal {
    pub fn new(layout: StoreLayout, keys: Arc<KeyRing>) -> Self {
        Self {
            layout,
            keys,
            fsync: true,
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Skip fsync after each append. Only for tests and throwaway stores.
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    /// All campaigns with a journal, sorted.
    pub fn list_campaigns(&self) -> Result<Vec<String>, JournalError> {
        Ok(self.layout.list_campaigns()?)
    }

    fn log_slot(&self, campaign_id: &str) -> Arc<Mutex<Option<CampaignLog>>> {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        logs.entry(campaign_id.to_owned()).or_default().clone()
    }

    /// Append validated events atomically.
    ///
    /// Assigns contiguous `seq` values after the current head, seals each
    /// event into the hash chain, and commits them as one journal line.
    /// An empty `events` vector is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] on I/O failure or if signing fails. On error
    /// nothing is committed.
    pub fn append(&self, campaign_id: &str, events: Vec<PendingEvent>) -> Result<Vec<StoredEvent>, JournalError> {
        check_campaign_id(campaign_id).map_err(|_| JournalError::InvalidCampaignId(campaign_id.to_owned()))?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let slot = self.log_slot(campaign_id);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let log = match guard.take() {
            Some(log) => log,
            None => self.recover(campaign_id)?,
        };
        let log = guard.insert(log);

        let mut prev = log.head.chain_hash.clone();
        let mut stored = Vec::with_capacity(events.len());
        for (i, pending) in events.into_iter().enumerate() {
            let mut event = pending.into_stored(campaign_id, log.head.last_seq + 1 + i as u64);
            seal(&mut event, &prev, &self.keys)?;
            prev.clone_from(&event.chain_hash);
            stored.push(event);
        }

        let mut line = serde_json::to_vec(&stored)?;
        line.push(b'\n');

        let path = self.layout.journal_path(campaign_id);
        let created = !path.exists();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.write_all(&line).and_then(|()| {
            if self.fsync {
                file.sync_data()?;
            }
            Ok(())
        });
        if let Err(e) = written {
            // Drop whatever part of the line reached the file.
            let _ = file.set_len(log.committed_len);
            *guard = None;
            return Err(e.into());
        }
        if created && self.fsync
            && let Some(dir) = path.parent()
        {
            sync_dir(dir)?;
        }

        let (first_seq, last_seq) = (stored[0].seq, stored[stored.len() - 1].seq);
        log.lines.push(LineSpan {
            first_seq,
            last_seq,
            offset: log.committed_len,
            len: line.len() as u64,
        });
        log.committed_len += line.len() as u64;
        log.head = JournalHead {
            last_seq,
            chain_hash: prev,
        };

        metrics::counter!("campaign_es_events_appended_total").increment(stored.len() as u64);
        tracing::info!(
            campaign_id = %campaign_id,
            first_seq,
            count = stored.len(),
            "events appended"
        );
        Ok(stored)
    }

    /// Load the committed head and line index, truncating a torn tail if
    /// one is present.
    fn recover(&self, campaign_id: &str) -> Result<CampaignLog, JournalError> {
        let path = self.layout.journal_path(campaign_id);
        let (bytes, committed) = read_committed(&path)?;

        if committed < bytes.len() {
            tracing::warn!(
                campaign_id = %campaign_id,
                torn_bytes = bytes.len() - committed,
                "truncating torn journal tail"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(committed as u64)?;
            file.sync_all()?;
        }

        let mut head = JournalHead::empty();
        let mut lines = Vec::new();
        for (line_no, offset, line) in committed_lines(&bytes[..committed]) {
            let events = decode_line(campaign_id, line_no, line)?;
            let first_seq = head.last_seq + 1;
            for event in events {
                if event.seq != head.last_seq + 1 {
                    return Err(JournalError::SequenceGap {
                        campaign_id: campaign_id.to_owned(),
                        expected: head.last_seq + 1,
                        found: event.seq,
                    });
                }
                head = JournalHead {
                    last_seq: event.seq,
                    chain_hash: event.chain_hash,
                };
            }
            lines.push(LineSpan {
                first_seq,
                last_seq: head.last_seq,
                offset,
                len: line.len() as u64 + 1,
            });
        }

        Ok(CampaignLog {
            head,
            committed_len: committed as u64,
            lines,
        })
    }

    /// The last committed seq and chain hash of a campaign.
    pub fn head(&self, campaign_id: &str) -> Result<JournalHead, JournalError> {
        check_campaign_id(campaign_id).map_err(|_| JournalError::InvalidCampaignId(campaign_id.to_owned()))?;
        let slot = self.log_slot(campaign_id);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let log = match guard.take() {
            Some(log) => log,
            None => self.recover(campaign_id)?,
        };
        Ok(guard.insert(log).head.clone())
    }

    /// Events with `seq > after_seq`, ascending, at most `limit` of them.
    ///
    /// Never returns a gap: a missing seq is reported as
    /// [`JournalError::SequenceGap`]. A torn trailing line is ignored.
    pub fn list_events(&self, campaign_id: &str, after_seq: u64, limit: usize) -> Result<Vec<StoredEvent>, JournalError> {
        check_campaign_id(campaign_id).map_err(|_| JournalError::InvalidCampaignId(campaign_id.to_owned()))?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let slot = self.log_slot(campaign_id);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let log = match guard.take() {
            Some(log) => log,
            None => self.recover(campaign_id)?,
        };
        let log = guard.insert(log);
        if let Some(events) = self.read_indexed(campaign_id, log, after_seq, limit)? {
            return Ok(events);
        }

        // The file changed under the index; rebuild it on next access.
        *guard = None;
        drop(guard);
        tracing::warn!(campaign_id = %campaign_id, "journal changed outside the store; rescanning");
        self.scan_events(campaign_id, after_seq, limit)
    }

    /// Read the lines covering `(after_seq, ..]` through the index.
    ///
    /// `None` when the file no longer matches the index.
    fn read_indexed(
        &self,
        campaign_id: &str,
        log: &CampaignLog,
        after_seq: u64,
        limit: usize,
    ) -> Result<Option<Vec<StoredEvent>>, JournalError> {
        let path = self.layout.journal_path(campaign_id);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok((log.committed_len == 0).then(Vec::new));
            }
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata()?.len();
        if file_len < log.committed_len {
            return Ok(None);
        }
        if file_len > log.committed_len {
            // A partial line is a torn tail; a complete one was not ours.
            let mut tail = Vec::new();
            file.seek(SeekFrom::Start(log.committed_len))?;
            file.read_to_end(&mut tail)?;
            if tail.contains(&b'\n') {
                return Ok(None);
            }
        }

        let start = log.lines.partition_point(|span| span.last_seq <= after_seq);
        let mut out = Vec::new();
        let mut buf = Vec::new();
        for span in &log.lines[start..] {
            if out.len() >= limit {
                break;
            }
            file.seek(SeekFrom::Start(span.offset))?;
            buf.resize(span.len as usize, 0);
            file.read_exact(&mut buf)?;
            let Some((&b'\n', line)) = buf.split_last() else {
                return Ok(None);
            };
            let Ok(events) = serde_json::from_slice::<Vec<StoredEvent>>(line) else {
                return Ok(None);
            };
            let in_place = events.len() as u64 == span.last_seq - span.first_seq + 1
                && events.iter().zip(span.first_seq..).all(|(e, seq)| e.seq == seq);
            if !in_place {
                return Ok(None);
            }
            out.extend(events.into_iter().filter(|e| e.seq > after_seq).take(limit - out.len()));
        }
        Ok(Some(out))
    }

    /// Decode the whole file from seq 1, checking contiguity.
    fn scan_events(&self, campaign_id: &str, after_seq: u64, limit: usize) -> Result<Vec<StoredEvent>, JournalError> {
        let path = self.layout.journal_path(campaign_id);
        let (bytes, committed) = read_committed(&path)?;

        let mut out = Vec::new();
        let mut expected = 1;
        for (line_no, _, line) in committed_lines(&bytes[..committed]) {
            for event in decode_line(campaign_id, line_no, line)? {
                if event.seq != expected {
                    return Err(JournalError::SequenceGap {
                        campaign_id: campaign_id.to_owned(),
                        expected,
                        found: event.seq,
                    });
                }
                expected += 1;
                if event.seq <= after_seq {
                    continue;
                }
                if out.len() >= limit {
                    return Ok(out);
                }
                out.push(event);
            }
        }
        Ok(out)
    }

    /// Every event of a campaign, ascending.
    pub fn read_all(&self, campaign_id: &str) -> Result<Vec<StoredEvent>, JournalError> {
        self.list_events(campaign_id, 0, usize::MAX)
    }

    /// Recompute the chain and re-check every signature from seq 1.
    ///
    /// Always reads the file itself, never the index. Tampering is reported
    /// as [`IntegrityReport::Corrupted`] at the first event that fails to
    /// decode or verify, not as an error; `Err` means the journal could not
    /// be read at all.
    pub fn verify_integrity(&self, campaign_id: &str) -> Result<IntegrityReport, JournalError> {
        check_campaign_id(campaign_id).map_err(|_| JournalError::InvalidCampaignId(campaign_id.to_owned()))?;
        let path = self.layout.journal_path(campaign_id);
        let (bytes, committed) = read_committed(&path)?;

        let mut verifier = ChainVerifier::new(campaign_id, &self.keys);
        for (line_no, _, line) in committed_lines(&bytes[..committed]) {
            let records: Vec<serde_json::Value> = match serde_json::from_slice::<Vec<serde_json::Value>>(line) {
                Ok(records) if !records.is_empty() => records,
                Ok(_) => {
                    let reason = format!("line {line_no}: empty append record");
                    return Ok(corrupted(campaign_id, verifier.expected_seq(), reason));
                }
                Err(e) => {
                    let reason = format!("line {line_no}: {e}");
                    return Ok(corrupted(campaign_id, verifier.expected_seq(), reason));
                }
            };
            // Decode one record at a time so a bad record is reported at
            // its own seq, not at the first seq of its line.
            for record in records {
                let event: StoredEvent = match serde_json::from_value(record) {
                    Ok(event) => event,
                    Err(e) => {
                        let reason = format!("line {line_no}: {e}");
                        return Ok(corrupted(campaign_id, verifier.expected_seq(), reason));
                    }
                };
                if let Err(c) = verifier.push(&event) {
                    return Ok(corrupted(campaign_id, c.at_seq, c.reason));
                }
            }
        }

        Ok(IntegrityReport::Ok {
            events: verifier.verified(),
        })
    }
}

fn corrupted(campaign_id: &str, at_seq: u64, reason: String) -> IntegrityReport {
    tracing::error!(
        campaign_id = %campaign_id,
        at_seq,
        reason = %reason,
        "journal integrity check failed"
    );
    IntegrityReport::Corrupted { at_seq, reason }
}

/// Read a journal file and find the end of its last complete line.
fn read_committed(path: &Path) -> io::Result<(Vec<u8>, usize)> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let committed = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    Ok((bytes, committed))
}

/// Non-empty lines of the committed region with their byte offsets,
/// numbered from 1.
fn committed_lines(bytes: &[u8]) -> impl Iterator<Item = (usize, u64, &[u8])> {
    let mut offset = 0u64;
    bytes
        .split(|b| *b == b'\n')
        .enumerate()
        .map(move |(i, line)| {
            let start = offset;
            offset += line.len() as u64 + 1;
            (i + 1, start, line)
        })
        .filter(|(_, _, line)| !line.is_empty())
}

fn decode_line(campaign_id: &str, line_no: usize, line: &[u8]) -> Result<Vec<StoredEvent>, JournalError> {
    let events: Vec<StoredEvent> = serde_json::from_slice(line).map_err(|e| JournalError::Corrupt {
        campaign_id: campaign_id.to_owned(),
        line: line_no,
        reason: e.to_string(),
    })?;
    if events.is_empty() {
        return Err(JournalError::Corrupt {
            campaign_id: campaign_id.to_owned(),
            line: line_no,
            reason: "empty append record".to_owned(),
        });
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{pending, pending_batch};
    use tempfile::TempDir;

    fn journal(dir: &TempDir) -> Journal {
        Journal::new(StoreLayout::new(dir.path()), Arc::new(KeyRing::new("k1", b"root")))
    }

    #[test]
    fn append_assigns_contiguous_seqs() {
        let tmp = TempDir::new().unwrap();
        let journal = journal(&tmp);

        let first = journal.append("c-1", pending_batch(2)).unwrap();
        let second = journal.append("c-1", vec![pending("n3")]).unwrap();

        assert_eq!(first.iter().map(|e| e.seq).collect::<Vec<_>>(), [1, 2]);
        assert_eq!(second[0].seq, 3);
        assert_eq!(second[0].prev_hash, first[1].chain_hash);
        assert_eq!(journal.head("c-1").unwrap().last_seq, 3);
    }

    #[test]
    fn empty_append_is_noop() {
        let tmp = TempDir::new().unwrap();
        let journal = journal(&tmp);
        assert!(journal.append("c-1", Vec::new()).unwrap().is_empty());
        assert!(!journal.layout().journal_path("c-1").exists());
    }

    #[test]
    fn campaigns_are_independent() {
        let tmp = TempDir::new().unwrap();
        let journal = journal(&tmp);
        journal.append("a", pending_batch(3)).unwrap();
        let b = journal.append("b", pending_batch(1)).unwrap();
        assert_eq!(b[0].seq, 1);
        assert_eq!(b[0].prev_hash, GENESIS_HASH);
        assert_eq!(journal.list_campaigns().unwrap(), ["a", "b"]);
    }

    #[test]
    fn list_events_pages_after_seq() {
        let tmp = TempDir::new().unwrap();
        let journal = journal(&tmp);
        journal.append("c-1", pending_batch(5)).unwrap();

        let page = journal.list_events("c-1", 2, 2).unwrap();
        assert_eq!(page.iter().map(|e| e.seq).collect::<Vec<_>>(), [3, 4]);
        assert!(journal.list_events("c-1", 5, 10).unwrap().is_empty());
        assert!(journal.list_events("missing", 0, 10).unwrap().is_empty());
    }

    #[test]
    fn torn_tail_ignored_by_readers_and_truncated_by_writer() {
        let tmp = TempDir::new().unwrap();
        let journal = journal(&tmp);
        journal.append("c-1", pending_batch(1)).unwrap();

        let path = journal.layout().journal_path("c-1");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"[{"campaign_id":"c-1","seq":2"#).unwrap();
        drop(file);

        assert_eq!(journal.read_all("c-1").unwrap().len(), 1);

        // A fresh journal recovers on first access.
        let reopened = Journal::new(StoreLayout::new(tmp.path()), Arc::new(KeyRing::new("k1", b"root")));
        let appended = reopened.append("c-1", vec![pending("after")]).unwrap();
        assert_eq!(appended[0].seq, 2);
        assert_eq!(reopened.read_all("c-1").unwrap().len(), 2);
        assert!(reopened.verify_integrity("c-1").unwrap().is_ok());
    }

    #[test]
    fn verify_detects_payload_tamper() {
        let tmp = TempDir::new().unwrap();
        let journal = journal(&tmp);
        for i in 1..=5 {
            journal.append("c-1", vec![pending(&format!("note-{i}"))]).unwrap();
        }
        assert_eq!(journal.verify_integrity("c-1").unwrap(), IntegrityReport::Ok { events: 5 });

        let path = journal.layout().journal_path("c-1");
        let contents = fs::read_to_string(&path).unwrap().replace("note-3", "note-X");
        fs::write(&path, contents).unwrap();

        assert_eq!(journal.verify_integrity("c-1").unwrap().corrupted_at(), Some(3));
    }

    #[test]
    fn verify_reports_unparseable_line() {
        let tmp = TempDir::new().unwrap();
        let journal = journal(&tmp);
        journal.append("c-1", pending_batch(2)).unwrap();
        let path = journal.layout().journal_path("c-1");
        let mut contents = fs::read(&path).unwrap();
        contents.extend_from_slice(b"garbage\n");
        fs::write(&path, contents).unwrap();

        assert_eq!(journal.verify_integrity("c-1").unwrap().corrupted_at(), Some(3));
        assert!(matches!(
            journal.read_all("c-1"),
            Err(JournalError::Corrupt { line: 2, .. })
        ));
    }

    #[test]
    fn verify_names_the_bad_event_inside_a_batch() {
        let tmp = TempDir::new().unwrap();
        let journal = journal(&tmp);
        journal.append("c-1", vec![pending("a")]).unwrap();
        journal.append("c-1", vec![pending("b"), pending("c")]).unwrap();

        let path = journal.layout().journal_path("c-1");
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("\"seq\":3").count(), 1);
        fs::write(&path, text.replacen("\"seq\":3", "\"seq\":\"3\"", 1)).unwrap();

        match journal.verify_integrity("c-1").unwrap() {
            IntegrityReport::Corrupted { at_seq, reason } => {
                assert_eq!(at_seq, 3);
                assert!(reason.contains("line 2"), "{reason}");
            }
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn list_events_reads_across_batch_lines() {
        let tmp = TempDir::new().unwrap();
        let journal = journal(&tmp);
        journal.append("c-1", pending_batch(2)).unwrap();
        journal.append("c-1", pending_batch(3)).unwrap();
        journal.append("c-1", vec![pending("last")]).unwrap();

        let seqs = |after: u64, limit: usize| -> Vec<u64> {
            journal.list_events("c-1", after, limit).unwrap().iter().map(|e| e.seq).collect()
        };
        assert_eq!(seqs(3, 2), [4, 5]);
        assert_eq!(seqs(4, 10), [5, 6]);
        assert_eq!(seqs(5, 1), [6]);
        assert_eq!(seqs(0, 3), [1, 2, 3]);
        assert!(seqs(0, 0).is_empty());

        // A fresh journal builds the same index from disk.
        let reopened = Journal::new(StoreLayout::new(tmp.path()), Arc::new(KeyRing::new("k1", b"root")));
        assert_eq!(
            reopened.list_events("c-1", 3, 2).unwrap().iter().map(|e| e.seq).collect::<Vec<_>>(),
            [4, 5]
        );
    }

    #[test]
    fn rewritten_file_is_rescanned() {
        let tmp = TempDir::new().unwrap();
        let journal = journal(&tmp);
        for i in 1..=3 {
            journal.append("c-1", vec![pending(&format!("note-{i}"))]).unwrap();
        }

        let path = journal.layout().journal_path("c-1");
        let text = fs::read_to_string(&path).unwrap();
        fs::write(&path, text.replacen("note-1", "a much longer first note", 1)).unwrap();

        let events = journal.list_events("c-1", 1, 10).unwrap();
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), [2, 3]);
        let first = journal.list_events("c-1", 0, 1).unwrap();
        assert_eq!(first[0].payload["text"], "a much longer first note");
        assert_eq!(journal.head("c-1").unwrap().last_seq, 3);
    }

    #[test]
    fn invalid_campaign_id_rejected() {
        let tmp = TempDir::new().unwrap();
        let journal = journal(&tmp);
        assert!(matches!(
            journal.append("../x", pending_batch(1)),
            Err(JournalError::InvalidCampaignId(_))
        ));
    }
}
