// Segmented Replicated Log
//
// Append-only log split into fixed-size segment files plus a CRC-framed
// metadata file holding `{current_term, voted_for, first_log_index,
// commit_index}`. All mutation goes through the node's state lock; reads
// are safe once the in-memory segment index is built.
//
// Layout under the log directory:
//   segments/<first-index, zero padded>.seg   framed log records
//   metadata                                  framed LogMetadata

pub mod entry;
mod segment;

pub use entry::{
    ClusterConfiguration, EntryType, LogEntry, LogIndex, LogMetadata, ServerId, ServerInfo, Term,
};

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{RaftError, Result};
use entry::{decode_framed, write_frame, FRAME_HEADER_LEN};
use segment::Segment;

const SEGMENTS_DIR: &str = "segments";
const METADATA_FILE: &str = "metadata";
const METADATA_TMP_FILE: &str = "metadata.tmp";

/// Durable, CRC-checked log of consensus entries.
pub struct SegmentedLog {
    segments_dir: PathBuf,
    metadata_path: PathBuf,
    metadata_tmp_path: PathBuf,
    max_segment_size: u64,
    /// Open segments keyed by their first index.
    segments: BTreeMap<LogIndex, Segment>,
    metadata: LogMetadata,
}

impl SegmentedLog {
    /// Open (or initialize) the log under `log_dir`.
    ///
    /// Recovery scans segments in index order, verifies every record CRC,
    /// and truncates the log at the first torn or corrupt record; segments
    /// beyond the truncation point are deleted.
    pub fn open(log_dir: &Path, max_segment_size: u64) -> Result<Self> {
        let segments_dir = log_dir.join(SEGMENTS_DIR);
        fs::create_dir_all(&segments_dir)?;

        let metadata_path = log_dir.join(METADATA_FILE);
        let metadata_tmp_path = log_dir.join(METADATA_TMP_FILE);
        let metadata = if metadata_path.exists() {
            let raw = fs::read(&metadata_path)?;
            LogMetadata::decode(&decode_framed(&raw)?)?
        } else {
            LogMetadata::default()
        };
        // A leftover temp file from an interrupted metadata write.
        let _ = fs::remove_file(&metadata_tmp_path);

        let mut names: Vec<(LogIndex, PathBuf)> = Vec::new();
        for dirent in fs::read_dir(&segments_dir)? {
            let path = dirent?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if let Some(first_index) = segment::parse_segment_file_name(name) {
                names.push((first_index, path));
            }
        }
        names.sort_by_key(|(first, _)| *first);

        let mut segments = BTreeMap::new();
        let mut expected_next: Option<LogIndex> = None;
        let mut truncated = false;
        for (first_index, path) in names.iter() {
            if truncated {
                fs::remove_file(path)?;
                continue;
            }
            if let Some(expected) = expected_next {
                if *first_index != expected {
                    tracing::warn!(
                        expected,
                        found = first_index,
                        "gap between segments, truncating log tail"
                    );
                    truncated = true;
                    fs::remove_file(path)?;
                    continue;
                }
            }

            let (seg, clean) = Segment::open(path)?;
            if !clean {
                tracing::warn!(path = ?path, "corrupt record, truncating log tail");
                truncated = true;
            }
            if seg.is_empty() {
                seg.remove()?;
                continue;
            }
            expected_next = seg.last_index().map(|last| last + 1);
            segments.insert(seg.first_index(), seg);
        }

        Ok(Self {
            segments_dir,
            metadata_path,
            metadata_tmp_path,
            max_segment_size,
            segments,
            metadata,
        })
    }

    /// First index still covered by the log.
    pub fn first_index(&self) -> LogIndex {
        self.metadata.first_log_index
    }

    /// Index of the most recent entry, or `first_index - 1` when empty.
    pub fn last_index(&self) -> LogIndex {
        self.segments
            .values()
            .rev()
            .find_map(|seg| seg.last_index())
            .unwrap_or(self.metadata.first_log_index - 1)
    }

    /// Persisted metadata snapshot.
    pub fn metadata(&self) -> &LogMetadata {
        &self.metadata
    }

    /// On-disk bytes held by live segments.
    pub fn total_size(&self) -> u64 {
        self.segments.values().map(|seg| seg.size()).sum()
    }

    /// Append a contiguous batch starting at `last_index + 1`.
    ///
    /// Entries are durable (written and fsynced) before this returns. The
    /// log rolls to a new segment whenever the active one would exceed the
    /// configured maximum size.
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<LogIndex> {
        if entries.is_empty() {
            return Ok(self.last_index());
        }
        let mut expected = self.last_index() + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(RaftError::InvalidOperation(format!(
                    "append expects index {}, got {}",
                    expected, entry.index
                )));
            }
            expected += 1;
        }

        let mut bodies: Vec<(Vec<u8>, Term)> = entries
            .iter()
            .map(|e| Ok((e.encode()?, e.term)))
            .collect::<Result<_>>()?;

        let mut idx = 0;
        while idx < bodies.len() {
            let first_frame = FRAME_HEADER_LEN + bodies[idx].0.len() as u64;
            let roll = match self.segments.values().next_back() {
                Some(seg) => !seg.is_empty() && seg.size() + first_frame > self.max_segment_size,
                None => true,
            };
            if roll {
                let first_index = entries[idx].index;
                let seg = Segment::create(&self.segments_dir, first_index)?;
                self.segments.insert(first_index, seg);
            }

            let seg = self
                .segments
                .values_mut()
                .next_back()
                .expect("segment exists after roll check");
            let mut batch = Vec::new();
            let mut projected = seg.size();
            while idx < bodies.len() {
                let frame_len = FRAME_HEADER_LEN + bodies[idx].0.len() as u64;
                let segment_started = !seg.is_empty() || !batch.is_empty();
                if segment_started && projected + frame_len > self.max_segment_size {
                    break;
                }
                projected += frame_len;
                batch.push(std::mem::take(&mut bodies[idx]));
                idx += 1;
            }
            seg.append(&batch)?;
            seg.sync()?;
        }

        Ok(self.last_index())
    }

    /// Fetch the entry at `index`, which must lie in
    /// `[first_index, last_index]`.
    pub fn entry_at(&self, index: LogIndex) -> Result<LogEntry> {
        if index < self.metadata.first_log_index || index > self.last_index() {
            return Err(RaftError::NotFound(format!("log index {}", index)));
        }
        let (_, seg) = self
            .segments
            .range(..=index)
            .next_back()
            .ok_or_else(|| RaftError::NotFound(format!("log index {}", index)))?;
        seg.read_entry(index)
    }

    /// Fetch up to `max_entries` entries starting at `from` (bounded by the
    /// last index).
    pub fn entries_from(&self, from: LogIndex, max_entries: usize) -> Result<Vec<LogEntry>> {
        let last = self.last_index();
        if from > last {
            return Ok(Vec::new());
        }
        let to = last.min(from + max_entries as u64 - 1);
        let mut entries = Vec::with_capacity((to - from + 1) as usize);
        for index in from..=to {
            entries.push(self.entry_at(index)?);
        }
        Ok(entries)
    }

    /// Term of the entry at `index`, from the in-memory segment index.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index < self.metadata.first_log_index || index > self.last_index() {
            return None;
        }
        self.segments
            .range(..=index)
            .next_back()
            .and_then(|(_, seg)| seg.term_at(index))
    }

    /// Term of the most recent entry, or `None` when the log is empty.
    pub fn last_term(&self) -> Option<Term> {
        let last = self.last_index();
        if last < self.metadata.first_log_index {
            None
        } else {
            self.term_at(last)
        }
    }

    /// Drop whole segments strictly below `new_first_index` and advance the
    /// persisted first index. Never splits a segment mid-record.
    pub fn truncate_prefix(&mut self, new_first_index: LogIndex) -> Result<()> {
        if new_first_index <= self.metadata.first_log_index {
            return Ok(());
        }

        let removable: Vec<LogIndex> = self
            .segments
            .iter()
            .filter(|(_, seg)| match seg.last_index() {
                Some(last) => last < new_first_index,
                None => true,
            })
            .map(|(first, _)| *first)
            .collect();
        for key in removable {
            if let Some(seg) = self.segments.remove(&key) {
                seg.remove()?;
            }
        }

        self.metadata.first_log_index = new_first_index;
        self.persist_metadata()
    }

    /// Discard every entry above `new_last_index`. Used when a follower's
    /// log conflicts with the leader's.
    pub fn truncate_suffix(&mut self, new_last_index: LogIndex) -> Result<()> {
        if new_last_index >= self.last_index() {
            return Ok(());
        }
        if new_last_index + 1 < self.metadata.first_log_index {
            return Err(RaftError::InvalidOperation(format!(
                "cannot truncate below first log index {}",
                self.metadata.first_log_index
            )));
        }

        let removable: Vec<LogIndex> = self
            .segments
            .range(new_last_index + 1..)
            .map(|(first, _)| *first)
            .collect();
        for key in removable {
            if let Some(seg) = self.segments.remove(&key) {
                seg.remove()?;
            }
        }

        if let Some((_, seg)) = self.segments.range_mut(..=new_last_index).next_back() {
            if seg.last_index().is_some_and(|last| last > new_last_index) {
                seg.truncate_from(new_last_index + 1)?;
            }
        }
        Ok(())
    }

    /// Drop the entire log and restart it at `next_index`. Used after a
    /// snapshot install that conflicts with the local log.
    pub fn reset(&mut self, next_index: LogIndex) -> Result<()> {
        let keys: Vec<LogIndex> = self.segments.keys().copied().collect();
        for key in keys {
            if let Some(seg) = self.segments.remove(&key) {
                seg.remove()?;
            }
        }
        self.metadata.first_log_index = next_index;
        self.persist_metadata()
    }

    /// Persist the metadata file with fsync, via temp-file rename.
    pub fn update_meta(
        &mut self,
        current_term: Term,
        voted_for: Option<ServerId>,
        first_log_index: LogIndex,
        commit_index: LogIndex,
    ) -> Result<()> {
        self.metadata = LogMetadata {
            current_term,
            voted_for,
            first_log_index,
            commit_index,
        };
        self.persist_metadata()
    }

    fn persist_metadata(&self) -> Result<()> {
        let body = self.metadata.encode()?;
        let mut framed = Vec::with_capacity(FRAME_HEADER_LEN as usize + body.len());
        write_frame(&mut framed, &body)?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.metadata_tmp_path)?;
        file.write_all(&framed)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.metadata_tmp_path, &self.metadata_path)?;
        Ok(())
    }
}
