// Snapshot Store
//
// Persistent home of the latest state-machine snapshot: a metadata file
// (`{last_included_index, last_included_term, configuration}`, CRC-framed)
// next to a directory of opaque data files written by the state machine.
// A snapshot becomes current via directory rename: writers stage into
// `snapshot.tmp`, then the store swaps it into place. Only the latest
// snapshot is retained.
//
// Writers and readers are serialized by a mutex that is distinct from the
// node's state lock; the `taking`/`installing` flags arbitrate between a
// local snapshot write and a streamed install from the leader.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{RaftError, Result};
use crate::log::entry::{decode_framed, write_frame};
use crate::log::{ClusterConfiguration, LogIndex, Term};

const DATA_DIR: &str = "data";
const METADATA_FILE: &str = "metadata";

/// Metadata describing what a snapshot covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Highest log index folded into the snapshot.
    pub last_included_index: LogIndex,
    /// Term of that entry.
    pub last_included_term: Term,
    /// Cluster configuration as of `last_included_index`.
    pub configuration: ClusterConfiguration,
}

impl SnapshotMeta {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let (meta, _) = bincode::serde::decode_from_slice(body, bincode::config::standard())?;
        Ok(meta)
    }
}

/// Durable snapshot directory with atomic swap semantics.
pub struct SnapshotStore {
    snapshot_dir: PathBuf,
    tmp_dir: PathBuf,
    old_dir: PathBuf,
    meta: RwLock<SnapshotMeta>,
    /// Serializes directory mutation against readers streaming files out.
    dir_lock: Mutex<()>,
    taking_snapshot: AtomicBool,
    installing_snapshot: AtomicBool,
}

impl SnapshotStore {
    /// Open the store, completing or rolling back any interrupted swap.
    pub fn open(snapshot_dir: PathBuf, tmp_dir: PathBuf) -> Result<Self> {
        let old_dir = snapshot_dir.with_extension("old");

        if !snapshot_dir.exists() {
            let staged_meta = tmp_dir.join(METADATA_FILE);
            if staged_meta.exists() && Self::read_meta(&staged_meta).is_ok() {
                // Crash landed between removing the old snapshot and the
                // final rename; the staged snapshot is complete, promote it.
                fs::rename(&tmp_dir, &snapshot_dir)?;
            } else if old_dir.exists() {
                fs::rename(&old_dir, &snapshot_dir)?;
            }
        }
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        if old_dir.exists() {
            fs::remove_dir_all(&old_dir)?;
        }

        let meta_path = snapshot_dir.join(METADATA_FILE);
        let meta = if meta_path.exists() {
            Self::read_meta(&meta_path)?
        } else {
            SnapshotMeta::default()
        };

        Ok(Self {
            snapshot_dir,
            tmp_dir,
            old_dir,
            meta: RwLock::new(meta),
            dir_lock: Mutex::new(()),
            taking_snapshot: AtomicBool::new(false),
            installing_snapshot: AtomicBool::new(false),
        })
    }

    /// Metadata of the current snapshot (zeroed when none exists).
    pub fn current_meta(&self) -> SnapshotMeta {
        self.meta.read().clone()
    }

    /// Highest index covered by the current snapshot (0 when none).
    pub fn last_included_index(&self) -> LogIndex {
        self.meta.read().last_included_index
    }

    pub fn has_snapshot(&self) -> bool {
        self.last_included_index() > 0
    }

    /// Directory holding the current snapshot's data files.
    pub fn data_dir(&self) -> PathBuf {
        self.snapshot_dir.join(DATA_DIR)
    }

    /// Staging directory the state machine (or an install) writes into.
    pub fn tmp_data_dir(&self) -> PathBuf {
        self.tmp_dir.join(DATA_DIR)
    }

    /// Prepare a clean staging directory and return its data path.
    pub fn begin_write(&self) -> Result<PathBuf> {
        let _guard = self.dir_lock.lock();
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        let data = self.tmp_data_dir();
        fs::create_dir_all(&data)?;
        Ok(data)
    }

    /// Seal the staged snapshot: write its metadata, then swap the staging
    /// directory into place and drop the previous snapshot.
    pub fn commit(&self, meta: SnapshotMeta) -> Result<()> {
        let _guard = self.dir_lock.lock();
        if !self.tmp_dir.exists() {
            return Err(RaftError::InvalidOperation(
                "no staged snapshot to commit".to_string(),
            ));
        }

        let body = meta.encode()?;
        let mut framed = Vec::new();
        write_frame(&mut framed, &body)?;
        let meta_path = self.tmp_dir.join(METADATA_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&meta_path)?;
        file.write_all(&framed)?;
        file.sync_all()?;
        drop(file);

        if self.snapshot_dir.exists() {
            fs::rename(&self.snapshot_dir, &self.old_dir)?;
        }
        fs::rename(&self.tmp_dir, &self.snapshot_dir)?;
        if self.old_dir.exists() {
            fs::remove_dir_all(&self.old_dir)?;
        }

        tracing::info!(
            last_included_index = meta.last_included_index,
            last_included_term = meta.last_included_term,
            "snapshot committed"
        );
        *self.meta.write() = meta;
        Ok(())
    }

    /// Open every data file of the current snapshot, ordered by name, for
    /// streaming to a lagging peer.
    pub fn open_files_for_send(&self) -> Result<BTreeMap<String, File>> {
        let _guard = self.dir_lock.lock();
        let data_dir = self.data_dir();
        let mut files = BTreeMap::new();
        if !data_dir.exists() {
            return Ok(files);
        }
        for dirent in fs::read_dir(&data_dir)? {
            let dirent = dirent?;
            if !dirent.file_type()?.is_file() {
                continue;
            }
            let name = dirent
                .file_name()
                .into_string()
                .map_err(|_| RaftError::Corruption("non-UTF8 snapshot file name".to_string()))?;
            files.insert(name, File::open(dirent.path())?);
        }
        Ok(files)
    }

    /// Claim the snapshot-writer slot. Fails when a snapshot or an install
    /// is already running.
    pub fn try_begin_snapshot(&self) -> bool {
        if self.installing_snapshot.load(Ordering::Acquire) {
            return false;
        }
        self.taking_snapshot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_snapshot(&self) {
        self.taking_snapshot.store(false, Ordering::Release);
    }

    /// Claim the install slot. Fails while a local snapshot is being taken
    /// or another install is running.
    pub fn try_begin_install(&self) -> bool {
        if self.taking_snapshot.load(Ordering::Acquire) {
            return false;
        }
        self.installing_snapshot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_install(&self) {
        self.installing_snapshot.store(false, Ordering::Release);
    }

    pub fn is_installing(&self) -> bool {
        self.installing_snapshot.load(Ordering::Acquire)
    }

    fn read_meta(path: &Path) -> Result<SnapshotMeta> {
        let raw = fs::read(path)?;
        SnapshotMeta::decode(&decode_framed(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::ServerInfo;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SnapshotStore {
        SnapshotStore::open(dir.path().join("snapshot"), dir.path().join("snapshot.tmp")).unwrap()
    }

    fn sample_meta(index: LogIndex) -> SnapshotMeta {
        SnapshotMeta {
            last_included_index: index,
            last_included_term: 2,
            configuration: ClusterConfiguration::new(vec![
                ServerInfo::new(1, "127.0.0.1", 7001),
                ServerInfo::new(2, "127.0.0.1", 7002),
            ]),
        }
    }

    #[test]
    fn empty_store_reports_zeroed_meta() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(!store.has_snapshot());
        assert_eq!(store.current_meta(), SnapshotMeta::default());
    }

    #[test]
    fn commit_swaps_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = store(&dir);
            let data = store.begin_write().unwrap();
            fs::write(data.join("kv"), b"state-bytes").unwrap();
            store.commit(sample_meta(42)).unwrap();
            assert_eq!(store.last_included_index(), 42);
        }

        let store = store(&dir);
        assert_eq!(store.last_included_index(), 42);
        assert_eq!(
            fs::read(store.data_dir().join("kv")).unwrap(),
            b"state-bytes"
        );
        assert!(!dir.path().join("snapshot.tmp").exists());
        assert!(!dir.path().join("snapshot.old").exists());
    }

    #[test]
    fn newer_snapshot_replaces_older() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let data = store.begin_write().unwrap();
        fs::write(data.join("kv"), b"v1").unwrap();
        store.commit(sample_meta(10)).unwrap();

        let data = store.begin_write().unwrap();
        fs::write(data.join("kv"), b"v2").unwrap();
        store.commit(sample_meta(20)).unwrap();

        assert_eq!(store.last_included_index(), 20);
        assert_eq!(fs::read(store.data_dir().join("kv")).unwrap(), b"v2");
    }

    #[test]
    fn files_for_send_are_name_ordered() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let data = store.begin_write().unwrap();
        fs::write(data.join("b-pages"), b"b").unwrap();
        fs::write(data.join("a-index"), b"a").unwrap();
        store.commit(sample_meta(5)).unwrap();

        let files = store.open_files_for_send().unwrap();
        let names: Vec<&String> = files.keys().collect();
        assert_eq!(names, vec!["a-index", "b-pages"]);
    }

    #[test]
    fn writer_flags_are_mutually_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(store.try_begin_snapshot());
        assert!(!store.try_begin_snapshot());
        assert!(!store.try_begin_install());
        store.end_snapshot();

        assert!(store.try_begin_install());
        assert!(!store.try_begin_snapshot());
        assert!(!store.try_begin_install());
        store.end_install();
        assert!(store.try_begin_snapshot());
        store.end_snapshot();
    }

    #[test]
    fn interrupted_swap_rolls_back_to_old() {
        let dir = TempDir::new().unwrap();
        {
            let store = store(&dir);
            let data = store.begin_write().unwrap();
            fs::write(data.join("kv"), b"v1").unwrap();
            store.commit(sample_meta(10)).unwrap();
        }
        // Simulate a crash after the current snapshot was renamed aside but
        // before the staged one moved in.
        fs::rename(dir.path().join("snapshot"), dir.path().join("snapshot.old")).unwrap();

        let store = store(&dir);
        assert_eq!(store.last_included_index(), 10);
        assert_eq!(fs::read(store.data_dir().join("kv")).unwrap(), b"v1");
    }
}
