// Host State Machine Interface
//
// The consensus engine hands committed DATA payloads to the host through
// this trait and asks it to serialize/hydrate itself around snapshots.
// `apply_data` must be deterministic: every member applies the same
// payloads in the same order and must end up in the same state.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::{RaftError, Result};
use crate::log::entry::{decode_framed, write_frame};
use crate::log::LogIndex;

/// Host-provided state machine driven by committed log entries.
pub trait StateMachine: Send + Sync {
    /// Apply one committed DATA payload. Must be deterministic.
    fn apply_data(&self, payload: &[u8]) -> Result<()>;

    /// Serialize the full state into `data_dir` (a staged snapshot
    /// directory). `last_applied` is the highest index folded in.
    fn write_snapshot(&self, data_dir: &Path, last_applied: LogIndex) -> Result<()>;

    /// Replace the current state with the snapshot stored in `data_dir`.
    fn read_snapshot(&self, data_dir: &Path) -> Result<()>;

    /// Point read used by the linearizable-read helpers. Never mutates.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// Commands understood by [`MemoryKv`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (cmd, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
        Ok(cmd)
    }
}

const KV_SNAPSHOT_FILE: &str = "kv";

/// In-memory key/value reference machine.
///
/// Used by the demo cluster and the scenario tests; production hosts plug
/// in their own engine behind [`StateMachine`].
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl StateMachine for MemoryKv {
    fn apply_data(&self, payload: &[u8]) -> Result<()> {
        match KvCommand::decode(payload)? {
            KvCommand::Put { key, value } => {
                self.entries.write().insert(key, value);
            }
            KvCommand::Delete { key } => {
                self.entries.write().remove(&key);
            }
        }
        Ok(())
    }

    fn write_snapshot(&self, data_dir: &Path, _last_applied: LogIndex) -> Result<()> {
        let entries = self.entries.read().clone();
        let body = bincode::serde::encode_to_vec(&entries, bincode::config::standard())?;
        let mut framed = Vec::new();
        write_frame(&mut framed, &body)?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(data_dir.join(KV_SNAPSHOT_FILE))?;
        file.write_all(&framed)?;
        file.sync_all()?;
        Ok(())
    }

    fn read_snapshot(&self, data_dir: &Path) -> Result<()> {
        let raw = fs::read(data_dir.join(KV_SNAPSHOT_FILE))?;
        let body = decode_framed(&raw)?;
        let (entries, _): (BTreeMap<Vec<u8>, Vec<u8>>, _) =
            bincode::serde::decode_from_slice(&body, bincode::config::standard())
                .map_err(|e| RaftError::Serialization(e.to_string()))?;
        *self.entries.write() = entries;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }
}
