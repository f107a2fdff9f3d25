// Node Configuration
//
// Every tunable the consensus engine recognizes, with production defaults.
// Timeouts follow the usual Raft constraint: the heartbeat period must be
// much smaller than the vote timeout, and election timeouts are drawn
// uniformly from [vote_timeout, 2 * vote_timeout].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RaftError, Result};

/// Configuration for a single consensus node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftOptions {
    /// Root directory for the log and snapshots.
    pub data_dir: PathBuf,

    /// Threshold at which the log rolls to a new segment file.
    pub max_segment_file_size: u64,

    /// Base for the randomized election timeout.
    pub vote_timeout: Duration,

    /// Heartbeat period on the leader.
    pub keep_alive_period: Duration,

    /// Upper bound on entries per AppendEntries request.
    pub max_entry_batch_size: usize,

    /// Chunk size for InstallSnapshot streaming.
    pub max_snapshot_bytes_per_request: usize,

    /// Minimum log size in bytes before a snapshot is considered.
    pub snapshot_min_log_size: u64,

    /// Period of the snapshot evaluation task.
    pub backup_interval: Duration,

    /// Lag threshold (in entries) at which a new peer is declared caught up.
    pub catchup_margin: u64,

    /// Bound on client propose/read waits.
    pub max_await_timeout: Duration,

    /// Return from propose after the local durable append, before quorum.
    pub async_write: bool,

    /// Number of permits bounding concurrent outbound consensus RPCs.
    pub consensus_thread_num: usize,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./raft-data"),
            max_segment_file_size: 32 * 1024 * 1024, // 32MB
            vote_timeout: Duration::from_millis(1000),
            keep_alive_period: Duration::from_millis(100),
            max_entry_batch_size: 100,
            max_snapshot_bytes_per_request: 256 * 1024, // 256KB
            snapshot_min_log_size: 64 * 1024 * 1024,    // 64MB
            backup_interval: Duration::from_secs(3600),
            catchup_margin: 500,
            max_await_timeout: Duration::from_millis(1000),
            async_write: false,
            consensus_thread_num: 20,
        }
    }
}

impl RaftOptions {
    /// Create options rooted at the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set the segment roll threshold.
    pub fn with_max_segment_file_size(mut self, bytes: u64) -> Self {
        self.max_segment_file_size = bytes;
        self
    }

    /// Set the base election timeout.
    pub fn with_vote_timeout(mut self, timeout: Duration) -> Self {
        self.vote_timeout = timeout;
        self
    }

    /// Set the leader heartbeat period.
    pub fn with_keep_alive_period(mut self, period: Duration) -> Self {
        self.keep_alive_period = period;
        self
    }

    /// Set the per-request entry batch bound.
    pub fn with_max_entry_batch_size(mut self, entries: usize) -> Self {
        self.max_entry_batch_size = entries;
        self
    }

    /// Set the InstallSnapshot chunk size.
    pub fn with_max_snapshot_bytes_per_request(mut self, bytes: usize) -> Self {
        self.max_snapshot_bytes_per_request = bytes;
        self
    }

    /// Set the minimum log size that triggers snapshotting.
    pub fn with_snapshot_min_log_size(mut self, bytes: u64) -> Self {
        self.snapshot_min_log_size = bytes;
        self
    }

    /// Set the snapshot evaluation period.
    pub fn with_backup_interval(mut self, interval: Duration) -> Self {
        self.backup_interval = interval;
        self
    }

    /// Set the catch-up margin for newly added peers.
    pub fn with_catchup_margin(mut self, entries: u64) -> Self {
        self.catchup_margin = entries;
        self
    }

    /// Set the client await bound.
    pub fn with_max_await_timeout(mut self, timeout: Duration) -> Self {
        self.max_await_timeout = timeout;
        self
    }

    /// Enable or disable async-write mode.
    pub fn with_async_write(mut self, enabled: bool) -> Self {
        self.async_write = enabled;
        self
    }

    /// Set the outbound RPC concurrency bound.
    pub fn with_consensus_thread_num(mut self, permits: usize) -> Self {
        self.consensus_thread_num = permits;
        self
    }

    /// Directory holding the segmented log.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    /// Directory holding the current snapshot.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshot")
    }

    /// Staging directory for an in-progress snapshot write or install.
    pub fn snapshot_tmp_dir(&self) -> PathBuf {
        self.data_dir.join("snapshot.tmp")
    }

    /// Validate option combinations before starting a node.
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_file_size == 0 {
            return Err(RaftError::Configuration(
                "max_segment_file_size must be greater than 0".to_string(),
            ));
        }
        if self.vote_timeout.is_zero() {
            return Err(RaftError::Configuration(
                "vote_timeout must be greater than 0".to_string(),
            ));
        }
        if self.keep_alive_period >= self.vote_timeout {
            return Err(RaftError::Configuration(
                "keep_alive_period must be smaller than vote_timeout".to_string(),
            ));
        }
        if self.max_entry_batch_size == 0 {
            return Err(RaftError::Configuration(
                "max_entry_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.max_snapshot_bytes_per_request == 0 {
            return Err(RaftError::Configuration(
                "max_snapshot_bytes_per_request must be greater than 0".to_string(),
            ));
        }
        if self.consensus_thread_num == 0 {
            return Err(RaftError::Configuration(
                "consensus_thread_num must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        let options = RaftOptions::default();
        assert!(options.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let options = RaftOptions::new("/var/lib/raft")
            .with_vote_timeout(Duration::from_millis(500))
            .with_keep_alive_period(Duration::from_millis(50))
            .with_max_entry_batch_size(32)
            .with_async_write(true);

        assert_eq!(options.data_dir, PathBuf::from("/var/lib/raft"));
        assert_eq!(options.vote_timeout, Duration::from_millis(500));
        assert_eq!(options.max_entry_batch_size, 32);
        assert!(options.async_write);
    }

    #[test]
    fn heartbeat_must_undercut_vote_timeout() {
        let options = RaftOptions::default()
            .with_vote_timeout(Duration::from_millis(100))
            .with_keep_alive_period(Duration::from_millis(100));
        assert!(options.validate().is_err());
    }

    #[test]
    fn derived_paths() {
        let options = RaftOptions::new("/data/node1");
        assert_eq!(options.log_dir(), PathBuf::from("/data/node1/log"));
        assert_eq!(options.snapshot_dir(), PathBuf::from("/data/node1/snapshot"));
        assert_eq!(
            options.snapshot_tmp_dir(),
            PathBuf::from("/data/node1/snapshot.tmp")
        );
    }
}
