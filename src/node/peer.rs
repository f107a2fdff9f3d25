// Per-Peer Replication State
//
// One record per remote member: the leader's replication cursor into that
// peer's log, the vote bookkeeping for the current election round, the
// catch-up flag used while a new server streams up to date, and the RPC
// client handle. Records live for the peer's membership and are torn down
// (closing the handle) when the peer leaves the configuration.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::log::{LogIndex, ServerInfo};
use crate::rpc::RaftClient;

pub struct Peer {
    pub server: ServerInfo,
    pub client: Arc<dyn RaftClient>,
    /// Leader's guess of the next entry to send.
    next_index: AtomicU64,
    /// Highest entry known replicated on the peer.
    match_index: AtomicU64,
    /// Vote outcome in the current election round; `None` until answered.
    vote_granted: Mutex<Option<bool>>,
    /// Set once a newly added peer is within the catch-up margin.
    caught_up: AtomicBool,
    /// Wakes the peer's replicator ahead of its next heartbeat tick.
    pub wake: Notify,
}

impl Peer {
    pub fn new(server: ServerInfo, client: Arc<dyn RaftClient>) -> Arc<Self> {
        Arc::new(Self {
            server,
            client,
            next_index: AtomicU64::new(1),
            match_index: AtomicU64::new(0),
            vote_granted: Mutex::new(None),
            caught_up: AtomicBool::new(true),
            wake: Notify::new(),
        })
    }

    pub fn id(&self) -> crate::log::ServerId {
        self.server.id
    }

    pub fn next_index(&self) -> LogIndex {
        self.next_index.load(Ordering::Acquire)
    }

    pub fn set_next_index(&self, index: LogIndex) {
        self.next_index.store(index, Ordering::Release);
    }

    pub fn match_index(&self) -> LogIndex {
        self.match_index.load(Ordering::Acquire)
    }

    pub fn set_match_index(&self, index: LogIndex) {
        self.match_index.store(index, Ordering::Release);
    }

    pub fn vote_granted(&self) -> Option<bool> {
        *self.vote_granted.lock()
    }

    pub fn set_vote_granted(&self, granted: bool) {
        *self.vote_granted.lock() = Some(granted);
    }

    /// Reset the vote record at the start of an election round.
    pub fn clear_vote(&self) {
        *self.vote_granted.lock() = None;
    }

    pub fn caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    pub fn set_caught_up(&self, value: bool) {
        self.caught_up.store(value, Ordering::Release);
    }

    /// Point the cursor at the end of the leader's log, as done when a
    /// node first becomes leader.
    pub fn reset_cursor(&self, last_log_index: LogIndex) {
        self.set_next_index(last_log_index + 1);
        self.set_match_index(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::messages::*;
    use async_trait::async_trait;

    struct NullClient;

    #[async_trait]
    impl RaftClient for NullClient {
        async fn request_vote(&self, _r: VoteRequest) -> crate::error::Result<VoteResponse> {
            unimplemented!("not dialed in this test")
        }
        async fn append_entries(
            &self,
            _r: AppendEntriesRequest,
        ) -> crate::error::Result<AppendEntriesResponse> {
            unimplemented!("not dialed in this test")
        }
        async fn install_snapshot(
            &self,
            _r: InstallSnapshotRequest,
        ) -> crate::error::Result<InstallSnapshotResponse> {
            unimplemented!("not dialed in this test")
        }
        async fn leader_commit_index(
            &self,
            _r: CommitIndexRequest,
        ) -> crate::error::Result<CommitIndexResponse> {
            unimplemented!("not dialed in this test")
        }
    }

    #[test]
    fn cursor_and_vote_lifecycle() {
        let peer = Peer::new(
            ServerInfo::new(2, "127.0.0.1", 7002),
            std::sync::Arc::new(NullClient),
        );

        peer.reset_cursor(10);
        assert_eq!(peer.next_index(), 11);
        assert_eq!(peer.match_index(), 0);

        peer.set_match_index(11);
        peer.set_next_index(12);
        assert_eq!(peer.match_index(), 11);

        assert_eq!(peer.vote_granted(), None);
        peer.set_vote_granted(true);
        assert_eq!(peer.vote_granted(), Some(true));
        peer.clear_vote();
        assert_eq!(peer.vote_granted(), None);
    }
}
