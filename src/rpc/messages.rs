// Consensus Wire Messages
//
// Typed requests and responses exchanged between members. The transport is
// abstract; any carrier that delivers these structs intact works. All
// numeric fields are unsigned 64-bit except server ids, which are 32-bit.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::log::{LogEntry, LogIndex, ServerId, Term};
use crate::snapshot::SnapshotMeta;

/// Outcome code carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResult {
    Success,
    /// The caller's term is behind the responder's.
    FailTerm,
    /// AppendEntries prev-entry check failed; back off using the hint.
    FailLogMismatch,
    /// The responder is not the leader.
    FailNotLeader,
}

/// RequestVote / PreVote. A pre-vote asks "would you vote for me in the
/// next term?" without the responder persisting anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term (for a pre-vote: the term it would campaign in).
    pub term: Term,
    pub candidate_id: ServerId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
    /// True for the non-binding pre-vote probe.
    pub pre_vote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Responder's current term, for the candidate to update itself.
    pub term: Term,
    pub vote_granted: bool,
}

/// Log replication and heartbeat (empty `entries`) in one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    /// So the follower can hint clients at the leader.
    pub leader_id: ServerId,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub result: RpcResult,
    /// On rejection: a back-off hint, never at or above the failed
    /// `prev_log_index`. On success: the follower's last log index.
    pub last_log_index: LogIndex,
}

/// One chunk of a streamed snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: ServerId,
    /// Snapshot data file this chunk belongs to.
    pub file_name: String,
    /// Byte offset of this chunk within the file.
    pub offset: u64,
    pub data: Bytes,
    /// First chunk of the whole snapshot; carries `meta`.
    pub is_first: bool,
    /// Last chunk of the whole snapshot; triggers the atomic swap.
    pub is_last: bool,
    pub meta: Option<SnapshotMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub result: RpcResult,
}

/// Read-only probe of the leader's commit index, used by the follower
/// read path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitIndexRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitIndexResponse {
    pub term: Term,
    pub result: RpcResult,
    /// Best-known leader when `result` is `FailNotLeader`.
    pub leader_id: Option<ServerId>,
    pub commit_index: LogIndex,
}
