// RPC Abstraction
//
// The engine never talks to a socket directly. A host supplies a
// `RaftTransport` that connects `RaftClient` handles to peers; the node
// drives those handles and serves the mirror-image handler methods. The
// in-process transport in `memory` is the reference implementation and
// the one the cluster tests run on.

pub mod memory;
pub mod messages;

pub use messages::{
    AppendEntriesRequest, AppendEntriesResponse, CommitIndexRequest, CommitIndexResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, RpcResult, VoteRequest, VoteResponse,
};

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::log::ServerInfo;

/// Outbound handle to one peer. Calls fail with `RaftError::Network` on
/// delivery problems; the caller retries on its next tick.
#[async_trait]
pub trait RaftClient: Send + Sync {
    async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;

    async fn leader_commit_index(&self, request: CommitIndexRequest)
        -> Result<CommitIndexResponse>;
}

/// Connector the host provides; one client handle per configured peer.
pub trait RaftTransport: Send + Sync {
    fn connect(&self, server: &ServerInfo) -> Arc<dyn RaftClient>;
}
