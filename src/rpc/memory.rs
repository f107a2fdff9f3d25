// In-Process Transport
//
// Routes consensus RPCs between nodes living in the same process by
// invoking the target node's handler methods directly. Supports cutting
// and healing links, which is how the scenario tests build partitions
// without a network stack.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

use crate::error::{RaftError, Result};
use crate::log::{ServerId, ServerInfo};
use crate::node::RaftNode;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, CommitIndexRequest, CommitIndexResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, RaftClient, RaftTransport, VoteRequest,
    VoteResponse,
};

/// Registry of in-process nodes plus the set of severed links.
pub struct InMemoryNetwork {
    self_ref: Weak<InMemoryNetwork>,
    nodes: DashMap<ServerId, Arc<RaftNode>>,
    cut_links: RwLock<HashSet<(ServerId, ServerId)>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            nodes: DashMap::new(),
            cut_links: RwLock::new(HashSet::new()),
        })
    }

    /// Make a node reachable under its id.
    pub fn register(&self, node: Arc<RaftNode>) {
        self.nodes.insert(node.id(), node);
    }

    /// Remove a node; calls to it fail like a dead host.
    pub fn unregister(&self, id: ServerId) {
        self.nodes.remove(&id);
    }

    /// Sever the link between two nodes, both directions.
    pub fn partition(&self, a: ServerId, b: ServerId) {
        self.cut_links.write().insert(link(a, b));
    }

    /// Sever every link between `id` and the rest of the registry.
    pub fn isolate(&self, id: ServerId) {
        let mut cuts = self.cut_links.write();
        for entry in self.nodes.iter() {
            let other = *entry.key();
            if other != id {
                cuts.insert(link(id, other));
            }
        }
    }

    /// Restore the link between two nodes.
    pub fn heal(&self, a: ServerId, b: ServerId) {
        self.cut_links.write().remove(&link(a, b));
    }

    /// Restore every link.
    pub fn heal_all(&self) {
        self.cut_links.write().clear();
    }

    /// Transport handle for the node with the given local id.
    pub fn transport(&self, local: ServerId) -> Arc<dyn RaftTransport> {
        Arc::new(MemoryTransport {
            network: self.self_ref.clone(),
            local,
        })
    }

    fn route(&self, from: ServerId, to: ServerId) -> Result<Arc<RaftNode>> {
        if self.cut_links.read().contains(&link(from, to)) {
            return Err(RaftError::Network(format!(
                "link {} -> {} is partitioned",
                from, to
            )));
        }
        self.nodes
            .get(&to)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RaftError::Network(format!("server {} is unreachable", to)))
    }
}

fn link(a: ServerId, b: ServerId) -> (ServerId, ServerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

struct MemoryTransport {
    network: Weak<InMemoryNetwork>,
    local: ServerId,
}

impl RaftTransport for MemoryTransport {
    fn connect(&self, server: &ServerInfo) -> Arc<dyn RaftClient> {
        Arc::new(MemoryClient {
            network: self.network.clone(),
            from: self.local,
            to: server.id,
        })
    }
}

struct MemoryClient {
    network: Weak<InMemoryNetwork>,
    from: ServerId,
    to: ServerId,
}

impl MemoryClient {
    fn target(&self) -> Result<Arc<RaftNode>> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| RaftError::Network("network is gone".to_string()))?;
        network.route(self.from, self.to)
    }
}

#[async_trait]
impl RaftClient for MemoryClient {
    async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.target()?.handle_request_vote(request).await
    }

    async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.target()?.handle_append_entries(request).await
    }

    async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.target()?.handle_install_snapshot(request).await
    }

    async fn leader_commit_index(
        &self,
        request: CommitIndexRequest,
    ) -> Result<CommitIndexResponse> {
        self.target()?.handle_commit_index(request).await
    }
}
