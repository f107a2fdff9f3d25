// Leader Replication
//
// One task per peer, alive for one leadership term. Each iteration sends
// at most one AppendEntries (so requests to a single peer never overlap),
// then either continues immediately (more entries or a back-off retry
// pending) or parks until the next heartbeat tick or an explicit wake
// from propose. A peer whose cursor fell behind the first log index is
// switched to snapshot streaming.

use bytes::Bytes;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RaftError;
use crate::log::{LogIndex, Term};
use crate::node::{peer::Peer, NodeState, RaftNode, RaftRole};
use crate::rpc::{AppendEntriesRequest, InstallSnapshotRequest, RpcResult};

/// What the replicator loop should do after one iteration.
enum Flow {
    /// More work is pending; run the next iteration immediately.
    Continue,
    /// Nothing to send; wait for a wake or the next heartbeat tick.
    Idle,
    /// Leadership or the peer is gone; exit the task.
    Stop,
}

pub(crate) fn spawn_replicator(node: Arc<RaftNode>, peer: Arc<Peer>, term: Term) {
    let handle = tokio::spawn(run_replicator(Arc::clone(&node), peer, term));
    node.tasks.lock().push(handle);
}

async fn run_replicator(node: Arc<RaftNode>, peer: Arc<Peer>, term: Term) {
    tracing::debug!(peer = peer.id(), term, "replicator started");
    let mut shutdown = node.shutdown_rx();
    loop {
        if *shutdown.borrow() {
            break;
        }
        match replicate_once(&node, &peer, term).await {
            Flow::Continue => {}
            Flow::Idle => {
                tokio::select! {
                    _ = peer.wake.notified() => {}
                    _ = tokio::time::sleep(node.options.keep_alive_period) => {}
                    _ = shutdown.changed() => break,
                }
            }
            Flow::Stop => break,
        }
    }
    tracing::debug!(peer = peer.id(), term, "replicator stopped");
}

/// Send one AppendEntries (or stream a snapshot) to the peer and fold the
/// response back into leader state.
async fn replicate_once(node: &Arc<RaftNode>, peer: &Arc<Peer>, term: Term) -> Flow {
    let leader_commit = {
        let state = node.state.read().await;
        if state.role != RaftRole::Leader || state.current_term != term {
            return Flow::Stop;
        }
        if !state.peers.contains_key(&peer.id()) {
            return Flow::Stop;
        }
        state.commit_index
    };

    let next = peer.next_index();
    let request = {
        let log = node.log.read().await;
        if next < log.first_index() {
            drop(log);
            return send_snapshot(node, peer, term).await;
        }
        let prev = next - 1;
        let prev_term = match node.prev_term(&log, prev) {
            Some(prev_term) => prev_term,
            // The prefix was truncated under us; fall back to a snapshot.
            None => {
                drop(log);
                return send_snapshot(node, peer, term).await;
            }
        };
        let entries = match log.entries_from(next, node.options.max_entry_batch_size) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(peer = peer.id(), error = %e, "failed to read batch");
                return Flow::Idle;
            }
        };
        AppendEntriesRequest {
            term,
            leader_id: node.id(),
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries,
            leader_commit,
        }
    };
    let prev = request.prev_log_index;
    let sent = request.entries.len() as u64;

    let permit = match Arc::clone(&node.rpc_permits).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return Flow::Stop,
    };
    let response = tokio::time::timeout(rpc_deadline(node), peer.client.append_entries(request)).await;
    drop(permit);

    let response = match response {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return on_rpc_error(node, peer, &e).await,
        Err(_) => {
            tracing::debug!(peer = peer.id(), "append entries timed out");
            return Flow::Idle;
        }
    };

    let mut state = node.state.write().await;
    if state.role != RaftRole::Leader || state.current_term != term {
        return Flow::Stop;
    }
    if response.term > term {
        node.step_down_locked(&mut state, response.term).await;
        return Flow::Stop;
    }

    match response.result {
        RpcResult::Success => {
            let match_index = prev + sent;
            if match_index > peer.match_index() {
                peer.set_match_index(match_index);
            }
            peer.set_next_index(peer.match_index() + 1);

            let last = { node.log.read().await.last_index() };
            if !peer.caught_up()
                && last.saturating_sub(peer.match_index()) <= node.options.catchup_margin
            {
                peer.set_caught_up(true);
                node.sync_notify.notify_waiters();
                tracing::info!(peer = peer.id(), match_index = peer.match_index(), "peer caught up");
            }

            node.advance_commit(&mut state).await;
            if peer.next_index() <= last {
                Flow::Continue
            } else {
                Flow::Idle
            }
        }
        RpcResult::FailLogMismatch => {
            // The hint is the point the follower can accept from; never
            // move the cursor forward on a rejection.
            let hinted = response.last_log_index + 1;
            let fallback = next.saturating_sub(1).max(1);
            peer.set_next_index(if hinted < next { hinted } else { fallback });
            tracing::debug!(
                peer = peer.id(),
                next_index = peer.next_index(),
                "log mismatch, backing off"
            );
            Flow::Idle
        }
        RpcResult::FailTerm | RpcResult::FailNotLeader => Flow::Idle,
    }
}

/// A transport error. Peers that already left the configuration are torn
/// down; members and catching-up learners are retried on the next tick.
async fn on_rpc_error(node: &Arc<RaftNode>, peer: &Arc<Peer>, error: &RaftError) -> Flow {
    tracing::debug!(peer = peer.id(), error = %error, "replication rpc failed");
    let mut state = node.state.write().await;
    if !state.configuration.contains(peer.id()) && peer.caught_up() {
        state.peers.remove(&peer.id());
        tracing::info!(peer = peer.id(), "dropped unreachable non-member peer");
        return Flow::Stop;
    }
    Flow::Idle
}

/// Stream the current snapshot to a peer whose cursor precedes the first
/// log index, chunk by chunk, then resume log replication after it.
async fn send_snapshot(node: &Arc<RaftNode>, peer: &Arc<Peer>, term: Term) -> Flow {
    let meta = node.snapshots.current_meta();
    if meta.last_included_index == 0 {
        // No snapshot exists yet; realign with the log start.
        let first = { node.log.read().await.first_index() };
        peer.set_next_index(first);
        return Flow::Idle;
    }

    let files = match node.snapshots.open_files_for_send() {
        Ok(files) => files,
        Err(e) => {
            tracing::error!(error = %e, "cannot open snapshot for streaming");
            return Flow::Idle;
        }
    };
    tracing::info!(
        peer = peer.id(),
        last_included_index = meta.last_included_index,
        files = files.len(),
        "streaming snapshot to lagging peer"
    );

    let chunk_size = node.options.max_snapshot_bytes_per_request;
    let total_files = files.len();
    let mut first_chunk = true;

    if total_files == 0 {
        // Snapshot with no data files: a single placeholder chunk still
        // carries the metadata and the completion flag.
        match push_chunk(node, peer, term, &meta, String::new(), 0, Vec::new(), true, true).await {
            ChunkSent::Delivered => {}
            ChunkSent::Retry => return Flow::Idle,
            ChunkSent::Abort => return Flow::Stop,
        }
    }

    for (file_number, (name, mut file)) in files.into_iter().enumerate() {
        let len = match file.metadata() {
            Ok(stat) => stat.len(),
            Err(e) => {
                tracing::error!(error = %e, "cannot stat snapshot file");
                return Flow::Idle;
            }
        };
        let mut offset = 0u64;
        loop {
            let want = chunk_size.min((len - offset) as usize);
            let mut buf = vec![0u8; want];
            if want > 0 {
                if let Err(e) = file.read_exact(&mut buf) {
                    tracing::error!(error = %e, "cannot read snapshot file");
                    return Flow::Idle;
                }
            }
            let end_of_file = offset + want as u64 >= len;
            let is_last = file_number + 1 == total_files && end_of_file;

            match push_chunk(
                node,
                peer,
                term,
                &meta,
                name.clone(),
                offset,
                buf,
                first_chunk,
                is_last,
            )
            .await
            {
                ChunkSent::Delivered => {}
                ChunkSent::Retry => return Flow::Idle,
                ChunkSent::Abort => return Flow::Stop,
            }
            first_chunk = false;
            offset += want as u64;
            if end_of_file {
                break;
            }
        }
    }

    peer.set_match_index(meta.last_included_index);
    peer.set_next_index(meta.last_included_index + 1);
    tracing::info!(
        peer = peer.id(),
        next_index = peer.next_index(),
        "snapshot streamed, resuming log replication"
    );

    let mut state = node.state.write().await;
    if state.role == RaftRole::Leader && state.current_term == term {
        node.advance_commit(&mut state).await;
    }
    Flow::Continue
}

enum ChunkSent {
    Delivered,
    /// Transient failure; abandon this pass and retry the stream later.
    Retry,
    /// Leadership is gone; stop the replicator.
    Abort,
}

#[allow(clippy::too_many_arguments)]
async fn push_chunk(
    node: &Arc<RaftNode>,
    peer: &Arc<Peer>,
    term: Term,
    meta: &crate::snapshot::SnapshotMeta,
    file_name: String,
    offset: u64,
    data: Vec<u8>,
    is_first: bool,
    is_last: bool,
) -> ChunkSent {
    {
        let state = node.state.read().await;
        if state.role != RaftRole::Leader || state.current_term != term {
            return ChunkSent::Abort;
        }
    }

    let request = InstallSnapshotRequest {
        term,
        leader_id: node.id(),
        file_name,
        offset,
        data: Bytes::from(data),
        is_first,
        is_last,
        meta: if is_first { Some(meta.clone()) } else { None },
    };

    let permit = match Arc::clone(&node.rpc_permits).acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return ChunkSent::Abort,
    };
    let response =
        tokio::time::timeout(rpc_deadline(node), peer.client.install_snapshot(request)).await;
    drop(permit);

    let response = match response {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            return match on_rpc_error(node, peer, &e).await {
                Flow::Stop => ChunkSent::Abort,
                _ => ChunkSent::Retry,
            };
        }
        Err(_) => {
            tracing::debug!(peer = peer.id(), "snapshot chunk timed out");
            return ChunkSent::Retry;
        }
    };
    if response.term > term {
        node.step_down(response.term).await;
        return ChunkSent::Abort;
    }
    if response.result != RpcResult::Success {
        tracing::debug!(peer = peer.id(), result = ?response.result, "snapshot chunk refused");
        return ChunkSent::Retry;
    }
    ChunkSent::Delivered
}

fn rpc_deadline(node: &RaftNode) -> Duration {
    (node.options.keep_alive_period * 3).max(Duration::from_secs(1))
}

impl RaftNode {
    /// Advance the commit index by the median rule over the voters'
    /// match indices (self counts at its last log index), committing only
    /// entries from the current term. Leader only; called under the state
    /// lock.
    pub(crate) async fn advance_commit(&self, state: &mut NodeState) {
        if state.role != RaftRole::Leader {
            return;
        }
        let log = self.log.read().await;
        let last = log.last_index();

        let mut matches: Vec<LogIndex> = state
            .configuration
            .servers
            .iter()
            .map(|server| {
                if server.id == self.id() {
                    last
                } else {
                    state
                        .peers
                        .get(&server.id)
                        .map(|peer| peer.match_index())
                        .unwrap_or(0)
                }
            })
            .collect();
        if matches.is_empty() {
            return;
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matches[matches.len() / 2];

        if candidate <= state.commit_index {
            return;
        }
        // Counting replicas alone is not enough: only an entry of the
        // current term may be committed by the median rule.
        if log.term_at(candidate) != Some(state.current_term) {
            return;
        }
        drop(log);

        tracing::debug!(id = self.id(), commit_index = candidate, "commit advanced");
        state.commit_index = candidate;
        self.commit_notify.notify_one();
    }
}
