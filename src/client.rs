// Client Façade
//
// The surface a host calls into: propose a payload and wait for it to
// apply, or run one of the linearizable read helpers. Consensus-level
// outcomes (`ok` / `notLeader` / `timeout`) are data, not errors; the
// `Result` layer only carries storage and shutdown failures.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::error::{RaftError, Result};
use crate::log::{EntryType, LogEntry, LogIndex, ServerId, Term};
use crate::node::{peer::Peer, RaftNode, RaftRole};
use crate::rpc::{AppendEntriesRequest, CommitIndexRequest, RpcResult};

/// Outcome of a propose call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposeOutcome {
    /// Committed and applied locally at `index` (or durably appended, in
    /// async-write mode).
    Ok { index: LogIndex },
    /// This node is not the leader; retry against the hint if present.
    NotLeader { leader_hint: Option<ServerId> },
    /// The quorum wait expired. The entry may still commit later, so the
    /// caller must retry idempotently.
    Timeout,
}

impl RaftNode {
    /// Propose a DATA payload. Shorthand for [`RaftNode::propose`].
    pub async fn propose_data(&self, payload: Vec<u8>) -> Result<ProposeOutcome> {
        self.propose(payload, EntryType::Data).await
    }

    /// Serialize a payload into the log, dispatch replication, and wait
    /// (bounded by `max_await_timeout`) until the entry applies locally.
    /// With `async_write` the call returns right after the durable local
    /// append.
    pub async fn propose(&self, payload: Vec<u8>, entry_type: EntryType) -> Result<ProposeOutcome> {
        let (index, term) = {
            let mut state = self.state.write().await;
            if state.role != RaftRole::Leader {
                return Ok(ProposeOutcome::NotLeader {
                    leader_hint: state.leader_id,
                });
            }
            let term = state.current_term;
            let mut log = self.log.write().await;
            let index = log.last_index() + 1;
            log.append(&[LogEntry::new(term, index, entry_type, payload)])?;
            drop(log);

            // A single-voter cluster commits on its own append.
            self.advance_commit(&mut state).await;
            (index, term)
        };
        self.wake_replicators().await;

        if self.options.async_write {
            return Ok(ProposeOutcome::Ok { index });
        }
        self.await_applied(index, term, self.options.max_await_timeout)
            .await
    }

    async fn await_applied(
        &self,
        index: LogIndex,
        term: Term,
        timeout: Duration,
    ) -> Result<ProposeOutcome> {
        let mut applied = self.applied_tx.subscribe();
        let waited =
            tokio::time::timeout(timeout, applied.wait_for(|current| *current >= index)).await;
        match waited {
            Ok(Ok(_)) => {
                // Confirm the applied entry is ours and was not overwritten
                // by a competing leader.
                let surviving_term = {
                    let log = self.log.read().await;
                    log.term_at(index)
                };
                match surviving_term {
                    Some(t) if t == term => Ok(ProposeOutcome::Ok { index }),
                    None => {
                        // Compacted away already; if leadership never moved,
                        // the entry was necessarily ours.
                        let state = self.state.read().await;
                        if state.role == RaftRole::Leader && state.current_term == term {
                            Ok(ProposeOutcome::Ok { index })
                        } else {
                            Ok(ProposeOutcome::NotLeader {
                                leader_hint: state.leader_id,
                            })
                        }
                    }
                    Some(_) => {
                        let state = self.state.read().await;
                        Ok(ProposeOutcome::NotLeader {
                            leader_hint: state.leader_id,
                        })
                    }
                }
            }
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Ok(ProposeOutcome::Timeout),
        }
    }

    /// Leader-side linearizable read barrier: capture the commit index,
    /// confirm leadership with a heartbeat round acknowledged by a
    /// majority, then wait until the applier catches up to the captured
    /// index. Returns that index.
    pub async fn read_index(&self) -> Result<LogIndex> {
        let deadline = Instant::now() + self.options.max_await_timeout;
        let (read_index, term, peers, quorum) = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader {
                    leader_hint: state.leader_id,
                });
            }
            let peers: Vec<Arc<Peer>> = state
                .configuration
                .servers
                .iter()
                .filter(|s| s.id != self.id())
                .filter_map(|s| state.peers.get(&s.id).cloned())
                .collect();
            (
                state.commit_index,
                state.current_term,
                peers,
                state.configuration.quorum_size(),
            )
        };

        if !self.confirm_leadership(term, &peers, quorum, deadline).await? {
            return Err(RaftError::QuorumTimeout);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut applied = self.applied_tx.subscribe();
        let outcome =
            tokio::time::timeout(remaining, applied.wait_for(|current| *current >= read_index))
                .await;
        match outcome {
            Ok(Ok(_)) => Ok(read_index),
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(RaftError::QuorumTimeout),
        }
    }

    /// Heartbeat every voter once and wait for a majority of
    /// acknowledgements of this term.
    async fn confirm_leadership(
        &self,
        term: Term,
        peers: &[Arc<Peer>],
        quorum: usize,
        deadline: Instant,
    ) -> Result<bool> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let commit = { self.state.read().await.commit_index };
            let log = self.log.read().await;
            for peer in peers {
                // Probe at the peer's match point; an empty batch there can
                // only be acknowledged or term-rejected, never conflict.
                let prev = peer.match_index();
                let prev_term = self.prev_term(&log, prev).unwrap_or(0);
                let request = AppendEntriesRequest {
                    term,
                    leader_id: self.id(),
                    prev_log_index: if prev_term == 0 { 0 } else { prev },
                    prev_log_term: prev_term,
                    entries: Vec::new(),
                    leader_commit: commit,
                };
                let tx = tx.clone();
                let peer = Arc::clone(peer);
                let permits = Arc::clone(&self.rpc_permits);
                let rpc_timeout = deadline.saturating_duration_since(Instant::now());
                tokio::spawn(async move {
                    let _permit = match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    let outcome =
                        tokio::time::timeout(rpc_timeout, peer.client.append_entries(request))
                            .await;
                    let _ = tx.send(outcome);
                });
            }
        }
        drop(tx);

        let mut acks = 1usize; // self
        loop {
            if acks >= quorum {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(Ok(Ok(response)))) => {
                    if response.term > term {
                        self.step_down(response.term).await;
                        return Err(RaftError::NotLeader { leader_hint: None });
                    }
                    if response.result != RpcResult::FailTerm {
                        acks += 1;
                    }
                }
                Ok(Some(Ok(Err(_)))) | Ok(Some(Err(_))) => {}
                Ok(None) => return Ok(acks >= quorum),
                Err(_) => return Ok(false),
            }
        }
    }

    /// Follower-side linearizable read barrier: fetch the leader's commit
    /// index, then wait until the local applier reaches it. Falls through
    /// to [`RaftNode::read_index`] when called on the leader itself.
    pub async fn wait_for_leader_commit_index(&self) -> Result<LogIndex> {
        let deadline = Instant::now() + self.options.max_await_timeout;
        let client = {
            let state = self.state.read().await;
            if state.role == RaftRole::Leader {
                drop(state);
                return self.read_index().await;
            }
            let leader_id = state.leader_id.ok_or(RaftError::NotLeader {
                leader_hint: None,
            })?;
            state
                .peers
                .get(&leader_id)
                .map(|peer| Arc::clone(&peer.client))
                .ok_or(RaftError::NotLeader {
                    leader_hint: Some(leader_id),
                })?
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let response = tokio::time::timeout(
            remaining,
            client.leader_commit_index(CommitIndexRequest::default()),
        )
        .await
        .map_err(|_| RaftError::QuorumTimeout)??;

        match response.result {
            RpcResult::Success => {
                let target = response.commit_index;
                let remaining = deadline.saturating_duration_since(Instant::now());
                let mut applied = self.applied_tx.subscribe();
                let outcome = tokio::time::timeout(
                    remaining,
                    applied.wait_for(|current| *current >= target),
                )
                .await;
                match outcome {
                    Ok(Ok(_)) => Ok(target),
                    Ok(Err(_)) => Err(RaftError::Shutdown),
                    Err(_) => Err(RaftError::QuorumTimeout),
                }
            }
            _ => Err(RaftError::NotLeader {
                leader_hint: response.leader_id,
            }),
        }
    }

    /// Best-known leader, for redirecting clients.
    pub async fn leader_hint(&self) -> Option<ServerId> {
        let state = self.state.read().await;
        state.leader_id
    }

    /// Whether this node currently believes it is the leader.
    pub async fn is_leader(&self) -> bool {
        let state = self.state.read().await;
        state.role == RaftRole::Leader
    }
}
