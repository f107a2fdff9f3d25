// Consensus Node
//
// The role state machine (Follower / PreCandidate / Candidate / Leader)
// and everything scheduled around it: election and heartbeat timing, the
// RPC handlers, the applier that feeds committed entries to the state
// machine, the periodic snapshotter, and membership changes.
//
// Locking discipline: one coarse state lock guards role, term, vote,
// commit bookkeeping and the peer map; the log has its own lock and is
// always taken after the state lock. No lock is ever held across a
// network call: callers snapshot what they need, release, send, then
// re-acquire and re-check `(term, role)` before trusting a response.

pub mod peer;
pub(crate) mod replication;

pub use peer::Peer;

use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;

use crate::config::RaftOptions;
use crate::error::{RaftError, Result};
use crate::log::{
    ClusterConfiguration, EntryType, LogIndex, SegmentedLog, ServerId, ServerInfo, Term,
};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, CommitIndexRequest, CommitIndexResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, RaftTransport, RpcResult, VoteRequest,
    VoteResponse,
};
use crate::snapshot::{SnapshotMeta, SnapshotStore};
use crate::state_machine::StateMachine;

/// Role in the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    /// Passively receives entries from the leader.
    Follower,
    /// Probing whether an election would succeed, without bumping the term.
    PreCandidate,
    /// Requesting votes for leadership.
    Candidate,
    /// Accepts proposals and drives replication.
    Leader,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RaftRole::Follower => "follower",
            RaftRole::PreCandidate => "pre-candidate",
            RaftRole::Candidate => "candidate",
            RaftRole::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a node, for operators and tests.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub id: ServerId,
    pub role: RaftRole,
    pub current_term: Term,
    pub leader_id: Option<ServerId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub first_log_index: LogIndex,
    pub last_log_index: LogIndex,
    pub configuration: ClusterConfiguration,
}

/// Mutable node state guarded by the single state lock.
pub(crate) struct NodeState {
    pub role: RaftRole,
    pub current_term: Term,
    pub voted_for: Option<ServerId>,
    pub leader_id: Option<ServerId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub configuration: ClusterConfiguration,
    /// Config members plus any learners still catching up.
    pub peers: HashMap<ServerId, Arc<Peer>>,
    /// Last time a live leader (or a granted vote) was observed.
    pub last_leader_contact: Instant,
    /// Current randomized election timeout draw.
    pub election_timeout: Duration,
}

/// State of a chunked snapshot install in progress.
struct InstallProgress {
    meta: SnapshotMeta,
    data_dir: PathBuf,
}

/// A member of a replicated state machine cluster.
pub struct RaftNode {
    id: ServerId,
    /// Self-handle for the background tasks this node spawns.
    self_ref: Weak<RaftNode>,
    pub(crate) options: RaftOptions,
    pub(crate) state: RwLock<NodeState>,
    pub(crate) log: RwLock<SegmentedLog>,
    pub(crate) snapshots: SnapshotStore,
    state_machine: Arc<dyn StateMachine>,
    transport: Arc<dyn RaftTransport>,
    /// Bounds concurrent outbound consensus RPCs.
    pub(crate) rpc_permits: Arc<Semaphore>,
    /// Signalled when `commit_index` advances.
    pub(crate) commit_notify: Notify,
    /// Signalled when a catching-up peer crosses the margin.
    pub(crate) sync_notify: Notify,
    /// Broadcasts `last_applied` advances to propose/read waiters.
    pub(crate) applied_tx: watch::Sender<LogIndex>,
    shutdown_tx: watch::Sender<bool>,
    pub(crate) tasks: SyncMutex<Vec<JoinHandle<()>>>,
    /// Serializes membership changes; one add/remove at a time.
    membership_lock: AsyncMutex<()>,
    /// Chunk accumulation state for an in-flight snapshot install.
    install: AsyncMutex<Option<InstallProgress>>,
}

impl RaftNode {
    /// Open persistent state, recover, and start the node's background
    /// tasks. `initial_servers` seeds the configuration only when neither
    /// the snapshot nor the log carries one.
    pub async fn start(
        local: ServerInfo,
        options: RaftOptions,
        initial_servers: Vec<ServerInfo>,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        fs::create_dir_all(&options.data_dir)?;

        let log = SegmentedLog::open(&options.log_dir(), options.max_segment_file_size)?;
        let snapshots = SnapshotStore::open(options.snapshot_dir(), options.snapshot_tmp_dir())?;

        let snap_meta = snapshots.current_meta();
        let meta = log.metadata().clone();

        if snapshots.has_snapshot() {
            state_machine.read_snapshot(&snapshots.data_dir())?;
        }
        let last_applied = snap_meta.last_included_index;
        let commit_index = meta.commit_index.max(last_applied);

        let configuration = Self::recover_configuration(&log, &snap_meta, initial_servers)?;
        if !configuration.contains(local.id) {
            tracing::warn!(
                id = local.id,
                "local server is not part of the recovered configuration"
            );
        }

        let (applied_tx, _) = watch::channel(last_applied);
        let (shutdown_tx, _) = watch::channel(false);

        let node = Arc::new_cyclic(|self_ref| Self {
            id: local.id,
            self_ref: self_ref.clone(),
            rpc_permits: Arc::new(Semaphore::new(options.consensus_thread_num)),
            state: RwLock::new(NodeState {
                role: RaftRole::Follower,
                current_term: meta.current_term,
                voted_for: meta.voted_for,
                leader_id: None,
                commit_index,
                last_applied,
                configuration,
                peers: HashMap::new(),
                last_leader_contact: Instant::now(),
                election_timeout: randomized_timeout(options.vote_timeout),
            }),
            options,
            log: RwLock::new(log),
            snapshots,
            state_machine,
            transport,
            commit_notify: Notify::new(),
            sync_notify: Notify::new(),
            applied_tx,
            shutdown_tx,
            tasks: SyncMutex::new(Vec::new()),
            membership_lock: AsyncMutex::new(()),
            install: AsyncMutex::new(None),
        });

        {
            let mut state = node.state.write().await;
            let servers = state.configuration.servers.clone();
            for server in servers {
                if server.id != node.id {
                    let client = node.transport.connect(&server);
                    state.peers.insert(server.id, Peer::new(server, client));
                }
            }
        }

        node.spawn_background();
        // Recovered commit index may be ahead of the applied index.
        node.commit_notify.notify_one();

        tracing::info!(
            id = node.id,
            term = meta.current_term,
            commit_index,
            last_applied,
            "node started"
        );
        Ok(node)
    }

    /// This node's server id.
    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn options(&self) -> &RaftOptions {
        &self.options
    }

    /// Current status snapshot.
    pub async fn status(&self) -> RaftStatus {
        let state = self.state.read().await;
        let log = self.log.read().await;
        RaftStatus {
            id: self.id,
            role: state.role,
            current_term: state.current_term,
            leader_id: state.leader_id,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            first_log_index: log.first_index(),
            last_log_index: log.last_index(),
            configuration: state.configuration.clone(),
        }
    }

    /// Stop timers, replicators and the applier, then persist final
    /// metadata. The node object is inert afterwards.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.commit_notify.notify_one();
        self.sync_notify.notify_waiters();
        {
            let state = self.state.read().await;
            for peer in state.peers.values() {
                peer.wake.notify_one();
            }
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let _ = futures::future::join_all(handles).await;

        let state = self.state.read().await;
        let mut log = self.log.write().await;
        let first = log.first_index();
        if let Err(e) = log.update_meta(
            state.current_term,
            state.voted_for,
            first,
            state.commit_index,
        ) {
            tracing::error!(error = %e, "failed to persist metadata on shutdown");
        }
        tracing::info!(id = self.id, "node stopped");
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    // ---- startup helpers ----------------------------------------------

    /// The active configuration is the newest CONFIGURATION entry in the
    /// log, else the snapshot's, else the host-supplied bootstrap list.
    fn recover_configuration(
        log: &SegmentedLog,
        snap_meta: &SnapshotMeta,
        initial_servers: Vec<ServerInfo>,
    ) -> Result<ClusterConfiguration> {
        let first = log.first_index();
        let last = log.last_index();
        let mut index = last;
        while index >= first && index > 0 {
            let entry = log.entry_at(index)?;
            if entry.entry_type == EntryType::Configuration {
                return ClusterConfiguration::decode(&entry.payload);
            }
            index -= 1;
        }
        if !snap_meta.configuration.is_empty() {
            return Ok(snap_meta.configuration.clone());
        }
        Ok(ClusterConfiguration::new(initial_servers))
    }

    fn spawn_background(&self) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };

        // Election ticker.
        {
            let node = Arc::clone(&this);
            let mut shutdown = self.shutdown_rx();
            let tick = (self.options.vote_timeout / 20).max(Duration::from_millis(10));
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        _ = interval.tick() => node.check_election_timeout().await,
                        _ = shutdown.changed() => break,
                    }
                }
            });
            self.tasks.lock().push(handle);
        }

        // Applier.
        {
            let node = Arc::clone(&this);
            let mut shutdown = self.shutdown_rx();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = node.commit_notify.notified() => {
                            if let Err(e) = node.apply_committed().await {
                                tracing::error!(error = %e, "apply loop failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            });
            self.tasks.lock().push(handle);
        }

        // Periodic snapshotter.
        {
            let node = Arc::clone(&this);
            let mut shutdown = self.shutdown_rx();
            let period = self.options.backup_interval;
            let handle = tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // the first tick fires immediately
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            match node.maybe_snapshot().await {
                                Ok(()) => {}
                                Err(RaftError::SnapshotBusy) => {}
                                Err(e) => tracing::error!(error = %e, "snapshot task failed"),
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            });
            self.tasks.lock().push(handle);
        }
    }

    // ---- elections -----------------------------------------------------

    async fn check_election_timeout(&self) {
        let due = {
            let state = self.state.read().await;
            state.role != RaftRole::Leader
                && state.configuration.contains(self.id)
                && state.last_leader_contact.elapsed() >= state.election_timeout
        };
        if due {
            self.run_election_round().await;
        }
    }

    /// One full election round: pre-vote probe, then (on a majority of
    /// pre-grants) a real election in the next term.
    async fn run_election_round(&self) {
        let Some((proposed_term, last_log_index, last_log_term, voters, quorum)) = ({
            let mut state = self.state.write().await;
            if state.role == RaftRole::Leader {
                None
            } else {
                state.role = RaftRole::PreCandidate;
                state.leader_id = None;
                state.last_leader_contact = Instant::now();
                state.election_timeout = randomized_timeout(self.options.vote_timeout);
                for peer in state.peers.values() {
                    peer.clear_vote();
                }
                let log = self.log.read().await;
                let (lli, llt) = self.last_log_id(&log);
                let voters = self.voter_peers(&state);
                Some((
                    state.current_term + 1,
                    lli,
                    llt,
                    voters,
                    state.configuration.quorum_size(),
                ))
            }
        }) else {
            return;
        };

        tracing::debug!(id = self.id, term = proposed_term, "starting pre-vote");
        let pre_granted = self
            .collect_votes(proposed_term, last_log_index, last_log_term, &voters, quorum, true)
            .await;
        if !pre_granted {
            let mut state = self.state.write().await;
            if state.role == RaftRole::PreCandidate {
                state.role = RaftRole::Follower;
            }
            return;
        }

        // Promote to candidate: bump the term and persist the self-vote
        // before any request reveals it.
        {
            let mut state = self.state.write().await;
            if state.role != RaftRole::PreCandidate || state.current_term + 1 != proposed_term {
                return;
            }
            state.role = RaftRole::Candidate;
            state.current_term = proposed_term;
            state.voted_for = Some(self.id);
            for peer in state.peers.values() {
                peer.clear_vote();
            }
            let mut log = self.log.write().await;
            let first = log.first_index();
            if let Err(e) =
                log.update_meta(proposed_term, Some(self.id), first, state.commit_index)
            {
                tracing::error!(error = %e, "failed to persist vote, aborting election");
                state.role = RaftRole::Follower;
                return;
            }
        }
        tracing::info!(id = self.id, term = proposed_term, "starting election");

        let granted = self
            .collect_votes(proposed_term, last_log_index, last_log_term, &voters, quorum, false)
            .await;
        if granted {
            self.become_leader(proposed_term).await;
        } else {
            let mut state = self.state.write().await;
            if state.role == RaftRole::Candidate && state.current_term == proposed_term {
                state.role = RaftRole::Follower;
            }
        }
    }

    /// Fan a vote (or pre-vote) request out to the voters and count
    /// grants, self included. Returns once a majority is reached, every
    /// voter answered, or the round timed out.
    async fn collect_votes(
        &self,
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
        voters: &[Arc<Peer>],
        quorum: usize,
        pre_vote: bool,
    ) -> bool {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for peer in voters {
            let tx = tx.clone();
            let peer = Arc::clone(peer);
            let permits = Arc::clone(&self.rpc_permits);
            let request = VoteRequest {
                term,
                candidate_id: self.id,
                last_log_index,
                last_log_term,
                pre_vote,
            };
            let rpc_timeout = self.options.vote_timeout;
            tokio::spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let result =
                    tokio::time::timeout(rpc_timeout, peer.client.request_vote(request)).await;
                let flattened = match result {
                    Ok(inner) => inner,
                    Err(_) => Err(RaftError::Network("vote request timed out".to_string())),
                };
                let _ = tx.send((peer, flattened));
            });
        }
        drop(tx);

        let mut granted = 1usize; // our own vote
        let deadline = Instant::now() + self.options.vote_timeout;
        loop {
            if granted >= quorum {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some((peer, Ok(response)))) => {
                    // Discard responses that arrive after the round moved on.
                    let round_live = {
                        let state = self.state.read().await;
                        if pre_vote {
                            state.role == RaftRole::PreCandidate
                                && state.current_term + 1 == term
                        } else {
                            state.role == RaftRole::Candidate && state.current_term == term
                        }
                    };
                    if !round_live {
                        return false;
                    }
                    if response.term > term {
                        self.step_down(response.term).await;
                        return false;
                    }
                    peer.set_vote_granted(response.vote_granted);
                    if response.vote_granted {
                        granted += 1;
                    }
                }
                Ok(Some((peer, Err(e)))) => {
                    tracing::debug!(peer = peer.id(), error = %e, "vote request failed");
                }
                Ok(None) => return granted >= quorum,
                Err(_) => return false,
            }
        }
    }

    async fn become_leader(&self, term: Term) {
        let mut state = self.state.write().await;
        if state.role != RaftRole::Candidate || state.current_term != term {
            return;
        }
        state.role = RaftRole::Leader;
        state.leader_id = Some(self.id);

        let last = { self.log.read().await.last_index() };
        tracing::info!(id = self.id, term, last_log_index = last, "won election");

        for peer in state.peers.values() {
            peer.reset_cursor(last);
            peer.set_caught_up(true);
        }
        let peers: Vec<Arc<Peer>> = state.peers.values().cloned().collect();
        drop(state);
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        for peer in peers {
            replication::spawn_replicator(Arc::clone(&this), peer, term);
        }
    }

    /// Revert to follower, adopting `new_term` when it is newer. A stale
    /// `new_term` is logged and ignored; late responses land here after
    /// the term has already moved on.
    pub(crate) async fn step_down_locked(&self, state: &mut NodeState, new_term: Term) {
        if new_term < state.current_term {
            tracing::debug!(
                observed = new_term,
                local = state.current_term,
                "ignoring stale step-down"
            );
            return;
        }
        if new_term > state.current_term {
            state.current_term = new_term;
            state.voted_for = None;
            state.leader_id = None;
            let mut log = self.log.write().await;
            let first = log.first_index();
            if let Err(e) = log.update_meta(new_term, None, first, state.commit_index) {
                tracing::error!(error = %e, "failed to persist term during step-down");
            }
        }
        if state.role != RaftRole::Follower {
            tracing::info!(id = self.id, term = state.current_term, "stepping down");
            state.role = RaftRole::Follower;
        }
        state.last_leader_contact = Instant::now();
        state.election_timeout = randomized_timeout(self.options.vote_timeout);
    }

    pub(crate) async fn step_down(&self, new_term: Term) {
        let mut state = self.state.write().await;
        self.step_down_locked(&mut state, new_term).await;
    }

    // ---- RPC handlers --------------------------------------------------

    /// RequestVote / PreVote handler.
    pub async fn handle_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        if request.pre_vote {
            return self.handle_pre_vote(request).await;
        }

        let mut state = self.state.write().await;
        if request.term > state.current_term {
            self.step_down_locked(&mut state, request.term).await;
        }
        if request.term < state.current_term {
            return Ok(VoteResponse {
                term: state.current_term,
                vote_granted: false,
            });
        }

        let can_vote =
            state.voted_for.is_none() || state.voted_for == Some(request.candidate_id);
        let (last_log_index, last_log_term) = {
            let log = self.log.read().await;
            self.last_log_id(&log)
        };
        let log_ok = request.last_log_term > last_log_term
            || (request.last_log_term == last_log_term
                && request.last_log_index >= last_log_index);

        let mut granted = false;
        if can_vote && log_ok {
            state.voted_for = Some(request.candidate_id);
            let mut log = self.log.write().await;
            let first = log.first_index();
            log.update_meta(
                state.current_term,
                state.voted_for,
                first,
                state.commit_index,
            )?;
            // Granting a vote counts as leader activity for timeout purposes.
            state.last_leader_contact = Instant::now();
            state.election_timeout = randomized_timeout(self.options.vote_timeout);
            granted = true;
            tracing::debug!(
                id = self.id,
                candidate = request.candidate_id,
                term = state.current_term,
                "vote granted"
            );
        }
        Ok(VoteResponse {
            term: state.current_term,
            vote_granted: granted,
        })
    }

    /// Answer the hypothetical "would you vote for me?" without touching
    /// persistent state or the election timer.
    async fn handle_pre_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let state = self.state.read().await;

        // Leader stickiness: a node in live contact with a leader refuses
        // pre-votes, so a rejoining partitioned node cannot inflate terms.
        if state.leader_id.is_some()
            && state.last_leader_contact.elapsed() < self.options.vote_timeout
        {
            return Ok(VoteResponse {
                term: state.current_term,
                vote_granted: false,
            });
        }
        if request.term < state.current_term {
            return Ok(VoteResponse {
                term: state.current_term,
                vote_granted: false,
            });
        }

        let (last_log_index, last_log_term) = {
            let log = self.log.read().await;
            self.last_log_id(&log)
        };
        let log_ok = request.last_log_term > last_log_term
            || (request.last_log_term == last_log_term
                && request.last_log_index >= last_log_index);
        Ok(VoteResponse {
            term: state.current_term,
            vote_granted: log_ok,
        })
    }

    /// AppendEntries handler: heartbeat, log replication and conflict
    /// resolution in one place.
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut state = self.state.write().await;
        if request.term > state.current_term {
            self.step_down_locked(&mut state, request.term).await;
        }
        if request.term < state.current_term {
            return Ok(AppendEntriesResponse {
                term: state.current_term,
                result: RpcResult::FailTerm,
                last_log_index: 0,
            });
        }

        // A live leader for this term.
        if state.role == RaftRole::PreCandidate || state.role == RaftRole::Candidate {
            state.role = RaftRole::Follower;
        }
        state.leader_id = Some(request.leader_id);
        state.last_leader_contact = Instant::now();

        let mut log = self.log.write().await;

        // Consistency check on the entry preceding the batch.
        if request.prev_log_index > 0 {
            let last = log.last_index();
            let hint = last.min(request.prev_log_index.saturating_sub(1));
            let snap = self.snapshots.current_meta();
            let local_prev_term = if request.prev_log_index == snap.last_included_index {
                Some(snap.last_included_term)
            } else if request.prev_log_index < log.first_index() {
                // Below our snapshot: those entries are committed and
                // therefore match the leader's.
                Some(request.prev_log_term)
            } else {
                log.term_at(request.prev_log_index)
            };
            match local_prev_term {
                Some(term) if term == request.prev_log_term => {}
                _ => {
                    return Ok(AppendEntriesResponse {
                        term: state.current_term,
                        result: RpcResult::FailLogMismatch,
                        last_log_index: hint,
                    });
                }
            }
        }

        // Skip entries we already hold; truncate at the first conflict.
        let first = log.first_index();
        let mut append_from = None;
        for (i, entry) in request.entries.iter().enumerate() {
            if entry.index < first {
                continue;
            }
            if entry.index > log.last_index() {
                append_from = Some(i);
                break;
            }
            if log.term_at(entry.index) != Some(entry.term) {
                tracing::warn!(
                    id = self.id,
                    index = entry.index,
                    "conflicting entry, truncating suffix"
                );
                log.truncate_suffix(entry.index - 1)?;
                append_from = Some(i);
                break;
            }
        }
        if let Some(i) = append_from {
            log.append(&request.entries[i..])?;
        }

        let last_new_entry = request.prev_log_index + request.entries.len() as u64;
        if request.leader_commit > state.commit_index {
            let new_commit = request
                .leader_commit
                .min(last_new_entry.max(state.commit_index))
                .min(log.last_index());
            if new_commit > state.commit_index {
                state.commit_index = new_commit;
                self.commit_notify.notify_one();
            }
        }

        Ok(AppendEntriesResponse {
            term: state.current_term,
            result: RpcResult::Success,
            last_log_index: log.last_index(),
        })
    }

    /// InstallSnapshot handler. Chunks accumulate in the staging dir; the
    /// final chunk swaps the snapshot in, truncates the log and resets the
    /// state machine.
    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let term = {
            let mut state = self.state.write().await;
            if request.term > state.current_term {
                self.step_down_locked(&mut state, request.term).await;
            }
            if request.term < state.current_term {
                return Ok(InstallSnapshotResponse {
                    term: state.current_term,
                    result: RpcResult::FailTerm,
                });
            }
            if state.role == RaftRole::PreCandidate || state.role == RaftRole::Candidate {
                state.role = RaftRole::Follower;
            }
            state.leader_id = Some(request.leader_id);
            state.last_leader_contact = Instant::now();
            state.current_term
        };

        let mut install = self.install.lock().await;

        if request.is_first {
            if install.is_some() {
                // A previous stream died mid-way; restart cleanly.
                *install = None;
                self.snapshots.end_install();
            }
            if !self.snapshots.try_begin_install() {
                return Err(RaftError::SnapshotBusy);
            }
            let meta = match request.meta.clone() {
                Some(meta) => meta,
                None => {
                    self.snapshots.end_install();
                    return Err(RaftError::InvalidOperation(
                        "first snapshot chunk carries no metadata".to_string(),
                    ));
                }
            };
            let data_dir = match self.snapshots.begin_write() {
                Ok(dir) => dir,
                Err(e) => {
                    self.snapshots.end_install();
                    return Err(e);
                }
            };
            tracing::info!(
                id = self.id,
                last_included_index = meta.last_included_index,
                "receiving snapshot"
            );
            *install = Some(InstallProgress { meta, data_dir });
        }

        let progress = match install.as_ref() {
            Some(progress) => progress,
            None => {
                return Err(RaftError::InvalidOperation(
                    "snapshot chunk received without a first chunk".to_string(),
                ));
            }
        };

        if let Err(e) = write_snapshot_chunk(progress, &request) {
            *install = None;
            self.snapshots.end_install();
            return Err(e);
        }

        if request.is_last {
            if let Some(progress) = install.take() {
                let result = self.finish_snapshot_install(progress).await;
                self.snapshots.end_install();
                result?;
            }
        }

        Ok(InstallSnapshotResponse {
            term,
            result: RpcResult::Success,
        })
    }

    async fn finish_snapshot_install(&self, progress: InstallProgress) -> Result<()> {
        let meta = progress.meta;
        self.snapshots.commit(meta.clone())?;

        let mut state = self.state.write().await;
        let mut log = self.log.write().await;

        // Keep the log tail when it agrees with the snapshot boundary,
        // otherwise discard the whole log.
        if log.term_at(meta.last_included_index) == Some(meta.last_included_term) {
            log.truncate_prefix(meta.last_included_index + 1)?;
        } else {
            log.reset(meta.last_included_index + 1)?;
        }

        self.state_machine.read_snapshot(&self.snapshots.data_dir())?;
        state.commit_index = state.commit_index.max(meta.last_included_index);
        state.last_applied = meta.last_included_index;
        self.applied_tx.send_replace(state.last_applied);
        self.install_configuration_locked(&mut state, meta.configuration.clone())
            .await;

        let first = log.first_index();
        log.update_meta(
            state.current_term,
            state.voted_for,
            first,
            state.commit_index,
        )?;
        tracing::info!(
            id = self.id,
            last_included_index = meta.last_included_index,
            "snapshot installed"
        );
        Ok(())
    }

    /// GetLeaderCommitIndex handler, the follower read-path probe.
    pub async fn handle_commit_index(
        &self,
        _request: CommitIndexRequest,
    ) -> Result<CommitIndexResponse> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Ok(CommitIndexResponse {
                term: state.current_term,
                result: RpcResult::Success,
                leader_id: Some(self.id),
                commit_index: state.commit_index,
            })
        } else {
            Ok(CommitIndexResponse {
                term: state.current_term,
                result: RpcResult::FailNotLeader,
                leader_id: state.leader_id,
                commit_index: state.commit_index,
            })
        }
    }

    // ---- applier -------------------------------------------------------

    /// Apply entries in `(last_applied, commit_index]` in order, handing
    /// DATA payloads to the state machine and installing CONFIGURATION
    /// entries into the peer map.
    async fn apply_committed(&self) -> Result<()> {
        loop {
            let (next, commit) = {
                let state = self.state.read().await;
                (state.last_applied + 1, state.commit_index)
            };
            if next > commit {
                return Ok(());
            }

            let entry = {
                let log = self.log.read().await;
                match log.entry_at(next) {
                    Ok(entry) => entry,
                    // A concurrent snapshot install moved the floor; the
                    // next pass re-reads the indices.
                    Err(RaftError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            };

            match entry.entry_type {
                EntryType::Data => self.state_machine.apply_data(&entry.payload)?,
                EntryType::Configuration => {
                    let config = ClusterConfiguration::decode(&entry.payload)?;
                    let mut state = self.state.write().await;
                    self.install_configuration_locked(&mut state, config).await;
                }
            }

            let mut state = self.state.write().await;
            if state.last_applied < next {
                state.last_applied = next;
                self.applied_tx.send_replace(next);
            }
        }
    }

    /// Swap in a newly applied (or snapshot-carried) configuration:
    /// connect peers that joined, tear down peers that left.
    pub(crate) async fn install_configuration_locked(
        &self,
        state: &mut NodeState,
        config: ClusterConfiguration,
    ) {
        let old = std::mem::replace(&mut state.configuration, config.clone());

        for server in &config.servers {
            if server.id == self.id || state.peers.contains_key(&server.id) {
                continue;
            }
            let client = self.transport.connect(server);
            let peer = Peer::new(server.clone(), client);
            if state.role == RaftRole::Leader {
                let last = { self.log.read().await.last_index() };
                peer.reset_cursor(last);
                if let Some(this) = self.self_ref.upgrade() {
                    replication::spawn_replicator(this, Arc::clone(&peer), state.current_term);
                }
            }
            state.peers.insert(server.id, peer);
        }

        for server in &old.servers {
            if server.id != self.id && !config.contains(server.id) {
                if let Some(peer) = state.peers.remove(&server.id) {
                    // The replicator notices the missing record and exits,
                    // dropping the RPC handle with the peer.
                    peer.wake.notify_one();
                    tracing::info!(id = self.id, peer = server.id, "peer removed");
                }
            }
        }

        if old != config {
            tracing::info!(
                id = self.id,
                servers = ?config.ids(),
                "configuration installed"
            );
        }
    }

    // ---- membership ----------------------------------------------------

    /// Add one server to the cluster. The newcomer first replicates as a
    /// non-voting learner; once its lag is within `catchup_margin` the
    /// CONFIGURATION entry is proposed, and the server votes from the
    /// moment that entry applies.
    pub async fn add_server(&self, server: ServerInfo) -> Result<()> {
        let _guard = self.membership_lock.lock().await;
        let deadline = Instant::now() + self.options.max_await_timeout;

        let peer = {
            let mut state = self.state.write().await;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader {
                    leader_hint: state.leader_id,
                });
            }
            if server.id == self.id || state.configuration.contains(server.id) {
                return Err(RaftError::AlreadyExists(format!("server {}", server.id)));
            }
            if state.peers.contains_key(&server.id) {
                return Err(RaftError::AlreadyExists(format!(
                    "server {} is already joining",
                    server.id
                )));
            }
            let client = self.transport.connect(&server);
            let peer = Peer::new(server.clone(), client);
            let last = { self.log.read().await.last_index() };
            peer.reset_cursor(last);
            peer.set_caught_up(false);
            state.peers.insert(server.id, Arc::clone(&peer));
            if let Some(this) = self.self_ref.upgrade() {
                replication::spawn_replicator(this, Arc::clone(&peer), state.current_term);
            }
            peer
        };
        tracing::info!(id = self.id, peer = server.id, "catching up new server");

        while !peer.caught_up() {
            {
                let state = self.state.read().await;
                if state.role != RaftRole::Leader {
                    drop(state);
                    self.abandon_learner(server.id).await;
                    return Err(RaftError::NotLeader { leader_hint: None });
                }
            }
            if Instant::now() >= deadline {
                self.abandon_learner(server.id).await;
                return Err(RaftError::QuorumTimeout);
            }
            let wait = deadline
                .saturating_duration_since(Instant::now())
                .min(self.options.keep_alive_period);
            tokio::select! {
                _ = self.sync_notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let new_config = {
            let state = self.state.read().await;
            state.configuration.with_server(server.clone())
        };
        match self
            .propose(new_config.encode()?, EntryType::Configuration)
            .await?
        {
            crate::client::ProposeOutcome::Ok { .. } => Ok(()),
            crate::client::ProposeOutcome::NotLeader { leader_hint } => {
                self.abandon_learner(server.id).await;
                Err(RaftError::NotLeader { leader_hint })
            }
            // The entry may still commit; the learner stays either way.
            crate::client::ProposeOutcome::Timeout => Err(RaftError::QuorumTimeout),
        }
    }

    async fn abandon_learner(&self, id: ServerId) {
        let mut state = self.state.write().await;
        if !state.configuration.contains(id) {
            if let Some(peer) = state.peers.remove(&id) {
                peer.wake.notify_one();
            }
        }
    }

    /// Remove one server. Its peer record and RPC handle are torn down
    /// when the CONFIGURATION entry applies; quorum shrinks accordingly.
    pub async fn remove_server(&self, id: ServerId) -> Result<()> {
        let _guard = self.membership_lock.lock().await;
        let new_config = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader {
                    leader_hint: state.leader_id,
                });
            }
            if id == self.id {
                return Err(RaftError::InvalidOperation(
                    "a leader cannot remove itself".to_string(),
                ));
            }
            if !state.configuration.contains(id) {
                return Err(RaftError::NotFound(format!("server {}", id)));
            }
            state.configuration.without_server(id)
        };
        match self
            .propose(new_config.encode()?, EntryType::Configuration)
            .await?
        {
            crate::client::ProposeOutcome::Ok { .. } => Ok(()),
            crate::client::ProposeOutcome::NotLeader { leader_hint } => {
                Err(RaftError::NotLeader { leader_hint })
            }
            crate::client::ProposeOutcome::Timeout => Err(RaftError::QuorumTimeout),
        }
    }

    // ---- snapshotting --------------------------------------------------

    /// Evaluate the snapshot trigger and take one when due.
    pub async fn maybe_snapshot(&self) -> Result<()> {
        let (last_applied, log_size) = {
            let state = self.state.read().await;
            let log = self.log.read().await;
            (state.last_applied, log.total_size())
        };
        let snap = self.snapshots.current_meta();
        if log_size < self.options.snapshot_min_log_size
            || last_applied <= snap.last_included_index
        {
            return Ok(());
        }

        if !self.snapshots.try_begin_snapshot() {
            return Err(RaftError::SnapshotBusy);
        }
        let result = self.take_snapshot().await;
        self.snapshots.end_snapshot();
        result
    }

    async fn take_snapshot(&self) -> Result<()> {
        // Holding the state lock (read) keeps the applier parked, so the
        // serialized state matches `last_applied` exactly.
        let (last_applied, term, configuration) = {
            let state = self.state.read().await;
            let last_applied = state.last_applied;
            let log = self.log.read().await;
            let term = match self.prev_term(&log, last_applied) {
                Some(term) => term,
                None => {
                    return Err(RaftError::InvalidOperation(format!(
                        "term of applied index {} is unknown",
                        last_applied
                    )));
                }
            };
            drop(log);

            let data_dir = self.snapshots.begin_write()?;
            self.state_machine.write_snapshot(&data_dir, last_applied)?;
            (last_applied, term, state.configuration.clone())
        };

        self.snapshots.commit(SnapshotMeta {
            last_included_index: last_applied,
            last_included_term: term,
            configuration,
        })?;

        let state = self.state.read().await;
        let mut log = self.log.write().await;
        log.truncate_prefix(last_applied + 1)?;
        log.update_meta(
            state.current_term,
            state.voted_for,
            last_applied + 1,
            state.commit_index,
        )?;
        tracing::info!(
            id = self.id,
            last_included_index = last_applied,
            "log compacted behind snapshot"
        );
        Ok(())
    }

    // ---- shared helpers ------------------------------------------------

    /// `(index, term)` of the last log entry, falling back to the snapshot
    /// boundary when the log is empty.
    pub(crate) fn last_log_id(&self, log: &SegmentedLog) -> (LogIndex, Term) {
        let last = log.last_index();
        match log.last_term() {
            Some(term) => (last, term),
            None => {
                let snap = self.snapshots.current_meta();
                (last, snap.last_included_term)
            }
        }
    }

    /// Term of `index` from the log or the snapshot boundary; index 0 has
    /// term 0 by definition.
    pub(crate) fn prev_term(&self, log: &SegmentedLog, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if let Some(term) = log.term_at(index) {
            return Some(term);
        }
        let snap = self.snapshots.current_meta();
        if snap.last_included_index == index {
            return Some(snap.last_included_term);
        }
        None
    }

    /// Peer records of the current configuration's voters (self excluded).
    fn voter_peers(&self, state: &NodeState) -> Vec<Arc<Peer>> {
        state
            .configuration
            .servers
            .iter()
            .filter(|s| s.id != self.id)
            .filter_map(|s| state.peers.get(&s.id).cloned())
            .collect()
    }

    /// Wake every replicator ahead of its next heartbeat tick.
    pub(crate) async fn wake_replicators(&self) {
        let state = self.state.read().await;
        for peer in state.peers.values() {
            peer.wake.notify_one();
        }
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        // Idempotent; a no-op after shutdown().
        let _ = self.shutdown_tx.send(true);
    }
}

fn write_snapshot_chunk(progress: &InstallProgress, request: &InstallSnapshotRequest) -> Result<()> {
    if request.file_name.is_empty() {
        // Placeholder chunk of a data-less snapshot.
        return Ok(());
    }
    if request.file_name.contains('/') || request.file_name.contains('\\') {
        return Err(RaftError::Corruption(format!(
            "snapshot chunk file name {:?} contains a path separator",
            request.file_name
        )));
    }

    use std::io::{Seek, SeekFrom, Write};
    let path = progress.data_dir.join(&request.file_name);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    file.seek(SeekFrom::Start(request.offset))?;
    file.write_all(&request.data)?;
    file.sync_data()?;
    Ok(())
}

/// Uniform random draw over `[base, 2 * base]`, the spread that keeps
/// split votes unlikely.
fn randomized_timeout(base: Duration) -> Duration {
    let extra = rand::rng().random_range(0..=base.as_millis() as u64);
    base + Duration::from_millis(extra)
}
