// End-to-end cluster scenarios over the in-process transport: elections,
// replication, partitions, reconciliation, snapshot install and
// membership changes.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use rusty_raft::rpc::memory::InMemoryNetwork;
use rusty_raft::{
    LogIndex, ProposeOutcome, RaftError, RaftNode, RaftOptions, RaftRole, Result, ServerId,
    ServerInfo, StateMachine,
};

/// State machine that records every applied payload in order, with full
/// snapshot support so installs can be compared against live members.
#[derive(Default)]
struct RecordingSm {
    applied: Mutex<Vec<Vec<u8>>>,
}

impl RecordingSm {
    fn applied(&self) -> Vec<Vec<u8>> {
        self.applied.lock().clone()
    }
}

impl StateMachine for RecordingSm {
    fn apply_data(&self, payload: &[u8]) -> Result<()> {
        self.applied.lock().push(payload.to_vec());
        Ok(())
    }

    fn write_snapshot(&self, data_dir: &Path, _last_applied: LogIndex) -> Result<()> {
        let applied = self.applied.lock().clone();
        let bytes = bincode::serde::encode_to_vec(&applied, bincode::config::standard())
            .map_err(|e| RaftError::Serialization(e.to_string()))?;
        std::fs::write(data_dir.join("history"), bytes)?;
        Ok(())
    }

    fn read_snapshot(&self, data_dir: &Path) -> Result<()> {
        let bytes = std::fs::read(data_dir.join("history"))?;
        let (applied, _): (Vec<Vec<u8>>, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| RaftError::Serialization(e.to_string()))?;
        *self.applied.lock() = applied;
        Ok(())
    }

    fn get(&self, _key: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

struct TestCluster {
    network: Arc<InMemoryNetwork>,
    servers: Vec<ServerInfo>,
    nodes: Vec<Option<Arc<RaftNode>>>,
    machines: Vec<Arc<RecordingSm>>,
    dirs: Vec<TempDir>,
}

impl TestCluster {
    async fn start(size: u32, tune: impl Fn(RaftOptions) -> RaftOptions) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let network = InMemoryNetwork::new();
        let servers: Vec<ServerInfo> = (1..=size)
            .map(|id| ServerInfo::new(id, "127.0.0.1", 7000 + id as u16))
            .collect();

        let mut nodes = Vec::new();
        let mut machines = Vec::new();
        let mut dirs = Vec::new();
        for server in &servers {
            let dir = TempDir::new().expect("temp dir");
            let machine = Arc::new(RecordingSm::default());
            let options = tune(base_options(dir.path()));
            let node = RaftNode::start(
                server.clone(),
                options,
                servers.clone(),
                Arc::clone(&machine) as Arc<dyn StateMachine>,
                network.transport(server.id),
            )
            .await
            .expect("node start");
            network.register(Arc::clone(&node));
            nodes.push(Some(node));
            machines.push(machine);
            dirs.push(dir);
        }

        Self {
            network,
            servers,
            nodes,
            machines,
            dirs,
        }
    }

    fn node(&self, id: ServerId) -> Arc<RaftNode> {
        self.nodes[id as usize - 1]
            .as_ref()
            .expect("node is running")
            .clone()
    }

    fn machine(&self, id: ServerId) -> Arc<RecordingSm> {
        Arc::clone(&self.machines[id as usize - 1])
    }

    fn running_ids(&self) -> Vec<ServerId> {
        self.nodes
            .iter()
            .flatten()
            .map(|node| node.id())
            .collect()
    }

    /// Stop a node the hard way: no goodbye to the cluster, calls to it
    /// fail like a dead host.
    async fn stop(&mut self, id: ServerId) {
        if let Some(node) = self.nodes[id as usize - 1].take() {
            self.network.unregister(id);
            node.shutdown().await;
        }
    }

    /// Restart a stopped node from its on-disk state, with a fresh state
    /// machine hydrated by recovery.
    async fn restart(&mut self, id: ServerId, tune: impl Fn(RaftOptions) -> RaftOptions) {
        let index = id as usize - 1;
        assert!(self.nodes[index].is_none(), "stop the node first");
        let machine = Arc::new(RecordingSm::default());
        let options = tune(base_options(self.dirs[index].path()));
        let node = RaftNode::start(
            self.servers[index].clone(),
            options,
            self.servers.clone(),
            Arc::clone(&machine) as Arc<dyn StateMachine>,
            self.network.transport(id),
        )
        .await
        .expect("node restart");
        self.network.register(Arc::clone(&node));
        self.nodes[index] = Some(node);
        self.machines[index] = machine;
    }

    async fn shutdown(&mut self) {
        for slot in &mut self.nodes {
            if let Some(node) = slot.take() {
                node.shutdown().await;
            }
        }
    }

    /// Wait until exactly one running node reports leadership and return it.
    async fn wait_for_leader(&self, timeout: Duration) -> Arc<RaftNode> {
        self.wait_for_leader_among(&self.running_ids(), timeout).await
    }

    async fn wait_for_leader_among(&self, ids: &[ServerId], timeout: Duration) -> Arc<RaftNode> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut leaders = Vec::new();
            for &id in ids {
                if let Some(node) = self.nodes[id as usize - 1].as_ref() {
                    if node.status().await.role == RaftRole::Leader {
                        leaders.push(Arc::clone(node));
                    }
                }
            }
            if leaders.len() == 1 {
                return leaders.remove(0);
            }
            assert!(
                Instant::now() < deadline,
                "no single leader within {:?} (saw {})",
                timeout,
                leaders.len()
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Wait until every running node has applied up to `index`.
    async fn wait_all_applied(&self, index: LogIndex, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let mut lagging = Vec::new();
            for &id in &self.running_ids() {
                let status = self.node(id).status().await;
                if status.last_applied < index {
                    lagging.push((id, status.last_applied));
                }
            }
            if lagging.is_empty() {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "nodes {:?} did not apply {} within {:?}",
                lagging,
                index,
                timeout
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

fn base_options(data_dir: &Path) -> RaftOptions {
    RaftOptions::new(data_dir)
        .with_vote_timeout(Duration::from_millis(300))
        .with_keep_alive_period(Duration::from_millis(50))
        .with_max_await_timeout(Duration::from_secs(3))
}

async fn propose_ok(node: &Arc<RaftNode>, payload: &[u8]) -> LogIndex {
    match node.propose_data(payload.to_vec()).await.expect("propose") {
        ProposeOutcome::Ok { index } => index,
        other => panic!("propose of {:?} failed: {:?}", payload, other),
    }
}

// S1: three nodes elect a leader and apply proposals in identical order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_happy_path() {
    let mut cluster = TestCluster::start(3, |o| o).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;

    let mut last_index = 0;
    for payload in [b"A".as_slice(), b"B".as_slice(), b"C".as_slice()] {
        last_index = propose_ok(&leader, payload).await;
        cluster
            .wait_all_applied(last_index, Duration::from_secs(3))
            .await;
    }

    for id in cluster.running_ids() {
        let status = cluster.node(id).status().await;
        assert_eq!(status.last_applied, last_index);
        assert_eq!(
            cluster.machine(id).applied(),
            vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()],
            "node {} applied a different sequence",
            id
        );
    }

    cluster.shutdown().await;
}

// S2: an isolated leader steps down in favor of a new one, and its
// uncommitted proposals are replaced by the new leader's log.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_isolation_and_reconciliation() {
    let mut cluster =
        TestCluster::start(3, |o| o.with_max_await_timeout(Duration::from_millis(800))).await;
    let old_leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
    let old_id = old_leader.id();

    propose_ok(&old_leader, b"committed").await;
    cluster.wait_all_applied(1, Duration::from_secs(3)).await;

    cluster.network.isolate(old_id);
    let followers: Vec<ServerId> = cluster
        .running_ids()
        .into_iter()
        .filter(|&id| id != old_id)
        .collect();
    let new_leader = cluster
        .wait_for_leader_among(&followers, Duration::from_secs(5))
        .await;

    // The stale leader cannot commit.
    let outcome = old_leader
        .propose_data(b"lost".to_vec())
        .await
        .expect("propose on stale leader");
    assert!(
        matches!(
            outcome,
            ProposeOutcome::Timeout | ProposeOutcome::NotLeader { .. }
        ),
        "stale leader must not commit, got {:?}",
        outcome
    );

    let x_index = propose_ok(&new_leader, b"X").await;

    cluster.network.heal_all();
    cluster
        .wait_all_applied(x_index, Duration::from_secs(5))
        .await;

    let old_status = cluster.node(old_id).status().await;
    assert_eq!(old_status.role, RaftRole::Follower, "old leader steps down");

    let expected = cluster.machine(new_leader.id()).applied();
    assert_eq!(
        cluster.machine(old_id).applied(),
        expected,
        "old leader must converge on the new leader's history"
    );
    assert_eq!(expected.last().unwrap(), &b"X".to_vec());

    cluster.shutdown().await;
}

// S3: a follower that was down while the log advanced is driven back to
// the leader's tail entry by entry.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_reconciliation_after_restart() {
    let mut cluster = TestCluster::start(3, |o| o).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;

    for i in 0..10u32 {
        propose_ok(&leader, format!("early-{}", i).as_bytes()).await;
    }
    cluster.wait_all_applied(10, Duration::from_secs(3)).await;

    let follower_id = cluster
        .running_ids()
        .into_iter()
        .find(|&id| id != leader.id())
        .unwrap();
    cluster.stop(follower_id).await;

    for i in 0..40u32 {
        propose_ok(&leader, format!("late-{}", i).as_bytes()).await;
    }
    let last = leader.status().await.last_log_index;
    assert_eq!(last, 50);

    cluster.restart(follower_id, |o| o).await;
    cluster.wait_all_applied(50, Duration::from_secs(10)).await;

    assert_eq!(
        cluster.machine(follower_id).applied(),
        cluster.machine(leader.id()).applied(),
        "restarted follower must match the leader byte for byte"
    );

    cluster.shutdown().await;
}

// S4: a tiny snapshot threshold forces compaction, and a fresh node added
// to the cluster is brought up via chunked snapshot install.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_compaction_and_install() {
    let tune = |o: RaftOptions| {
        o.with_max_segment_file_size(4 * 1024)
            .with_snapshot_min_log_size(2 * 1024)
            .with_backup_interval(Duration::from_millis(200))
            .with_max_snapshot_bytes_per_request(512)
            .with_catchup_margin(16)
            .with_max_await_timeout(Duration::from_secs(10))
    };
    let mut cluster = TestCluster::start(3, tune).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;

    let mut last = 0;
    for i in 0..300u32 {
        last = propose_ok(&leader, format!("entry-{:04}", i).as_bytes()).await;
    }
    cluster.wait_all_applied(last, Duration::from_secs(10)).await;

    // The snapshotter must kick in and truncate the prefix.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = leader.status().await;
        if status.first_log_index > 1 {
            break;
        }
        assert!(Instant::now() < deadline, "leader never compacted its log");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Bring up a fresh server and add it; it must arrive via snapshot.
    let new_server = ServerInfo::new(4, "127.0.0.1", 7004);
    let dir = TempDir::new().unwrap();
    let machine = Arc::new(RecordingSm::default());
    let node = RaftNode::start(
        new_server.clone(),
        tune(base_options(dir.path())),
        cluster.servers.clone(),
        Arc::clone(&machine) as Arc<dyn StateMachine>,
        cluster.network.transport(4),
    )
    .await
    .unwrap();
    cluster.network.register(Arc::clone(&node));
    cluster.servers.push(new_server.clone());
    cluster.nodes.push(Some(Arc::clone(&node)));
    cluster.machines.push(Arc::clone(&machine));
    cluster.dirs.push(dir);

    leader.add_server(new_server).await.expect("add server");

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if node.status().await.last_applied >= last {
            break;
        }
        assert!(Instant::now() < deadline, "new node never caught up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        machine.applied(),
        cluster.machine(leader.id()).applied(),
        "installed state must equal the leader's"
    );

    // Replication now includes the new member.
    let index = propose_ok(&leader, b"after-join").await;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if node.status().await.last_applied >= index {
            break;
        }
        assert!(Instant::now() < deadline, "new member missed a fresh entry");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    cluster.shutdown().await;
}

// S5: a partitioned follower's repeated election attempts must not bump
// the cluster term, thanks to pre-vote.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pre_vote_prevents_term_churn() {
    let mut cluster = TestCluster::start(3, |o| o).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;

    propose_ok(&leader, b"anchor").await;
    cluster.wait_all_applied(1, Duration::from_secs(3)).await;
    let settled_term = leader.status().await.current_term;

    let victim = cluster
        .running_ids()
        .into_iter()
        .find(|&id| id != leader.id())
        .unwrap();
    cluster.network.isolate(victim);

    // Many election timeouts worth of futile pre-voting.
    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(
        cluster.node(victim).status().await.current_term,
        settled_term,
        "pre-vote must keep the partitioned node's term pinned"
    );

    cluster.network.heal_all();
    tokio::time::sleep(Duration::from_millis(600)).await;

    for id in cluster.running_ids() {
        assert_eq!(
            cluster.node(id).status().await.current_term,
            settled_term,
            "healing the partition must not inflate the term"
        );
    }
    assert_eq!(leader.status().await.role, RaftRole::Leader);

    cluster.shutdown().await;
}

// S6: removing a member shrinks the quorum; the survivors keep making
// progress even with one more node down.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn membership_removal_shrinks_quorum() {
    let mut cluster =
        TestCluster::start(5, |o| o.with_max_await_timeout(Duration::from_secs(5))).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;

    let removed = cluster
        .running_ids()
        .into_iter()
        .rev()
        .find(|&id| id != leader.id())
        .unwrap();
    leader.remove_server(removed).await.expect("remove server");

    // The four remaining members converge on the new configuration.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut converged = true;
        for &id in &cluster.running_ids() {
            if id == removed {
                continue;
            }
            let config = cluster.node(id).status().await.configuration;
            if config.contains(removed) || config.servers.len() != 4 {
                converged = false;
            }
        }
        if converged {
            break;
        }
        assert!(Instant::now() < deadline, "configuration did not converge");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Quorum is now 3 of 4: progress must survive one more loss.
    let casualty = cluster
        .running_ids()
        .into_iter()
        .rev()
        .find(|&id| id != leader.id() && id != removed)
        .unwrap();
    cluster.stop(casualty).await;

    let index = propose_ok(&leader, b"post-removal").await;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut applied = 0;
        for &id in &cluster.running_ids() {
            if id == removed {
                continue;
            }
            if cluster.node(id).status().await.last_applied >= index {
                applied += 1;
            }
        }
        if applied >= 3 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "progress stalled after removal plus one crash"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cluster.shutdown().await;
}

// Round-trip property: every payload a successful propose acknowledged is
// readable through the linearizable read helpers on leader and follower.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_helpers_observe_acknowledged_writes() {
    let mut cluster = TestCluster::start(3, |o| o).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;

    let index = propose_ok(&leader, b"readable").await;

    let read = leader.read_index().await.expect("leader read barrier");
    assert!(read >= index);
    assert_eq!(
        cluster.machine(leader.id()).applied().last().unwrap(),
        &b"readable".to_vec()
    );

    let follower_id = cluster
        .running_ids()
        .into_iter()
        .find(|&id| id != leader.id())
        .unwrap();
    let follower = cluster.node(follower_id);
    let read = follower
        .wait_for_leader_commit_index()
        .await
        .expect("follower read barrier");
    assert!(read >= index);
    assert_eq!(
        cluster.machine(follower_id).applied().last().unwrap(),
        &b"readable".to_vec()
    );

    cluster.shutdown().await;
}
