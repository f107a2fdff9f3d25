// RustyRaft - Raft-based replicated state machine engine
// Core library module
//
// A cluster member is a `RaftNode` wired to three host-provided pieces: a
// data directory (segmented log + snapshots), a `StateMachine` that
// interprets committed payloads, and a `RaftTransport` that carries the
// typed RPC messages. Elections with pre-vote, batched replication,
// snapshot streaming, single-server membership changes and the
// linearizable read helpers all live behind that node handle.

pub mod client;
pub mod config;
pub mod error;
pub mod log;
pub mod node;
pub mod rpc;
pub mod snapshot;
pub mod state_machine;

pub use client::ProposeOutcome;
pub use config::RaftOptions;
pub use error::{RaftError, Result};
pub use log::{
    ClusterConfiguration, EntryType, LogEntry, LogIndex, SegmentedLog, ServerId, ServerInfo, Term,
};
pub use node::{RaftNode, RaftRole, RaftStatus};
pub use rpc::{RaftClient, RaftTransport};
pub use snapshot::{SnapshotMeta, SnapshotStore};
pub use state_machine::{KvCommand, MemoryKv, StateMachine};
