pub mod pb {
    tonic::include_proto!("raftfs");
}

mod config;
mod files;
mod machine;
mod node;
mod rpc;
mod storage;

pub use crate::config::{ClusterConfig, Member};
pub use crate::files::{ContentStore, FileCommand, FileMachine, FileRecord};
pub use crate::machine::{ApplyOutcome, MachineError, StateMachine};
pub use crate::node::{RaftNode, Role, HEARTBEAT_MS};
pub use crate::storage::{LogEntry, MAX_COMMAND};

use thiserror::Error;

/// Errors surfaced by the consensus core's public API.
///
/// Transport failures between nodes never show up here; the core absorbs
/// them and retries on the next heartbeat or election tick. Durable-log
/// I/O failures are fail-stop and abort the process instead.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The operation must be retried against the current leader.
    #[error("not the leader")]
    NotLeader,

    /// The command does not fit in one log entry slot.
    #[error("command is {0} bytes, entries hold at most {}", MAX_COMMAND)]
    CommandTooLarge(usize),

    /// The entry was dropped before commit (the node stopped, or a newer
    /// leader overwrote it).
    #[error("entry discarded before commit")]
    Discarded,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
