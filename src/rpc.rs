// Re-export generated protobuf types
pub use crate::pb::{
    raft_client::RaftClient,
    raft_server::{Raft, RaftServer},
    AppendEntriesArgs, AppendEntriesReply, Entry, RequestVoteArgs, RequestVoteReply,
};

use crate::storage::LogEntry;

// Wire entries never carry the local result channel, so the outbound
// conversion borrows and the inbound one starts with no waiter.
impl From<&LogEntry> for Entry {
    fn from(entry: &LogEntry) -> Self {
        Entry {
            term: entry.term,
            command: entry.command.clone(),
        }
    }
}

impl From<Entry> for LogEntry {
    fn from(entry: Entry) -> Self {
        LogEntry {
            term: entry.term,
            command: entry.command,
            result: None,
        }
    }
}
