use thiserror::Error;

/// Error a state machine may report for a single committed command.
///
/// These are delivered to the waiting client through the entry's result
/// channel and never block commit or the application of later entries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("unknown command tag {0}")]
    UnknownCommand(u8),

    #[error("malformed command: {0}")]
    Malformed(String),

    #[error("state machine i/o: {0}")]
    Io(String),
}

/// Outcome of applying one committed command.
pub type ApplyOutcome = Result<Vec<u8>, MachineError>;

/// A replicated state machine fed by the consensus core.
///
/// `apply` is invoked serially from a single applier path, in log order,
/// exactly once per committed entry. Implementations may assume no
/// concurrent invocations but must keep any derived state they expose
/// (listings, lookups) safe against concurrent readers.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, command: &[u8]) -> ApplyOutcome;
}
