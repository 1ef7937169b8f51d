use std::time::Duration;

use thiserror::Error;

/// Conditions after which the safepoint state can no longer be trusted.
///
/// None of these are recoverable: they are handed to
/// [`VirtualMachine::fatal`](crate::VirtualMachine::fatal), which never returns.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// A collaborator used the nexus incorrectly, e.g. released a lock it
    /// does not own.
    #[error("protocol misuse: {message}: id: {thread}")]
    ProtocolMisuse { thread: u32, message: String },

    /// A blocking wait accumulated more than the configured ceiling.
    ///
    /// `thread` is the thread that would not yield, or `None` when the
    /// process-critical lock could not be acquired.
    #[error("deadlock: {reason} after {elapsed:?} (limit {limit:?})")]
    Deadlock {
        thread: Option<u32>,
        reason: String,
        elapsed: Duration,
        limit: Duration,
    },

    /// The thread id counter wrapped around.
    #[error("exceeded maximum number of threads (last id: {last_id})")]
    CapacityExhausted { last_id: u32 },
}

impl FatalError {
    pub fn protocol_misuse(thread: u32, message: impl Into<String>) -> Self {
        Self::ProtocolMisuse {
            thread,
            message: message.into(),
        }
    }

    pub fn will_not_yield(id: u32, name: &str, elapsed: Duration, limit: Duration) -> Self {
        Self::Deadlock {
            thread: Some(id),
            reason: format!("thread will not yield: {name} (id: {id})"),
            elapsed,
            limit,
        }
    }

    pub fn unable_to_lock(elapsed: Duration, limit: Duration) -> Self {
        Self::Deadlock {
            thread: None,
            reason: "unable to lock, possible deadlock".to_string(),
            elapsed,
            limit,
        }
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock { .. })
    }
}
