//! Data structures describing the state of the command chain.
//!
//! `LifecycleState` is the observable state of the single in-flight chain,
//! and `ChainOutcome` reports how a chain run ended.

use std::fmt;

/// Lifecycle of the process currently owned by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No chain is in flight.
    Idle,
    /// A chain step is being spawned.
    Starting,
    /// A chain step is running with the given process id.
    Running { pid: u32 },
    /// A stop was requested and the running step is being torn down.
    Terminating,
}

/// How a chain run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every step exited successfully.
    Completed,
    /// A step exited with a failure status; later steps were skipped.
    Failed { command: String, code: Option<i32> },
    /// A step could not be spawned; later steps were skipped.
    SpawnFailed { command: String, error: String },
    /// The chain was stopped on request.
    Terminated,
}

impl fmt::Display for ChainOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed {
                command,
                code: Some(code),
            } => write!(f, "{} exited with code {}", command, code),
            Self::Failed { command, code: None } => write!(f, "{} failed", command),
            Self::SpawnFailed { command, error } => write!(f, "{} did not start: {}", command, error),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}
