// src/core/errors.rs

//! Defines the primary error type for the monitor.

use thiserror::Error;

/// The main error enum, representing all caller-visible failures of the
/// monitor operations. Using `thiserror` allows for clean error definitions
/// and automatic `From` trait implementations.
///
/// The group state machine itself never produces one of these: it only
/// declines to transition. All validation happens in the operation layer
/// before the state machine runs, so a returned error implies no state
/// mutation is visible.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StewardError {
    /// A concurrent membership change is in progress. This is a retryable
    /// condition, not a caller bug: back off and try again.
    #[error("Object in use: {0}")]
    ObjectInUse(String),

    /// A precondition on the current states of the group is not met. The
    /// message carries the current and expected states so the caller can
    /// act on it.
    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    /// An input value is out of range or infeasible given the current
    /// replication settings.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Formation \"{0}\" does not exist")]
    FormationNotFound(String),

    /// The node is not (or no longer) registered. A reporting agent seeing
    /// this must register again: its local identity is stale.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Internal monitor error: {0}")]
    Internal(String),
}

impl StewardError {
    /// Whether the caller should back off and retry the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StewardError::ObjectInUse(_))
    }
}
