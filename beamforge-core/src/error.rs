//! Error taxonomy for the orchestration core
//!
//! Caller mistakes (bad arguments, wrong lifecycle state, no free slot) are
//! recoverable by the caller. Configuration errors, broken internal invariants
//! and compute-step failures are fatal for the request or step they hit.

use std::sync::Arc;

use thiserror::Error;

use crate::request::RequestId;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed caller input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted in the wrong lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Every batch slot is held by another request
    #[error("no free batch slot: all {max_batch_size} slots are in use")]
    NoCapacity { max_batch_size: usize },

    /// Beam width over the hard limit, missing buffer for an enabled feature, ...
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The external compute step failed; shared by every request of the step
    #[error("compute step failed: {0}")]
    ComputeStep(Arc<anyhow::Error>),

    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    /// Internal bookkeeping is inconsistent
    #[error("internal invariant violated: {0}")]
    Invariant(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl EngineError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Errors the caller can fix and retry: nothing was mutated.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_)
                | Self::InvalidState(_)
                | Self::NoCapacity { .. }
                | Self::RequestNotFound(_)
        )
    }

    /// Errors that must propagate: the engine or the step cannot continue as-is.
    pub fn is_fatal(&self) -> bool {
        !self.is_caller_error()
    }
}

/// Result type alias for the orchestration core
pub type Result<T> = std::result::Result<T, EngineError>;
