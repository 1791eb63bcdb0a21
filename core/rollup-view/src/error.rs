//! FILENAME: core/rollup-view/src/error.rs
//! Error types for the view layer.

use rollup_engine::RollupError;
use serde::Serialize;
use thiserror::Error;

use crate::store::Phase;

/// Failure reported by a collaborator (row source, secondary source, state store).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source request failed: {message}")]
    Failed { message: String },

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    pub fn failed(message: impl Into<String>) -> Self {
        SourceError::Failed { message: message.into() }
    }
}

/// Engine errors raised while building a level count as a failed request.
impl From<RollupError> for SourceError {
    fn from(e: RollupError) -> Self {
        SourceError::failed(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("view is busy ({0:?})")]
    Busy(Phase),

    #[error("node '{0}' is not in the current tree")]
    UnknownNode(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("view has not been mounted")]
    NotMounted,

    #[error(transparent)]
    Engine(#[from] RollupError),

    #[error("saved view payload: {0}")]
    StateCodec(#[from] serde_json::Error),
}

/// Outcome of a restore pass. Node-level failures end up here instead of
/// failing the pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Keys that were found and are now expanded, in persisted order.
    pub restored: Vec<String>,
    /// Persisted keys that no longer exist in the tree.
    pub dropped: Vec<String>,
    /// Keys whose child fetch failed; they are expanded with no children.
    pub failed: Vec<String>,
    /// Number of depth levels processed.
    pub levels: usize,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty() && self.failed.is_empty()
    }
}
