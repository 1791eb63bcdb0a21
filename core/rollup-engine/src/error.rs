//! FILENAME: core/rollup-engine/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RollupError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Invalid node key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid persisted key list: {0}")]
    InvalidPersistedList(String),

    #[error("Dimension list is empty")]
    EmptyDimensions,
}
