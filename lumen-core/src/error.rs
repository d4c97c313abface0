//! Error taxonomy for the residency manager and generation sessions.
//!
//! Runtime internals (candle, hf-hub, tokenizers) report through `anyhow`;
//! they are folded into one of these variants where they cross into the
//! public API.

use std::path::PathBuf;

use crate::Tier;

pub type Result<T, E = LumenError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum LumenError {
    /// Rejected before any residency action takes place.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("model not registered: {model}")]
    ModelNotFound { model: String },

    /// The pipeline for `model` could not be constructed or migrated.
    #[error("model {model} unavailable: {message}")]
    Unavailable { model: String, message: String },

    #[error("inference failed: {message}")]
    Inference { message: String },

    #[error("residency slot is busy")]
    SlotBusy,

    #[error("cannot move to {requested} tier: {reason}")]
    InvalidTier { requested: Tier, reason: String },

    #[error("session not found: {id}")]
    SessionNotFound { id: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LumenError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn unavailable(model: &str, err: &anyhow::Error) -> Self {
        Self::Unavailable {
            model: model.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn persist(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persist {
            path: path.into(),
            source,
        }
    }
}

impl From<figment::Error> for LumenError {
    fn from(err: figment::Error) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}
