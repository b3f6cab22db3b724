//! Error types for the resonance core.
//!
//! Every variant is a deterministic logic error raised to the immediate
//! caller: there are no transient faults in this crate and therefore no
//! internal retries. Each variant carries enough structured context (pack
//! id, expected vs. actual dimension, offending axis) to be logged without
//! re-deriving it from the original input.

use thiserror::Error;

/// Errors raised by the axis-pack core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad builder inputs, degenerate seed sets, or a non-monotone capacity.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Embedding length does not match the pack's embedding dimension.
    #[error("dimension mismatch for pack {pack_id}: expected {expected}, got {actual}")]
    DimensionMismatch {
        pack_id: String,
        expected: usize,
        actual: usize,
    },

    /// More axes requested than embedding dimensions available.
    #[error("over-complete axes: {axes} axes cannot span a {dim}-dimensional space")]
    OverCompleteAxes { axes: usize, dim: usize },

    /// Non-finite value in an input embedding.
    #[error("invalid embedding: non-finite component at index {index}")]
    InvalidEmbedding { index: usize },

    /// Non-finite value produced while comparing scores.
    #[error("invalid score on axis {axis}")]
    InvalidScore { axis: String },

    /// Evaluation was requested but no pack is active in the registry.
    #[error("no active axis pack")]
    NoActivePack,

    /// Referenced pack id is unknown to the registry or artifact store.
    #[error("axis pack not found: {pack_id}")]
    PackNotFound { pack_id: String },

    /// The external encoder failed; retry policy belongs to the caller.
    #[error("encoder error: {message}")]
    Encoder { message: String },

    /// Artifact file I/O failure.
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact (de)serialization failure.
    #[error("artifact format error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Short stable code for logs and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::OverCompleteAxes { .. } => "over_complete_axes",
            Self::InvalidEmbedding { .. } => "invalid_embedding",
            Self::InvalidScore { .. } => "invalid_score",
            Self::NoActivePack => "no_active_pack",
            Self::PackNotFound { .. } => "pack_not_found",
            Self::Encoder { .. } => "encoder_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "format_error",
        }
    }
}
