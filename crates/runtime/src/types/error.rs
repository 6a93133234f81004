//! Error types for model loading and prompt rewriting
//!
//! Two failure domains exist. [`ModelError`] covers load-time and placement
//! failures and always propagates to the caller. [`StageError`] covers every
//! predict-time stage and is absorbed by the failure guard, which turns it
//! into the fallback outcome.

use thiserror::Error;

/// Load-time and placement errors
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model artifact not found: {path}")]
    ArtifactNotFound { path: String },

    #[error("Invalid model artifact {path}: {reason}")]
    InvalidArtifact { path: String, reason: String },

    #[error("No chat template found under {path}")]
    MissingTemplate { path: String },

    #[error("Tokenizer error: {reason}")]
    Tokenizer { reason: String },

    #[error("Device unavailable ({device}): {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("Hub download failed for {repo}: {reason}")]
    HubDownload { repo: String, reason: String },

    #[error("Weight loading failed: {0}")]
    Weights(#[from] candle_core::Error),
}

/// Coarse classification of predict-time failures
///
/// Both kinds produce the same fallback; the distinction exists for logs
/// and for callers inspecting a [`RewriteOutcome`](crate::RewriteOutcome).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The model ran but its output broke the marker contract
    MalformedOutput,
    /// Templating, tensor, device, or decoding failure
    Runtime,
}

/// Errors raised by a single predict-time stage
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("Chat template rendering failed: {reason}")]
    Template { reason: String },

    #[error("Input packing failed: {reason}")]
    Pack { reason: String },

    #[error("Generation failed: {reason}")]
    Generate { reason: String },

    #[error("Decoding failed: {reason}")]
    Decode { reason: String },

    #[error("Malformed model output: expected 2 reasoning markers, found {occurrences}")]
    MalformedOutput { occurrences: usize },
}

impl StageError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StageError::MalformedOutput { .. } => FailureKind::MalformedOutput,
            _ => FailureKind::Runtime,
        }
    }

    /// Short stage label used in log fields
    pub fn stage(&self) -> &'static str {
        match self {
            StageError::Template { .. } => "template",
            StageError::Pack { .. } => "pack",
            StageError::Generate { .. } => "generate",
            StageError::Decode { .. } => "decode",
            StageError::MalformedOutput { .. } => "sanitize",
        }
    }

    pub(crate) fn generate(err: impl std::fmt::Display) -> Self {
        StageError::Generate {
            reason: summary(&err),
        }
    }

    pub(crate) fn pack(err: impl std::fmt::Display) -> Self {
        StageError::Pack {
            reason: summary(&err),
        }
    }
}

/// First line of an error message; candle appends captured backtraces below it.
fn summary(err: &impl std::fmt::Display) -> String {
    let message = err.to_string();
    message.lines().next().unwrap_or_default().trim_end().to_string()
}

/// Placement failures during a call surface as generation failures
impl From<ModelError> for StageError {
    fn from(err: ModelError) -> Self {
        StageError::generate(err)
    }
}
