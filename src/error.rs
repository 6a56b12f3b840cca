use thiserror::Error;

/// Typed error hierarchy for the operations exposed in `commands`.
///
/// Serializes as a plain string so callers that forward results as JSON get
/// a readable `"error message"` instead of a nested object.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Json(String),

    #[error("{0}")]
    Other(String),
}

impl serde::Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Other(format!("{:#}", e))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e.to_string())
    }
}

impl From<AnalysisError> for AppError {
    fn from(e: AnalysisError) -> Self {
        match e {
            AnalysisError::UnknownSource(id) => AppError::NotFound(format!("source '{}'", id)),
            other => AppError::Other(other.to_string()),
        }
    }
}

/// Allows `.ok_or_else(|| format!(…))?` to coerce into AppError.
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Other(s)
    }
}

/// Allows `.ok_or("literal string")?` to coerce into AppError.
impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Other(s.to_string())
    }
}

/// Why a single episode analysis ended without persisting anything.
///
/// None of these escape `get_skip_segments`; the background supervisor logs
/// them and records them in the worker's error log.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("source '{0}' is not registered")]
    UnknownSource(String),

    #[error("failed to resolve video for episode {episode_id}: {message}")]
    Resolve { episode_id: String, message: String },

    #[error("failed to list episodes of series {series_id}: {message}")]
    ListEpisodes { series_id: String, message: String },

    #[error("analysis already in progress for {0}")]
    InProgress(String),

    #[error("no direct video URL for episode {0} (embed-only)")]
    NoDirectUrl(String),

    #[error("audio extraction failed for episode {0}")]
    ExtractionFailed(String),

    #[error("no opening or ending detected for episode {0}")]
    NothingDetected(String),

    #[error("analysis cancelled")]
    Cancelled,

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl AnalysisError {
    /// Transient or "not yet" outcomes that a later retry may resolve.
    pub fn is_transient(&self) -> bool {
        !matches!(self, AnalysisError::Internal(_) | AnalysisError::UnknownSource(_))
    }
}
