use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification used for retry decisions and report counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    NotFound,
    ResourceExhausted,
    DataIntegrity,
    Configuration,
    Interrupted,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::DataIntegrity => "data_integrity",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Transient failure fetching {url}: {reason}")]
    Transient { url: String, reason: String },

    #[error("{url} not found")]
    NotFound { url: String },

    #[error("{url} refused credentials (HTTP {status})")]
    Unauthorized { url: String, status: u16 },

    #[error("{url} rejected the request (HTTP {status})")]
    Rejected { url: String, status: u16 },

    #[error("Rate limited by {url}")]
    RateLimited { url: String },

    #[error("Payload from {url} too small ({bytes} bytes)")]
    TooSmall { url: String, bytes: usize },

    #[error("{url} did not return an image (content-type: {content_type})")]
    NotAnImage { url: String, content_type: String },

    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("{url} already failed during this run")]
    Memoized { url: String },

    #[error("Malformed URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Transient { .. } => ErrorKind::TransientNetwork,
            FetchError::NotFound { .. }
            | FetchError::Rejected { .. }
            | FetchError::Memoized { .. } => ErrorKind::NotFound,
            FetchError::Unauthorized { .. } => ErrorKind::Configuration,
            FetchError::RateLimited { .. } => ErrorKind::ResourceExhausted,
            FetchError::TooSmall { .. }
            | FetchError::NotAnImage { .. }
            | FetchError::InvalidResponse { .. }
            | FetchError::InvalidUrl { .. } => ErrorKind::DataIntegrity,
        }
    }

    /// Only transport-level hiccups and rate limits are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transient { .. } | FetchError::RateLimited { .. }
        )
    }

    /// Failures that say something about the payload itself; the URL is
    /// remembered and never requested again in the same run.
    pub fn poisons_url(&self) -> bool {
        matches!(
            self,
            FetchError::NotFound { .. }
                | FetchError::Rejected { .. }
                | FetchError::TooSmall { .. }
                | FetchError::NotAnImage { .. }
                | FetchError::InvalidResponse { .. }
                | FetchError::InvalidUrl { .. }
        )
    }

    pub fn url(&self) -> &str {
        match self {
            FetchError::Transient { url, .. }
            | FetchError::NotFound { url }
            | FetchError::Unauthorized { url, .. }
            | FetchError::Rejected { url, .. }
            | FetchError::RateLimited { url }
            | FetchError::TooSmall { url, .. }
            | FetchError::NotAnImage { url, .. }
            | FetchError::InvalidResponse { url, .. }
            | FetchError::Memoized { url }
            | FetchError::InvalidUrl { url, .. } => url,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Network error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Unreadable image {path}: {reason}")]
    DataIntegrity { path: String, reason: String },

    #[error("Face analyzer error: {message}")]
    Analyzer { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Interrupted by user")]
    Interrupted,
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            message: message.into(),
        }
    }

    pub fn data_integrity(path: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::DataIntegrity {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Configuration { .. } => ErrorKind::Configuration,
            PipelineError::Fetch(e) => e.kind(),
            PipelineError::NotFound { .. } => ErrorKind::NotFound,
            PipelineError::DataIntegrity { .. } | PipelineError::Image(_) => {
                ErrorKind::DataIntegrity
            }
            PipelineError::Analyzer { .. } => ErrorKind::TransientNetwork,
            PipelineError::Io(_) | PipelineError::Json(_) => ErrorKind::Internal,
            PipelineError::Interrupted => ErrorKind::Interrupted,
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
