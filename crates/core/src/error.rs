use serde::{Deserialize, Serialize};

/// Failures crossing the cluster boundary. None of these are fatal to the
/// process; callers convert them into a backoff or an error payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ClusterError {
    /// No credential source produced a usable configuration.
    #[error("no usable credential source: {0}")]
    AuthUnavailable(String),
    /// A client was built but the validation probe failed.
    #[error("cluster validation failed: {0}")]
    ValidationFailed(String),
    /// The watch feed failed or ended.
    #[error("watch stream error: {0}")]
    StreamError(String),
    /// A specific orchestration API call failed.
    #[error("kubernetes API error: {0}")]
    ApiError(String),
    /// A numeric annotation did not parse as an unsigned integer.
    #[error("malformed annotation {key}={value:?}")]
    MalformedAnnotation { key: String, value: String },
}

impl ClusterError {
    /// True when the failure means there is no usable session at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ClusterError::AuthUnavailable(_) | ClusterError::ValidationFailed(_))
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;
