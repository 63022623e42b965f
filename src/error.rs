//! Custom error types for sro.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur while rolling out scale-set nodes.
#[derive(Error, Debug)]
pub enum SroError {
    /// The subscription is cooling down after a 429; no request was sent.
    #[error("[{operation}] too many requests, retry after {retry_at}")]
    TooManyRequests {
        operation: String,
        retry_at: DateTime<Utc>,
    },

    #[error("Bootstrap blob not ready: {0}")]
    BlobNotReady(String),

    #[error("Missing upstream context: {0}")]
    MissingContext(String),

    /// The guest cluster API server did not answer, usually while a master reimages.
    #[error("Guest cluster unreachable: {0}")]
    GuestUnreachable(String),

    #[error("[{operation}] Azure API returned {status}: {message}")]
    Azure {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("[{0}] transport error: {1}")]
    Transport(String, String),

    #[error("Azure credentials error: {0}")]
    Credentials(String),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("Invalid rollout stage: {0}")]
    InvalidStage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SroError {
    /// Build an Azure API error from a non-success response body.
    ///
    /// ARM wraps failures as `{"error": {"code": "...", "message": "..."}}`;
    /// the message is pulled out of that envelope when present.
    pub fn azure(operation: &str, status: u16, body: &str) -> Self {
        Self::Azure {
            operation: operation.to_string(),
            status,
            message: extract_arm_message(body),
        }
    }

    pub fn transport<E: std::fmt::Display>(operation: &str, err: E) -> Self {
        Self::Transport(operation.to_string(), err.to_string())
    }

    /// Conditions that end a pass without mutation and are retried on the next
    /// scheduled reconcile. Never surfaced as failures.
    pub const fn is_recoverable_wait(&self) -> bool {
        matches!(
            self,
            Self::BlobNotReady(_) | Self::MissingContext(_) | Self::GuestUnreachable(_)
        )
    }

    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::TooManyRequests { .. })
    }

    /// Returns true if this error is transient and should be retried.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Azure { status, .. } => *status >= 500 || *status == 408 || *status == 409,
            Self::Transport(_, _) | Self::KubernetesApi(_) | Self::Credentials(_) => true,
            _ => false,
        }
    }

    /// Earliest time the failing call may be retried, for rate-limited errors.
    pub const fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::TooManyRequests { retry_at, .. } => Some(*retry_at),
            _ => None,
        }
    }
}

impl From<kube::Error> for SroError {
    fn from(err: kube::Error) -> Self {
        Self::KubernetesApi(err.to_string())
    }
}

/// Result alias used across the rollout code.
pub type Result<T, E = SroError> = std::result::Result<T, E>;

fn extract_arm_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let from_envelope = parsed.as_ref().and_then(|v| {
        let err = v.get("error")?;
        let code = err.get("code").and_then(|c| c.as_str()).unwrap_or("Unknown");
        let message = err.get("message").and_then(|m| m.as_str())?;
        Some(format!("{code}: {message}"))
    });

    if let Some(msg) = from_envelope {
        return msg;
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        trimmed.chars().take(256).collect()
    }
}
