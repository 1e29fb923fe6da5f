//! Centralized error types for the captioning core.
//!
//! Every error in this crate carries a stable, machine-readable `kind()`
//! discriminant plus a human-readable message, per the error taxonomy in
//! the design notes. UI-facing text is the caller's responsibility; this
//! crate never formats anything for end users beyond the `Display` impl.

use thiserror::Error;

/// Trait for error types that expose a stable, machine-readable kind.
///
/// Implement this once per component error enum so callers can match on
/// `kind()` without depending on `Display` formatting or variant shape.
pub trait ErrorKind {
    /// Returns a stable discriminant string for this error.
    fn kind(&self) -> &'static str;

    /// Returns true if the caller should retry (reconnect/retry policy)
    /// rather than surface the error immediately.
    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Credential Store errors (§4.1, §7).
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid key format: {0}")]
    InvalidFormat(String),
    #[error("invalid API key")]
    InvalidKey,
    #[error("permission denied")]
    PermissionDenied,
    #[error("rate limited")]
    RateLimited,
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("no credential stored")]
    NotFound,
    #[error("decryption failed (device binding mismatch)")]
    DecryptionFailed,
}

impl ErrorKind for CredentialError {
    fn kind(&self) -> &'static str {
        match self {
            Self::InvalidFormat(_) => "InvalidFormat",
            Self::InvalidKey => "InvalidKey",
            Self::PermissionDenied => "PermissionDenied",
            Self::RateLimited => "RateLimited",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::NetworkError(_) => "NetworkError",
            Self::NotFound => "NotFound",
            Self::DecryptionFailed => "DecryptionFailed",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ServiceUnavailable | Self::NetworkError(_)
        )
    }
}

/// Audio Pipeline errors (§4.2, §7).
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("unsupported audio format: {0}")]
    FormatUnsupported(String),
    #[error("frame dropped under backpressure")]
    BackpressureDrop,
}

impl ErrorKind for AudioError {
    fn kind(&self) -> &'static str {
        match self {
            Self::CaptureFailed(_) => "CaptureFailed",
            Self::PermissionDenied => "PermissionDenied",
            Self::FormatUnsupported(_) => "FormatUnsupported",
            Self::BackpressureDrop => "BackpressureDrop",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::BackpressureDrop)
    }
}

/// Session Client errors (§4.3, §7).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket open failed: {0}")]
    WebSocketOpenFailed(String),
    #[error("timed out")]
    Timeout,
    #[error("authentication failed")]
    AuthFailed,
    #[error("failed to parse server message: {0}")]
    MessageParseFailed(String),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("cancelled")]
    Cancelled,
}

impl ErrorKind for SessionError {
    fn kind(&self) -> &'static str {
        match self {
            Self::WebSocketOpenFailed(_) => "WebSocketOpenFailed",
            Self::Timeout => "Timeout",
            Self::AuthFailed => "AuthFailed",
            Self::MessageParseFailed(_) => "MessageParseFailed",
            Self::ServerError(_) => "ServerError",
            Self::Cancelled => "Cancelled",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::WebSocketOpenFailed(_))
    }
}

/// Overlap Processor / pipeline errors (§4.5, §7).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl ErrorKind for PipelineError {
    fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "InvalidInput",
            Self::InternalError(_) => "InternalError",
        }
    }
}

/// Top-level error unifying every component, for callers that route
/// everything through one `onError({kind, message})` surface (§6).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl CoreError {
    /// Stable discriminant, regardless of which component raised the error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Credential(e) => e.kind(),
            Self::Audio(e) => e.kind(),
            Self::Session(e) => e.kind(),
            Self::Pipeline(e) => e.kind(),
        }
    }

    /// Whether the raising component's retry/reconnect policy should
    /// absorb this error rather than surface it immediately (§7).
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Credential(e) => e.is_recoverable(),
            Self::Audio(e) => e.is_recoverable(),
            Self::Session(e) => e.is_recoverable(),
            Self::Pipeline(_) => false,
        }
    }
}

pub type CredentialResult<T> = Result<T, CredentialError>;
pub type AudioResult<T> = Result<T, AudioError>;
pub type SessionResult<T> = Result<T, SessionError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_failed_is_not_recoverable() {
        let err = CredentialError::DecryptionFailed;
        assert_eq!(err.kind(), "DecryptionFailed");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn rate_limited_is_recoverable() {
        let err = CredentialError::RateLimited;
        assert!(err.is_recoverable());
    }

    #[test]
    fn core_error_forwards_kind() {
        let err: CoreError = SessionError::Timeout.into();
        assert_eq!(err.kind(), "Timeout");
        assert!(err.is_recoverable());
    }
}
