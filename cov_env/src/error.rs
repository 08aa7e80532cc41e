//! Error types for the CoV collaborator boundary.

use thiserror::Error;

/// Errors raised by a renderer or a vision-language model.
///
/// Variants are split into transient causes, which are worth retrying with
/// backoff, and permanent causes, which fail the current question.
#[derive(Debug, Clone, Error)]
pub enum EnvError {
    /// Connection reset, DNS failure, 5xx or rate limiting
    #[error("Transport error: {0}")]
    TransportError(String),
    
    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
    
    /// Credentials missing or rejected
    #[error("Authentication error: {0}")]
    AuthError(String),
    
    /// Response could not be decoded or violates the contract
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    
    /// Scene file missing or malformed
    #[error("Scene error: {0}")]
    SceneError(String),
    
    /// Renderer produced no frame this time
    #[error("Frame dropped: {0}")]
    FrameDropped(String),
    
    /// Local file access failed
    #[error("I/O error: {0}")]
    IoError(String),
}

impl EnvError {
    /// Creates a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportError(msg.into())
    }
    
    /// Creates a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }
    
    /// Creates a scene error.
    pub fn scene(msg: impl Into<String>) -> Self {
        Self::SceneError(msg.into())
    }
    
    /// Returns true for transient failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EnvError::TransportError(_) | EnvError::Timeout(_) | EnvError::FrameDropped(_)
        )
    }
}

impl From<std::io::Error> for EnvError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(EnvError::transport("reset").is_retryable());
        assert!(EnvError::Timeout(1500).is_retryable());
        assert!(EnvError::FrameDropped("gpu busy".into()).is_retryable());
    }
    
    #[test]
    fn test_permanent_errors_are_fatal() {
        assert!(!EnvError::AuthError("bad key".into()).is_retryable());
        assert!(!EnvError::scene("missing.glb").is_retryable());
        assert!(!EnvError::protocol("no choices").is_retryable());
        assert!(!EnvError::IoError("denied".into()).is_retryable());
    }
    
    #[test]
    fn test_timeout_display() {
        assert_eq!(EnvError::Timeout(250).to_string(), "Timeout after 250ms");
    }
}
