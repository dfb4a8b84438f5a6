//! Error taxonomy shared by every DocChat component.
//!
//! Domain operations return [`DocChatError`] so that callers (the HTTP
//! layer, the ingestion retry loop, the chat orchestrator) can branch on the
//! cause. Configuration and process plumbing in the application crate keep
//! using `anyhow`.

/// Result alias for domain operations.
pub type Result<T> = std::result::Result<T, DocChatError>;

/// Every failure a DocChat domain operation can surface.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DocChatError {
    /// Malformed input: unsupported format, bad chunk parameters, empty
    /// message, invalid status transition. Rejected before any state change.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The referenced document, session, account, or reservation does not
    /// exist (or is not visible to the caller).
    #[error("not found: {0}")]
    NotFound(String),

    /// Another operation holds the resource; the caller may retry later.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The embedding backend failed for a whole batch.
    #[error("embedding service error: {0}")]
    EmbeddingService(String),

    /// The embedding backend refused the batch (bad credentials, unknown
    /// model, disabled provider); retrying will not help.
    #[error("embedding request rejected: {0}")]
    EmbeddingRejected(String),

    /// The generation backend is temporarily unavailable.
    #[error("generation service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The generation backend rejected the request; retrying will not help.
    #[error("generation request rejected: {0}")]
    InvalidRequest(String),

    /// Reserving `requested` tokens would exceed the user's allocation.
    #[error("quota exceeded for user {user_id}: requested {requested}, remaining {remaining}")]
    QuotaExceeded {
        user_id: String,
        requested: i64,
        remaining: i64,
    },

    /// A vector's model or dimensionality does not match its index.
    #[error("index corruption: {0}")]
    IndexCorruption(String),

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl DocChatError {
    /// Transient external-service failures that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingService(_) | Self::ServiceUnavailable(_)
        )
    }

    /// Machine-readable error code used in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::EmbeddingService(_)
            | Self::EmbeddingRejected(_)
            | Self::ServiceUnavailable(_) => "service_unavailable",
            Self::InvalidRequest(_) => "generation_failed",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::IndexCorruption(_) | Self::Storage(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DocChatError::EmbeddingService("503".into()).is_retryable());
        assert!(!DocChatError::EmbeddingRejected("401".into()).is_retryable());
        assert!(DocChatError::ServiceUnavailable("timeout".into()).is_retryable());
        assert!(!DocChatError::InvalidRequest("bad model".into()).is_retryable());
        assert!(!DocChatError::Validation("overlap".into()).is_retryable());
        assert!(!DocChatError::QuotaExceeded {
            user_id: "u".into(),
            requested: 10,
            remaining: 0,
        }
        .is_retryable());
    }

    #[test]
    fn test_quota_message_names_amounts() {
        let err = DocChatError::QuotaExceeded {
            user_id: "u1".into(),
            requested: 100,
            remaining: 50,
        };
        let msg = err.to_string();
        assert!(msg.contains("u1"));
        assert!(msg.contains("100"));
        assert!(msg.contains("50"));
        assert_eq!(err.code(), "quota_exceeded");
    }
}
