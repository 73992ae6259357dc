//! Error types for the relay.

use std::time::Duration;

use crate::model::Source;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors. A failed write never releases a lease early: the
/// row is left untouched and the item is re-offered after its visibility
/// timeout.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Message source (provider adapter) errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Authentication failed for {provider}: {reason}")]
    Auth { provider: Source, reason: String },

    #[error("No credentials stored for user {user_id} on {provider}")]
    CredentialsNotFound { user_id: String, provider: Source },

    #[error("{provider} unavailable: {reason}")]
    Unavailable { provider: Source, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: Source, reason: String },

    #[error("{provider} adapter is not connected")]
    NotConnected { provider: Source },
}

impl SourceError {
    /// Whether the next poll tick may succeed without operator action.
    ///
    /// Auth failures and missing credentials need a fresh OAuth grant, so
    /// they are not retryable by the adapter itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::InvalidResponse { .. })
    }
}

/// Failure while turning one queue item into a processed result.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Transform timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let unavailable = SourceError::Unavailable {
            provider: Source::Slack,
            reason: "502".into(),
        };
        let auth = SourceError::Auth {
            provider: Source::Gmail,
            reason: "invalid_grant".into(),
        };
        let missing = SourceError::CredentialsNotFound {
            user_id: "u1".into(),
            provider: Source::Teams,
        };
        assert!(unavailable.is_retryable());
        assert!(!auth.is_retryable());
        assert!(!missing.is_retryable());
    }

    #[test]
    fn error_messages_name_the_source() {
        let err = SourceError::Auth {
            provider: Source::Gmail,
            reason: "token revoked".into(),
        };
        assert_eq!(err.to_string(), "Authentication failed for GMAIL: token revoked");
    }

    #[test]
    fn processing_error_wraps_store_error() {
        let err: ProcessingError = DatabaseError::Query("disk full".into()).into();
        assert!(matches!(err, ProcessingError::Store(_)));
        let top: Error = err.into();
        assert!(top.to_string().starts_with("Processing error"));
    }
}
