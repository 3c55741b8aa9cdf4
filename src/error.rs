//! Error types for the tenant-aware database layer.
//!
//! All failures surface as [`DbError`]. Backend-native errors are converted
//! into the `Query` variant by the normalizer in [`crate::db::normalize`] and
//! nowhere else, so callers can pattern-match on [`ErrorCode`] reliably.

use thiserror::Error;

/// Stable classification codes for normalized backend errors.
///
/// The string forms (`UNIQUE_VIOLATION`, `DB_TIMEOUT`, ...) are the contract
/// upstream layers switch on; they never change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Duplicate key / unique index violation.
    UniqueViolation,
    /// Pool acquisition or statement execution exceeded its deadline.
    Timeout,
    /// The backend refused or dropped the connection (server down, too many
    /// connections, fatal protocol failure).
    Unavailable,
    /// Everything else; the native message is preserved in `detail`.
    Other,
}

impl ErrorCode {
    /// The stable wire form of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UniqueViolation => "UNIQUE_VIOLATION",
            Self::Timeout => "DB_TIMEOUT",
            Self::Unavailable => "DB_UNAVAILABLE",
            Self::Other => "DB_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    /// Malformed call (empty SQL, bad placeholder count). Caller error,
    /// raised before any connection is leased, never retried.
    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },

    /// A connection could not be leased or opened.
    #[error("Connection failed: {message}")]
    Connection { message: String },

    /// Tenant id is not present in the catalog.
    #[error("Unknown tenant: {tenant}")]
    TenantNotFound { tenant: String },

    /// A backend error normalized into the fixed code set.
    /// Constructed only by [`crate::db::normalize`].
    #[error("{code}: {message}")]
    Query {
        code: ErrorCode,
        message: String,
        /// Original backend message when it differs from `message`.
        detail: Option<String>,
        /// Constraint or index name for unique violations, when reported.
        constraint: Option<String>,
    },
}

impl DbError {
    /// Create an invalid-query error.
    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a tenant-not-found error.
    pub fn tenant_not_found(tenant: impl Into<String>) -> Self {
        Self::TenantNotFound {
            tenant: tenant.into(),
        }
    }

    /// The normalized classification code, total over all variants.
    ///
    /// Caller errors (`InvalidQuery`, `TenantNotFound`) classify as `Other`;
    /// connection-lease failures as `Unavailable`.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidQuery { .. } | Self::TenantNotFound { .. } => ErrorCode::Other,
            Self::Connection { .. } => ErrorCode::Unavailable,
            Self::Query { code, .. } => *code,
        }
    }

    /// Whether a caller may reasonably retry after this error.
    ///
    /// The layer itself never retries; this is advisory for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code(), ErrorCode::Timeout | ErrorCode::Unavailable)
    }

    /// Constraint name for unique violations, when the backend reported one.
    pub fn constraint(&self) -> Option<&str> {
        match self {
            Self::Query { constraint, .. } => constraint.as_deref(),
            _ => None,
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_strings_are_stable() {
        assert_eq!(ErrorCode::UniqueViolation.as_str(), "UNIQUE_VIOLATION");
        assert_eq!(ErrorCode::Timeout.as_str(), "DB_TIMEOUT");
        assert_eq!(ErrorCode::Unavailable.as_str(), "DB_UNAVAILABLE");
        assert_eq!(ErrorCode::Other.as_str(), "DB_ERROR");
    }

    #[test]
    fn test_every_variant_classifies() {
        assert_eq!(DbError::invalid_query("empty").code(), ErrorCode::Other);
        assert_eq!(
            DbError::connection("refused").code(),
            ErrorCode::Unavailable
        );
        assert_eq!(DbError::tenant_not_found("acme").code(), ErrorCode::Other);
        let q = DbError::Query {
            code: ErrorCode::UniqueViolation,
            message: "duplicate".into(),
            detail: None,
            constraint: Some("users_email_key".into()),
        };
        assert_eq!(q.code(), ErrorCode::UniqueViolation);
        assert_eq!(q.constraint(), Some("users_email_key"));
    }

    #[test]
    fn test_retryable() {
        assert!(DbError::connection("down").is_retryable());
        assert!(!DbError::invalid_query("blank").is_retryable());
        let timeout = DbError::Query {
            code: ErrorCode::Timeout,
            message: "pool acquire timed out".into(),
            detail: None,
            constraint: None,
        };
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_display_carries_code() {
        let err = DbError::Query {
            code: ErrorCode::Unavailable,
            message: "too many connections".into(),
            detail: None,
            constraint: None,
        };
        assert!(err.to_string().starts_with("DB_UNAVAILABLE"));
    }
}
