//! Error normalization across backend families.
//!
//! Each backend reports duplicate keys, timeouts, and unavailability with its
//! own codes. [`normalize`] maps every native error into exactly one
//! [`ErrorCode`] — the mapping is total and never panics, so classification
//! itself can never become a new failure mode. Normalized errors are the only
//! place [`DbError::Query`] is constructed.

use crate::config::DriverKind;
use crate::error::{DbError, ErrorCode};

/// Convert a driver error into the normalized taxonomy.
pub fn normalize(kind: DriverKind, err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Database(db_err) => {
            let native_code = native_code(kind, db_err.as_ref());
            let message = db_err.message().to_string();
            let code = classify(kind, native_code.as_deref(), &message);
            let constraint = match code {
                ErrorCode::UniqueViolation => db_err
                    .constraint()
                    .map(str::to_string)
                    .or_else(|| scrape_mysql_key(&message)),
                _ => None,
            };
            DbError::Query {
                code,
                message: summary(code, &message),
                detail: Some(message),
                constraint,
            }
        }
        sqlx::Error::PoolTimedOut => DbError::Query {
            code: ErrorCode::Timeout,
            message: "connection pool acquire timed out".to_string(),
            detail: None,
            constraint: None,
        },
        sqlx::Error::PoolClosed => unavailable("connection pool is closed"),
        sqlx::Error::Io(e) => unavailable(format!("I/O error: {e}")),
        sqlx::Error::Tls(e) => unavailable(format!("TLS error: {e}")),
        sqlx::Error::Protocol(msg) => unavailable(format!("protocol error: {msg}")),
        sqlx::Error::Configuration(msg) => unavailable(format!("configuration error: {msg}")),
        other => DbError::Query {
            code: ErrorCode::Other,
            message: other.to_string(),
            detail: None,
            constraint: None,
        },
    }
}

/// Error for a statement that exceeded the configured query timeout.
pub(crate) fn statement_timeout(limit: std::time::Duration) -> DbError {
    DbError::Query {
        code: ErrorCode::Timeout,
        message: format!("statement exceeded the {}ms query timeout", limit.as_millis()),
        detail: None,
        constraint: None,
    }
}

fn unavailable(message: impl Into<String>) -> DbError {
    DbError::Query {
        code: ErrorCode::Unavailable,
        message: message.into(),
        detail: None,
        constraint: None,
    }
}

/// Extract the most specific native code the driver exposes.
///
/// The MySQL family reports a SQLSTATE through `code()` but the useful signal
/// is the server error number (1062, 1040, ...), so prefer that when the
/// concrete error type is available.
fn native_code(kind: DriverKind, db_err: &dyn sqlx::error::DatabaseError) -> Option<String> {
    if matches!(kind, DriverKind::MySql | DriverKind::MariaDb) {
        if let Some(mysql_err) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
            return Some(mysql_err.number().to_string());
        }
    }
    db_err.code().map(|c| c.to_string())
}

/// Pure classification of a native error signal. Total: every input maps to
/// exactly one code.
pub(crate) fn classify(kind: DriverKind, code: Option<&str>, message: &str) -> ErrorCode {
    let code = code.unwrap_or("");
    match kind {
        DriverKind::Postgres => match code {
            "23505" => ErrorCode::UniqueViolation,
            "57014" => ErrorCode::Timeout,
            "53300" | "57P01" => ErrorCode::Unavailable,
            c if c.starts_with("08") => ErrorCode::Unavailable,
            _ => classify_by_message(message),
        },
        DriverKind::MySql | DriverKind::MariaDb => match code {
            // ER_DUP_ENTRY and its SQLSTATE
            "1062" | "23000" => ErrorCode::UniqueViolation,
            // lock wait timeout, max_execution_time, MariaDB statement timeout
            "1205" | "3024" | "1969" => ErrorCode::Timeout,
            // too many connections, client connection failures
            "1040" | "2002" | "2003" | "2006" | "2013" => ErrorCode::Unavailable,
            _ => classify_by_message(message),
        },
        DriverKind::Sqlite => match code {
            // SQLITE_CONSTRAINT_PRIMARYKEY, SQLITE_CONSTRAINT_UNIQUE
            "1555" | "2067" => ErrorCode::UniqueViolation,
            // SQLITE_BUSY, SQLITE_LOCKED
            "5" | "6" => ErrorCode::Timeout,
            // SQLITE_CANTOPEN
            "14" => ErrorCode::Unavailable,
            _ => {
                if message.contains("UNIQUE constraint failed") {
                    ErrorCode::UniqueViolation
                } else {
                    classify_by_message(message)
                }
            }
        },
    }
}

/// Fallback classification from the message text when no code matched.
fn classify_by_message(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        ErrorCode::Timeout
    } else if lower.contains("connection refused")
        || lower.contains("too many connections")
        || lower.contains("server has gone away")
    {
        ErrorCode::Unavailable
    } else {
        ErrorCode::Other
    }
}

/// Concise message for known codes; the native text rides in `detail`.
fn summary(code: ErrorCode, native_message: &str) -> String {
    match code {
        ErrorCode::UniqueViolation => "duplicate key violates a unique constraint".to_string(),
        ErrorCode::Timeout => "operation timed out".to_string(),
        ErrorCode::Unavailable => "database is unavailable".to_string(),
        ErrorCode::Other => native_message.to_string(),
    }
}

/// Pull the index name out of a MySQL-family duplicate-entry message:
/// `Duplicate entry 'x' for key 'users.email_unique'`.
fn scrape_mysql_key(message: &str) -> Option<String> {
    let tail = message.split("for key '").nth(1)?;
    let key = tail.split('\'').next()?;
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}
