//! Positional query parameters and backend-specific binding.
//!
//! Callers always write `?` placeholders; the Postgres-family adapter rewrites
//! them to `$1..$n` via [`expand_placeholders`]. Placeholder syntax is an
//! adapter-internal concern, never exposed at the facade.

use serde::{Deserialize, Serialize};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Type name of this parameter for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Bind a parameter to a Postgres-family query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a MySQL-family (MySQL or MariaDB) query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Rewrite `?` placeholders to `$1..$n` for the Postgres wire protocol.
///
/// Skips placeholders inside single-quoted strings, double-quoted identifiers,
/// dollar-quoted strings (`$$...$$`, `$tag$...$tag$`), `--` line comments, and
/// `/* */` block comments. Doubled `''` escapes inside string literals are
/// handled. A bare `?` jsonb operator is indistinguishable from a placeholder
/// and gets rewritten; callers on Postgres use `jsonb_exists(...)` instead.
pub(crate) fn expand_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut index = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '?' => {
                index += 1;
                out.push('$');
                out.push_str(&index.to_string());
            }
            '$' => {
                out.push(c);
                // possible dollar-quote opener: $tag$ with an identifier tag
                let mut tag = String::new();
                let mut opened = false;
                while let Some(&next) = chars.peek() {
                    if next == '$' {
                        opened = true;
                        break;
                    }
                    let tag_char = if tag.is_empty() {
                        next.is_ascii_alphabetic() || next == '_'
                    } else {
                        next.is_ascii_alphanumeric() || next == '_'
                    };
                    if !tag_char {
                        break;
                    }
                    tag.push(next);
                    chars.next();
                    out.push(next);
                }
                if opened {
                    chars.next();
                    out.push('$');
                    // consume until the matching closing delimiter
                    let delimiter = format!("${tag}$");
                    let delimiter_len = delimiter.chars().count();
                    let mut window = std::collections::VecDeque::new();
                    for inner in chars.by_ref() {
                        out.push(inner);
                        window.push_back(inner);
                        if window.len() > delimiter_len {
                            window.pop_front();
                        }
                        if window.len() == delimiter_len
                            && window.iter().copied().eq(delimiter.chars())
                        {
                            break;
                        }
                    }
                }
            }
            '\'' => {
                out.push(c);
                // consume until the closing quote, honoring '' escapes
                while let Some(inner) = chars.next() {
                    out.push(inner);
                    if inner == '\'' {
                        if chars.peek() == Some(&'\'') {
                            out.push(chars.next().unwrap_or('\''));
                        } else {
                            break;
                        }
                    }
                }
            }
            '"' => {
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == '"' {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                out.push(c);
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    out.push(inner);
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(QueryParam::from("hello").type_name(), "string");
    }

    #[test]
    fn test_expand_simple() {
        assert_eq!(
            expand_placeholders("SELECT * FROM t WHERE a = ? AND b = ?"),
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
    }

    #[test]
    fn test_expand_skips_string_literals() {
        assert_eq!(
            expand_placeholders("SELECT '?' , name FROM t WHERE id = ?"),
            "SELECT '?' , name FROM t WHERE id = $1"
        );
        // doubled-quote escape keeps the literal open
        assert_eq!(
            expand_placeholders("SELECT 'it''s ?' WHERE id = ?"),
            "SELECT 'it''s ?' WHERE id = $1"
        );
    }

    #[test]
    fn test_expand_skips_quoted_identifiers_and_comments() {
        assert_eq!(
            expand_placeholders("SELECT \"a?b\" FROM t -- trailing ?\nWHERE x = ?"),
            "SELECT \"a?b\" FROM t -- trailing ?\nWHERE x = $1"
        );
        assert_eq!(
            expand_placeholders("SELECT /* ? */ x FROM t WHERE y = ?"),
            "SELECT /* ? */ x FROM t WHERE y = $1"
        );
    }

    #[test]
    fn test_expand_skips_dollar_quoted_strings() {
        assert_eq!(
            expand_placeholders("SELECT $$has ? inside$$ WHERE id = ?"),
            "SELECT $$has ? inside$$ WHERE id = $1"
        );
        assert_eq!(
            expand_placeholders("DO $fn$ UPDATE t SET v = '?'; $fn$ WHERE x = ?"),
            "DO $fn$ UPDATE t SET v = '?'; $fn$ WHERE x = $1"
        );
        // a nested different tag does not close the outer quote
        assert_eq!(
            expand_placeholders("SELECT $a$ $$ ? $$ $a$, ?"),
            "SELECT $a$ $$ ? $$ $a$, $1"
        );
    }

    #[test]
    fn test_lone_dollar_is_not_a_quote() {
        assert_eq!(
            expand_placeholders("SELECT price$ FROM t WHERE v = ?"),
            "SELECT price$ FROM t WHERE v = $1"
        );
        assert_eq!(
            expand_placeholders("SELECT 1 $ 2 = ?"),
            "SELECT 1 $ 2 = $1"
        );
    }

    #[test]
    fn test_expand_no_placeholders() {
        let sql = "SELECT 1";
        assert_eq!(expand_placeholders(sql), sql);
    }

    #[test]
    fn test_bytes_param_serde_roundtrip() {
        let param = QueryParam::Bytes(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let json = serde_json::to_string(&param).unwrap();
        assert_eq!(json, "\"3q2+7w==\"");
    }
}
