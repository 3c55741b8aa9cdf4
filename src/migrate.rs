//! Migration runner.
//!
//! Applies `*.sql` files from a directory in filename order, one transaction
//! per file, recording each applied name in the `schema_migrations` table.
//! The runner always targets an explicit database and bypasses tenant
//! routing: migrations are an operator action, not a request.

use crate::db::facade::Database;
use crate::db::params::QueryParam;
use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::info;

const TRACKING_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (\
     name VARCHAR(255) PRIMARY KEY, applied_at VARCHAR(64) NOT NULL)";

/// One row of migration bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

pub struct Migrator<'a> {
    db: &'a Database,
    /// Explicit target database.
    database: String,
    dir: PathBuf,
}

impl<'a> Migrator<'a> {
    pub fn new(db: &'a Database, database: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            database: database.into(),
            dir: dir.into(),
        }
    }

    /// Apply every pending migration; returns the names applied this run.
    pub async fn run(&self) -> DbResult<Vec<String>> {
        self.ensure_tracking_table().await?;
        let already: HashSet<String> = self
            .applied()
            .await?
            .into_iter()
            .map(|m| m.name)
            .collect();

        let mut applied_now = Vec::new();
        for name in self.pending_files()? {
            if already.contains(&name) {
                continue;
            }
            let text = std::fs::read_to_string(self.dir.join(&name)).map_err(|e| {
                DbError::invalid_query(format!("cannot read migration {name}: {e}"))
            })?;
            self.apply_one(&name, &text).await?;
            info!(migration = %name, database = %self.database, "applied migration");
            applied_now.push(name);
        }
        Ok(applied_now)
    }

    /// Migrations already recorded against the target, oldest first.
    pub async fn applied(&self) -> DbResult<Vec<AppliedMigration>> {
        let result = self
            .db
            .query_on(
                &self.database,
                "SELECT name, applied_at FROM schema_migrations ORDER BY name",
                &[],
            )
            .await?;

        let mut out = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let name = match row.get("name") {
                Some(JsonValue::String(s)) => s.clone(),
                _ => continue,
            };
            let applied_at = match row.get("applied_at") {
                Some(JsonValue::String(s)) => DateTime::parse_from_rfc3339(s)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
                _ => DateTime::<Utc>::default(),
            };
            out.push(AppliedMigration { name, applied_at });
        }
        Ok(out)
    }

    async fn ensure_tracking_table(&self) -> DbResult<()> {
        self.db
            .query_on(&self.database, TRACKING_DDL, &[])
            .await
            .map(|_| ())
    }

    /// `*.sql` files in the directory, filename order.
    fn pending_files(&self) -> DbResult<Vec<String>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            DbError::invalid_query(format!(
                "cannot read migrations directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.ends_with(".sql").then_some(name)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// One migration file runs in one transaction, bookkeeping included, so a
    /// failing statement leaves neither partial schema nor a stale record.
    async fn apply_one(&self, name: &str, text: &str) -> DbResult<()> {
        let statements = split_statements(text);
        let name = name.to_string();
        self.db
            .with_transaction_on(&self.database, move |txn| {
                Box::pin(async move {
                    for statement in &statements {
                        txn.query(statement, &[]).await?;
                    }
                    txn.query(
                        "INSERT INTO schema_migrations (name, applied_at) VALUES (?, ?)",
                        &[
                            QueryParam::String(name),
                            QueryParam::String(Utc::now().to_rfc3339()),
                        ],
                    )
                    .await?;
                    Ok(())
                })
            })
            .await
    }
}

/// Split a migration file into statements on top-level semicolons, honoring
/// single-quoted strings ('' escapes included), `--` line comments, and
/// `/* */` block comments.
fn split_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ';' => {
                let stmt = current.trim();
                if !stmt.is_empty() {
                    statements.push(stmt.to_string());
                }
                current.clear();
            }
            '\'' => {
                current.push(c);
                while let Some(inner) = chars.next() {
                    current.push(inner);
                    if inner == '\'' {
                        if chars.peek() == Some(&'\'') {
                            current.push(chars.next().unwrap_or('\''));
                        } else {
                            break;
                        }
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                current.push(c);
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    current.push(inner);
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            _ => current.push(c),
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DbConfig, DriverKind};
    use crate::tenant::resolver::StaticDirectory;
    use std::sync::Arc;

    #[test]
    fn test_split_statements() {
        let text = "CREATE TABLE a (id INT);\n-- seed; not a boundary\nINSERT INTO a VALUES (1);\nINSERT INTO a VALUES ('x;y')";
        let statements = split_statements(text);
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0], "CREATE TABLE a (id INT)");
        assert_eq!(statements[2], "INSERT INTO a VALUES ('x;y')");
    }

    #[test]
    fn test_split_ignores_semicolons_in_block_comments() {
        let text = "CREATE TABLE a (id INT) /* trailing; note */;\nINSERT INTO a /* here; too */ VALUES (1)";
        let statements = split_statements(text);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "CREATE TABLE a (id INT) /* trailing; note */");
        assert_eq!(
            statements[1],
            "INSERT INTO a /* here; too */ VALUES (1)"
        );
    }

    fn scratch() -> (tempfile::TempDir, Database, String) {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("erp.db").to_string_lossy().into_owned();
        let db = Database::new(
            DbConfig::new(DriverKind::Sqlite, file.clone()),
            Arc::new(StaticDirectory::new([])),
        );
        (dir, db, file)
    }

    fn write_migration(dir: &tempfile::TempDir, name: &str, sql: &str) {
        std::fs::write(dir.path().join("migrations").join(name), sql).unwrap();
    }

    #[tokio::test]
    async fn test_run_applies_in_filename_order_once() {
        let (dir, db, file) = scratch();
        std::fs::create_dir(dir.path().join("migrations")).unwrap();
        write_migration(&dir, "002_seed.sql", "INSERT INTO users (name) VALUES ('root');");
        write_migration(&dir, "001_users.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT);");

        let migrator = Migrator::new(&db, &file, dir.path().join("migrations"));
        let applied = migrator.run().await.unwrap();
        assert_eq!(applied, vec!["001_users.sql", "002_seed.sql"]);

        let rows = db
            .query_on(&file, "SELECT name FROM users", &[])
            .await
            .unwrap();
        assert_eq!(rows.row_count, 1);

        // second run is a no-op
        let applied = migrator.run().await.unwrap();
        assert!(applied.is_empty());

        let record = migrator.applied().await.unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record[0].name, "001_users.sql");
    }

    #[tokio::test]
    async fn test_failed_migration_rolls_back_and_is_not_recorded() {
        let (dir, db, file) = scratch();
        std::fs::create_dir(dir.path().join("migrations")).unwrap();
        write_migration(
            &dir,
            "001_bad.sql",
            "CREATE TABLE ok_table (id INTEGER);\nINSERT INTO missing_table VALUES (1);",
        );

        let migrator = Migrator::new(&db, &file, dir.path().join("migrations"));
        assert!(migrator.run().await.is_err());

        // the create rolled back with the failing insert
        let probe = db
            .query_on(
                &file,
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'ok_table'",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(probe.row_count, 0);
        assert!(migrator.applied().await.unwrap().is_empty());
    }
}
