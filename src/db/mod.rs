use std::cell::Cell;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use regex::Regex;
use rusqlite::{params, Params, Row, Statement};

pub type DbPool = Pool<SqliteConnectionManager>;

pub const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial",
    include_str!("../../migrations/001_initial.sql"),
)];

/// Every table the application owns, parents before children.
pub const TABLES: &[&str] = &[
    "users",
    "tags",
    "posts",
    "uploads",
    "post_tags",
    "post_uploads",
    "upload_tags",
    "history",
    "settings",
    "plugins",
];

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid table prefix: {0}")]
    InvalidPrefix(String),
}

/// Connection pool plus the table prefix every statement is rewritten with.
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    prefix: Arc<str>,
}

impl Database {
    pub fn open(db_path: &Path, prefix: &str) -> Result<Self, DbError> {
        if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DbError::InvalidPrefix(prefix.to_string()));
        }

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = Pool::builder().max_size(8).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        Ok(Self {
            pool,
            prefix: Arc::from(prefix),
        })
    }

    pub fn conn(&self) -> Result<Conn, DbError> {
        Ok(Conn {
            inner: self.pool.get()?,
            prefix: self.prefix.clone(),
            depth: Cell::new(0),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full table name for `name`.
    pub fn table(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn run_migrations(&self) -> Result<(), DbError> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS __schema_version (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )?;

        for (name, sql) in MIGRATIONS {
            let already_applied: bool = conn.query_row(
                "SELECT COUNT(*) > 0 FROM __schema_version WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?;

            if !already_applied {
                tracing::info!("Applying migration: {}", name);
                conn.transaction(|c| {
                    c.execute_batch(sql)?;
                    c.execute(
                        "INSERT INTO __schema_version (name) VALUES (?1)",
                        params![name],
                    )?;
                    Ok::<_, DbError>(())
                })?;
            }
        }

        tracing::info!("Database migrations complete");
        Ok(())
    }
}

fn prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(^|[^A-Za-z0-9_])__([A-Za-z][A-Za-z0-9_]*)").expect("static regex")
    })
}

/// Replace every `__name` table reference with `<prefix>name`.
pub fn apply_prefix(sql: &str, prefix: &str) -> String {
    let replacement = format!("${{1}}{}${{2}}", prefix.replace('$', "$$"));
    prefix_pattern()
        .replace_all(sql, replacement.as_str())
        .into_owned()
}

/// A pooled connection that rewrites table prefixes and nests transactions
/// with savepoints.
pub struct Conn {
    inner: PooledConnection<SqliteConnectionManager>,
    prefix: Arc<str>,
    depth: Cell<u32>,
}

impl Conn {
    pub fn sql(&self, sql: &str) -> String {
        apply_prefix(sql, &self.prefix)
    }

    pub fn table(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn execute<P: Params>(&self, sql: &str, params: P) -> rusqlite::Result<usize> {
        self.inner.execute(&self.sql(sql), params)
    }

    pub fn execute_batch(&self, sql: &str) -> rusqlite::Result<()> {
        self.inner.execute_batch(&self.sql(sql))
    }

    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> rusqlite::Result<T>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.inner.query_row(&self.sql(sql), params, f)
    }

    pub fn prepare(&self, sql: &str) -> rusqlite::Result<Statement<'_>> {
        self.inner.prepare(&self.sql(sql))
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.inner.last_insert_rowid()
    }

    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    pub fn begin(&self) -> rusqlite::Result<()> {
        let depth = self.depth.get();
        if depth == 0 {
            self.inner.execute_batch("BEGIN IMMEDIATE")?;
        } else {
            self.inner
                .execute_batch(&format!("SAVEPOINT LEVEL{}", depth))?;
        }
        self.depth.set(depth + 1);
        Ok(())
    }

    pub fn commit(&self) -> rusqlite::Result<()> {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth == 0 {
            // A failed COMMIT (deferred FK checks) leaves the transaction open
            if let Err(e) = self.inner.execute_batch("COMMIT") {
                if !self.inner.is_autocommit() {
                    if let Err(rollback) = self.inner.execute_batch("ROLLBACK") {
                        tracing::error!("Rollback after failed commit failed: {}", rollback);
                    }
                }
                return Err(e);
            }
            Ok(())
        } else {
            self.inner
                .execute_batch(&format!("RELEASE SAVEPOINT LEVEL{}", depth))
        }
    }

    pub fn rollback(&self) -> rusqlite::Result<()> {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth == 0 {
            self.inner.execute_batch("ROLLBACK")
        } else {
            self.inner.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT LEVEL{0}; RELEASE SAVEPOINT LEVEL{0}",
                depth
            ))
        }
    }

    /// Run `f` inside a transaction, or a savepoint when one is already open.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
        F: FnOnce(&Conn) -> Result<T, E>,
    {
        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback() {
                    tracing::error!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_db(dir: &Path) -> Database {
        let db = Database::open(&dir.join("test.db"), "test_").unwrap();
        db.run_migrations().unwrap();
        db
    }

    #[test]
    fn prefix_is_applied_to_table_references() {
        assert_eq!(
            apply_prefix("SELECT * FROM __posts WHERE id = ?1", "lp_"),
            "SELECT * FROM lp_posts WHERE id = ?1"
        );
        assert_eq!(
            apply_prefix("__posts JOIN __post_tags ON x", "lp_"),
            "lp_posts JOIN lp_post_tags ON x"
        );
        assert_eq!(
            apply_prefix("content='__posts'", "lp_"),
            "content='lp_posts'"
        );
    }

    #[test]
    fn identifiers_containing_double_underscore_are_left_alone() {
        assert_eq!(apply_prefix("SELECT a__b FROM t", "lp_"), "SELECT a__b FROM t");
        assert_eq!(apply_prefix("SELECT __1", "lp_"), "SELECT __1");
    }

    #[test]
    fn invalid_prefix_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let result = Database::open(&tmp.path().join("x.db"), "bad prefix;");
        assert!(matches!(result, Err(DbError::InvalidPrefix(_))));
    }

    #[test]
    fn migrations_create_prefixed_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let db = test_db(tmp.path());
        let conn = db.conn().unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };
        for table in TABLES {
            assert!(
                tables.contains(&format!("test_{}", table)),
                "missing table {}",
                table
            );
        }
        assert!(tables.contains(&"test_post_search".to_string()));
    }

    #[test]
    fn migrations_are_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let db = test_db(tmp.path());
        db.run_migrations().unwrap();

        let conn = db.conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM __schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn nested_rollback_only_undoes_inner_savepoint() {
        let tmp = tempfile::tempdir().unwrap();
        let db = test_db(tmp.path());
        let conn = db.conn().unwrap();

        conn.begin().unwrap();
        conn.execute(
            "INSERT INTO __settings (name, value) VALUES ('outer', '1')",
            [],
        )
        .unwrap();

        conn.begin().unwrap();
        assert_eq!(conn.depth(), 2);
        conn.execute(
            "INSERT INTO __settings (name, value) VALUES ('inner', '1')",
            [],
        )
        .unwrap();
        conn.rollback().unwrap();

        conn.commit().unwrap();
        assert_eq!(conn.depth(), 0);

        let names: Vec<String> = {
            let mut stmt = conn.prepare("SELECT name FROM __settings").unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };
        assert_eq!(names, vec!["outer".to_string()]);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let db = test_db(tmp.path());
        let conn = db.conn().unwrap();

        let result: Result<(), DbError> = conn.transaction(|c| {
            c.execute("INSERT INTO __settings (name, value) VALUES ('a', '1')", [])?;
            c.execute("INSERT INTO __settings (name, value) VALUES ('a', '2')", [])?;
            Ok(())
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM __settings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(conn.depth(), 0);
    }

    #[test]
    fn failed_commit_releases_the_write_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let db = test_db(tmp.path());
        let conn = db.conn().unwrap();
        conn.execute("INSERT INTO __settings (name, value) VALUES ('kept', '1')", [])
            .unwrap();

        let result: Result<(), DbError> = conn.transaction(|c| {
            c.execute_batch("PRAGMA defer_foreign_keys = ON")?;
            c.execute("DELETE FROM __settings", [])?;
            c.execute("INSERT INTO __posts (slug, author) VALUES ('orphan', 999)", [])?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(conn.depth(), 0);
        assert!(conn.inner.is_autocommit());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM __settings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let other = db.conn().unwrap();
        other
            .execute("INSERT INTO __settings (name, value) VALUES ('other', '1')", [])
            .unwrap();
    }

    #[test]
    fn foreign_keys_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let db = test_db(tmp.path());
        let conn = db.conn().unwrap();
        let result = conn.execute(
            "INSERT INTO __posts (slug, author) VALUES ('orphan', 999)",
            [],
        );
        assert!(result.is_err());
    }
}
