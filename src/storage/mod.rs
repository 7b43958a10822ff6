//! Shared storage engine: one connection pool, dialect-aware placeholder
//! rewriting, and a per-table read-write lock factory. Every concrete store
//! (`samples`, `dictionary`, `approved_users`, `detected_spam`, `locator`)
//! holds a clone of `Engine` plus the lock for the tables it owns.

pub mod approved_users;
pub mod detected_spam;
pub mod dictionary;
pub mod locator;
pub mod samples;

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, Mutex},
};

use sqlx::any::{AnyPool, AnyPoolOptions};
use tokio::sync::RwLock;

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

/// Resolves a DSN the way §6 of the spec describes, returning the dialect and
/// the connection string sqlx should actually see.
fn classify_dsn(dsn: &str) -> (Dialect, String) {
    let lower = dsn.to_ascii_lowercase();
    if lower == "memory" || lower.starts_with("memory://") || lower.starts_with("mem://") {
        (Dialect::Sqlite, "sqlite::memory:".to_string())
    } else if lower.starts_with("sqlite3:") {
        (Dialect::Sqlite, format!("sqlite:{}", &dsn["sqlite3:".len()..]))
    } else if lower.starts_with("sqlite:") {
        (Dialect::Sqlite, dsn.to_string())
    } else if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        (Dialect::Postgres, dsn.to_string())
    } else if lower.starts_with("mysql://") {
        // sqlx's MySQL driver decodes temporal columns natively; there is no
        // Rust equivalent of go-sql-driver's `parseTime` query parameter, so
        // unlike the original we pass the DSN through unchanged (see DESIGN.md).
        (Dialect::MySql, dsn.to_string())
    } else {
        (Dialect::Sqlite, format!("sqlite:{dsn}"))
    }
}

/// Rewrites `?` placeholders into the dialect's native positional form,
/// skipping `?` characters that appear inside single-quoted string literals.
fn rewrite_placeholders(query: &str) -> String {
    let mut out = String::with_capacity(query.len() + 8);
    let mut in_quote = false;
    let mut n = 0u32;
    for c in query.chars() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                out.push(c);
            }
            '?' if !in_quote => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(c),
        }
    }
    out
}

#[derive(Clone)]
pub struct Engine {
    pool: AnyPool,
    dialect: Dialect,
    gid: String,
    locks: Arc<Mutex<HashMap<&'static str, Arc<RwLock<()>>>>>,
}

impl Engine {
    pub async fn open(dsn: &str, gid: impl Into<String>) -> Result<Self, StorageError> {
        sqlx::any::install_default_drivers();
        let (dialect, conn_str) = classify_dsn(dsn);
        // An in-memory SQLite database only lives on the connection that
        // created it, so a pool spanning several connections would silently
        // fan out to several independent empty databases. Pin it to one.
        let max_connections = if conn_str == "sqlite::memory:" { 1 } else { 8 };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(&conn_str)
            .await?;
        Ok(Self {
            pool,
            dialect,
            gid: gid.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn gid(&self) -> &str {
        &self.gid
    }

    /// Rewrite `?` placeholders for the active dialect. SQLite and MySQL both
    /// accept `?` natively; only Postgres needs `$N` rewriting.
    pub fn adopt<'a>(&self, query: &'a str) -> Cow<'a, str> {
        match self.dialect {
            Dialect::Postgres => Cow::Owned(rewrite_placeholders(query)),
            _ => Cow::Borrowed(query),
        }
    }

    /// Returns the (shared, lazily-created) read-write lock that arbitrates
    /// writers for the named logical table: unbounded readers, a single writer.
    pub fn make_lock(&self, table: &'static str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks
            .entry(table)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Runs a batch of DDL statements inside one transaction, holding no
    /// application-level lock beyond sqlx's own transaction isolation — this
    /// mirrors the teacher's "engine-wide lock for init" note without needing a
    /// bespoke mutex, since schema creation only ever races with itself.
    pub async fn init_schema(&self, statements: &[&str]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for stmt in statements {
            let adopted = self.adopt(stmt);
            sqlx::query(adopted.as_ref()).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Minimal cooperative-cancellation flag shared by streamed `Iterator`
/// operations (`samples::iterator`, `dictionary::iterator`). Each step of the
/// stream checks this before doing any further work and stops producing
/// values once cancelled, per the iterator-cancellation design note.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<std::sync::atomic::AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_dsn_variants() {
        assert_eq!(classify_dsn("memory").0, Dialect::Sqlite);
        assert_eq!(classify_dsn("memory").1, "sqlite::memory:");
        assert_eq!(classify_dsn("mem://").0, Dialect::Sqlite);
        assert_eq!(classify_dsn("/tmp/x.db").1, "sqlite:/tmp/x.db");
        assert_eq!(classify_dsn("sqlite3:/tmp/x.db").1, "sqlite:/tmp/x.db");
        assert_eq!(classify_dsn("postgres://u@h/db").0, Dialect::Postgres);
        assert_eq!(classify_dsn("mysql://u@h/db").0, Dialect::MySql);
    }

    #[test]
    fn rewrite_skips_quoted_question_marks() {
        let q = "SELECT * FROM t WHERE a = ? AND b = 'lit?eral' AND c = ?";
        assert_eq!(
            rewrite_placeholders(q),
            "SELECT * FROM t WHERE a = $1 AND b = 'lit?eral' AND c = $2"
        );
    }
}
