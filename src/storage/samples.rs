//! Ham/spam training samples, tagged by origin (`preset` bulk-loaded vs `user`
//! appended online) and scoped by group id. `UNIQUE(gid, message)` means a
//! message exists at most once per group; re-adding it with a different
//! (type, origin) replaces the row in place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::storage::{CancelFlag, Dialect, Engine};

const TABLE: &str = "samples";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Ham,
    Spam,
}

impl SampleType {
    fn as_str(self) -> &'static str {
        match self {
            SampleType::Ham => "ham",
            SampleType::Spam => "spam",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOrigin {
    Preset,
    User,
    /// Valid only for read-side filters; rejected by `add`.
    Any,
}

impl SampleOrigin {
    fn as_str(self) -> &'static str {
        match self {
            SampleOrigin::Preset => "preset",
            SampleOrigin::User => "user",
            SampleOrigin::Any => "any",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub id: i64,
    pub gid: String,
    pub timestamp: DateTime<Utc>,
    pub kind: SampleType,
    pub origin: SampleOrigin,
    pub message: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ImportStats {
    pub total_spam: u64,
    pub total_ham: u64,
    pub preset_spam: u64,
    pub preset_ham: u64,
    pub user_spam: u64,
    pub user_ham: u64,
}

pub struct SamplesStore {
    engine: Engine,
    lock: Arc<RwLock<()>>,
}

fn upsert_sql(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::MySql => {
            "INSERT INTO samples (gid, ts, type, origin, message) VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE ts = VALUES(ts), type = VALUES(type), origin = VALUES(origin)"
        }
        Dialect::Sqlite | Dialect::Postgres => {
            "INSERT INTO samples (gid, ts, type, origin, message) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(gid, message) DO UPDATE SET ts = excluded.ts, type = excluded.type, origin = excluded.origin"
        }
    }
}

impl SamplesStore {
    pub async fn new(engine: Engine) -> Result<Self, StorageError> {
        engine
            .init_schema(&[
                "CREATE TABLE IF NOT EXISTS samples (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    gid TEXT NOT NULL,
                    ts BIGINT NOT NULL,
                    type TEXT NOT NULL,
                    origin TEXT NOT NULL,
                    message TEXT NOT NULL,
                    UNIQUE(gid, message)
                )",
                "CREATE INDEX IF NOT EXISTS idx_samples_gid_type_origin ON samples(gid, type, origin)",
            ])
            .await?;
        let lock = engine.make_lock(TABLE);
        Ok(Self { engine, lock })
    }

    pub async fn add(
        &self,
        kind: SampleType,
        origin: SampleOrigin,
        message: &str,
    ) -> Result<(), StorageError> {
        if message.trim().is_empty() {
            return Err(StorageError::Validation("message must not be empty".into()));
        }
        if origin == SampleOrigin::Any {
            return Err(StorageError::Validation(
                "origin 'any' is not valid for add".into(),
            ));
        }
        let _guard = self.lock.write().await;
        let sql = self.engine.adopt(upsert_sql(self.engine.dialect()));
        sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(Utc::now().timestamp())
            .bind(kind.as_str())
            .bind(origin.as_str())
            .bind(message)
            .execute(self.engine.pool())
            .await
            .map_err(StorageError::from)
            .map_err(|e| e.context("add sample"))?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        let sql = self
            .engine
            .adopt("DELETE FROM samples WHERE id = ? AND gid = ?");
        sqlx::query(sql.as_ref())
            .bind(id)
            .bind(self.engine.gid())
            .execute(self.engine.pool())
            .await?;
        Ok(())
    }

    pub async fn delete_message(&self, message: &str) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        let sql = self
            .engine
            .adopt("DELETE FROM samples WHERE gid = ? AND message = ?");
        let result = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(message)
            .execute(self.engine.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::Validation(format!(
                "message not found in group: {message}"
            )));
        }
        Ok(())
    }

    fn read_query(kind: SampleType, origin: SampleOrigin) -> (String, bool) {
        let has_origin = origin != SampleOrigin::Any;
        let base = "SELECT id, gid, ts, type, origin, message FROM samples WHERE gid = ? AND type = ?";
        if has_origin {
            (format!("{base} AND origin = ? ORDER BY id"), true)
        } else {
            (format!("{base} ORDER BY id"), false)
        }
    }

    pub async fn read(
        &self,
        kind: SampleType,
        origin: SampleOrigin,
    ) -> Result<Vec<Sample>, StorageError> {
        let _guard = self.lock.read().await;
        let (query, has_origin) = Self::read_query(kind, origin);
        let sql = self.engine.adopt(&query);
        let mut q = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(kind.as_str());
        if has_origin {
            q = q.bind(origin.as_str());
        }
        let rows = q.fetch_all(self.engine.pool()).await?;
        Ok(rows.iter().map(row_to_sample).collect())
    }

    /// Streamed message-only view, used by the detector to tokenize samples
    /// without materializing full `Sample` rows.
    pub async fn iterator(
        &self,
        kind: SampleType,
        origin: SampleOrigin,
        cancel: CancelFlag,
    ) -> Result<SampleIterator, StorageError> {
        let samples = self.read(kind, origin).await?;
        Ok(SampleIterator {
            items: samples.into_iter().map(|s| s.message).collect::<Vec<_>>().into_iter(),
            cancel,
        })
    }

    /// Streams `reader` input (one message per line, empties skipped) into the
    /// store. When `with_cleanup` is set, all existing (type, origin) rows are
    /// removed first; both steps run in one transaction.
    pub async fn import(
        &self,
        kind: SampleType,
        origin: SampleOrigin,
        input: &str,
        with_cleanup: bool,
    ) -> Result<ImportStats, StorageError> {
        if origin == SampleOrigin::Any {
            return Err(StorageError::Validation(
                "origin 'any' is not valid for import".into(),
            ));
        }
        let _guard = self.lock.write().await;
        let mut tx = self.engine.pool().begin().await?;
        if with_cleanup {
            let sql = self
                .engine
                .adopt("DELETE FROM samples WHERE gid = ? AND type = ? AND origin = ?");
            sqlx::query(sql.as_ref())
                .bind(self.engine.gid())
                .bind(kind.as_str())
                .bind(origin.as_str())
                .execute(&mut *tx)
                .await?;
        }
        let upsert = self.engine.adopt(upsert_sql(self.engine.dialect()));
        let now = Utc::now().timestamp();
        for line in input.lines() {
            let msg = line.trim();
            if msg.is_empty() {
                continue;
            }
            sqlx::query(upsert.as_ref())
                .bind(self.engine.gid())
                .bind(now)
                .bind(kind.as_str())
                .bind(origin.as_str())
                .bind(msg)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.stats().await
    }

    async fn stats(&self) -> Result<ImportStats, StorageError> {
        let sql = self
            .engine
            .adopt("SELECT type, origin, COUNT(*) AS n FROM samples WHERE gid = ? GROUP BY type, origin");
        let rows = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .fetch_all(self.engine.pool())
            .await?;
        let mut stats = ImportStats::default();
        for row in rows {
            let kind: String = row.get("type");
            let origin: String = row.get("origin");
            let n: i64 = row.get("n");
            let n = n as u64;
            match (kind.as_str(), origin.as_str()) {
                ("spam", "preset") => {
                    stats.preset_spam += n;
                    stats.total_spam += n;
                }
                ("spam", "user") => {
                    stats.user_spam += n;
                    stats.total_spam += n;
                }
                ("ham", "preset") => {
                    stats.preset_ham += n;
                    stats.total_ham += n;
                }
                ("ham", "user") => {
                    stats.user_ham += n;
                    stats.total_ham += n;
                }
                _ => {}
            }
        }
        Ok(stats)
    }
}

fn row_to_sample(row: &sqlx::any::AnyRow) -> Sample {
    let kind_str: String = row.get("type");
    let origin_str: String = row.get("origin");
    Sample {
        id: row.get("id"),
        gid: row.get("gid"),
        timestamp: DateTime::from_timestamp(row.get::<i64, _>("ts"), 0).unwrap_or_default(),
        kind: if kind_str == "spam" {
            SampleType::Spam
        } else {
            SampleType::Ham
        },
        origin: if origin_str == "preset" {
            SampleOrigin::Preset
        } else {
            SampleOrigin::User
        },
        message: row.get("message"),
    }
}

pub struct SampleIterator {
    items: std::vec::IntoIter<String>,
    cancel: CancelFlag,
}

impl Iterator for SampleIterator {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let item = self.items.next();
        if self.cancel.is_cancelled() {
            return None;
        }
        item
    }
}

/// Adapts a [`SamplesStore`] to the detector's [`SampleUpdater`] seam, saving
/// the detector module from depending on the storage module directly.
pub struct SamplesStoreUpdater {
    store: Arc<SamplesStore>,
}

impl SamplesStoreUpdater {
    pub fn new(store: Arc<SamplesStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl crate::detector::SampleUpdater for SamplesStoreUpdater {
    async fn add_spam(&self, text: &str) -> Result<(), StorageError> {
        self.store.add(SampleType::Spam, SampleOrigin::User, text).await
    }

    async fn add_ham(&self, text: &str) -> Result<(), StorageError> {
        self.store.add(SampleType::Ham, SampleOrigin::User, text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SamplesStore {
        let engine = Engine::open("memory", "g1").await.unwrap();
        SamplesStore::new(engine).await.unwrap()
    }

    #[tokio::test]
    async fn add_rejects_empty_and_any() {
        let s = store().await;
        assert!(s.add(SampleType::Spam, SampleOrigin::User, "  ").await.is_err());
        assert!(s.add(SampleType::Spam, SampleOrigin::Any, "x").await.is_err());
    }

    #[tokio::test]
    async fn add_upserts_on_message_uniqueness() {
        let s = store().await;
        s.add(SampleType::Ham, SampleOrigin::User, "hello").await.unwrap();
        s.add(SampleType::Spam, SampleOrigin::Preset, "hello").await.unwrap();
        let spam = s.read(SampleType::Spam, SampleOrigin::Any).await.unwrap();
        let ham = s.read(SampleType::Ham, SampleOrigin::Any).await.unwrap();
        assert_eq!(spam.len(), 1);
        assert_eq!(ham.len(), 0);
    }

    #[tokio::test]
    async fn delete_message_requires_existing_row() {
        let s = store().await;
        assert!(s.delete_message("missing").await.is_err());
        s.add(SampleType::Ham, SampleOrigin::User, "hi").await.unwrap();
        assert!(s.delete_message("hi").await.is_ok());
    }

    #[tokio::test]
    async fn import_with_cleanup_replaces_set() {
        let s = store().await;
        s.import(SampleType::Spam, SampleOrigin::Preset, "a\nb\n\n", true)
            .await
            .unwrap();
        let stats = s
            .import(SampleType::Spam, SampleOrigin::Preset, "c\nd", true)
            .await
            .unwrap();
        assert_eq!(stats.preset_spam, 2);
        let rows = s.read(SampleType::Spam, SampleOrigin::Preset).await.unwrap();
        let msgs: Vec<_> = rows.iter().map(|r| r.message.clone()).collect();
        assert_eq!(msgs, vec!["c".to_string(), "d".to_string()]);
    }

    #[tokio::test]
    async fn group_isolation() {
        let e1 = Engine::open("memory", "g1").await.unwrap();
        let e2 = Engine::open("memory", "g2").await.unwrap();
        let s1 = SamplesStore::new(e1).await.unwrap();
        let s2 = SamplesStore::new(e2).await.unwrap();
        s1.add(SampleType::Spam, SampleOrigin::User, "dup").await.unwrap();
        s2.add(SampleType::Spam, SampleOrigin::User, "dup").await.unwrap();
        assert_eq!(s1.read(SampleType::Spam, SampleOrigin::Any).await.unwrap().len(), 1);
        assert_eq!(s2.read(SampleType::Spam, SampleOrigin::Any).await.unwrap().len(), 1);
    }
}
