//! Stop-phrases and ignored tokens, scoped per group. Stop-phrases are matched
//! as case-insensitive substrings of cleaned text; ignored words are excluded
//! from classifier tokenization.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::storage::{CancelFlag, Dialect, Engine};

const TABLE: &str = "dictionary";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictionaryType {
    StopPhrase,
    IgnoredWord,
}

impl DictionaryType {
    fn as_str(self) -> &'static str {
        match self {
            DictionaryType::StopPhrase => "stop_phrase",
            DictionaryType::IgnoredWord => "ignored_word",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DictionaryEntry {
    pub id: i64,
    pub gid: String,
    pub timestamp: DateTime<Utc>,
    pub kind: DictionaryType,
    pub data: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DictionaryImportStats {
    pub total_stop_phrases: u64,
    pub total_ignored_words: u64,
}

pub struct DictionaryStore {
    engine: Engine,
    lock: Arc<RwLock<()>>,
}

fn upsert_sql(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::MySql => {
            "INSERT INTO dictionary (gid, ts, type, data) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE ts = VALUES(ts), type = VALUES(type)"
        }
        Dialect::Sqlite | Dialect::Postgres => {
            "INSERT INTO dictionary (gid, ts, type, data) VALUES (?, ?, ?, ?) \
             ON CONFLICT(gid, data) DO UPDATE SET ts = excluded.ts, type = excluded.type"
        }
    }
}

impl DictionaryStore {
    pub async fn new(engine: Engine) -> Result<Self, StorageError> {
        engine
            .init_schema(&[
                "CREATE TABLE IF NOT EXISTS dictionary (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    gid TEXT NOT NULL,
                    ts BIGINT NOT NULL,
                    type TEXT NOT NULL,
                    data TEXT NOT NULL,
                    UNIQUE(gid, data)
                )",
                "CREATE INDEX IF NOT EXISTS idx_dictionary_gid_type ON dictionary(gid, type)",
            ])
            .await?;
        let lock = engine.make_lock(TABLE);
        Ok(Self { engine, lock })
    }

    pub async fn add(&self, kind: DictionaryType, data: &str) -> Result<(), StorageError> {
        if data.trim().is_empty() {
            return Err(StorageError::Validation("entry must not be empty".into()));
        }
        let _guard = self.lock.write().await;
        let sql = self.engine.adopt(upsert_sql(self.engine.dialect()));
        sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(Utc::now().timestamp())
            .bind(kind.as_str())
            .bind(data)
            .execute(self.engine.pool())
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        let sql = self
            .engine
            .adopt("DELETE FROM dictionary WHERE id = ? AND gid = ?");
        sqlx::query(sql.as_ref())
            .bind(id)
            .bind(self.engine.gid())
            .execute(self.engine.pool())
            .await?;
        Ok(())
    }

    pub async fn read(&self, kind: DictionaryType) -> Result<Vec<DictionaryEntry>, StorageError> {
        let _guard = self.lock.read().await;
        let sql = self.engine.adopt(
            "SELECT id, gid, ts, type, data FROM dictionary WHERE gid = ? AND type = ? ORDER BY id",
        );
        let rows = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(kind.as_str())
            .fetch_all(self.engine.pool())
            .await?;
        Ok(rows
            .iter()
            .map(|row| DictionaryEntry {
                id: row.get("id"),
                gid: row.get("gid"),
                timestamp: DateTime::from_timestamp(row.get::<i64, _>("ts"), 0).unwrap_or_default(),
                kind,
                data: row.get("data"),
            })
            .collect())
    }

    pub async fn iterator(
        &self,
        kind: DictionaryType,
        cancel: CancelFlag,
    ) -> Result<DictionaryIterator, StorageError> {
        let entries = self.read(kind).await?;
        Ok(DictionaryIterator {
            items: entries.into_iter().map(|e| e.data).collect::<Vec<_>>().into_iter(),
            cancel,
        })
    }

    /// CSV import: not RFC-4180 strict. Supports quoted fields with `""`
    /// escapes, trims a leading space after a comma, allows a variable number
    /// of fields per record, and skips empty fields.
    pub async fn import(
        &self,
        kind: DictionaryType,
        input: &str,
        with_cleanup: bool,
    ) -> Result<DictionaryImportStats, StorageError> {
        let _guard = self.lock.write().await;
        let mut tx = self.engine.pool().begin().await?;
        if with_cleanup {
            let sql = self.engine.adopt("DELETE FROM dictionary WHERE gid = ? AND type = ?");
            sqlx::query(sql.as_ref())
                .bind(self.engine.gid())
                .bind(kind.as_str())
                .execute(&mut *tx)
                .await?;
        }
        let upsert = self.engine.adopt(upsert_sql(self.engine.dialect()));
        let now = Utc::now().timestamp();
        for record in parse_csv_lenient(input) {
            for field in record {
                let field = field.trim();
                if field.is_empty() {
                    continue;
                }
                sqlx::query(upsert.as_ref())
                    .bind(self.engine.gid())
                    .bind(now)
                    .bind(kind.as_str())
                    .bind(field)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        self.stats().await
    }

    async fn stats(&self) -> Result<DictionaryImportStats, StorageError> {
        let sql = self
            .engine
            .adopt("SELECT type, COUNT(*) AS n FROM dictionary WHERE gid = ? GROUP BY type");
        let rows = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .fetch_all(self.engine.pool())
            .await?;
        let mut stats = DictionaryImportStats::default();
        for row in rows {
            let kind: String = row.get("type");
            let n: i64 = row.get("n");
            match kind.as_str() {
                "stop_phrase" => stats.total_stop_phrases = n as u64,
                "ignored_word" => stats.total_ignored_words = n as u64,
                _ => {}
            }
        }
        Ok(stats)
    }
}

pub struct DictionaryIterator {
    items: std::vec::IntoIter<String>,
    cancel: CancelFlag,
}

impl Iterator for DictionaryIterator {
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

/// Lenient CSV line parser: handles quoted fields with `""` escapes and a
/// variable number of fields per record. Deliberately not RFC-4180 strict —
/// e.g. it does not validate that every record has the same arity.
fn parse_csv_lenient(input: &str) -> Vec<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::Fields)
        .from_reader(input.as_bytes());
    let mut out = Vec::new();
    for result in reader.records() {
        if let Ok(record) = result {
            out.push(record.iter().map(|f| f.to_string()).collect());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> DictionaryStore {
        let engine = Engine::open("memory", "g1").await.unwrap();
        DictionaryStore::new(engine).await.unwrap()
    }

    #[tokio::test]
    async fn add_and_read_roundtrip() {
        let d = store().await;
        d.add(DictionaryType::StopPhrase, "free money").await.unwrap();
        let rows = d.read(DictionaryType::StopPhrase).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data, "free money");
    }

    #[tokio::test]
    async fn csv_import_handles_quotes_and_empty_fields() {
        let d = store().await;
        let input = "word1, \"word, with comma\", , \"quote\"\"inside\"\"\"\n";
        let stats = d.import(DictionaryType::IgnoredWord, input, false).await.unwrap();
        assert_eq!(stats.total_ignored_words, 3);
        let rows = d.read(DictionaryType::IgnoredWord).await.unwrap();
        let data: Vec<_> = rows.iter().map(|r| r.data.clone()).collect();
        assert!(data.contains(&"word1".to_string()));
        assert!(data.contains(&"word, with comma".to_string()));
        assert!(data.contains(&"quote\"inside\"".to_string()));
    }
}
