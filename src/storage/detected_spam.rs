//! Append-only ledger of detected-spam verdicts, bounded to the most recent
//! 500 entries per group on read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::message::CheckResponse;
use crate::storage::Engine;

const TABLE: &str = "detected_spam";
const READ_LIMIT: i64 = 500;

#[derive(Debug, Clone)]
pub struct DetectedSpamEntry {
    pub id: i64,
    pub gid: String,
    pub text: String,
    pub user_id: String,
    pub user_name: String,
    pub timestamp: DateTime<Utc>,
    pub added: bool,
    pub checks: Vec<CheckResponse>,
}

pub struct DetectedSpamLedger {
    engine: Engine,
    lock: Arc<RwLock<()>>,
}

impl DetectedSpamLedger {
    pub async fn new(engine: Engine) -> Result<Self, StorageError> {
        engine
            .init_schema(&[
                "CREATE TABLE IF NOT EXISTS detected_spam (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    gid TEXT NOT NULL,
                    text TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    user_name TEXT NOT NULL,
                    ts BIGINT NOT NULL,
                    added INTEGER NOT NULL DEFAULT 0,
                    checks TEXT NOT NULL
                )",
                "CREATE INDEX IF NOT EXISTS idx_detected_spam_gid_ts ON detected_spam(gid, ts)",
                "CREATE INDEX IF NOT EXISTS idx_detected_spam_gid_user ON detected_spam(gid, user_id)",
            ])
            .await?;
        let lock = engine.make_lock(TABLE);
        Ok(Self { engine, lock })
    }

    pub async fn write(
        &self,
        text: &str,
        user_id: &str,
        user_name: &str,
        checks: &[CheckResponse],
    ) -> Result<i64, StorageError> {
        if self.engine.gid().is_empty() {
            return Err(StorageError::Validation("gid must not be empty".into()));
        }
        let checks_json = serde_json::to_string(checks)
            .map_err(|e| StorageError::Validation(format!("failed to serialize checks: {e}")))?;
        let _guard = self.lock.write().await;
        let sql = self.engine.adopt(
            "INSERT INTO detected_spam (gid, text, user_id, user_name, ts, added, checks) \
             VALUES (?, ?, ?, ?, ?, 0, ?)",
        );
        let result = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(text)
            .bind(user_id)
            .bind(user_name)
            .bind(Utc::now().timestamp())
            .bind(checks_json)
            .execute(self.engine.pool())
            .await?;
        Ok(result.last_insert_id().unwrap_or_default())
    }

    pub async fn set_added_to_samples_flag(&self, id: i64) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        let sql = self
            .engine
            .adopt("UPDATE detected_spam SET added = 1 WHERE id = ? AND gid = ?");
        sqlx::query(sql.as_ref())
            .bind(id)
            .bind(self.engine.gid())
            .execute(self.engine.pool())
            .await?;
        Ok(())
    }

    /// Most recent 500 entries for the current group, newest first.
    pub async fn read(&self) -> Result<Vec<DetectedSpamEntry>, StorageError> {
        let _guard = self.lock.read().await;
        let sql = self.engine.adopt(
            "SELECT id, gid, text, user_id, user_name, ts, added, checks FROM detected_spam \
             WHERE gid = ? ORDER BY ts DESC LIMIT ?",
        );
        let rows = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(READ_LIMIT)
            .fetch_all(self.engine.pool())
            .await?;
        Ok(rows.iter().map(row_to_entry).collect())
    }

    /// Most recent detected-spam entry for the given user, or `None`.
    pub async fn find_by_user_id(
        &self,
        user_id: &str,
    ) -> Result<Option<DetectedSpamEntry>, StorageError> {
        let _guard = self.lock.read().await;
        let sql = self.engine.adopt(
            "SELECT id, gid, text, user_id, user_name, ts, added, checks FROM detected_spam \
             WHERE gid = ? AND user_id = ? ORDER BY ts DESC LIMIT 1",
        );
        let row = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(user_id)
            .fetch_optional(self.engine.pool())
            .await?;
        Ok(row.as_ref().map(row_to_entry))
    }
}

fn row_to_entry(row: &sqlx::any::AnyRow) -> DetectedSpamEntry {
    let checks_json: String = row.get("checks");
    let checks = serde_json::from_str(&checks_json).unwrap_or_default();
    DetectedSpamEntry {
        id: row.get("id"),
        gid: row.get("gid"),
        text: row.get("text"),
        user_id: row.get("user_id"),
        user_name: row.get("user_name"),
        timestamp: DateTime::from_timestamp(row.get::<i64, _>("ts"), 0).unwrap_or_default(),
        added: row.get::<i64, _>("added") != 0,
        checks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_find_by_user() {
        let engine = Engine::open("memory", "g1").await.unwrap();
        let ledger = DetectedSpamLedger::new(engine).await.unwrap();
        let checks = vec![CheckResponse::spam("stopword", "free money")];
        ledger.write("free money now", "7", "bob", &checks).await.unwrap();
        let found = ledger.find_by_user_id("7").await.unwrap().unwrap();
        assert_eq!(found.text, "free money now");
        assert_eq!(found.checks[0].name, "stopword");
        assert!(ledger.find_by_user_id("999").await.unwrap().is_none());
    }
}
