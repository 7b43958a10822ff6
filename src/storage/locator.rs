//! Content-hash → message-metadata mapping used to resolve an admin's reply
//! (which only carries text) back to the original message, plus a per-user
//! spam-check cache. Both tables share the same TTL/min-size eviction rule.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::Row;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::message::CheckResponse;
use crate::storage::{Dialect, Engine};

const MESSAGES_TABLE: &str = "locator_messages";
const SPAM_TABLE: &str = "locator_spam";

#[derive(Debug, Clone)]
pub struct LocatorMessage {
    pub hash: String,
    pub gid: String,
    pub time: DateTime<Utc>,
    pub chat_id: i64,
    pub user_id: String,
    pub user_name: String,
    pub msg_id: i32,
}

#[derive(Debug, Clone)]
pub struct LocatorSpam {
    pub user_id: String,
    pub gid: String,
    pub time: DateTime<Utc>,
    pub checks: Vec<CheckResponse>,
}

pub struct Locator {
    engine: Engine,
    messages_lock: Arc<RwLock<()>>,
    spam_lock: Arc<RwLock<()>>,
    ttl: Duration,
    min_size: i64,
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

impl Locator {
    pub async fn new(engine: Engine, ttl: Duration, min_size: i64) -> Result<Self, StorageError> {
        engine
            .init_schema(&[
                "CREATE TABLE IF NOT EXISTS locator_messages (
                    hash TEXT NOT NULL,
                    gid TEXT NOT NULL,
                    ts BIGINT NOT NULL,
                    chat_id BIGINT NOT NULL,
                    user_id TEXT NOT NULL,
                    user_name TEXT NOT NULL,
                    msg_id INTEGER NOT NULL,
                    PRIMARY KEY (gid, hash)
                )",
                "CREATE INDEX IF NOT EXISTS idx_locator_messages_gid_user ON locator_messages(gid, user_id)",
                "CREATE INDEX IF NOT EXISTS idx_locator_messages_gid_name ON locator_messages(gid, user_name)",
                "CREATE TABLE IF NOT EXISTS locator_spam (
                    user_id TEXT NOT NULL,
                    gid TEXT NOT NULL,
                    ts BIGINT NOT NULL,
                    checks TEXT NOT NULL,
                    PRIMARY KEY (gid, user_id)
                )",
            ])
            .await?;
        let messages_lock = engine.make_lock(MESSAGES_TABLE);
        let spam_lock = engine.make_lock(SPAM_TABLE);
        Ok(Self {
            engine,
            messages_lock,
            spam_lock,
            ttl,
            min_size,
        })
    }

    pub async fn add_message(
        &self,
        text: &str,
        chat_id: i64,
        user_id: &str,
        user_name: &str,
        msg_id: i32,
    ) -> Result<(), StorageError> {
        let hash = sha256_hex(text);
        let _guard = self.messages_lock.write().await;
        let sql = self.engine.adopt(upsert_message_sql(self.engine.dialect()));
        sqlx::query(sql.as_ref())
            .bind(hash)
            .bind(self.engine.gid())
            .bind(Utc::now().timestamp())
            .bind(chat_id)
            .bind(user_id)
            .bind(user_name)
            .bind(msg_id)
            .execute(self.engine.pool())
            .await?;
        drop(_guard);
        self.cleanup_messages().await
    }

    pub async fn add_spam(&self, user_id: &str, checks: &[CheckResponse]) -> Result<(), StorageError> {
        let checks_json = serde_json::to_string(checks)
            .map_err(|e| StorageError::Validation(format!("failed to serialize checks: {e}")))?;
        let _guard = self.spam_lock.write().await;
        let sql = self.engine.adopt(upsert_spam_sql(self.engine.dialect()));
        sqlx::query(sql.as_ref())
            .bind(user_id)
            .bind(self.engine.gid())
            .bind(Utc::now().timestamp())
            .bind(checks_json)
            .execute(self.engine.pool())
            .await?;
        drop(_guard);
        self.cleanup_spam().await
    }

    pub async fn message(&self, text: &str) -> Result<Option<LocatorMessage>, StorageError> {
        let hash = sha256_hex(text);
        let _guard = self.messages_lock.read().await;
        let sql = self.engine.adopt(
            "SELECT hash, gid, ts, chat_id, user_id, user_name, msg_id FROM locator_messages \
             WHERE gid = ? AND hash = ?",
        );
        let row = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(hash)
            .fetch_optional(self.engine.pool())
            .await?;
        Ok(row.as_ref().map(row_to_message))
    }

    pub async fn user_name_by_id(&self, user_id: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.messages_lock.read().await;
        let sql = self.engine.adopt(
            "SELECT user_name FROM locator_messages WHERE gid = ? AND user_id = ? LIMIT 1",
        );
        let row = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(user_id)
            .fetch_optional(self.engine.pool())
            .await?;
        Ok(row.map(|r| r.get("user_name")))
    }

    pub async fn user_id_by_name(&self, user_name: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.messages_lock.read().await;
        let sql = self.engine.adopt(
            "SELECT user_id FROM locator_messages WHERE gid = ? AND user_name = ? LIMIT 1",
        );
        let row = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(user_name)
            .fetch_optional(self.engine.pool())
            .await?;
        Ok(row.map(|r| r.get("user_id")))
    }

    /// Returns `None` on a missing row or on a stored-JSON parse failure —
    /// a corrupt row is treated the same as no row.
    pub async fn spam(&self, user_id: &str) -> Result<Option<LocatorSpam>, StorageError> {
        let _guard = self.spam_lock.read().await;
        let sql = self
            .engine
            .adopt("SELECT user_id, gid, ts, checks FROM locator_spam WHERE gid = ? AND user_id = ?");
        let row = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(user_id)
            .fetch_optional(self.engine.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };
        let checks_json: String = row.get("checks");
        let Ok(checks) = serde_json::from_str(&checks_json) else {
            return Ok(None);
        };
        Ok(Some(LocatorSpam {
            user_id: row.get("user_id"),
            gid: row.get("gid"),
            time: DateTime::from_timestamp(row.get::<i64, _>("ts"), 0).unwrap_or_default(),
            checks,
        }))
    }

    async fn cleanup_messages(&self) -> Result<(), StorageError> {
        let _guard = self.messages_lock.write().await;
        self.evict("locator_messages").await
    }

    async fn cleanup_spam(&self) -> Result<(), StorageError> {
        let _guard = self.spam_lock.write().await;
        self.evict("locator_spam").await
    }

    /// `DELETE WHERE time < now-ttl AND gid=? AND (SELECT COUNT(*) WHERE gid=?) > minSize`.
    /// The min-size floor keeps small groups from being emptied by a long idle
    /// period.
    async fn evict(&self, table: &str) -> Result<(), StorageError> {
        let cutoff = (Utc::now() - self.ttl).timestamp();
        let sql = format!(
            "DELETE FROM {table} WHERE gid = ? AND ts < ? \
             AND (SELECT COUNT(*) FROM {table} WHERE gid = ?) > ?"
        );
        let sql = self.engine.adopt(&sql);
        sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(cutoff)
            .bind(self.engine.gid())
            .bind(self.min_size)
            .execute(self.engine.pool())
            .await?;
        Ok(())
    }
}

fn upsert_message_sql(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::MySql => {
            "INSERT INTO locator_messages (hash, gid, ts, chat_id, user_id, user_name, msg_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE ts = VALUES(ts), chat_id = VALUES(chat_id), \
             user_id = VALUES(user_id), user_name = VALUES(user_name), msg_id = VALUES(msg_id)"
        }
        Dialect::Sqlite | Dialect::Postgres => {
            "INSERT INTO locator_messages (hash, gid, ts, chat_id, user_id, user_name, msg_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(gid, hash) DO UPDATE SET ts = excluded.ts, chat_id = excluded.chat_id, \
             user_id = excluded.user_id, user_name = excluded.user_name, msg_id = excluded.msg_id"
        }
    }
}

fn upsert_spam_sql(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::MySql => {
            "INSERT INTO locator_spam (user_id, gid, ts, checks) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE ts = VALUES(ts), checks = VALUES(checks)"
        }
        Dialect::Sqlite | Dialect::Postgres => {
            "INSERT INTO locator_spam (user_id, gid, ts, checks) VALUES (?, ?, ?, ?) \
             ON CONFLICT(gid, user_id) DO UPDATE SET ts = excluded.ts, checks = excluded.checks"
        }
    }
}

fn row_to_message(row: &sqlx::any::AnyRow) -> LocatorMessage {
    LocatorMessage {
        hash: row.get("hash"),
        gid: row.get("gid"),
        time: DateTime::from_timestamp(row.get::<i64, _>("ts"), 0).unwrap_or_default(),
        chat_id: row.get("chat_id"),
        user_id: row.get("user_id"),
        user_name: row.get("user_name"),
        msg_id: row.get("msg_id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_message_then_lookup_by_hash() {
        let engine = Engine::open("memory", "g1").await.unwrap();
        let locator = Locator::new(engine, Duration::hours(24), 100).await.unwrap();
        locator.add_message("hello spam", 10, "5", "bob", 99).await.unwrap();
        let found = locator.message("hello spam").await.unwrap().unwrap();
        assert_eq!(found.msg_id, 99);
        assert_eq!(found.user_name, "bob");
        assert!(locator.message("never seen").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn name_and_id_lookups_resolve_both_ways() {
        let engine = Engine::open("memory", "g1").await.unwrap();
        let locator = Locator::new(engine, Duration::hours(24), 100).await.unwrap();
        locator.add_message("hi", 10, "5", "bob", 1).await.unwrap();
        assert_eq!(locator.user_name_by_id("5").await.unwrap().as_deref(), Some("bob"));
        assert_eq!(locator.user_id_by_name("bob").await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn eviction_respects_min_size_floor() {
        let engine = Engine::open("memory", "g1").await.unwrap();
        let locator = Locator::new(engine, Duration::seconds(-1), 2).await.unwrap();
        locator.add_message("a", 1, "1", "a", 1).await.unwrap();
        locator.add_message("b", 1, "2", "b", 2).await.unwrap();
        // ttl is already expired for both rows, but min_size=2 keeps them.
        assert!(locator.message("a").await.unwrap().is_some());
        assert!(locator.message("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn spam_roundtrip() {
        let engine = Engine::open("memory", "g1").await.unwrap();
        let locator = Locator::new(engine, Duration::hours(24), 100).await.unwrap();
        let checks = vec![CheckResponse::spam("classifier", "p=0.98")];
        locator.add_spam("7", &checks).await.unwrap();
        let found = locator.spam("7").await.unwrap().unwrap();
        assert_eq!(found.checks[0].name, "classifier");
        assert!(locator.spam("no-such-user").await.unwrap().is_none());
    }
}
