//! Users exempted from first-message checks. The persisted row never stores
//! the running `count` — see the detector's "approved-user count is
//! process-derived on load" design note: every reloaded row is immediately
//! treated as approved.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::storage::Engine;

const TABLE: &str = "approved_users";

#[derive(Debug, Clone)]
pub struct ApprovedUserRow {
    pub id: i64,
    pub user_id: String,
    pub user_name: String,
    pub timestamp: DateTime<Utc>,
}

pub struct ApprovedUsersStore {
    engine: Engine,
    lock: Arc<RwLock<()>>,
}

impl ApprovedUsersStore {
    pub async fn new(engine: Engine) -> Result<Self, StorageError> {
        engine
            .init_schema(&[
                "CREATE TABLE IF NOT EXISTS approved_users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    gid TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    user_name TEXT NOT NULL,
                    ts BIGINT NOT NULL,
                    UNIQUE(gid, user_id)
                )",
            ])
            .await?;
        let lock = engine.make_lock(TABLE);
        Ok(Self { engine, lock })
    }

    /// Ordered by timestamp DESC, most recently approved first.
    pub async fn read(&self) -> Result<Vec<ApprovedUserRow>, StorageError> {
        let _guard = self.lock.read().await;
        let sql = self.engine.adopt(
            "SELECT id, user_id, user_name, ts FROM approved_users WHERE gid = ? ORDER BY ts DESC",
        );
        let rows = sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .fetch_all(self.engine.pool())
            .await?;
        Ok(rows
            .iter()
            .map(|row| ApprovedUserRow {
                id: row.get("id"),
                user_id: row.get("user_id"),
                user_name: row.get("user_name"),
                timestamp: DateTime::from_timestamp(row.get::<i64, _>("ts"), 0).unwrap_or_default(),
            })
            .collect())
    }

    /// Insert-or-ignore by user id: the first write wins the timestamp.
    pub async fn write(&self, user_id: &str, user_name: &str) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        let sql = match self.engine.dialect() {
            crate::storage::Dialect::MySql => {
                "INSERT IGNORE INTO approved_users (gid, user_id, user_name, ts) VALUES (?, ?, ?, ?)"
            }
            _ => {
                "INSERT INTO approved_users (gid, user_id, user_name, ts) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(gid, user_id) DO NOTHING"
            }
        };
        let sql = self.engine.adopt(sql);
        sqlx::query(sql.as_ref())
            .bind(self.engine.gid())
            .bind(user_id)
            .bind(user_name)
            .bind(Utc::now().timestamp())
            .execute(self.engine.pool())
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        let sql = self
            .engine
            .adopt("DELETE FROM approved_users WHERE id = ? AND gid = ?");
        sqlx::query(sql.as_ref())
            .bind(id)
            .bind(self.engine.gid())
            .execute(self.engine.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_is_insert_or_ignore() {
        let engine = Engine::open("memory", "g1").await.unwrap();
        let store = ApprovedUsersStore::new(engine).await.unwrap();
        store.write("42", "alice").await.unwrap();
        store.write("42", "alice-renamed").await.unwrap();
        let rows = store.read().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_name, "alice");
    }
}
