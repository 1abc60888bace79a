//! SQLite-backed store
//!
//! Handles persistence of quota state to the `kv_store` table. Values are
//! stored as JSON text so the engine sees exactly what it wrote.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::{KeyValueStore, StoreError};
use crate::db::Database;

/// Durable [`KeyValueStore`] on top of the shared SQLite pool
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SqliteStore with the given database pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn from_database(db: &Database) -> Self {
        Self::new(db.pool.clone())
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT key, value FROM kv_store WHERE key IN (");
        let mut separated = query.separated(", ");
        for key in keys {
            separated.push_bind(key.clone());
        }
        separated.push_unseparated(")");

        let rows: Vec<(String, String)> = query.build_query_as().fetch_all(&self.pool).await?;

        let mut values = HashMap::with_capacity(rows.len());
        for (key, raw) in rows {
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => {
                    values.insert(key, value);
                }
                Err(e) => {
                    // An unreadable value is treated as absent
                    log::warn!("[store:sqlite] Dropping corrupt value for {}: {}", key, e);
                }
            }
        }

        log::debug!(
            "[store:sqlite] Read {} of {} keys",
            values.len(),
            keys.len()
        );
        Ok(values)
    }

    async fn set(&self, values: HashMap<String, Value>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for (key, value) in &values {
            let raw = serde_json::to_string(value)?;
            sqlx::query(
                r#"
                INSERT INTO kv_store (key, value, updated_at)
                VALUES (?, ?, datetime('now'))
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(key)
            .bind(&raw)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        log::debug!("[store:sqlite] Wrote {} keys", values.len());
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<Value>,
        new: Value,
    ) -> Result<bool, StoreError> {
        let raw_new = serde_json::to_string(&new)?;

        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO kv_store (key, value, updated_at)
                    VALUES (?, ?, datetime('now'))
                    ON CONFLICT(key) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(&raw_new)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                let raw_expected = serde_json::to_string(&expected)?;
                sqlx::query(
                    r#"
                    UPDATE kv_store
                    SET value = ?, updated_at = datetime('now')
                    WHERE key = ? AND value = ?
                    "#,
                )
                .bind(&raw_new)
                .bind(key)
                .bind(&raw_expected)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn create_store() -> (SqliteStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Database::open(temp_dir.path().join("kv.db"))
            .await
            .expect("Failed to create test database");
        (SqliteStore::from_database(&db), temp_dir)
    }

    #[tokio::test]
    async fn test_set_then_get_round_trips_json() {
        let (store, _dir) = create_store().await;
        store
            .set(HashMap::from([
                ("usage".to_string(), json!(1234)),
                ("active".to_string(), json!(true)),
                ("start".to_string(), Value::Null),
            ]))
            .await
            .unwrap();

        let got = store
            .get(&[
                "usage".to_string(),
                "active".to_string(),
                "start".to_string(),
                "missing".to_string(),
            ])
            .await
            .unwrap();

        assert_eq!(got.len(), 3);
        assert_eq!(got.get("usage"), Some(&json!(1234)));
        assert_eq!(got.get("active"), Some(&json!(true)));
        assert_eq!(got.get("start"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let (store, _dir) = create_store().await;
        for n in 0..3 {
            store
                .set(HashMap::from([("k".to_string(), json!(n))]))
                .await
                .unwrap();
        }
        let got = store.get(&["k".to_string()]).await.unwrap();
        assert_eq!(got.get("k"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_get_with_no_keys() {
        let (store, _dir) = create_store().await;
        assert!(store.get(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_value_is_dropped() {
        let (store, _dir) = create_store().await;
        sqlx::query("INSERT INTO kv_store (key, value) VALUES ('bad', '{not json')")
            .execute(&store.pool)
            .await
            .unwrap();

        let got = store.get(&["bad".to_string()]).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let (store, _dir) = create_store().await;

        assert!(store.compare_and_set("k", None, json!(1)).await.unwrap());
        assert!(!store.compare_and_set("k", None, json!(9)).await.unwrap());
        assert!(!store
            .compare_and_set("k", Some(json!(5)), json!(9))
            .await
            .unwrap());
        assert!(store
            .compare_and_set("k", Some(json!(1)), json!(2))
            .await
            .unwrap());

        let got = store.get(&["k".to_string()]).await.unwrap();
        assert_eq!(got.get("k"), Some(&json!(2)));
    }
}
