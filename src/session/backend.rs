//! 会话持久化后端：按 key 存取序列化后的会话记录

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// 会话记录存取接口（值为 JSON 字符串）
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// 不存在时返回 None
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// 进程内后端（测试与单机使用）
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    records: RwLock<HashMap<String, String>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        self.records.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.records.write().await.remove(key);
        Ok(())
    }
}

#[cfg(feature = "async-sqlite")]
mod sqlite {
    use std::path::Path;

    use anyhow::Context;
    use async_trait::async_trait;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
    use sqlx::Row;

    use super::SessionBackend;

    /// SQLite 后端：表 sessions(key PRIMARY KEY, value, updated_at)
    pub struct SqliteBackend {
        pool: SqlitePool,
    }

    impl SqliteBackend {
        pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
            let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&db_url)
                .await?;

            let backend = Self { pool };
            backend.init_tables().await?;
            Ok(backend)
        }

        /// 从连接池创建（表需已存在或随后调用 init_tables）
        pub fn from_pool(pool: SqlitePool) -> Self {
            Self { pool }
        }

        pub async fn init_tables(&self) -> Result<(), sqlx::Error> {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS sessions (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
            )
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl SessionBackend for SqliteBackend {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            let row = sqlx::query("SELECT value FROM sessions WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("load session {key}"))?;
            match row {
                Some(row) => Ok(Some(row.try_get::<String, _>("value")?)),
                None => Ok(None),
            }
        }

        async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
            let now = chrono::Utc::now().to_rfc3339();
            sqlx::query(
                "INSERT INTO sessions (key, value, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(value)
            .bind(&now)
            .execute(&self.pool)
            .await
            .with_context(|| format!("save session {key}"))?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            sqlx::query("DELETE FROM sessions WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
                .await
                .with_context(|| format!("delete session {key}"))?;
            Ok(())
        }
    }

}

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteBackend;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_backend() {
        let backend = InMemoryBackend::new();
        backend.set("a", "1".into()).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(backend.get("b").await.unwrap(), None);
        backend.delete("a").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
    }
}
