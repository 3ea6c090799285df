//! 轮次持久化
//!
//! MessageStore 负责整表保存 / 加载 / 清空。文件实现写单个 JSON 数组；
//! 文件不存在视为空，内容损坏时记录警告并视为空。

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::llm::embedding::content_hash;
use crate::memory::{MemoryError, Turn};

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(&self, turns: &[Turn]) -> Result<(), MemoryError>;

    async fn load(&self) -> Result<Vec<Turn>, MemoryError>;

    async fn clear(&self) -> Result<(), MemoryError>;
}

/// 进程内存储（无持久化）
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    turns: Mutex<Vec<Turn>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save(&self, turns: &[Turn]) -> Result<(), MemoryError> {
        *self.turns.lock().await = turns.to_vec();
        Ok(())
    }

    async fn load(&self) -> Result<Vec<Turn>, MemoryError> {
        Ok(self.turns.lock().await.clone())
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        self.turns.lock().await.clear();
        Ok(())
    }
}

/// JSON 文件存储：[{id, query, answer, summary, created_at}]
#[derive(Debug)]
pub struct FileMessageStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileMessageStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// 会话专属文件 `<dir>/<key>.json`；key 含不宜做文件名的字符时替换为 '_' 并附加内容哈希前缀
    pub fn for_session(dir: impl AsRef<Path>, key: &str) -> Self {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let name = if !key.is_empty() && safe == key {
            format!("{key}.json")
        } else {
            format!("{safe}-{}.json", &content_hash(key)[..8])
        };
        Self::new(dir.as_ref().join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_json(&self, turns: &[Turn]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(turns)?;
        tokio::fs::write(&self.path, data)
            .await
            .with_context(|| format!("write {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn save(&self, turns: &[Turn]) -> Result<(), MemoryError> {
        let _guard = self.lock.lock().await;
        self.write_json(turns)
            .await
            .map_err(|e| MemoryError::Persistence(format!("{e:#}")))
    }

    async fn load(&self) -> Result<Vec<Turn>, MemoryError> {
        let _guard = self.lock.lock().await;
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "turn file unreadable, starting empty");
                return Ok(Vec::new());
            }
        };
        match serde_json::from_str::<Vec<Turn>>(&data) {
            Ok(turns) => {
                tracing::info!(path = %self.path.display(), count = turns.len(), "turns loaded");
                Ok(turns)
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "turn file corrupt, starting empty");
                Ok(Vec::new())
            }
        }
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MemoryError::Persistence(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn turn(id: u64) -> Turn {
        Turn {
            id,
            query: format!("q{id}"),
            answer: format!("a{id}"),
            summary: format!("q{id} → a{id}"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = FileMessageStore::new(dir.path().join("nested/turns.json"));

        assert!(store.load().await.unwrap().is_empty());

        let turns = vec![turn(0), turn(1)];
        store.save(&turns).await.unwrap();
        assert_eq!(store.load().await.unwrap(), turns);

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("turns.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileMessageStore::new(&path);
        assert!(store.load().await.unwrap().is_empty());
    }

    #[test]
    fn test_session_file_names() {
        let dir = Path::new("/tmp/turns");
        assert_eq!(
            FileMessageStore::for_session(dir, "user-1").path(),
            dir.join("user-1.json")
        );
        let a = FileMessageStore::for_session(dir, "a/b");
        let b = FileMessageStore::for_session(dir, "a_b");
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(dir));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryMessageStore::new();
        store.save(&[turn(3)]).await.unwrap();
        assert_eq!(store.load().await.unwrap()[0].id, 3);
        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }
}
