use anyhow::{Context, Result};
use async_trait::async_trait;

/// Key-value persistence keyed by path.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }
}
