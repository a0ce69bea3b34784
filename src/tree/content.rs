use std::path::Path;
use async_trait::async_trait;

/// Supplies file contents to the tree builder and the source map store.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn get_content(&self, path: &Path) -> crate::Result<String>;
}

/// Reads straight from disk.
pub struct FsContentSource;

#[async_trait]
impl ContentSource for FsContentSource {
    async fn get_content(&self, path: &Path) -> crate::Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| crate::Error::ContentUnavailable {
                uri: path.display().to_string(),
                reason: e.to_string(),
            })
    }
}
