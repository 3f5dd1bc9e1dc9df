//! Asset store seam used by the loader to resolve `@uri` document references.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("asset not found: {location}"))]
    NotFound { location: String },

    #[snafu(display("asset i/o error: {location}, {source}"))]
    Io {
        location: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Metadata for a stored object.
#[derive(Debug, Clone)]
pub struct AssetMeta {
    pub url: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Read-only object store the loader and engine resolve references through.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn exists(&self, url: &str) -> bool;
    async fn list(&self, url: &str) -> Result<Vec<String>>;
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
    async fn object(&self, url: &str) -> Result<AssetMeta>;
}

/// Joins a base URL and a relative path with a single separator.
#[must_use]
pub fn join(base: &str, path: &str) -> String {
    if base.is_empty() {
        return path.to_string();
    }
    if path.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Filesystem-backed store; URLs are plain paths.
#[derive(Debug, Default)]
pub struct LocalAssetStore;

impl LocalAssetStore {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AssetStore for LocalAssetStore {
    async fn exists(&self, url: &str) -> bool {
        tokio::fs::try_exists(url).await.unwrap_or(false)
    }

    async fn list(&self, url: &str) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(url)
            .await
            .context(IoSnafu { location: url })?;
        let mut result = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context(IoSnafu { location: url })?
        {
            result.push(entry.path().display().to_string());
        }
        Ok(result)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        tokio::fs::read(url).await.context(IoSnafu { location: url })
    }

    async fn object(&self, url: &str) -> Result<AssetMeta> {
        let meta = tokio::fs::metadata(url)
            .await
            .context(IoSnafu { location: url })?;
        Ok(AssetMeta {
            url: url.to_string(),
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::from),
        })
    }
}

/// In-memory store for tests and embedded documents.
#[derive(Debug, Default)]
pub struct MemoryAssetStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryAssetStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, url: &str, content: impl Into<Vec<u8>>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(url.to_string(), content.into());
        }
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn exists(&self, url: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(url))
            .unwrap_or(false)
    }

    async fn list(&self, url: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", url.trim_end_matches('/'));
        let entries = self.entries.read().map_err(|_| Error::NotFound {
            location: url.to_string(),
        })?;
        Ok(entries
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(url).cloned())
            .context(NotFoundSnafu { location: url })
    }

    async fn object(&self, url: &str) -> Result<AssetMeta> {
        let size = self
            .entries
            .read()
            .ok()
            .and_then(|entries| entries.get(url).map(|content| content.len() as u64))
            .context(NotFoundSnafu { location: url })?;
        Ok(AssetMeta {
            url: url.to_string(),
            size,
            modified: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join("base/", "/req.json"), "base/req.json");
        assert_eq!(join("", "req.json"), "req.json");
        assert_eq!(join("base", ""), "base");
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryAssetStore::new();
        store.put("wf/default/req.json", br#"{"a":1}"#.to_vec());
        assert!(store.exists("wf/default/req.json").await);
        assert!(!store.exists("wf/other.json").await);
        assert_eq!(store.download("wf/default/req.json").await.unwrap(), br#"{"a":1}"#);
        assert_eq!(store.list("wf/default").await.unwrap().len(), 1);
    }
}
