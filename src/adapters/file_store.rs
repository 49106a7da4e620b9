//! JSON File Document Store
//!
//! Implements the `DocumentStore` port with one JSON file per document in a
//! data directory. Writes go to a temporary file first and are renamed into
//! place so a crash never leaves a half-written document behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::domain::ports::{Document, DocumentStore};
use crate::error::{Error, Result};

/// File-backed document store
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `dir` (created on first save)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Data directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, document: Document) -> PathBuf {
        self.dir.join(format!("{}.json", document.key()))
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn load(&self, document: Document) -> Result<Option<serde_json::Value>> {
        let path = self.path_of(document);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };

        let value = serde_json::from_slice(&raw).map_err(|e| Error::Storage {
            document: document.to_string(),
            reason: format!("corrupt JSON in {}: {}", path.display(), e),
        })?;
        debug!("Loaded {} ({} bytes)", path.display(), raw.len());
        Ok(Some(value))
    }

    async fn save(&self, document: Document, value: serde_json::Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_of(document);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec(&value)?;

        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Saved {} ({} bytes)", path.display(), raw.len());
        Ok(())
    }
}
