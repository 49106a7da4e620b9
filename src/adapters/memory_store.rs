//! In-Memory Document Store
//!
//! Implements the `DocumentStore` port on a `DashMap`. Used by tests and by
//! the binary when no data directory is configured.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::ports::{Document, DocumentStore};
use crate::error::{Error, Result};

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub loads: u64,
    pub saves: u64,
}

/// In-memory document store
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: DashMap<Document, serde_json::Value>,
    loads: AtomicU64,
    saves: AtomicU64,
    /// When set, every save fails (for failure-path tests)
    fail_saves: std::sync::atomic::AtomicBool,
}

impl InMemoryDocumentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with a document
    pub fn with_document(document: Document, value: serde_json::Value) -> Self {
        let store = Self::default();
        store.documents.insert(document, value);
        store
    }

    /// Current content of a document
    pub fn get(&self, document: Document) -> Option<serde_json::Value> {
        self.documents.get(&document).map(|v| v.clone())
    }

    /// Make subsequent saves fail
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Relaxed);
    }

    /// Load/save counters
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            loads: self.loads.load(Ordering::Relaxed),
            saves: self.saves.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn load(&self, document: Document) -> Result<Option<serde_json::Value>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.get(document))
    }

    async fn save(&self, document: Document, value: serde_json::Value) -> Result<()> {
        if self.fail_saves.load(Ordering::Relaxed) {
            return Err(Error::Storage {
                document: document.to_string(),
                reason: "save rejected".to_string(),
            });
        }
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.documents.insert(document, value);
        Ok(())
    }
}
