//! Persistence
//!
//! Loads the two persisted documents at startup and decides when a dirty
//! document is written back.
//!
//! # Flush rule
//!
//! A dirty document is written when any of these holds:
//!
//! - it has been quiet (no change) for its save delay
//! - its flush interval elapsed since the last write
//! - an immediate flush was requested (after a reset)
//! - the caller forces it (shutdown)
//!
//! The document is serialized under its lock, written outside of it, and the
//! serialized revision is recorded as saved afterwards. Changes made while
//! the write was in flight keep the document dirty.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheStore, DirtyState, HotnessTracker, LoadReport};
use crate::config::{CacheConfig, PersistenceConfig};
use crate::domain::ports::{Document, DocumentStore};
use crate::error::Result;

/// What one flush pass wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub cache_saved: bool,
    pub hotness_saved: bool,
}

/// State restored at startup
#[derive(Debug)]
pub struct Restored {
    pub store: CacheStore,
    pub hotness: HotnessTracker,
    pub report: LoadReport,
    pub hot_pruned: usize,
}

#[derive(Debug, Clone, Copy)]
struct Schedule {
    last_write: Instant,
    flush_now: bool,
}

impl Schedule {
    fn new() -> Self {
        Self {
            last_write: Instant::now(),
            flush_now: false,
        }
    }
}

/// Writes the cache and hotness documents through a [`DocumentStore`]
pub struct Persistence {
    documents: Arc<dyn DocumentStore>,
    config: PersistenceConfig,
    cache: Mutex<Schedule>,
    hotness: Mutex<Schedule>,
    // One flush pass at a time
    writer: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("config", &self.config)
            .finish()
    }
}

impl Persistence {
    pub fn new(documents: Arc<dyn DocumentStore>, config: PersistenceConfig) -> Self {
        Self {
            documents,
            config,
            cache: Mutex::new(Schedule::new()),
            hotness: Mutex::new(Schedule::new()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Load both documents.
    ///
    /// A missing document starts empty. A document that cannot be read is
    /// logged and also starts empty, so a corrupt file never keeps the
    /// service down.
    #[instrument(skip(self, cache_config))]
    pub async fn load(&self, cache_config: CacheConfig, hotness_ttl: Duration) -> Restored {
        let hot_doc = self.load_document(Document::Hotness).await;
        let mut hotness = hot_doc
            .as_ref()
            .map(HotnessTracker::from_document)
            .unwrap_or_default();
        let hot_pruned = hotness.prune(Utc::now(), hotness_ttl);

        let cache_doc = self.load_document(Document::Cache).await;
        let (store, report) = match cache_doc {
            Some(doc) => CacheStore::load(cache_config, &doc, &hotness),
            None => (CacheStore::new(cache_config), LoadReport::default()),
        };

        info!(
            "Loaded {} cache entries ({} migrated, {} skipped, {} trimmed) and {} hotness records",
            report.loaded,
            report.migrated,
            report.skipped,
            report.trimmed,
            hotness.len()
        );
        Restored {
            store,
            hotness,
            report,
            hot_pruned,
        }
    }

    async fn load_document(&self, document: Document) -> Option<serde_json::Value> {
        match self.documents.load(document).await {
            Ok(doc) => doc,
            Err(e) => {
                error!("Failed to load {}: {}", document, e);
                None
            }
        }
    }

    /// Write the documents whose flush is due; `force` writes every dirty one.
    pub async fn flush(
        &self,
        store: &RwLock<CacheStore>,
        hotness: &RwLock<HotnessTracker>,
        force: bool,
    ) -> Result<FlushReport> {
        let _writer = self.writer.lock().await;
        let mut report = FlushReport::default();
        let mut first_error = None;

        let snapshot = {
            let store = store.read();
            let due = self.due(
                &self.cache,
                store.dirty(),
                self.config.cache_save_delay,
                self.config.cache_flush_interval,
                force,
            );
            due.then(|| (store.to_document(), store.dirty().revision()))
        };
        if let Some((doc, revision)) = snapshot {
            match self.write(Document::Cache, doc, &self.cache).await {
                Ok(()) => {
                    store.write().mark_saved(revision);
                    report.cache_saved = true;
                }
                Err(e) => first_error = Some(e),
            }
        }

        let snapshot = {
            let hotness = hotness.read();
            let due = self.due(
                &self.hotness,
                hotness.dirty(),
                self.config.hotness_save_delay,
                self.config.hotness_flush_interval,
                force,
            );
            due.then(|| (hotness.to_document(), hotness.dirty().revision()))
        };
        if let Some((doc, revision)) = snapshot {
            match self.write(Document::Hotness, doc, &self.hotness).await {
                Ok(()) => {
                    hotness.write().mark_saved(revision);
                    report.hotness_saved = true;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Ask for the next flush pass to write `document` if it is dirty
    pub fn request_flush(&self, document: Document) {
        debug!("Immediate flush requested for {}", document);
        self.schedule(document).lock().flush_now = true;
    }

    fn schedule(&self, document: Document) -> &Mutex<Schedule> {
        match document {
            Document::Cache => &self.cache,
            Document::Hotness => &self.hotness,
        }
    }

    fn due(
        &self,
        schedule: &Mutex<Schedule>,
        dirty: &DirtyState,
        save_delay: Duration,
        flush_interval: Duration,
        force: bool,
    ) -> bool {
        if !dirty.is_dirty() {
            return false;
        }
        let now = Instant::now();
        let schedule = schedule.lock();
        force
            || schedule.flush_now
            || dirty.idle_for(now).is_some_and(|idle| idle >= save_delay)
            || now.saturating_duration_since(schedule.last_write) >= flush_interval
    }

    async fn write(
        &self,
        document: Document,
        doc: serde_json::Value,
        schedule: &Mutex<Schedule>,
    ) -> Result<()> {
        match self.documents.save(document, doc).await {
            Ok(()) => {
                let mut schedule = schedule.lock();
                schedule.last_write = Instant::now();
                schedule.flush_now = false;
                debug!("Saved {}", document);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to save {}: {}", document, e);
                Err(e)
            }
        }
    }
}
