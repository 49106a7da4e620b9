//! Inflight Coordinator
//!
//! At most one upstream fetch runs per grid cell, regardless of language.
//! The fetch is a detached tokio task owned by the registry: it runs to
//! completion even when every caller stopped waiting, and it removes its own
//! registry slot when done. Callers observe the outcome through a
//! [`Shared`] handle, so every joiner sees the same single result.
//!
//! ```text
//!   start_or_join(cell) ──▶ slot exists? ──yes──▶ Joined(shared)
//!                                 │
//!                                 no
//!                                 ▼
//!              spawn task { outcome = fetch.await; unregister(cell, gen) }
//!                                 │
//!                                 ▼
//!                          Started(shared)
//! ```
//!
//! The coordinator is generic over what a fetch resolves to so the service
//! can hand joiners the starter's language and timestamp along with the
//! upstream outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::task::JoinError;
use tracing::{debug, error};

use crate::cache::GridCell;

/// Handle every joiner of a fetch awaits
pub type SharedOutcome<T> = Shared<BoxFuture<'static, T>>;

/// Whether the caller started a new fetch or joined a running one
pub enum Admission<T> {
    Started(SharedOutcome<T>),
    Joined(SharedOutcome<T>),
}

impl<T> Admission<T> {
    pub fn outcome(self) -> SharedOutcome<T> {
        match self {
            Admission::Started(outcome) | Admission::Joined(outcome) => outcome,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Admission::Started(_))
    }
}

struct Slot<T> {
    generation: u64,
    outcome: SharedOutcome<T>,
}

type Registry<T> = Arc<Mutex<HashMap<GridCell, Slot<T>>>>;

/// Registry of running fetches keyed by grid cell.
///
/// `T` is what a fetch resolves to; a task that panicked or was cancelled
/// resolves to `T::from(JoinError)`.
pub struct InflightCoordinator<T> {
    slots: Registry<T>,
    generation: AtomicU64,
}

impl<T> Default for InflightCoordinator<T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }
}

impl<T> std::fmt::Debug for InflightCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightCoordinator")
            .field("pending", &self.slots.lock().len())
            .finish()
    }
}

impl<T> InflightCoordinator<T>
where
    T: Clone + Send + Sync + From<JoinError> + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the running fetch of `cell`, or spawn the one built by `fetch`.
    ///
    /// `fetch` is only invoked when no fetch is running. The spawned task
    /// unregisters itself once `fetch` resolved, so any state the future
    /// applies is visible before a new fetch for the cell can start.
    pub fn start_or_join<F, Fut>(&self, cell: GridCell, fetch: F) -> Admission<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(&cell) {
            return Admission::Joined(slot.outcome.clone());
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.slots);
        let work = fetch();
        let handle = tokio::spawn(async move {
            let outcome = work.await;
            let mut slots = registry.lock();
            if slots.get(&cell).map(|s| s.generation) == Some(generation) {
                slots.remove(&cell);
            }
            outcome
        });

        let outcome = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Fetch task for cell {} failed: {}", cell, e);
                    T::from(e)
                }
            }
        }
        .boxed()
        .shared();

        slots.insert(
            cell,
            Slot {
                generation,
                outcome: outcome.clone(),
            },
        );
        debug!(%cell, pending = slots.len(), "Started upstream fetch");
        Admission::Started(outcome)
    }

    /// Number of fetches running or waiting for the rate limiter
    pub fn pending(&self) -> usize {
        self.slots.lock().len()
    }
}
