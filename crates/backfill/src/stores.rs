use std::fmt;
use std::sync::Arc;

use backfill_core::{BackfillStore, BarStore, CoverageRegistry, JobRepository, RateLimiter};

/// Handles to every persistence seam, usually all backed by one store.
#[derive(Clone)]
pub struct Stores {
    /// Bar storage.
    pub bars: Arc<dyn BarStore>,
    /// Job and chunk lifecycle.
    pub jobs: Arc<dyn JobRepository>,
    /// Symbols and coverage definitions.
    pub registry: Arc<dyn CoverageRegistry>,
    /// Shared rate buckets.
    pub limiter: Arc<dyn RateLimiter>,
}

impl Stores {
    /// Uses one store for every seam.
    #[must_use]
    pub fn new<S: BackfillStore + 'static>(store: Arc<S>) -> Self {
        Self {
            bars: store.clone(),
            jobs: store.clone(),
            registry: store.clone(),
            limiter: store,
        }
    }
}

impl fmt::Debug for Stores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
