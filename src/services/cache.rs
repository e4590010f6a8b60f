//! Transform cache: memoized view conversion between sources.
//!
//! DESIGN
//! ======
//! Converting the current view into another source's space takes two hops:
//! the active source's forward conversion into canonical Mercator terms,
//! then the target's reverse conversion. Both can be expensive and are
//! asked for several times per frame (background sync, viewpoint
//! broadcast), so results are kept in a single buffer keyed by the active
//! source and its view rounded to 10 fractional digits.
//!
//! The buffer is replaced wholesale when the key changes; there is no
//! per-entry eviction. Each replacement bumps a generation counter.
//! Conversions run without the lock held, and their results are stored only
//! if the generation they were computed for is still current.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::SyncError;
use crate::geo::{MercView, ViewState};
use crate::source::{Source, SourceId};

#[derive(Debug, Default)]
struct ConversionBuffer {
    generation: u64,
    active: Option<SourceId>,
    snapshot: Option<ViewState>,
    mercs: Option<MercView>,
    sizes: HashMap<SourceId, ViewState>,
}

impl ConversionBuffer {
    fn matches(&self, active: &SourceId, snapshot: &ViewState) -> bool {
        self.active.as_ref() == Some(active) && self.snapshot.is_some_and(|s| s.bit_eq(snapshot))
    }
}

/// Memoizes `active view -> Mercator -> target view` conversions.
#[derive(Debug, Default)]
pub struct TransformCache {
    buffer: Mutex<ConversionBuffer>,
}

impl TransformCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ConversionBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current buffer generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// `view` (in `active`'s space) expressed in `target`'s space, rounded.
    ///
    /// # Errors
    ///
    /// Propagates conversion failures from either source; nothing is cached
    /// for a failed conversion.
    pub async fn resolve(&self, active: &Source, view: ViewState, target: &Source) -> Result<ViewState, SyncError> {
        let snapshot = view.rounded();
        let (mercs, generation) = self.canonical(active, snapshot).await?;
        if target.id == active.id {
            return Ok(snapshot);
        }

        if let Some(size) = self.lookup(generation, &target.id) {
            debug!(target = %target.id, "transform cache hit");
            return Ok(size);
        }

        debug!(target = %target.id, "transform cache miss");
        let size = target.caps().mercs_to_size(&mercs).await?.rounded();
        let mut buffer = self.lock();
        if Some(buffer.generation) == generation {
            buffer.sizes.insert(target.id.clone(), size);
        } else {
            debug!(target = %target.id, "discarding conversion for a replaced cache generation");
        }
        Ok(size)
    }

    /// Canonical Mercator view for `snapshot`, plus the generation it is
    /// stored under (`None` if it could not be stored).
    async fn canonical(&self, active: &Source, snapshot: ViewState) -> Result<(MercView, Option<u64>), SyncError> {
        let observed = {
            let buffer = self.lock();
            if buffer.matches(&active.id, &snapshot)
                && let Some(mercs) = buffer.mercs
            {
                return Ok((mercs, Some(buffer.generation)));
            }
            buffer.generation
        };

        debug!(active = %active.id, "converting view to Mercator");
        let mercs = active.caps().size_to_mercs(snapshot).await?;

        let mut buffer = self.lock();
        if buffer.matches(&active.id, &snapshot)
            && let Some(stored) = buffer.mercs
        {
            return Ok((stored, Some(buffer.generation)));
        }
        if buffer.generation != observed {
            debug!(active = %active.id, "cache replaced during conversion; result not stored");
            return Ok((mercs, None));
        }
        buffer.generation += 1;
        buffer.active = Some(active.id.clone());
        buffer.snapshot = Some(snapshot);
        buffer.mercs = Some(mercs);
        buffer.sizes.clear();
        buffer.sizes.insert(active.id.clone(), snapshot);
        Ok((mercs, Some(buffer.generation)))
    }

    fn lookup(&self, generation: Option<u64>, target: &SourceId) -> Option<ViewState> {
        let buffer = self.lock();
        if Some(buffer.generation) != generation {
            return None;
        }
        buffer.sizes.get(target).copied()
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod tests;
