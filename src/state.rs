//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppContext` bundles the shared components of one running viewer. It is
//! cheap to clone (every field is `Arc`-wrapped or a channel handle) and is
//! handed to each component's constructor, which keeps only the pieces it
//! needs. Nothing in here points back at the `App` facade.
//!
//! The active source lives in [`ActiveSource`] together with a generation
//! number bumped on every reassignment. Async work that started against one
//! generation re-checks it after each await and drops its result if the
//! active source moved on in the meantime.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::{AppOptions, AppSetting};
use crate::engine::RenderEngine;
use crate::events::EventBus;
use crate::services::cache::TransformCache;
use crate::services::markers::MarkerService;
use crate::services::persistence::{StatePersistence, StateUpdate};
use crate::source::{GpsPosition, Source, SourceRegistry};

// =============================================================================
// ACTIVE SOURCE
// =============================================================================

/// The source currently shown in the foreground (`from`).
#[derive(Debug)]
pub struct ActiveSource {
    slot: Mutex<(Arc<Source>, u64)>,
}

impl ActiveSource {
    #[must_use]
    pub fn new(source: Arc<Source>) -> Self {
        Self { slot: Mutex::new((source, 0)) }
    }

    fn lock(&self) -> MutexGuard<'_, (Arc<Source>, u64)> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn get(&self) -> Arc<Source> {
        Arc::clone(&self.lock().0)
    }

    /// Active source and its generation.
    #[must_use]
    pub fn snapshot(&self) -> (Arc<Source>, u64) {
        let slot = self.lock();
        (Arc::clone(&slot.0), slot.1)
    }

    /// Reassign and return the new generation.
    pub fn set(&self, source: Arc<Source>) -> u64 {
        let mut slot = self.lock();
        slot.0 = source;
        slot.1 += 1;
        slot.1
    }

    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.lock().1 == generation
    }
}

// =============================================================================
// VIEWPORT
// =============================================================================

/// The engines plus the host-visible display state they do not keep.
pub struct Viewport {
    /// Foreground engine; its view is the source of truth.
    pub fg: Arc<dyn RenderEngine>,
    /// Background engine, present only with overlay enabled.
    pub bg: Option<Arc<dyn RenderEngine>>,
    transparency: Mutex<f64>,
    gps: Mutex<Option<GpsPosition>>,
}

impl Viewport {
    #[must_use]
    pub fn new(fg: Arc<dyn RenderEngine>, bg: Option<Arc<dyn RenderEngine>>) -> Self {
        Self { fg, bg, transparency: Mutex::new(0.0), gps: Mutex::new(None) }
    }

    #[must_use]
    pub fn transparency(&self) -> f64 {
        *self.transparency.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply foreground transparency and queue it for persistence.
    pub fn set_transparency(&self, percentage: f64, persistence: &StatePersistence) {
        *self.transparency.lock().unwrap_or_else(PoisonError::into_inner) = percentage;
        self.fg.set_transparency(percentage);
        persistence.request_update(StateUpdate::new().transparency(percentage));
    }

    #[must_use]
    pub fn gps(&self) -> Option<GpsPosition> {
        *self.gps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store_gps(&self, position: Option<GpsPosition>) {
        *self.gps.lock().unwrap_or_else(PoisonError::into_inner) = position;
    }
}

impl std::fmt::Debug for Viewport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Viewport").field("overlay", &self.bg.is_some()).finish_non_exhaustive()
    }
}

// =============================================================================
// APP CONTEXT
// =============================================================================

/// Behavior switches fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewFlags {
    /// Apply per-source zoom bounds on switch.
    pub zoom_restriction: bool,
    /// Force rotation to 0 whenever a view is applied.
    pub no_rotate: bool,
    /// A GL overlay adapter is available.
    pub gl_adapter: bool,
}

impl ViewFlags {
    #[must_use]
    pub fn from_config(setting: &AppSetting, options: &AppOptions) -> Self {
        Self {
            zoom_restriction: setting.zoom_restriction,
            no_rotate: setting.no_rotate || options.no_rotate,
            gl_adapter: options.gl_adapter,
        }
    }

    /// Rotation to apply given a converted one.
    #[must_use]
    pub fn rotation(self, rotation: f64) -> f64 {
        if self.no_rotate { 0.0 } else { rotation }
    }
}

/// Shared components of one running viewer.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub registry: Arc<SourceRegistry>,
    pub active: Arc<ActiveSource>,
    pub cache: Arc<TransformCache>,
    pub viewport: Arc<Viewport>,
    pub persistence: Arc<StatePersistence>,
    pub markers: Arc<MarkerService>,
    pub bus: EventBus,
    pub flags: ViewFlags,
}

impl AppContext {
    #[must_use]
    pub fn new(
        registry: Arc<SourceRegistry>,
        provisional: Arc<Source>,
        viewport: Viewport,
        persistence: StatePersistence,
        markers: MarkerService,
        bus: EventBus,
        flags: ViewFlags,
    ) -> Self {
        Self {
            registry,
            active: Arc::new(ActiveSource::new(provisional)),
            cache: Arc::new(TransformCache::new()),
            viewport: Arc::new(viewport),
            persistence: Arc::new(persistence),
            markers: Arc::new(markers),
            bus,
            flags,
        }
    }

    /// Re-emit the POI count seen from the active source.
    pub fn dispatch_poi_number(&self) {
        let active = self.active.get();
        let count = self.markers.store().poi_number(&active.id);
        self.bus.emit(crate::events::AppEvent::PoiNumber(count));
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
#[path = "state_helpers_test.rs"]
pub mod test_helpers;

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
