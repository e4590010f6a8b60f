//! View sync loop: per-frame background sync and viewpoint broadcast.
//!
//! DESIGN
//! ======
//! Driven by the foreground engine's post-render tick. Two jobs run one
//! after the other against the transform cache, so a frame costs at most
//! one forward conversion:
//!
//! - the background engine is moved to the foreground's view expressed in
//!   its own source. At most one background sync is in flight; frames that
//!   arrive meanwhile skip it.
//! - the view is expressed in the Mercator basemap's space and broadcast as
//!   `changeViewpoint`, unless it is bit-identical to the last broadcast.
//!
//! Both re-check the active source's generation after awaiting and drop
//! results computed for a source that is no longer active.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::error::SyncError;
use crate::events::{AppEvent, EventBus, ViewpointChange};
use crate::geo::{ViewState, merc_to_lnglat, normalize_degree};
use crate::services::cache::TransformCache;
use crate::services::persistence::{Position, StatePersistence, StateUpdate};
use crate::source::SourceRegistry;
use crate::state::{ActiveSource, AppContext, ViewFlags, Viewport};

/// What one post-render tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameOutcome {
    pub background_synced: bool,
    pub viewpoint_emitted: bool,
}

/// Clears the in-flight flag however the background sync ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ViewSyncLoop {
    registry: Arc<SourceRegistry>,
    active: Arc<ActiveSource>,
    cache: Arc<TransformCache>,
    viewport: Arc<Viewport>,
    persistence: Arc<StatePersistence>,
    bus: EventBus,
    flags: ViewFlags,
    back_moving: AtomicBool,
    last_broadcast: Mutex<Option<ViewState>>,
}

impl ViewSyncLoop {
    #[must_use]
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            registry: Arc::clone(&ctx.registry),
            active: Arc::clone(&ctx.active),
            cache: Arc::clone(&ctx.cache),
            viewport: Arc::clone(&ctx.viewport),
            persistence: Arc::clone(&ctx.persistence),
            bus: ctx.bus.clone(),
            flags: ctx.flags,
            back_moving: AtomicBool::new(false),
            last_broadcast: Mutex::new(None),
        }
    }

    /// Handle one foreground post-render tick.
    ///
    /// # Errors
    ///
    /// Propagates conversion failures from either job.
    pub async fn on_post_render(&self) -> Result<FrameOutcome, SyncError> {
        let background_synced = self.sync_background().await?;
        let viewpoint_emitted = self.broadcast_viewpoint().await?;
        Ok(FrameOutcome { background_synced, viewpoint_emitted })
    }

    async fn sync_background(&self) -> Result<bool, SyncError> {
        let Some(bg) = &self.viewport.bg else {
            return Ok(false);
        };
        let Some(back) = bg.source().and_then(|id| self.registry.get(&id)) else {
            return Ok(false);
        };
        if self.back_moving.swap(true, Ordering::SeqCst) {
            debug!("background sync already in flight; skipped");
            return Ok(false);
        }
        let _in_flight = InFlight(&self.back_moving);

        let (active, generation) = self.active.snapshot();
        let view = self.cache.resolve(&active, self.viewport.fg.view(), &back).await?;
        if !self.active.is_current(generation) {
            debug!(background = %back.id, "active source changed; background sync dropped");
            return Ok(false);
        }
        bg.set_center(view.center);
        bg.set_zoom(view.zoom);
        bg.set_rotation(self.flags.rotation(view.rotation));
        Ok(true)
    }

    async fn broadcast_viewpoint(&self) -> Result<bool, SyncError> {
        let (active, generation) = self.active.snapshot();
        let view = self.viewport.fg.view();
        let basemap = self.registry.basemap();
        let merc = self.cache.resolve(&active, view, &basemap).await?;
        if !self.active.is_current(generation) {
            debug!(active = %active.id, "active source changed; viewpoint dropped");
            return Ok(false);
        }

        {
            let mut last = self.last_broadcast.lock().unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|prev| prev.bit_eq(&merc)) {
                return Ok(false);
            }
            *last = Some(merc);
        }

        let lnglat = merc_to_lnglat(merc.center);
        let rotation = normalize_degree(view.rotation.to_degrees());
        self.bus.emit(AppEvent::ChangeViewpoint(ViewpointChange {
            x: view.center.x,
            y: view.center.y,
            longitude: lnglat.longitude,
            latitude: lnglat.latitude,
            mercator_x: merc.center.x,
            mercator_y: merc.center.y,
            zoom: view.zoom,
            merc_zoom: merc.zoom,
            direction: normalize_degree(merc.rotation.to_degrees()),
            rotation,
        }));
        self.persistence.request_update(StateUpdate::new().position(Position {
            x: view.center.x,
            y: view.center.y,
            zoom: view.zoom,
            rotation,
        }));
        Ok(true)
    }

    /// Pull a center that left the active source's valid area back inside.
    /// Returns whether the center was moved.
    pub fn on_move_end(&self) -> bool {
        let active = self.active.get();
        let center = self.viewport.fg.view().center;
        if active.caps().inside(center) {
            return false;
        }
        let clamped = active.caps().modulate_inside(center);
        debug!(source = %active.id, x = clamped.x, y = clamped.y, "center clamped into source area");
        self.viewport.fg.set_center(clamped);
        true
    }
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
