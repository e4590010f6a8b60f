//! Application facade: the host-facing surface of one running viewer.
//!
//! DESIGN
//! ======
//! [`App`] owns the services and routes host calls and engine callbacks to
//! them. It holds no view state of its own: the view lives in the
//! foreground engine, the active source in [`ActiveSource`], pending state
//! in [`StatePersistence`]. Startup emits `sourceLoaded`, resolves what to
//! restore, and waits for the initial switch before returning.
//!
//! Dropping the `App` drops the switch scheduler's sender; the worker drains
//! and exits, and the shared context is released with it.
//!
//! ERROR HANDLING
//! ==============
//! Configuration errors surface from [`App::start`] and
//! [`App::change_map`]. Conversion errors are returned to the caller of the
//! operation that triggered them. Unknown ids are no-ops reported as
//! `false` / `None`.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::{AppOptions, AppSetting, RuntimeConfig};
use crate::engine::RenderEngine;
use crate::error::SyncError;
use crate::events::{AppEvent, EventBus};
use crate::geo::{Point, merc_to_lnglat};
use crate::services::gesture::{GestureController, GestureState, PointerEvent};
use crate::services::markers::{LineDef, MarkerService, Poi, PoiLayer, PoiPatch, PoiPosition, RedrawOutcome};
use crate::services::persistence::{KvStore, RestoreOptions, StatePersistence, StateUpdate, restore_session};
use crate::services::switch::{MapSwitchScheduler, SwitchTicket};
use crate::services::sync::{FrameOutcome, ViewSyncLoop};
use crate::source::{GpsPosition, MapMeta, SourceId, SourceRegistry, Viewpoint, affine};
use crate::state::{AppContext, ViewFlags, Viewport};

/// Rendering engines handed to the viewer by the host.
pub struct Engines {
    pub fg: Arc<dyn RenderEngine>,
    /// Only used with overlay enabled.
    pub bg: Option<Arc<dyn RenderEngine>>,
}

pub struct App {
    ctx: AppContext,
    scheduler: MapSwitchScheduler,
    sync: ViewSyncLoop,
    gestures: GestureController,
}

impl App {
    /// Build the viewer from its setting and run the initial switch.
    ///
    /// Subscribe on `bus` beforehand to observe `sourceLoaded` and the
    /// initial `mapChanged`.
    ///
    /// # Errors
    ///
    /// - Configuration errors from source building and registration.
    /// - The initial switch's own failure.
    pub async fn start(
        setting: &AppSetting,
        options: AppOptions,
        runtime: RuntimeConfig,
        engines: Engines,
        store: Option<Arc<dyn KvStore>>,
        bus: EventBus,
    ) -> Result<Self, SyncError> {
        let registry = Arc::new(SourceRegistry::new(affine::build_sources(setting)?, options.gl_adapter)?);
        let flags = ViewFlags::from_config(setting, &options);

        let store = store.filter(|_| options.restore_session);
        let restore = match (&options.restore, &store) {
            (Some(explicit), _) => explicit.clone(),
            (None, Some(store)) => {
                let now = time::OffsetDateTime::now_utc().unix_timestamp();
                restore_session(store.as_ref(), now, runtime.session_freshness).unwrap_or_default()
            }
            (None, None) => RestoreOptions::default(),
        };
        let initial = registry.initial_id(restore.map_id.as_ref(), setting.start_from.as_ref());
        let provisional = registry.provisional_from(&initial);
        debug!(%initial, provisional = %provisional.id, "initial map chosen");

        let bg = engines.bg.filter(|_| options.overlay);
        let viewport = Viewport::new(engines.fg, bg);
        let persistence = StatePersistence::new(bus.clone(), store, runtime.state_debounce);
        let markers = MarkerService::new(setting.pois.clone());
        {
            let mut store = markers.store();
            for def in &setting.sources {
                store.register_source(&def.map_id, def.pois.clone());
            }
        }
        let ctx = AppContext::new(Arc::clone(&registry), provisional, viewport, persistence, markers, bus, flags);

        ctx.bus.emit(AppEvent::SourceLoaded(registry.metas()));

        let app = Self {
            scheduler: MapSwitchScheduler::spawn(&ctx),
            sync: ViewSyncLoop::new(&ctx),
            gestures: GestureController::new(&ctx, runtime.idle_fade),
            ctx,
        };
        app.change_map(&initial, restore).await?;
        info!(app = %setting.app_name, sources = registry.len(), "viewer started");
        Ok(app)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.ctx.bus.subscribe()
    }

    #[must_use]
    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    fn fg(&self) -> &dyn RenderEngine {
        self.ctx.viewport.fg.as_ref()
    }

    // =========================================================================
    // MAP SWITCHING
    // =========================================================================

    /// Queue a switch without waiting for it.
    ///
    /// # Errors
    ///
    /// See [`MapSwitchScheduler::request_switch`].
    pub fn queue_map_change(&self, id: &SourceId, restore: RestoreOptions) -> Result<Option<SwitchTicket>, SyncError> {
        self.scheduler.request_switch(id, restore)
    }

    /// Switch to `id` and wait until the switch has been applied. Returns
    /// `false` for an unknown id.
    ///
    /// # Errors
    ///
    /// Configuration errors, or the switch's own failure.
    pub async fn change_map(&self, id: &SourceId, restore: RestoreOptions) -> Result<bool, SyncError> {
        match self.queue_map_change(id, restore)? {
            Some(ticket) => {
                ticket.wait().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[must_use]
    pub fn map_meta(&self, id: &SourceId) -> Option<MapMeta> {
        self.ctx.registry.get(id).map(|source| source.meta())
    }

    #[must_use]
    pub fn current_map_info(&self) -> MapMeta {
        self.ctx.active.get().meta()
    }

    // =========================================================================
    // ENGINE CALLBACKS
    // =========================================================================

    /// # Errors
    ///
    /// See [`ViewSyncLoop::on_post_render`].
    pub async fn on_post_render(&self) -> Result<FrameOutcome, SyncError> {
        self.sync.on_post_render().await
    }

    /// Clamp the center back into the active source and arm the idle fade.
    /// Returns whether the center was moved.
    pub fn on_move_end(&self) -> bool {
        let clamped = self.sync.on_move_end();
        self.gestures.move_end();
        clamped
    }

    pub fn on_pointer_down(&self, event: PointerEvent) {
        self.gestures.pointer_down(event);
    }

    pub fn on_pointer_drag(&self, event: PointerEvent) {
        self.gestures.pointer_drag(event);
    }

    pub fn on_pointer_up(&self, event: PointerEvent) {
        self.gestures.pointer_up(event);
    }

    /// # Errors
    ///
    /// See [`GestureController::pointer_move`].
    pub async fn on_pointer_move(&self, xy: Point) -> Result<usize, SyncError> {
        self.gestures.pointer_move(xy).await
    }

    #[must_use]
    pub fn gesture_state(&self) -> GestureState {
        self.gestures.state()
    }

    /// Handle a click at `xy`, on the marker `hit` if the engine found one.
    ///
    /// # Errors
    ///
    /// Propagates the conversion failure of a map click.
    pub async fn on_click(&self, xy: Point, hit: Option<&str>) -> Result<(), SyncError> {
        self.gestures.click();
        let marker = hit.and_then(|id| self.ctx.markers.store().get_marker(id).cloned());
        if let Some(poi) = marker {
            self.ctx.bus.emit(AppEvent::ClickMarker(poi));
            return Ok(());
        }

        self.ctx.bus.emit(AppEvent::ClickMapXy(xy));
        let merc = self.ctx.active.get().caps().xy_to_merc(xy).await?;
        self.ctx.bus.emit(AppEvent::ClickMapMerc(merc));
        let lnglat = merc_to_lnglat(merc);
        self.ctx.bus.emit(AppEvent::ClickMap { longitude: lnglat.longitude, latitude: lnglat.latitude });
        Ok(())
    }

    // =========================================================================
    // VIEW COMMANDS
    // =========================================================================

    /// # Errors
    ///
    /// Propagates conversion failures.
    pub async fn set_viewpoint(&self, cond: Viewpoint) -> Result<(), SyncError> {
        self.ctx.active.get().caps().set_viewpoint(self.fg(), cond).await
    }

    /// # Errors
    ///
    /// Propagates conversion failures.
    pub async fn go_home(&self) -> Result<(), SyncError> {
        self.ctx.active.get().caps().go_home(self.fg()).await
    }

    pub fn set_transparency(&self, percentage: f64) {
        self.ctx.viewport.set_transparency(percentage, &self.ctx.persistence);
    }

    #[must_use]
    pub fn transparency(&self) -> f64 {
        self.ctx.viewport.transparency()
    }

    /// Store the device position (kept across switches) and draw it.
    ///
    /// # Errors
    ///
    /// Propagates conversion failures.
    pub async fn set_gps_marker(&self, position: Option<GpsPosition>, ignore_move: bool) -> Result<(), SyncError> {
        self.ctx.viewport.store_gps(position);
        self.ctx.active.get().caps().set_gps_marker(self.fg(), position, ignore_move).await
    }

    /// Flush pending state immediately.
    pub fn flush_state(&self) {
        self.ctx.persistence.flush_now();
    }

    // =========================================================================
    // MARKERS
    // =========================================================================

    async fn redraw_markers(&self) -> Result<RedrawOutcome, SyncError> {
        let persistence = Arc::clone(&self.ctx.persistence);
        self.ctx.markers.redraw(self.fg(), self.ctx.active.get(), &move || persistence.hide_marker()).await
    }

    /// Add a POI to `layer` (default `main`). Returns its id, or `None` for
    /// an unknown layer.
    ///
    /// # Errors
    ///
    /// Propagates redraw conversion failures; the POI stays stored.
    pub async fn add_marker(&self, poi: Poi, layer: Option<&str>) -> Result<Option<String>, SyncError> {
        let added = self.ctx.markers.store().add_marker(poi, layer);
        if added.is_some() {
            self.ctx.dispatch_poi_number();
            self.redraw_markers().await?;
        }
        Ok(added)
    }

    /// # Errors
    ///
    /// Propagates redraw conversion failures.
    pub async fn remove_marker(&self, id: &str) -> Result<bool, SyncError> {
        let removed = self.ctx.markers.store().remove_marker(id);
        if removed {
            self.ctx.dispatch_poi_number();
            self.redraw_markers().await?;
        }
        Ok(removed)
    }

    /// Change a POI's fields and redraw. See [`MarkerStore::update_marker`].
    ///
    /// # Errors
    ///
    /// Propagates redraw conversion failures; the change stays stored.
    ///
    /// [`MarkerStore::update_marker`]: crate::services::markers::MarkerStore::update_marker
    pub async fn update_marker(&self, id: &str, patch: PoiPatch, overwrite: bool) -> Result<bool, SyncError> {
        let updated = self.ctx.markers.store().update_marker(id, patch, overwrite);
        if updated {
            self.redraw_markers().await?;
        }
        Ok(updated)
    }

    /// Clear one layer's POIs, or every app layer's with `None`.
    ///
    /// # Errors
    ///
    /// Propagates redraw conversion failures.
    pub async fn clear_markers(&self, layer: Option<&str>) -> Result<bool, SyncError> {
        let cleared = self.ctx.markers.store().clear_markers(layer);
        if cleared {
            self.ctx.dispatch_poi_number();
            self.redraw_markers().await?;
        }
        Ok(cleared)
    }

    /// Select a POI, redraw, and center the view on it.
    ///
    /// # Errors
    ///
    /// Propagates conversion failures.
    pub async fn select_marker(&self, id: &str) -> Result<Option<Poi>, SyncError> {
        let Some(poi) = self.ctx.markers.store().select(id) else {
            return Ok(None);
        };
        self.redraw_markers().await?;
        let cond = match poi.position {
            PoiPosition::Xy(xy) => Viewpoint { x: Some(xy.x), y: Some(xy.y), ..Viewpoint::default() },
            PoiPosition::Merc(merc) => geographic(merc),
            PoiPosition::Lnglat(lnglat) => Viewpoint {
                longitude: Some(lnglat.longitude),
                latitude: Some(lnglat.latitude),
                ..Viewpoint::default()
            },
        };
        self.set_viewpoint(cond).await?;
        Ok(Some(poi))
    }

    /// # Errors
    ///
    /// Propagates redraw conversion failures.
    pub async fn unselect_marker(&self) -> Result<bool, SyncError> {
        let unselected = self.ctx.markers.store().unselect();
        if unselected {
            self.redraw_markers().await?;
        }
        Ok(unselected)
    }

    /// # Errors
    ///
    /// Propagates redraw conversion failures.
    pub async fn show_all_markers(&self) -> Result<(), SyncError> {
        self.ctx.persistence.request_update(StateUpdate::new().hide_marker(false));
        self.redraw_markers().await.map(|_| ())
    }

    /// # Errors
    ///
    /// Propagates redraw conversion failures.
    pub async fn hide_all_markers(&self) -> Result<(), SyncError> {
        self.ctx.persistence.request_update(StateUpdate::new().hide_marker(true));
        self.redraw_markers().await.map(|_| ())
    }

    // =========================================================================
    // LAYERS AND LINES
    // =========================================================================

    /// # Errors
    ///
    /// Propagates redraw conversion failures.
    pub async fn add_poi_layer(&self, layer: PoiLayer) -> Result<bool, SyncError> {
        let added = self.ctx.markers.store().add_layer(layer);
        if added {
            self.ctx.dispatch_poi_number();
            self.redraw_markers().await?;
        }
        Ok(added)
    }

    /// # Errors
    ///
    /// Propagates redraw conversion failures.
    pub async fn remove_poi_layer(&self, id: &str) -> Result<bool, SyncError> {
        let removed = self.ctx.markers.store().remove_layer(id);
        if removed {
            self.ctx.dispatch_poi_number();
            self.redraw_markers().await?;
        }
        Ok(removed)
    }

    /// # Errors
    ///
    /// Propagates redraw conversion failures.
    pub async fn show_poi_layer(&self, id: &str) -> Result<bool, SyncError> {
        self.set_poi_layer_hidden(id, false).await
    }

    /// # Errors
    ///
    /// Propagates redraw conversion failures.
    pub async fn hide_poi_layer(&self, id: &str) -> Result<bool, SyncError> {
        self.set_poi_layer_hidden(id, true).await
    }

    async fn set_poi_layer_hidden(&self, id: &str, hidden: bool) -> Result<bool, SyncError> {
        let joined = {
            let mut store = self.ctx.markers.store();
            if !store.set_layer_hidden(id, hidden) {
                return Ok(false);
            }
            store.hidden_layer_ids(&self.ctx.active.get().id)
        };
        self.ctx.persistence.request_update(StateUpdate::new().hide_layer(joined));
        self.redraw_markers().await?;
        Ok(true)
    }

    /// App layers plus the active map's own layers.
    #[must_use]
    pub fn list_poi_layers(&self, hide_only: bool, nonzero: bool) -> Vec<PoiLayer> {
        let active = self.ctx.active.get();
        self.ctx.markers.store().list_layers(&active.id, hide_only, nonzero).into_iter().cloned().collect()
    }

    #[must_use]
    pub fn poi_number(&self) -> usize {
        let active = self.ctx.active.get();
        self.ctx.markers.store().poi_number(&active.id)
    }

    /// # Errors
    ///
    /// Propagates conversion failures; the line stays stored.
    pub async fn add_line(&self, line: LineDef) -> Result<(), SyncError> {
        self.ctx.markers.add_line(self.fg(), &self.ctx.active.get(), line).await
    }

    pub fn clear_lines(&self) {
        self.ctx.markers.clear_lines(self.fg());
    }
}

fn geographic(merc: Point) -> Viewpoint {
    let lnglat = merc_to_lnglat(merc);
    Viewpoint { longitude: Some(lnglat.longitude), latitude: Some(lnglat.latitude), ..Viewpoint::default() }
}

#[cfg(test)]
#[path = "app_test.rs"]
mod tests;
