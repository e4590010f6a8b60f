//! Map switch scheduler: serialized source changes.
//!
//! DESIGN
//! ======
//! Switch requests go through an unbounded mpsc queue drained by a single
//! worker task, so a switch starts only after the previous one has fully
//! finished. Each request carries a oneshot reply; the caller awaits its
//! [`SwitchTicket`] to learn when (and whether) its switch was applied.
//!
//! The worker owns a `SwitchContext` holding the shared pieces it needs.
//! Dropping the scheduler drops the only sender, the worker's `recv` returns
//! `None`, and the worker exits, releasing its context.
//!
//! ERROR HANDLING
//! ==============
//! Configuration errors (GL source without adapter) are returned
//! synchronously by [`MapSwitchScheduler::request_switch`]; unknown ids are
//! a no-op. A switch that fails mid-way reports the error to its own
//! requester and the worker moves on to the next queued switch.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::engine::RenderEngine;
use crate::error::SyncError;
use crate::events::{AppEvent, EventBus};
use crate::services::cache::TransformCache;
use crate::services::markers::MarkerService;
use crate::services::persistence::{RestoreOptions, StatePersistence, StateUpdate};
use crate::source::{Source, SourceId, SourceKind, SourceRegistry};
use crate::state::{ActiveSource, AppContext, ViewFlags, Viewport};

// =============================================================================
// REQUESTS
// =============================================================================

struct SwitchRequest {
    target: Arc<Source>,
    restore: RestoreOptions,
    reply: oneshot::Sender<Result<(), SyncError>>,
}

/// Completion handle for one queued switch.
#[derive(Debug)]
pub struct SwitchTicket {
    target: SourceId,
    rx: oneshot::Receiver<Result<(), SyncError>>,
}

impl SwitchTicket {
    #[must_use]
    pub fn target(&self) -> &SourceId {
        &self.target
    }

    /// Wait until the switch has been applied.
    ///
    /// # Errors
    ///
    /// The switch's own failure, or [`SyncError::SchedulerClosed`] if the
    /// worker went away before answering.
    pub async fn wait(self) -> Result<(), SyncError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SyncError::SchedulerClosed),
        }
    }
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Front end of the switch queue.
#[derive(Debug)]
pub struct MapSwitchScheduler {
    tx: mpsc::UnboundedSender<SwitchRequest>,
    registry: Arc<SourceRegistry>,
    gl_adapter: bool,
}

impl MapSwitchScheduler {
    /// Spawn the switch worker. Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(ctx: &AppContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = SwitchContext::new(ctx);
        tokio::spawn(run_worker(worker, rx));
        Self { tx, registry: Arc::clone(&ctx.registry), gl_adapter: ctx.flags.gl_adapter }
    }

    /// Queue a switch to `target`.
    ///
    /// Returns `Ok(None)` for an unknown id.
    ///
    /// # Errors
    ///
    /// - [`SyncError::GlAdapterMissing`] if `target` needs a GL adapter and none is configured.
    /// - [`SyncError::SchedulerClosed`] if the worker is gone.
    pub fn request_switch(&self, target: &SourceId, restore: RestoreOptions) -> Result<Option<SwitchTicket>, SyncError> {
        let Some(source) = self.registry.get(target) else {
            debug!(%target, "switch to unknown source ignored");
            return Ok(None);
        };
        if source.kind.needs_gl_adapter() && !self.gl_adapter {
            return Err(SyncError::GlAdapterMissing { id: source.id.clone() });
        }

        let (reply, rx) = oneshot::channel();
        self.tx.send(SwitchRequest { target: source, restore, reply }).map_err(|_| SyncError::SchedulerClosed)?;
        debug!(%target, "switch queued");
        Ok(Some(SwitchTicket { target: target.clone(), rx }))
    }
}

async fn run_worker(mut worker: SwitchContext, mut rx: mpsc::UnboundedReceiver<SwitchRequest>) {
    while let Some(request) = rx.recv().await {
        let target = request.target.id.clone();
        info!(%target, initial = worker.initial, "map switch started");
        let result = worker.switch_to(&request.target, &request.restore).await;
        match &result {
            Ok(()) => info!(%target, "map switch complete"),
            Err(e) => warn!(%target, error = %e, "map switch failed"),
        }
        if request.reply.send(result).is_err() {
            debug!(%target, "switch requester dropped its ticket");
        }
    }
    debug!("map switch worker stopped");
}

// =============================================================================
// SWITCH CONTEXT
// =============================================================================

/// Everything one switch touches.
struct SwitchContext {
    registry: Arc<SourceRegistry>,
    active: Arc<ActiveSource>,
    cache: Arc<TransformCache>,
    viewport: Arc<Viewport>,
    persistence: Arc<StatePersistence>,
    markers: Arc<MarkerService>,
    bus: EventBus,
    flags: ViewFlags,
    /// No switch has completed yet.
    initial: bool,
}

/// Background decision of one switch.
struct Composition {
    /// Source the background engine should follow after the switch.
    back_to: Option<Arc<Source>>,
}

impl SwitchContext {
    fn new(ctx: &AppContext) -> Self {
        Self {
            registry: Arc::clone(&ctx.registry),
            active: Arc::clone(&ctx.active),
            cache: Arc::clone(&ctx.cache),
            viewport: Arc::clone(&ctx.viewport),
            persistence: Arc::clone(&ctx.persistence),
            markers: Arc::clone(&ctx.markers),
            bus: ctx.bus.clone(),
            flags: ctx.flags,
            initial: true,
        }
    }

    fn fg(&self) -> &dyn RenderEngine {
        self.viewport.fg.as_ref()
    }

    async fn switch_to(&mut self, target: &Arc<Source>, restore: &RestoreOptions) -> Result<(), SyncError> {
        let from = self.active.get();

        // 1. Current view in the target's space.
        let size = self.cache.resolve(&from, self.fg().view(), target).await?;

        // 2-4. Layer composition and persisted ids.
        let composition = self.compose(&from, target, restore);

        // 5. The target becomes active only now.
        self.active.set(Arc::clone(target));
        self.dispatch_poi_number();

        // 6. Zoom bounds.
        if self.flags.zoom_restriction {
            self.fg().set_zoom_bounds(target.min_zoom, target.max_zoom);
        }

        // 7. Apply the converted view, or correct an out-of-area center.
        let caps = target.caps();
        if caps.inside(size.center) {
            self.fg().set_center(size.center);
            self.fg().set_zoom(size.zoom);
            self.fg().set_rotation(self.flags.rotation(size.rotation));
        } else if !self.initial {
            info!(target = %target.id, "converted center outside target; going home");
            self.bus.emit(AppEvent::OutOfMap);
            caps.go_home(self.fg()).await?;
        }

        // 8. Markers, lines, GPS, hidden layers.
        caps.set_gps_marker(self.fg(), self.viewport.gps(), true).await?;
        if let Some(hidden) = &restore.hide_layer {
            self.markers.store().apply_hidden_layers(hidden);
            self.persistence.request_update(StateUpdate::new().hide_layer(hidden.clone()));
        }
        if restore.hide_marker {
            self.persistence.request_update(StateUpdate::new().hide_marker(true));
        }
        let persistence = Arc::clone(&self.persistence);
        self.markers.redraw(self.fg(), Arc::clone(target), &move || persistence.hide_marker()).await?;
        self.markers.replay_lines(self.fg(), target).await?;
        self.bus.emit(AppEvent::MapChanged(target.meta()));

        // 9. Settle the foreground before anything reads it.
        self.fg().update_size();
        self.fg().render_sync();

        // 10. Restored position and transparency.
        let mut go_home = self.initial;
        if let Some(position) = restore.position {
            go_home = false;
            caps.set_viewpoint(self.fg(), position).await?;
        }
        if let Some(transparency) = restore.transparency.filter(|t| *t != 0.0) {
            self.viewport.set_transparency(transparency, &self.persistence);
        }
        self.initial = false;

        // 11. Initial home jump, else bring the background along.
        if go_home {
            caps.go_home(self.fg()).await?;
        } else if let (Some(bg), Some(back_to)) = (&self.viewport.bg, composition.back_to) {
            let view = self.cache.resolve(target, self.fg().view(), &back_to).await?;
            bg.set_center(view.center);
            bg.set_zoom(view.zoom);
            bg.set_rotation(self.flags.rotation(view.rotation));
            bg.update_size();
            bg.render_sync();
        }
        Ok(())
    }

    fn dispatch_poi_number(&self) {
        let active = self.active.get();
        let count = self.markers.store().poi_number(&active.id);
        self.bus.emit(AppEvent::PoiNumber(count));
    }

    /// Decide and apply background/overlay composition.
    fn compose(&self, from: &Arc<Source>, target: &Arc<Source>, restore: &RestoreOptions) -> Composition {
        let fg = self.fg();
        let basemap = self.registry.basemap();
        let back_restore = restore.background_id.as_ref().and_then(|id| self.registry.get(id));
        let mut back_src: Option<Arc<Source>> = None;
        let mut back_to: Option<Arc<Source>> = None;

        if let Some(bg) = &self.viewport.bg {
            back_src = bg.source().and_then(|id| self.registry.get(&id));
            if target.kind == SourceKind::Warped {
                let chosen = match (&back_restore, &back_src) {
                    (Some(restored), _) => {
                        bg.exchange_source(Some(restored.id.clone()));
                        Arc::clone(restored)
                    }
                    (None, None) => {
                        let promoted = match from.kind {
                            SourceKind::TileOverlay => fg.source().and_then(|id| self.registry.get(&id)),
                            kind if kind.is_basemap_like() => Some(Arc::clone(from)),
                            _ => None,
                        };
                        let chosen = promoted.unwrap_or_else(|| Arc::clone(&basemap));
                        bg.exchange_source(Some(chosen.id.clone()));
                        chosen
                    }
                    (None, Some(current)) => Arc::clone(current),
                };
                self.persistence.request_update(StateUpdate::new().background_id(chosen.id.clone()));
                back_to = Some(chosen);
            } else {
                bg.exchange_source(None);
            }
        }

        if target.kind == SourceKind::TileOverlay {
            fg.set_layer(Some(target.id.clone()));
            if let Some(restored) = &back_restore {
                fg.exchange_source(Some(restored.id.clone()));
            } else if !from.kind.is_basemap_like() || fg.source().is_none() {
                let base = back_src.unwrap_or_else(|| Arc::clone(&basemap));
                fg.exchange_source(Some(base.id.clone()));
            }
            if let Some(base) = fg.source() {
                self.persistence.request_update(StateUpdate::new().background_id(base));
            }
        } else {
            fg.set_layer(None);
            fg.exchange_source(Some(target.id.clone()));
        }

        let mut update = StateUpdate::new().map_id(target.id.clone());
        if target.kind.is_plain_basemap() {
            update = update.delete_background_id();
        }
        self.persistence.request_update(update);

        Composition { back_to }
    }
}

#[cfg(test)]
#[path = "switch_test.rs"]
mod tests;
