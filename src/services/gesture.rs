//! Gesture tracking: drag detection, pointer-move lookups, idle fade.
//!
//! DESIGN
//! ======
//! [`GestureStateMachine`] is plain synchronous state: the set of pressed
//! pointers, the derived `dragging` flag, and the single-slot buffer for
//! pointer moves that arrive while a lookup is in flight. It makes
//! decisions; [`GestureController`] carries them out (async lookups, event
//! emission, the idle-fade timer).
//!
//! Pointer-move lookups are serialized: one in flight, the newest pending
//! move kept in one slot, older pending moves overwritten. A lookup that
//! finishes after a drag started does not publish.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::engine::RenderEngine;
use crate::error::SyncError;
use crate::events::{AppEvent, EventBus};
use crate::geo::Point;
use crate::state::{ActiveSource, AppContext};
use crate::timer::ScopedTimer;

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Pointer identity as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerEvent {
    /// Per-pointer id, where the platform has one.
    pub pointer_id: Option<i64>,
    /// Remaining active touches, for platforms without pointer ids.
    pub touches: Option<usize>,
}

impl PointerEvent {
    #[must_use]
    pub fn id(pointer_id: i64) -> Self {
        Self { pointer_id: Some(pointer_id), touches: None }
    }

    #[must_use]
    pub fn touches(remaining: usize) -> Self {
        Self { pointer_id: None, touches: Some(remaining) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureState {
    Idle,
    /// A pointer-move lookup is in flight.
    Hovering,
    Dragging,
}

/// What to do with a pointer move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveDecision {
    /// Start a lookup for this position.
    Lookup(Point),
    /// Kept for after the in-flight lookup.
    Buffered,
    /// Ignored while dragging.
    Suppressed,
}

#[derive(Debug, Default)]
pub struct GestureStateMachine {
    pointers: HashSet<i64>,
    dragging: bool,
    waiting: bool,
    buffered: Option<Point>,
}

impl GestureStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> GestureState {
        if self.dragging {
            GestureState::Dragging
        } else if self.waiting {
            GestureState::Hovering
        } else {
            GestureState::Idle
        }
    }

    #[must_use]
    pub fn is_dragging(&self) -> bool {
        self.dragging
    }

    pub fn pointer_down(&mut self, event: PointerEvent) {
        if let Some(id) = event.pointer_id {
            self.pointers.insert(id);
        }
        self.dragging = true;
    }

    pub fn pointer_drag(&mut self, event: PointerEvent) {
        self.pointer_down(event);
    }

    pub fn pointer_up(&mut self, event: PointerEvent) {
        match (event.pointer_id, event.touches) {
            (Some(id), _) => {
                self.pointers.remove(&id);
                if self.pointers.is_empty() {
                    self.dragging = false;
                }
            }
            (None, Some(remaining)) => {
                if remaining == 0 {
                    self.dragging = false;
                }
            }
            (None, None) => self.dragging = false,
        }
    }

    pub fn pointer_move(&mut self, xy: Point) -> MoveDecision {
        if self.dragging {
            return MoveDecision::Suppressed;
        }
        if self.waiting {
            self.buffered = Some(xy);
            return MoveDecision::Buffered;
        }
        self.waiting = true;
        MoveDecision::Lookup(xy)
    }

    /// The in-flight lookup ended. Returns the buffered move to look up
    /// next, or `None` once the stream is idle. A drag drops the buffer.
    pub fn lookup_finished(&mut self) -> Option<Point> {
        let next = self.buffered.take().filter(|_| !self.dragging);
        if next.is_none() {
            self.waiting = false;
        }
        next
    }

    /// Forget the in-flight lookup and any buffered move.
    pub fn reset_moves(&mut self) {
        self.buffered = None;
        self.waiting = false;
    }
}

// =============================================================================
// IDLE FADE
// =============================================================================

/// Fades chrome controls once the view has settled for a while.
pub struct IdleFade {
    timer: ScopedTimer,
    delay: Duration,
    engine: Arc<dyn RenderEngine>,
}

impl IdleFade {
    #[must_use]
    pub fn new(engine: Arc<dyn RenderEngine>, delay: Duration) -> Self {
        Self { timer: ScopedTimer::new(), delay, engine }
    }

    /// (Re)arm the fade.
    pub fn settled(&self) {
        let engine = Arc::clone(&self.engine);
        self.timer.schedule(self.delay, move || engine.set_controls_faded(true));
    }

    /// Cancel a pending fade and show the controls.
    pub fn interrupted(&self) {
        if self.timer.cancel() {
            debug!("idle fade cancelled");
        }
        self.engine.set_controls_faded(false);
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.timer.is_pending()
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Resets the move stream unless the lookup loop drained it.
struct LookupStream<'a> {
    machine: &'a Mutex<GestureStateMachine>,
    drained: bool,
}

impl Drop for LookupStream<'_> {
    fn drop(&mut self) {
        if !self.drained {
            self.machine.lock().unwrap_or_else(PoisonError::into_inner).reset_moves();
        }
    }
}

/// Runs the state machine's decisions against the active source.
pub struct GestureController {
    machine: Mutex<GestureStateMachine>,
    active: Arc<ActiveSource>,
    bus: EventBus,
    fade: IdleFade,
}

impl GestureController {
    #[must_use]
    pub fn new(ctx: &AppContext, idle_fade: Duration) -> Self {
        Self {
            machine: Mutex::new(GestureStateMachine::new()),
            active: Arc::clone(&ctx.active),
            bus: ctx.bus.clone(),
            fade: IdleFade::new(Arc::clone(&ctx.viewport.fg), idle_fade),
        }
    }

    fn machine(&self) -> MutexGuard<'_, GestureStateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> GestureState {
        self.machine().state()
    }

    #[must_use]
    pub fn fade(&self) -> &IdleFade {
        &self.fade
    }

    pub fn pointer_down(&self, event: PointerEvent) {
        self.machine().pointer_down(event);
    }

    pub fn pointer_drag(&self, event: PointerEvent) {
        self.machine().pointer_drag(event);
        self.fade.interrupted();
    }

    pub fn pointer_up(&self, event: PointerEvent) {
        self.machine().pointer_up(event);
    }

    pub fn click(&self) {
        self.fade.interrupted();
    }

    pub fn move_end(&self) {
        self.fade.settled();
    }

    /// Handle a pointer move. Returns the number of lookups this call ran;
    /// `0` when the move was buffered for a lookup already in flight or
    /// suppressed by a drag.
    ///
    /// A failed or cancelled lookup resets the move stream, so later moves
    /// start fresh.
    ///
    /// # Errors
    ///
    /// Propagates a failed lookup.
    pub async fn pointer_move(&self, xy: Point) -> Result<usize, SyncError> {
        let decision = self.machine().pointer_move(xy);
        let MoveDecision::Lookup(mut xy) = decision else {
            return Ok(0);
        };

        let mut stream = LookupStream { machine: &self.machine, drained: false };
        let mut lookups = 0;
        loop {
            self.bus.emit(AppEvent::PointerMoveOnMapXy(xy));
            let source = self.active.get();
            lookups += 1;
            match source.caps().xy_to_merc(xy).await {
                Ok(merc) if self.machine().is_dragging() => {
                    debug!(x = merc.x, y = merc.y, "pointer lookup finished during drag; dropped");
                }
                Ok(merc) => self.bus.emit(AppEvent::PointerMoveOnMapMerc(merc)),
                Err(e) => return Err(e),
            }
            match self.machine().lookup_finished() {
                Some(next) => xy = next,
                None => {
                    stream.drained = true;
                    return Ok(lookups);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "gesture_test.rs"]
mod tests;
