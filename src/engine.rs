//! Rendering-engine boundary.
//!
//! The engine owns the live view (center / zoom / rotation), the layer
//! stack, and the drawn markers and lines. The sync core never keeps its own
//! copy of the view: it reads and writes through [`RenderEngine`] only.
//!
//! [`HeadlessEngine`] is an in-memory implementation that records every
//! call. The binary drives it directly and tests assert against its log.

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::geo::{Point, ViewState};
use crate::source::SourceId;

/// Stroke style for a polyline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Stroke {
    pub color: Option<String>,
    pub width: Option<f64>,
}

/// A marker as handed to the renderer, already in the active source's space.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrawnMarker {
    pub xy: Point,
    pub poi_id: String,
    pub icon: Option<String>,
    pub selected: bool,
}

/// Current-position marker in the active source's space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpsMarker {
    pub xy: Point,
    pub radius: Option<f64>,
}

/// Everything the sync core asks of a rendering engine.
///
/// Calls are immediate; the engine applies them before returning.
pub trait RenderEngine: Send + Sync {
    /// Current view in the engine's (= current source's) coordinate space.
    fn view(&self) -> ViewState;
    fn set_center(&self, center: Point);
    fn set_zoom(&self, zoom: f64);
    fn set_rotation(&self, rotation: f64);
    fn set_zoom_bounds(&self, min_zoom: f64, max_zoom: f64);

    /// Base source currently displayed.
    fn source(&self) -> Option<SourceId>;
    /// Replace the base source; `None` empties the engine.
    fn exchange_source(&self, source: Option<SourceId>);
    /// Tile overlay drawn above the base source.
    fn layer(&self) -> Option<SourceId>;
    fn set_layer(&self, layer: Option<SourceId>);

    /// Render synchronously so no stale tiles flash after a switch.
    fn render_sync(&self);
    fn update_size(&self);

    fn reset_markers(&self);
    fn set_marker(&self, marker: DrawnMarker);
    fn reset_lines(&self);
    fn set_line(&self, xys: &[Point], stroke: Option<&Stroke>);
    fn set_gps_marker(&self, marker: Option<GpsMarker>);

    /// Foreground opacity reduction in percent (0 = opaque).
    fn set_transparency(&self, percentage: f64);
    /// Hide (`true`) or show chrome controls.
    fn set_controls_faded(&self, faded: bool);
}

// =============================================================================
// HEADLESS ENGINE
// =============================================================================

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOp {
    SetCenter(Point),
    SetZoom(f64),
    SetRotation(f64),
    SetZoomBounds { min: f64, max: f64 },
    ExchangeSource(Option<SourceId>),
    SetLayer(Option<SourceId>),
    RenderSync,
    UpdateSize,
    ResetMarkers,
    SetMarker(String),
    ResetLines,
    SetLine(usize),
    SetGpsMarker(Option<Point>),
    SetTransparency(f64),
    SetControlsFaded(bool),
}

#[derive(Debug, Default)]
struct HeadlessState {
    view: ViewState,
    min_zoom: f64,
    max_zoom: Option<f64>,
    source: Option<SourceId>,
    layer: Option<SourceId>,
    markers: Vec<DrawnMarker>,
    lines: Vec<Vec<Point>>,
    gps: Option<GpsMarker>,
    transparency: f64,
    controls_faded: bool,
    ops: Vec<EngineOp>,
}

/// In-memory engine. Zoom is clamped to the configured bounds like a real
/// view would.
#[derive(Debug, Default)]
pub struct HeadlessEngine {
    state: Mutex<HeadlessState>,
}

impl HeadlessEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_view(view: ViewState) -> Self {
        let engine = Self::new();
        engine.lock().view = view;
        engine
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// All calls recorded so far, oldest first.
    #[must_use]
    pub fn ops(&self) -> Vec<EngineOp> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    #[must_use]
    pub fn count_ops(&self, pred: impl Fn(&EngineOp) -> bool) -> usize {
        self.lock().ops.iter().filter(|op| pred(op)).count()
    }

    #[must_use]
    pub fn markers(&self) -> Vec<DrawnMarker> {
        self.lock().markers.clone()
    }

    #[must_use]
    pub fn lines(&self) -> Vec<Vec<Point>> {
        self.lock().lines.clone()
    }

    #[must_use]
    pub fn gps(&self) -> Option<GpsMarker> {
        self.lock().gps
    }

    #[must_use]
    pub fn transparency(&self) -> f64 {
        self.lock().transparency
    }

    #[must_use]
    pub fn controls_faded(&self) -> bool {
        self.lock().controls_faded
    }

    #[must_use]
    pub fn zoom_bounds(&self) -> (f64, Option<f64>) {
        let state = self.lock();
        (state.min_zoom, state.max_zoom)
    }

    /// Move the view without recording, as a user gesture would.
    pub fn gesture_to(&self, view: ViewState) {
        self.lock().view = view;
    }
}

impl RenderEngine for HeadlessEngine {
    fn view(&self) -> ViewState {
        self.lock().view
    }

    fn set_center(&self, center: Point) {
        let mut state = self.lock();
        state.view.center = center;
        state.ops.push(EngineOp::SetCenter(center));
    }

    fn set_zoom(&self, zoom: f64) {
        let mut state = self.lock();
        let mut zoom = zoom.max(state.min_zoom);
        if let Some(max) = state.max_zoom {
            zoom = zoom.min(max);
        }
        state.view.zoom = zoom;
        state.ops.push(EngineOp::SetZoom(zoom));
    }

    fn set_rotation(&self, rotation: f64) {
        let mut state = self.lock();
        state.view.rotation = rotation;
        state.ops.push(EngineOp::SetRotation(rotation));
    }

    fn set_zoom_bounds(&self, min_zoom: f64, max_zoom: f64) {
        let mut state = self.lock();
        state.min_zoom = min_zoom;
        state.max_zoom = Some(max_zoom);
        state.ops.push(EngineOp::SetZoomBounds { min: min_zoom, max: max_zoom });
    }

    fn source(&self) -> Option<SourceId> {
        self.lock().source.clone()
    }

    fn exchange_source(&self, source: Option<SourceId>) {
        let mut state = self.lock();
        state.source.clone_from(&source);
        state.ops.push(EngineOp::ExchangeSource(source));
    }

    fn layer(&self) -> Option<SourceId> {
        self.lock().layer.clone()
    }

    fn set_layer(&self, layer: Option<SourceId>) {
        let mut state = self.lock();
        state.layer.clone_from(&layer);
        state.ops.push(EngineOp::SetLayer(layer));
    }

    fn render_sync(&self) {
        self.lock().ops.push(EngineOp::RenderSync);
    }

    fn update_size(&self) {
        self.lock().ops.push(EngineOp::UpdateSize);
    }

    fn reset_markers(&self) {
        let mut state = self.lock();
        state.markers.clear();
        state.ops.push(EngineOp::ResetMarkers);
    }

    fn set_marker(&self, marker: DrawnMarker) {
        let mut state = self.lock();
        state.ops.push(EngineOp::SetMarker(marker.poi_id.clone()));
        state.markers.push(marker);
    }

    fn reset_lines(&self) {
        let mut state = self.lock();
        state.lines.clear();
        state.ops.push(EngineOp::ResetLines);
    }

    fn set_line(&self, xys: &[Point], _stroke: Option<&Stroke>) {
        let mut state = self.lock();
        state.ops.push(EngineOp::SetLine(xys.len()));
        state.lines.push(xys.to_vec());
    }

    fn set_gps_marker(&self, marker: Option<GpsMarker>) {
        let mut state = self.lock();
        state.gps = marker;
        state.ops.push(EngineOp::SetGpsMarker(marker.map(|m| m.xy)));
    }

    fn set_transparency(&self, percentage: f64) {
        let mut state = self.lock();
        state.transparency = percentage;
        state.ops.push(EngineOp::SetTransparency(percentage));
    }

    fn set_controls_faded(&self, faded: bool) {
        let mut state = self.lock();
        state.controls_faded = faded;
        state.ops.push(EngineOp::SetControlsFaded(faded));
    }
}
