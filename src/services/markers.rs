//! Markers: POI layers, throttled marker redraw, and polylines.
//!
//! DESIGN
//! ======
//! POI data lives in a [`MarkerStore`]: app-level layers keyed by id, plus
//! layers owned by a single source and addressed as `mapID#layer`. Every
//! scope has a `main` layer that is always present and listed first. A
//! redraw shows the app layers and the active source's own layers. The
//! store is plain data; every drawing operation goes through
//! [`MarkerService`], which converts positions into the active source's
//! space and hands the results to the engine.
//!
//! REDRAW THROTTLE
//! ===============
//! A redraw pass is async (one conversion per marker). While a pass is in
//! flight, further requests are queued instead of starting a second pass;
//! a request for the same source as the last queued one is merged into it.
//! The task running the pass drains the queue before releasing the
//! throttle, so any burst of requests costs at most one extra pass per
//! distinct consecutive source.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::{DrawnMarker, RenderEngine, Stroke};
use crate::error::SyncError;
use crate::geo::{LngLat, Point, lnglat_to_merc};
use crate::services::persistence::Patch;
use crate::source::{Source, SourceId};

/// Id of the layer that can never be added or removed.
pub const MAIN_LAYER: &str = "main";

/// Joins a source id to a layer or POI id owned by that source.
pub const SCOPE_SEPARATOR: char = '#';

const DEFAULT_ICON: &str = "defaultpin.png";
const DEFAULT_SELECTED_ICON: &str = "defaultpin_selected.png";

// =============================================================================
// POI DATA
// =============================================================================

/// Where a POI sits. Mercator and geographic positions are converted with
/// extrapolation; `Xy` is already in a source's own space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoiPosition {
    Lnglat(LngLat),
    Merc(Point),
    Xy(Point),
}

impl PoiPosition {
    /// Mercator position, when known without a source.
    #[must_use]
    pub fn merc(&self) -> Option<Point> {
        match *self {
            Self::Lnglat(lnglat) => Some(lnglat_to_merc(lnglat)),
            Self::Merc(merc) => Some(merc),
            Self::Xy(_) => None,
        }
    }
}

/// A point of interest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poi {
    /// Assigned on insertion when empty.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub position: PoiPosition,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub selected_icon: Option<String>,
}

impl Poi {
    #[must_use]
    pub fn new(position: PoiPosition) -> Self {
        Self { id: String::new(), name: None, position, desc: None, icon: None, selected_icon: None }
    }
}

/// A named group of POIs that can be hidden as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoiLayer {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hide: bool,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub selected_icon: Option<String>,
    #[serde(default)]
    pub pois: Vec<Poi>,
}

impl PoiLayer {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), name: None, hide: false, icon: None, selected_icon: None, pois: Vec::new() }
    }
}

/// A POI ready to be converted and drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerDraw {
    pub poi_id: String,
    pub position: PoiPosition,
    pub icon: String,
    pub selected: bool,
}

/// Field changes for [`MarkerStore::update_marker`]. `None` leaves a field
/// untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PoiPatch {
    pub name: Option<Patch<String>>,
    pub position: Option<PoiPosition>,
    pub desc: Option<Patch<String>>,
    pub icon: Option<Patch<String>>,
    pub selected_icon: Option<Patch<String>>,
}

fn apply_patch<T>(slot: &mut Option<T>, patch: Option<Patch<T>>) {
    match patch {
        None => {}
        Some(Patch::Set(value)) => *slot = Some(value),
        Some(Patch::Delete) => *slot = None,
    }
}

// =============================================================================
// MARKER STORE
// =============================================================================

/// Source of a scoped id (`mapID#layer`, `mapID#poi`); `None` for app ids.
fn scope_of(id: &str) -> Option<&str> {
    id.split_once(SCOPE_SEPARATOR).map(|(map, _)| map)
}

/// Id without its source scope.
fn local_id(id: &str) -> &str {
    id.split_once(SCOPE_SEPARATOR).map_or(id, |(_, local)| local)
}

fn scoped(map: &str, local: &str) -> String {
    if scope_of(local) == Some(map) { local.to_owned() } else { format!("{map}{SCOPE_SEPARATOR}{local}") }
}

fn is_main(layer_id: &str) -> bool {
    local_id(layer_id) == MAIN_LAYER
}

/// POI layers plus the selection.
///
/// App layers are keyed by their plain id. Layers owned by one source are
/// keyed `mapID#layer` and their POIs carry `mapID#poi` ids, so every
/// lookup by id is unambiguous. Each scope has its own `main` layer.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    layers: BTreeMap<String, PoiLayer>,
    sources: BTreeSet<String>,
    selected: Option<String>,
    next_seq: u64,
}

impl MarkerStore {
    /// Build from the configured app layers; `main` is created if absent.
    #[must_use]
    pub fn new(layers: Vec<PoiLayer>) -> Self {
        let mut store = Self { layers: BTreeMap::new(), sources: BTreeSet::new(), selected: None, next_seq: 0 };
        for layer in layers {
            store.insert_layer(layer);
        }
        store.layers.entry(MAIN_LAYER.to_owned()).or_insert_with(|| PoiLayer::new(MAIN_LAYER));
        store
    }

    /// Attach the layers owned by `map`, which also gets its own `main`.
    pub fn register_source(&mut self, map: &SourceId, layers: Vec<PoiLayer>) {
        let map = map.as_str();
        self.sources.insert(map.to_owned());
        for mut layer in layers {
            layer.id = scoped(map, &layer.id);
            self.insert_layer(layer);
        }
        let main = scoped(map, MAIN_LAYER);
        self.layers.entry(main.clone()).or_insert_with(|| PoiLayer::new(main));
    }

    fn insert_layer(&mut self, mut layer: PoiLayer) {
        let pois = std::mem::take(&mut layer.pois);
        let id = layer.id.clone();
        self.layers.insert(id.clone(), layer);
        for poi in pois {
            self.push_poi(&id, poi);
        }
    }

    fn push_poi(&mut self, layer_id: &str, mut poi: Poi) -> Option<String> {
        let scope = scope_of(layer_id);
        if let Some(map) = scope
            && !poi.id.is_empty()
        {
            poi.id = scoped(map, &poi.id);
        }
        if poi.id.is_empty() || scope_of(&poi.id) != scope || self.find(&poi.id).is_some() {
            self.next_seq += 1;
            let local = format!("{}_{}", local_id(layer_id), self.next_seq);
            poi.id = match scope {
                Some(map) => scoped(map, &local),
                None => local,
            };
        }
        let id = poi.id.clone();
        self.layers.get_mut(layer_id)?.pois.push(poi);
        Some(id)
    }

    /// Layer key and index of the POI `id`, searched in its own scope.
    fn find(&self, id: &str) -> Option<(String, usize)> {
        let scope = scope_of(id);
        self.layers.iter().filter(|(layer_id, _)| scope_of(layer_id) == scope).find_map(|(layer_id, layer)| {
            layer.pois.iter().position(|p| p.id == id).map(|index| (layer_id.clone(), index))
        })
    }

    fn poi_mut(&mut self, id: &str) -> Option<&mut Poi> {
        let (layer_id, index) = self.find(id)?;
        self.layers.get_mut(&layer_id)?.pois.get_mut(index)
    }

    fn prune_selection(&mut self) {
        let stale = self.selected.as_deref().is_some_and(|id| self.find(id).is_none());
        if stale {
            self.selected = None;
        }
    }

    /// Add a POI to `layer_id` (default `main`). Returns the POI id, or
    /// `None` for an unknown layer.
    pub fn add_marker(&mut self, poi: Poi, layer_id: Option<&str>) -> Option<String> {
        let layer_id = layer_id.unwrap_or(MAIN_LAYER);
        if !self.layers.contains_key(layer_id) {
            return None;
        }
        self.push_poi(layer_id, poi)
    }

    pub fn remove_marker(&mut self, id: &str) -> bool {
        let Some((layer_id, index)) = self.find(id) else {
            return false;
        };
        if let Some(layer) = self.layers.get_mut(&layer_id) {
            layer.pois.remove(index);
        }
        self.prune_selection();
        true
    }

    /// Change the fields of POI `id`. With `overwrite`, every optional field
    /// is cleared before `patch` applies. The id never changes.
    pub fn update_marker(&mut self, id: &str, patch: PoiPatch, overwrite: bool) -> bool {
        let Some(poi) = self.poi_mut(id) else {
            return false;
        };
        if overwrite {
            poi.name = None;
            poi.desc = None;
            poi.icon = None;
            poi.selected_icon = None;
        }
        if let Some(position) = patch.position {
            poi.position = position;
        }
        apply_patch(&mut poi.name, patch.name);
        apply_patch(&mut poi.desc, patch.desc);
        apply_patch(&mut poi.icon, patch.icon);
        apply_patch(&mut poi.selected_icon, patch.selected_icon);
        true
    }

    /// Empty one layer, or every app layer when `layer_id` is `None`.
    pub fn clear_markers(&mut self, layer_id: Option<&str>) -> bool {
        match layer_id {
            None => {
                for layer in self.layers.values_mut().filter(|l| scope_of(&l.id).is_none()) {
                    layer.pois.clear();
                }
            }
            Some(id) => match self.layers.get_mut(id) {
                Some(layer) => layer.pois.clear(),
                None => return false,
            },
        }
        self.prune_selection();
        true
    }

    #[must_use]
    pub fn get_marker(&self, id: &str) -> Option<&Poi> {
        let (layer_id, index) = self.find(id)?;
        self.layers.get(&layer_id)?.pois.get(index)
    }

    /// Mark `id` as selected. Returns the POI, or `None` if unknown.
    pub fn select(&mut self, id: &str) -> Option<Poi> {
        let poi = self.get_marker(id).cloned()?;
        self.selected = Some(poi.id.clone());
        Some(poi)
    }

    pub fn unselect(&mut self) -> bool {
        self.selected.take().is_some()
    }

    #[must_use]
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Add a layer with its POIs. `main` layers, existing ids and layers of
    /// unregistered sources are refused.
    pub fn add_layer(&mut self, layer: PoiLayer) -> bool {
        if is_main(&layer.id) || self.layers.contains_key(&layer.id) {
            return false;
        }
        if let Some(map) = scope_of(&layer.id)
            && !self.sources.contains(map)
        {
            return false;
        }
        self.insert_layer(layer);
        true
    }

    pub fn remove_layer(&mut self, id: &str) -> bool {
        if is_main(id) || self.layers.remove(id).is_none() {
            return false;
        }
        self.prune_selection();
        true
    }

    pub fn set_layer_hidden(&mut self, id: &str, hidden: bool) -> bool {
        match self.layers.get_mut(id) {
            Some(layer) => {
                layer.hide = hidden;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn layer(&self, id: &str) -> Option<&PoiLayer> {
        self.layers.get(id)
    }

    /// Layers of one scope, its `main` first then by id.
    fn scope_layers(&self, scope: Option<&str>) -> Vec<&PoiLayer> {
        let mut layers: Vec<&PoiLayer> = self.layers.values().filter(|l| scope_of(&l.id) == scope).collect();
        layers.sort_by_key(|l| !is_main(&l.id));
        layers
    }

    /// App layers followed by `active`'s own layers. `hide_only` keeps
    /// hidden layers, `nonzero` keeps layers with at least one POI.
    #[must_use]
    pub fn list_layers(&self, active: &SourceId, hide_only: bool, nonzero: bool) -> Vec<&PoiLayer> {
        let own = self.scope_layers(Some(active.as_str()));
        self.scope_layers(None)
            .into_iter()
            .chain(own)
            .filter(|l| !hide_only || l.hide)
            .filter(|l| !nonzero || !l.pois.is_empty())
            .collect()
    }

    /// Comma-joined ids of hidden layers, as persisted in `hideLayer`.
    #[must_use]
    pub fn hidden_layer_ids(&self, active: &SourceId) -> String {
        self.list_layers(active, true, false).iter().map(|l| l.id.as_str()).collect::<Vec<_>>().join(",")
    }

    /// Hide every layer named in a persisted `hideLayer` value.
    pub fn apply_hidden_layers(&mut self, joined: &str) {
        for id in joined.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            self.set_layer_hidden(id, true);
        }
    }

    /// POIs reachable from `active`, hidden layers included.
    #[must_use]
    pub fn poi_number(&self, active: &SourceId) -> usize {
        self.list_layers(active, false, true).iter().map(|l| l.pois.len()).sum()
    }

    /// POIs of the visible layers reachable from `active`, with their
    /// resolved icons.
    #[must_use]
    pub fn visible_markers(&self, active: &SourceId) -> Vec<MarkerDraw> {
        self.list_layers(active, false, true)
            .into_iter()
            .filter(|l| !l.hide)
            .flat_map(|layer| {
                layer.pois.iter().map(move |poi| {
                    let selected = self.selected.as_deref() == Some(poi.id.as_str());
                    MarkerDraw { poi_id: poi.id.clone(), position: poi.position, icon: icon_for(poi, layer, selected), selected }
                })
            })
            .collect()
    }
}

fn icon_for(poi: &Poi, layer: &PoiLayer, selected: bool) -> String {
    let icon = poi.icon.as_ref().or(layer.icon.as_ref());
    let selected_icon = poi.selected_icon.as_ref().or(layer.selected_icon.as_ref());
    match (icon, selected) {
        (Some(icon), true) => selected_icon.unwrap_or(icon).clone(),
        (Some(icon), false) => icon.clone(),
        (None, true) => DEFAULT_SELECTED_ICON.to_owned(),
        (None, false) => DEFAULT_ICON.to_owned(),
    }
}

// =============================================================================
// REDRAW THROTTLE
// =============================================================================

#[derive(Debug, Default)]
struct ThrottleState {
    in_flight: bool,
    pending: VecDeque<Arc<Source>>,
}

/// Serializes redraw passes and merges repeated requests.
#[derive(Debug, Default)]
pub struct RedrawThrottle {
    state: Mutex<ThrottleState>,
}

impl RedrawThrottle {
    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the throttle. `true` means the caller must run the pass and
    /// then drain with [`RedrawThrottle::next`]; `false` means the request
    /// was queued (or merged into the last queued one).
    pub fn begin(&self, source: &Arc<Source>) -> bool {
        let mut state = self.lock();
        if !state.in_flight {
            state.in_flight = true;
            return true;
        }
        if state.pending.back().is_none_or(|last| last.id != source.id) {
            state.pending.push_back(Arc::clone(source));
        }
        false
    }

    /// Next queued source, or `None` after releasing the throttle.
    pub fn next(&self) -> Option<Arc<Source>> {
        let mut state = self.lock();
        let next = state.pending.pop_front();
        if next.is_none() {
            state.in_flight = false;
        }
        next
    }

    /// Release the throttle and drop every queued request. Returns how many
    /// were dropped.
    pub fn abandon(&self) -> usize {
        let mut state = self.lock();
        state.in_flight = false;
        let dropped = state.pending.len();
        state.pending.clear();
        dropped
    }

    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.lock().in_flight
    }
}

/// Holds the throttle for one redraw call and abandons it if the call is
/// cancelled before draining the queue.
struct ThrottleClaim<'a> {
    throttle: &'a RedrawThrottle,
    drained: bool,
}

impl Drop for ThrottleClaim<'_> {
    fn drop(&mut self) {
        if !self.drained {
            let dropped = self.throttle.abandon();
            debug!(dropped, "marker redraw cancelled; throttle released");
        }
    }
}

/// What a redraw request turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedrawOutcome {
    /// This call ran `passes` redraw passes (its own plus queued ones).
    Drawn { passes: usize },
    /// A pass was already running; the request was queued for it.
    Deferred,
}

// =============================================================================
// LINES
// =============================================================================

/// Vertices of a polyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinePath {
    Merc(Vec<Point>),
    Lnglat(Vec<LngLat>),
}

impl LinePath {
    fn mercs(&self) -> Vec<Point> {
        match self {
            Self::Merc(points) => points.clone(),
            Self::Lnglat(points) => points.iter().copied().map(lnglat_to_merc).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineDef {
    pub path: LinePath,
    #[serde(default)]
    pub stroke: Option<Stroke>,
}

// =============================================================================
// MARKER SERVICE
// =============================================================================

/// Shared marker, line and throttle state.
#[derive(Debug)]
pub struct MarkerService {
    store: Mutex<MarkerStore>,
    lines: Mutex<Vec<LineDef>>,
    throttle: RedrawThrottle,
}

impl MarkerService {
    #[must_use]
    pub fn new(layers: Vec<PoiLayer>) -> Self {
        Self { store: Mutex::new(MarkerStore::new(layers)), lines: Mutex::new(Vec::new()), throttle: RedrawThrottle::default() }
    }

    /// Lock the POI store. Never hold the guard across an await.
    pub fn store(&self) -> MutexGuard<'_, MarkerStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lines(&self) -> MutexGuard<'_, Vec<LineDef>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn throttle(&self) -> &RedrawThrottle {
        &self.throttle
    }

    /// Redraw all visible markers for `source`, throttled.
    ///
    /// `hidden` is re-read before every pass so a queued pass sees the
    /// latest show/hide-all flag.
    ///
    /// # Errors
    ///
    /// Returns the last conversion failure among the passes this call ran.
    /// The throttle is always released, also when the call is cancelled;
    /// requests queued behind a cancelled call are dropped.
    pub async fn redraw(
        &self,
        engine: &dyn RenderEngine,
        source: Arc<Source>,
        hidden: &(dyn Fn() -> bool + Sync),
    ) -> Result<RedrawOutcome, SyncError> {
        if !self.throttle.begin(&source) {
            debug!(source = %source.id, "marker redraw deferred");
            return Ok(RedrawOutcome::Deferred);
        }

        let mut claim = ThrottleClaim { throttle: &self.throttle, drained: false };
        let mut passes = 0;
        let mut result = Ok(());
        let mut current = Some(source);
        while let Some(source) = current {
            passes += 1;
            let markers = if hidden() { Vec::new() } else { self.store().visible_markers(&source.id) };
            if let Err(e) = draw_markers(engine, &source, markers).await {
                warn!(source = %source.id, error = %e, "marker redraw pass failed");
                result = Err(e);
            }
            current = self.throttle.next();
        }
        claim.drained = true;
        debug!(passes, "marker redraw complete");
        result.map(|()| RedrawOutcome::Drawn { passes })
    }

    /// Store a line and draw it.
    ///
    /// # Errors
    ///
    /// Propagates conversion failures; the line stays stored.
    pub async fn add_line(&self, engine: &dyn RenderEngine, source: &Source, line: LineDef) -> Result<(), SyncError> {
        self.lines().push(line.clone());
        draw_line(engine, source, &line).await
    }

    pub fn clear_lines(&self, engine: &dyn RenderEngine) {
        self.lines().clear();
        engine.reset_lines();
    }

    #[must_use]
    pub fn line_count(&self) -> usize {
        self.lines().len()
    }

    /// Redraw every stored line in `source`'s space.
    ///
    /// # Errors
    ///
    /// Propagates the first conversion failure.
    pub async fn replay_lines(&self, engine: &dyn RenderEngine, source: &Source) -> Result<(), SyncError> {
        let lines = self.lines().clone();
        engine.reset_lines();
        for line in &lines {
            draw_line(engine, source, line).await?;
        }
        Ok(())
    }
}

/// Clear the engine's markers and draw `markers` that land inside `source`.
async fn draw_markers(engine: &dyn RenderEngine, source: &Source, markers: Vec<MarkerDraw>) -> Result<(), SyncError> {
    engine.reset_markers();
    let caps = source.caps();
    for marker in markers {
        let xy = match marker.position {
            PoiPosition::Xy(xy) => Some(xy),
            PoiPosition::Merc(merc) => caps.merc_to_xy(merc, true).await?,
            PoiPosition::Lnglat(lnglat) => caps.merc_to_xy(lnglat_to_merc(lnglat), true).await?,
        };
        match xy {
            Some(xy) if caps.inside(xy) => engine.set_marker(DrawnMarker {
                xy,
                poi_id: marker.poi_id,
                icon: Some(marker.icon),
                selected: marker.selected,
            }),
            _ => debug!(poi = %marker.poi_id, "marker outside source area"),
        }
    }
    Ok(())
}

/// Vertices outside the source area are skipped.
async fn draw_line(engine: &dyn RenderEngine, source: &Source, line: &LineDef) -> Result<(), SyncError> {
    let mut xys = Vec::new();
    for merc in line.path.mercs() {
        if let Some(xy) = source.caps().merc_to_xy(merc, false).await? {
            xys.push(xy);
        }
    }
    engine.set_line(&xys, line.stroke.as_ref());
    Ok(())
}

#[cfg(test)]
#[path = "markers_test.rs"]
mod tests;
