//! Outgoing event stream.
//!
//! Events fan out over a `tokio::sync::broadcast` channel so any number of
//! host listeners can subscribe. Emitting with no subscriber is fine; a slow
//! subscriber lags and skips rather than blocking the sync loop.

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::geo::Point;
use crate::services::markers::Poi;
use crate::services::persistence::StateSnapshot;
use crate::source::MapMeta;

/// Payload of `changeViewpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewpointChange {
    /// Engine center in the active source's space.
    pub x: f64,
    pub y: f64,
    pub longitude: f64,
    pub latitude: f64,
    #[serde(rename = "mercator_x")]
    pub mercator_x: f64,
    #[serde(rename = "mercator_y")]
    pub mercator_y: f64,
    /// Engine zoom.
    pub zoom: f64,
    pub merc_zoom: f64,
    /// Map direction in degrees, from the canonical rotation.
    pub direction: f64,
    /// Engine rotation in degrees.
    pub rotation: f64,
}

/// Everything the core tells the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum AppEvent {
    #[serde(rename = "sourceLoaded")]
    SourceLoaded(Vec<MapMeta>),
    #[serde(rename = "mapChanged")]
    MapChanged(MapMeta),
    #[serde(rename = "changeViewpoint")]
    ChangeViewpoint(ViewpointChange),
    #[serde(rename = "updateState")]
    UpdateState(StateSnapshot),
    #[serde(rename = "outOfMap")]
    OutOfMap,
    #[serde(rename = "poi_number")]
    PoiNumber(usize),
    #[serde(rename = "clickMarker")]
    ClickMarker(Poi),
    #[serde(rename = "clickMapXy")]
    ClickMapXy(Point),
    #[serde(rename = "clickMapMerc")]
    ClickMapMerc(Point),
    #[serde(rename = "clickMap")]
    ClickMap { longitude: f64, latitude: f64 },
    #[serde(rename = "pointerMoveOnMapXy")]
    PointerMoveOnMapXy(Point),
    #[serde(rename = "pointerMoveOnMapMerc")]
    PointerMoveOnMapMerc(Point),
}

impl AppEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SourceLoaded(_) => "sourceLoaded",
            Self::MapChanged(_) => "mapChanged",
            Self::ChangeViewpoint(_) => "changeViewpoint",
            Self::UpdateState(_) => "updateState",
            Self::OutOfMap => "outOfMap",
            Self::PoiNumber(_) => "poi_number",
            Self::ClickMarker(_) => "clickMarker",
            Self::ClickMapXy(_) => "clickMapXy",
            Self::ClickMapMerc(_) => "clickMapMerc",
            Self::ClickMap { .. } => "clickMap",
            Self::PointerMoveOnMapXy(_) => "pointerMoveOnMapXy",
            Self::PointerMoveOnMapMerc(_) => "pointerMoveOnMapMerc",
        }
    }
}

/// Cloneable handle to the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: AppEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            trace!(event = name, "no event subscribers");
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}
