//! Map sources: the coordinate spaces the viewer can display.
//!
//! DESIGN
//! ======
//! A [`Source`] pairs static metadata (id, label, zoom bounds) with an
//! explicit [`SourceKind`] tag and a capability object implementing
//! [`MapSource`]. Overlay composition matches on the tag, never on the
//! concrete capability type, so the rules stay exhaustive.
//!
//! The capability object never holds a reference back to the application
//! or to the rendering engine: view commands receive the engine as an
//! argument. Sources are immutable once registered.

pub mod affine;

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::{GpsMarker, RenderEngine};
use crate::error::SyncError;
use crate::geo::{LngLat, MercView, Point, ViewState, lnglat_to_merc};

// =============================================================================
// IDENTITY
// =============================================================================

/// Stable identifier of a registered source (`mapID`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which family a source belongs to. Drives background/overlay composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Linear web-Mercator raster basemap.
    Basemap,
    /// Raster tiles drawn over a basemap.
    TileOverlay,
    /// Vector basemap rendered through the GL overlay adapter.
    GlBasemap,
    /// Scanned historical map warped onto Mercator.
    Warped,
}

impl SourceKind {
    /// Whether the source lives in Mercator space (everything but warped maps).
    #[must_use]
    pub fn is_basemap_like(self) -> bool {
        !matches!(self, Self::Warped)
    }

    /// A basemap that can stand alone as foreground or background.
    #[must_use]
    pub fn is_plain_basemap(self) -> bool {
        matches!(self, Self::Basemap | Self::GlBasemap)
    }

    #[must_use]
    pub fn needs_gl_adapter(self) -> bool {
        matches!(self, Self::GlBasemap)
    }
}

// =============================================================================
// VIEW COMMAND PAYLOADS
// =============================================================================

/// Partial view request. Engine coordinates win over geographic ones;
/// `rotation` is in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Viewpoint {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub zoom: Option<f64>,
    pub rotation: Option<f64>,
}

/// Device position reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPosition {
    pub lnglat: LngLat,
    /// Accuracy radius in meters.
    pub accuracy: Option<f64>,
}

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Coordinate capabilities of one source.
///
/// Conversions may be expensive (triangulation lookups) and are therefore
/// async. The predicates are cheap and synchronous.
#[async_trait::async_trait]
pub trait MapSource: Send + Sync {
    /// Source space to Mercator.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Conversion`] if the point cannot be transformed.
    async fn xy_to_merc(&self, xy: Point) -> Result<Point, SyncError>;

    /// Mercator to source space. `None` when the point falls outside the
    /// source's area and `extrapolate` is off.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Conversion`] if the point cannot be transformed.
    async fn merc_to_xy(&self, merc: Point, extrapolate: bool) -> Result<Option<Point>, SyncError>;

    /// Whole-viewport conversion into canonical Mercator terms.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Conversion`] if the view cannot be transformed.
    async fn size_to_mercs(&self, view: ViewState) -> Result<MercView, SyncError>;

    /// Inverse of [`MapSource::size_to_mercs`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Conversion`] if the view cannot be transformed.
    async fn mercs_to_size(&self, mercs: &MercView) -> Result<ViewState, SyncError>;

    /// Whether a source-space coordinate lies inside the valid area.
    fn inside(&self, xy: Point) -> bool;

    /// Clamp a source-space coordinate into the valid area.
    fn modulate_inside(&self, xy: Point) -> Point;

    /// Default view of this source.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Conversion`] if the home position cannot be transformed.
    async fn home_view(&self) -> Result<ViewState, SyncError>;

    /// Jump the engine to [`MapSource::home_view`].
    ///
    /// # Errors
    ///
    /// Propagates conversion failures.
    async fn go_home(&self, engine: &dyn RenderEngine) -> Result<(), SyncError> {
        let home = self.home_view().await?;
        engine.set_center(home.center);
        engine.set_zoom(home.zoom);
        engine.set_rotation(home.rotation);
        Ok(())
    }

    /// Apply a partial view request.
    ///
    /// # Errors
    ///
    /// Propagates conversion failures.
    async fn set_viewpoint(&self, engine: &dyn RenderEngine, cond: Viewpoint) -> Result<(), SyncError> {
        let center = match (cond.x, cond.y, cond.longitude, cond.latitude) {
            (Some(x), Some(y), _, _) => Some(Point::new(x, y)),
            (_, _, Some(lng), Some(lat)) => self.merc_to_xy(lnglat_to_merc(LngLat::new(lng, lat)), true).await?,
            _ => None,
        };
        if let Some(center) = center {
            engine.set_center(center);
        }
        if let Some(zoom) = cond.zoom {
            engine.set_zoom(zoom);
        }
        if let Some(rotation) = cond.rotation {
            engine.set_rotation(rotation.to_radians());
        }
        Ok(())
    }

    /// Draw (or clear) the current-position marker. Unless `ignore_move`,
    /// the view is also centered on a position that falls inside.
    ///
    /// # Errors
    ///
    /// Propagates conversion failures.
    async fn set_gps_marker(
        &self,
        engine: &dyn RenderEngine,
        position: Option<GpsPosition>,
        ignore_move: bool,
    ) -> Result<(), SyncError> {
        let Some(position) = position else {
            engine.set_gps_marker(None);
            return Ok(());
        };
        let xy = self.merc_to_xy(lnglat_to_merc(position.lnglat), false).await?;
        match xy {
            Some(xy) if self.inside(xy) => {
                engine.set_gps_marker(Some(GpsMarker { xy, radius: position.accuracy }));
                if !ignore_move {
                    engine.set_center(xy);
                }
            }
            _ => engine.set_gps_marker(None),
        }
        Ok(())
    }
}

// =============================================================================
// SOURCE
// =============================================================================

/// A registered source: metadata, kind tag, and capabilities.
pub struct Source {
    pub id: SourceId,
    pub label: String,
    pub kind: SourceKind,
    pub min_zoom: f64,
    pub max_zoom: f64,
    caps: Arc<dyn MapSource>,
}

impl Source {
    #[must_use]
    pub fn new(id: SourceId, label: impl Into<String>, kind: SourceKind, caps: Arc<dyn MapSource>) -> Self {
        Self { id, label: label.into(), kind, min_zoom: 0.0, max_zoom: 20.0, caps }
    }

    #[must_use]
    pub fn with_zoom_bounds(mut self, min_zoom: f64, max_zoom: f64) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom;
        self
    }

    #[must_use]
    pub fn caps(&self) -> &dyn MapSource {
        self.caps.as_ref()
    }

    #[must_use]
    pub fn meta(&self) -> MapMeta {
        MapMeta {
            map_id: self.id.clone(),
            label: self.label.clone(),
            kind: self.kind,
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").field("id", &self.id).field("kind", &self.kind).finish_non_exhaustive()
    }
}

/// Public description of a source, carried by `sourceLoaded` / `mapChanged`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapMeta {
    #[serde(rename = "mapID")]
    pub map_id: SourceId,
    pub label: String,
    pub kind: SourceKind,
    pub min_zoom: f64,
    pub max_zoom: f64,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// The immutable set of registered sources plus the Mercator basemap used as
/// the canonical reference space.
#[derive(Debug)]
pub struct SourceRegistry {
    ordered: Vec<Arc<Source>>,
    by_id: HashMap<SourceId, Arc<Source>>,
    basemap: Arc<Source>,
}

impl SourceRegistry {
    /// Register sources in declaration order.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NoSources`] for an empty list.
    /// - [`SyncError::GlAdapterMissing`] if a GL source is present without adapter.
    /// - [`SyncError::ConfigParse`] if no Mercator basemap is declared.
    pub fn new(sources: Vec<Source>, gl_adapter: bool) -> Result<Self, SyncError> {
        if sources.is_empty() {
            return Err(SyncError::NoSources);
        }
        if !gl_adapter && let Some(gl) = sources.iter().find(|s| s.kind.needs_gl_adapter()) {
            return Err(SyncError::GlAdapterMissing { id: gl.id.clone() });
        }

        let ordered: Vec<Arc<Source>> = sources.into_iter().map(Arc::new).collect();
        let basemap = ordered
            .iter()
            .find(|s| s.kind.is_plain_basemap())
            .or_else(|| ordered.iter().find(|s| s.kind.is_basemap_like()))
            .cloned()
            .ok_or_else(|| SyncError::ConfigParse("setting declares no Mercator basemap".into()))?;

        let mut by_id = HashMap::with_capacity(ordered.len());
        for source in &ordered {
            if by_id.insert(source.id.clone(), Arc::clone(source)).is_some() {
                return Err(SyncError::ConfigParse(format!("duplicate mapID: {}", source.id)));
            }
        }

        Ok(Self { ordered, by_id, basemap })
    }

    #[must_use]
    pub fn get(&self, id: &SourceId) -> Option<Arc<Source>> {
        self.by_id.get(id).cloned()
    }

    /// The canonical Mercator basemap.
    #[must_use]
    pub fn basemap(&self) -> Arc<Source> {
        Arc::clone(&self.basemap)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Source>> {
        self.ordered.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    #[must_use]
    pub fn metas(&self) -> Vec<MapMeta> {
        self.ordered.iter().map(|s| s.meta()).collect()
    }

    /// Initial map: restored id, else `start_from`, else the last source.
    /// Unknown ids fall through to the next candidate.
    #[must_use]
    pub fn initial_id(&self, restored: Option<&SourceId>, start_from: Option<&SourceId>) -> SourceId {
        restored
            .filter(|id| self.by_id.contains_key(*id))
            .or_else(|| start_from.filter(|id| self.by_id.contains_key(*id)))
            .cloned()
            .unwrap_or_else(|| self.ordered.last().unwrap_or(&self.basemap).id.clone())
    }

    /// Provisional active source before the first switch: the first source
    /// other than `initial`, moved forward to a later warped map when the
    /// first pick is basemap-like. Falls back to `initial` itself when it is
    /// the only source.
    #[must_use]
    pub fn provisional_from(&self, initial: &SourceId) -> Arc<Source> {
        let mut pick: Option<&Arc<Source>> = None;
        for source in &self.ordered {
            if &source.id == initial {
                continue;
            }
            match pick {
                None => pick = Some(source),
                Some(prev) if prev.kind.is_basemap_like() => pick = Some(source),
                Some(_) => {}
            }
        }
        pick.cloned().or_else(|| self.get(initial)).unwrap_or_else(|| self.basemap())
    }
}
