//! Linear (similarity transform) source capabilities.
//!
//! Covers every Mercator-space source (identity transform) and serves as a
//! stand-in for warped maps when no triangulation is available: the source
//! plane is rotated, uniformly scaled and offset onto Mercator. Zoom levels
//! shift by `log2(scale)` so one screen pixel covers the same ground in both
//! spaces.

#[cfg(test)]
#[path = "affine_test.rs"]
mod tests;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{MapSource, Source, SourceId};
use crate::config::{AppSetting, SourceDef};
use crate::error::SyncError;
use crate::geo::{LngLat, MercView, Point, ViewState, lnglat_to_merc};

/// Axis-aligned valid area in source coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Point,
    pub max: Point,
}

impl Bounds {
    #[must_use]
    pub fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    #[must_use]
    pub fn clamp(&self, p: Point) -> Point {
        Point::new(p.x.clamp(self.min.x, self.max.x), p.y.clamp(self.min.y, self.max.y))
    }
}

/// Where [`AffineSource::home_view`] lands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Home {
    /// A fixed view in source coordinates.
    Fixed(ViewState),
    /// A geographic position and Mercator zoom, converted on demand.
    Geographic { lnglat: LngLat, merc_zoom: f64 },
}

#[derive(Debug, Clone)]
pub struct AffineSource {
    id: SourceId,
    origin: Point,
    scale: f64,
    rotation: f64,
    bounds: Option<Bounds>,
    home: Home,
}

impl AffineSource {
    /// Identity transform: source space *is* Mercator.
    #[must_use]
    pub fn mercator(id: SourceId, home: Home) -> Self {
        Self { id, origin: Point::default(), scale: 1.0, rotation: 0.0, bounds: None, home }
    }

    /// `origin` is the Mercator position of source `(0, 0)`, `scale` the
    /// Mercator meters per source unit, `rotation` in radians.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConfigParse`] for a non-positive or non-finite scale.
    pub fn new(id: SourceId, origin: Point, scale: f64, rotation: f64, home: Home) -> Result<Self, SyncError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(SyncError::ConfigParse(format!("source {id}: scale must be positive, got {scale}")));
        }
        Ok(Self { id, origin, scale, rotation, bounds: None, home })
    }

    #[must_use]
    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Zoom difference between source space and Mercator space.
    fn zoom_shift(&self) -> f64 {
        self.scale.log2()
    }

    fn forward(&self, xy: Point) -> Point {
        let (sin, cos) = self.rotation.sin_cos();
        Point::new(
            (xy.x * cos - xy.y * sin) * self.scale + self.origin.x,
            (xy.x * sin + xy.y * cos) * self.scale + self.origin.y,
        )
    }

    fn inverse(&self, merc: Point) -> Point {
        let (sin, cos) = self.rotation.sin_cos();
        let dx = (merc.x - self.origin.x) / self.scale;
        let dy = (merc.y - self.origin.y) / self.scale;
        Point::new(dx * cos + dy * sin, -dx * sin + dy * cos)
    }

    fn finite(&self, p: Point) -> Result<Point, SyncError> {
        if p.x.is_finite() && p.y.is_finite() {
            Ok(p)
        } else {
            Err(SyncError::Conversion { id: self.id.clone(), reason: format!("non-finite result ({}, {})", p.x, p.y) })
        }
    }
}

#[async_trait::async_trait]
impl MapSource for AffineSource {
    async fn xy_to_merc(&self, xy: Point) -> Result<Point, SyncError> {
        self.finite(self.forward(xy))
    }

    async fn merc_to_xy(&self, merc: Point, extrapolate: bool) -> Result<Option<Point>, SyncError> {
        let xy = self.finite(self.inverse(merc))?;
        if !extrapolate && !self.inside(xy) {
            return Ok(None);
        }
        Ok(Some(xy))
    }

    async fn size_to_mercs(&self, view: ViewState) -> Result<MercView, SyncError> {
        let center = self.finite(self.forward(view.center))?;
        Ok(MercView::new(center, view.zoom - self.zoom_shift(), view.rotation + self.rotation))
    }

    async fn mercs_to_size(&self, mercs: &MercView) -> Result<ViewState, SyncError> {
        let center = self.finite(self.inverse(mercs.center))?;
        Ok(ViewState::new(center, mercs.zoom + self.zoom_shift(), mercs.rotation - self.rotation))
    }

    fn inside(&self, xy: Point) -> bool {
        self.bounds.is_none_or(|b| b.contains(xy))
    }

    fn modulate_inside(&self, xy: Point) -> Point {
        self.bounds.map_or(xy, |b| b.clamp(xy))
    }

    async fn home_view(&self) -> Result<ViewState, SyncError> {
        match self.home {
            Home::Fixed(view) => Ok(view),
            Home::Geographic { lnglat, merc_zoom } => {
                let center = self.finite(self.inverse(lnglat_to_merc(lnglat)))?;
                Ok(ViewState::new(center, merc_zoom + self.zoom_shift(), 0.0))
            }
        }
    }
}

// =============================================================================
// BUILD FROM SETTING
// =============================================================================

/// Build one source from its setting entry, falling back to app-level home
/// position and zoom bounds.
///
/// # Errors
///
/// Returns [`SyncError::ConfigParse`] for invalid transform parameters.
pub fn build_source(def: &SourceDef, setting: &AppSetting) -> Result<Source, SyncError> {
    let id = def.map_id.clone();
    let home = match def.home {
        Some(home) => Home::Fixed(ViewState::new(Point::new(home.x, home.y), home.zoom, 0.0)),
        None => Home::Geographic { lnglat: setting.home_lnglat(), merc_zoom: setting.default_zoom },
    };

    let origin = match (def.origin, def.origin_lnglat) {
        (Some(origin), _) => origin,
        (None, Some(lnglat)) => lnglat_to_merc(lnglat),
        (None, None) => Point::default(),
    };
    let mut caps = AffineSource::new(id.clone(), origin, def.scale, def.rotation.to_radians(), home)?;
    if let Some(bounds) = def.bounds {
        caps = caps.with_bounds(bounds);
    }

    let shift = def.scale.log2();
    let min_zoom = def.min_zoom.unwrap_or(setting.min_zoom + shift);
    let max_zoom = def.max_zoom.unwrap_or(setting.max_zoom + shift);
    let label = def.label.clone().unwrap_or_else(|| id.to_string());

    Ok(Source::new(id, label, def.kind, Arc::new(caps)).with_zoom_bounds(min_zoom, max_zoom))
}

/// Build every source declared in the setting, in order.
///
/// # Errors
///
/// Propagates the first [`build_source`] failure.
pub fn build_sources(setting: &AppSetting) -> Result<Vec<Source>, SyncError> {
    setting.sources.iter().map(|def| build_source(def, setting)).collect()
}
