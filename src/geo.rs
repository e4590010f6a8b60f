//! Geometry primitives shared by every coordinate space.
//!
//! A [`ViewState`] is always expressed in *some* source's space (pixels of a
//! scanned map, Mercator meters of a basemap). A [`MercView`] is the same
//! view expressed canonically in EPSG:3857, which is what lets two sources
//! with unrelated pixel spaces agree on where the user is looking.

#[cfg(test)]
#[path = "geo_test.rs"]
mod tests;

use serde::{Deserialize, Serialize};

/// Earth radius used by spherical (web) Mercator.
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Latitude limit of web Mercator.
pub const MAX_LATITUDE: f64 = 85.051_128_779_8;

/// Fractional digits kept when snapshotting views, absorbing renderer jitter.
pub const VIEW_PRECISION_DIGITS: i32 = 10;

// =============================================================================
// POINT
// =============================================================================

/// A point in a source's own coordinate space or in Mercator meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Round both components to `digits` fractional digits.
    #[must_use]
    pub fn rounded(self, digits: i32) -> Self {
        Self { x: round_to(self.x, digits), y: round_to(self.y, digits) }
    }

    /// Exact bitwise equality, so `-0.0` and `0.0` differ and `NaN` equals itself.
    #[must_use]
    pub fn bit_eq(&self, other: &Self) -> bool {
        self.x.to_bits() == other.x.to_bits() && self.y.to_bits() == other.y.to_bits()
    }
}

/// Geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    pub longitude: f64,
    pub latitude: f64,
}

impl LngLat {
    #[must_use]
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self { longitude, latitude }
    }
}

// =============================================================================
// VIEW STATE
// =============================================================================

/// Center / zoom / rotation of a view, in one source's coordinate space.
///
/// `rotation` is in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ViewState {
    pub center: Point,
    pub zoom: f64,
    pub rotation: f64,
}

impl ViewState {
    #[must_use]
    pub fn new(center: Point, zoom: f64, rotation: f64) -> Self {
        Self { center, zoom, rotation }
    }

    /// Snapshot used as the cache key: every component rounded to
    /// [`VIEW_PRECISION_DIGITS`].
    #[must_use]
    pub fn rounded(self) -> Self {
        Self {
            center: self.center.rounded(VIEW_PRECISION_DIGITS),
            zoom: round_to(self.zoom, VIEW_PRECISION_DIGITS),
            rotation: round_to(self.rotation, VIEW_PRECISION_DIGITS),
        }
    }

    #[must_use]
    pub fn bit_eq(&self, other: &Self) -> bool {
        self.center.bit_eq(&other.center)
            && self.zoom.to_bits() == other.zoom.to_bits()
            && self.rotation.to_bits() == other.rotation.to_bits()
    }
}

/// A view expressed canonically in web Mercator.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MercView {
    /// Center in EPSG:3857 meters.
    pub center: Point,
    /// Zoom level on the standard web Mercator tile pyramid.
    pub zoom: f64,
    /// Rotation in radians.
    pub rotation: f64,
}

impl MercView {
    #[must_use]
    pub fn new(center: Point, zoom: f64, rotation: f64) -> Self {
        Self { center, zoom, rotation }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Round `value` to `digits` fractional digits.
#[must_use]
pub fn round_to(value: f64, digits: i32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(digits);
    let scaled = value * factor;
    // Values this large have no fractional digits left to round.
    if !scaled.is_finite() {
        return value;
    }
    scaled.round() / factor
}

/// Fold an angle in degrees into `(-180, 180]`.
#[must_use]
pub fn normalize_degree(degree: f64) -> f64 {
    if !degree.is_finite() {
        return degree;
    }
    let folded = degree.rem_euclid(360.0);
    if folded > 180.0 { folded - 360.0 } else { folded }
}

/// EPSG:4326 to EPSG:3857.
#[must_use]
pub fn lnglat_to_merc(lnglat: LngLat) -> Point {
    let d = std::f64::consts::PI / 180.0;
    let lat = lnglat.latitude.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let sin_lat = (lat * d).sin();
    Point::new(EARTH_RADIUS * lnglat.longitude * d, EARTH_RADIUS * ((1.0 + sin_lat) / (1.0 - sin_lat)).ln() / 2.0)
}

/// EPSG:3857 to EPSG:4326.
#[must_use]
pub fn merc_to_lnglat(merc: Point) -> LngLat {
    let d = 180.0 / std::f64::consts::PI;
    LngLat::new(
        merc.x * d / EARTH_RADIUS,
        (2.0 * (merc.y / EARTH_RADIUS).exp().atan() - std::f64::consts::PI / 2.0) * d,
    )
}
