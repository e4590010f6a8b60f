//! Configuration: application setting, host options, and runtime tuning.
//!
//! DESIGN
//! ======
//! Three layers, from most to least static:
//! - [`AppSetting`] is the JSON document describing sources, home position,
//!   zoom bounds and initial POI layers.
//! - [`AppOptions`] are chosen by the embedding host (overlay on/off, session
//!   restore, GL adapter availability, explicit restore target).
//! - [`RuntimeConfig`] holds timing knobs read from environment variables,
//!   each with a default matching the viewer's interactive behavior.

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::geo::{LngLat, Point};
use crate::services::markers::PoiLayer;
use crate::services::persistence::RestoreOptions;
use crate::source::affine::Bounds;
use crate::source::{SourceId, SourceKind};

pub const DEFAULT_STATE_DEBOUNCE_MS: u64 = 50;
pub const DEFAULT_IDLE_FADE_MS: u64 = 3000;
pub const DEFAULT_SESSION_FRESHNESS_SECS: u64 = 3600;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

const DEFAULT_ZOOM: f64 = 17.0;
const DEFAULT_MAX_ZOOM: f64 = 20.0;

// =============================================================================
// APP SETTING
// =============================================================================

/// Fixed home view of a source, in source coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HomeDef {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

/// One source entry in the application setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDef {
    #[serde(rename = "mapID")]
    pub map_id: SourceId,
    #[serde(default)]
    pub label: Option<String>,
    pub kind: SourceKind,
    #[serde(default)]
    pub min_zoom: Option<f64>,
    #[serde(default)]
    pub max_zoom: Option<f64>,
    /// Mercator position of source `(0, 0)`.
    #[serde(default)]
    pub origin: Option<Point>,
    /// Same as `origin`, given geographically.
    #[serde(default)]
    pub origin_lnglat: Option<LngLat>,
    /// Mercator meters per source unit.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Rotation of the source plane in degrees.
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub home: Option<HomeDef>,
    /// POI layers that belong to this map only.
    #[serde(default)]
    pub pois: Vec<PoiLayer>,
}

fn default_scale() -> f64 {
    1.0
}

fn default_zoom() -> f64 {
    DEFAULT_ZOOM
}

fn default_max_zoom() -> f64 {
    DEFAULT_MAX_ZOOM
}

/// The application setting document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSetting {
    #[serde(default)]
    pub app_name: String,
    /// `[longitude, latitude]` of the default view.
    #[serde(default)]
    pub home_position: Option<[f64; 2]>,
    /// Mercator zoom of the default view.
    #[serde(default = "default_zoom")]
    pub default_zoom: f64,
    /// Apply each source's zoom bounds to the view on switch.
    #[serde(default)]
    pub zoom_restriction: bool,
    #[serde(default)]
    pub min_zoom: f64,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: f64,
    #[serde(default)]
    pub start_from: Option<SourceId>,
    #[serde(default)]
    pub no_rotate: bool,
    pub sources: Vec<SourceDef>,
    #[serde(default)]
    pub pois: Vec<PoiLayer>,
}

impl AppSetting {
    /// Parse a setting document.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConfigParse`] for malformed JSON or an empty source list.
    pub fn from_json(raw: &str) -> Result<Self, SyncError> {
        let setting: Self = serde_json::from_str(raw)?;
        if setting.sources.is_empty() {
            return Err(SyncError::NoSources);
        }
        Ok(setting)
    }

    /// Read and parse a setting file.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the file cannot be read, or the
    /// errors of [`AppSetting::from_json`].
    pub async fn load(path: &Path) -> Result<Self, SyncError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }

    #[must_use]
    pub fn home_lnglat(&self) -> LngLat {
        self.home_position.map_or(LngLat::new(0.0, 0.0), |[lng, lat]| LngLat::new(lng, lat))
    }
}

// =============================================================================
// APP OPTIONS
// =============================================================================

/// Host-chosen options.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq)]
pub struct AppOptions {
    /// Show a background basemap under non-opaque foreground maps.
    pub overlay: bool,
    /// Mirror state into the store and restore fresh sessions at startup.
    pub restore_session: bool,
    /// Explicit restore target; wins over the stored session.
    pub restore: Option<RestoreOptions>,
    /// Disable rotation regardless of the setting.
    pub no_rotate: bool,
    /// A GL overlay adapter is available for GL basemaps.
    pub gl_adapter: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self { overlay: true, restore_session: false, restore: None, no_rotate: false, gl_adapter: false }
    }
}

// =============================================================================
// RUNTIME CONFIG
// =============================================================================

/// Timing knobs, loaded from environment variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Debounce window for `updateState` emission and store mirroring.
    pub state_debounce: Duration,
    /// Idle time after a move ends before chrome controls fade.
    pub idle_fade: Duration,
    /// Maximum age of a stored session that may still be restored.
    pub session_freshness: Duration,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_debounce: Duration::from_millis(DEFAULT_STATE_DEBOUNCE_MS),
            idle_fade: Duration::from_millis(DEFAULT_IDLE_FADE_MS),
            session_freshness: Duration::from_secs(DEFAULT_SESSION_FRESHNESS_SECS),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Build from environment variables.
    ///
    /// Optional:
    /// - `MAPSYNC_STATE_DEBOUNCE_MS`: default 50
    /// - `MAPSYNC_IDLE_FADE_MS`: default 3000
    /// - `MAPSYNC_SESSION_FRESHNESS_SECS`: default 3600
    /// - `MAPSYNC_EVENT_CAPACITY`: default 1024
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            state_debounce: Duration::from_millis(env_parse("MAPSYNC_STATE_DEBOUNCE_MS", DEFAULT_STATE_DEBOUNCE_MS)),
            idle_fade: Duration::from_millis(env_parse("MAPSYNC_IDLE_FADE_MS", DEFAULT_IDLE_FADE_MS)),
            session_freshness: Duration::from_secs(env_parse(
                "MAPSYNC_SESSION_FRESHNESS_SECS",
                DEFAULT_SESSION_FRESHNESS_SECS,
            )),
            event_capacity: env_parse("MAPSYNC_EVENT_CAPACITY", DEFAULT_EVENT_CAPACITY).max(1),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}
