//! Error taxonomy for the sync engine.
//!
//! Configuration errors are fatal and returned synchronously to whoever
//! triggered them. Conversion errors come from map sources and propagate to
//! the nearest caller without retries. Out-of-bounds navigation and stale
//! async results are not errors at all: the former is an `outOfMap` event,
//! the latter are dropped where they are detected.

use crate::source::SourceId;

/// Errors produced by the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A GL-backed source was registered or requested without a GL adapter.
    #[error("source {id} needs a GL overlay adapter, but none was configured")]
    GlAdapterMissing { id: SourceId },

    /// Application setting could not be parsed.
    #[error("config parse failed: {0}")]
    ConfigParse(String),

    /// The application setting declares no sources.
    #[error("no map sources configured")]
    NoSources,

    /// A source failed to convert between its space and Mercator.
    #[error("conversion failed in source {id}: {reason}")]
    Conversion { id: SourceId, reason: String },

    /// The key-value store rejected a read or write.
    #[error("state store failed: {0}")]
    Storage(String),

    /// The map-switch worker is gone (application torn down).
    #[error("map switch queue closed")]
    SchedulerClosed,
}

impl SyncError {
    /// Whether the error stems from static configuration rather than runtime state.
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::GlAdapterMissing { .. } | Self::ConfigParse(_) | Self::NoSources)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigParse(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
