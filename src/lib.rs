//! Viewport synchronization and coordinate-cache engine for a historical-map
//! viewer.
//!
//! A foreground map is panned, zoomed and rotated by the user; a background
//! basemap, tile overlays, markers and lines stay aligned with it even
//! though every source has its own coordinate space. The crate converts the
//! view between those spaces on every frame, memoizes the conversions,
//! serializes map switches, and reports changes as an event stream with
//! debounced persistence. Rendering and the warp transform itself stay
//! behind the [`engine::RenderEngine`] and [`source::MapSource`] traits.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`app`] | Host-facing facade wiring services to engine callbacks |
//! | [`state`] | Shared context: active source, viewport, flags |
//! | [`services`] | Cache, switch scheduler, sync loop, gestures, persistence, markers |
//! | [`source`] | Source metadata, kinds, registry, capability trait |
//! | [`engine`] | Rendering-engine boundary and a headless recorder |
//! | [`events`] | Outgoing event types and the broadcast bus |
//! | [`config`] | Setting document, host options, runtime tuning |
//! | [`geo`] | Points, views, Mercator helpers |
//! | [`timer`] | Cancel-on-supersede timer |
//! | [`error`] | Error taxonomy |

pub mod app;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod geo;
pub mod services;
pub mod source;
pub mod state;
pub mod timer;

pub use app::{App, Engines};
pub use error::SyncError;
