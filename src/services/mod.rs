//! Services that keep the viewer's views, caches and state in step.
//!
//! ARCHITECTURE
//! ============
//! Each service takes the pieces of [`crate::state::AppContext`] it needs at
//! construction. The `App` facade owns the services and routes host calls
//! and engine callbacks to them; services never call back into the facade.

pub mod cache;
pub mod gesture;
pub mod markers;
pub mod persistence;
pub mod switch;
pub mod sync;
