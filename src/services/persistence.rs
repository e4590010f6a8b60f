//! State persistence: debounced `updateState` emission and session mirror.
//!
//! DESIGN
//! ======
//! Every state-changing operation shallow-merges a partial [`StateUpdate`]
//! into the cumulative [`StateSnapshot`] immediately, so readers such as the
//! marker redraw always see the latest flags. Emission and store mirroring
//! are debounced: each update re-arms a single [`ScopedTimer`], and only the
//! last one in a burst flushes.
//!
//! A [`Patch::Delete`] removes a field from the snapshot and, at the next
//! flush, from the store.
//!
//! SESSION RESTORE
//! ===============
//! The store carries an `epoch` written on every flush. At startup the
//! mirrored fields are read back only if that epoch is within the freshness
//! window; a stale session is ignored entirely.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::events::{AppEvent, EventBus};
use crate::source::{SourceId, Viewpoint};
use crate::timer::ScopedTimer;

pub const KEY_EPOCH: &str = "epoch";
pub const KEY_MAP_ID: &str = "mapID";
pub const KEY_BACKGROUND_ID: &str = "backgroundID";
pub const KEY_X: &str = "x";
pub const KEY_Y: &str = "y";
pub const KEY_ZOOM: &str = "zoom";
pub const KEY_ROTATION: &str = "rotation";
pub const KEY_TRANSPARENCY: &str = "transparency";
pub const KEY_HIDE_MARKER: &str = "hideMarker";
pub const KEY_HIDE_LAYER: &str = "hideLayer";

// Older sessions stored the ids under these names.
const LEGACY_KEY_MAP_ID: &str = "sourceID";
const LEGACY_KEY_BACKGROUND_ID: &str = "backID";

// =============================================================================
// STATE TYPES
// =============================================================================

/// Engine-space position; `rotation` in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
    pub rotation: f64,
}

/// Set a field or remove it.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch<T> {
    Set(T),
    Delete,
}

/// A partial state update. `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateUpdate {
    pub position: Option<Patch<Position>>,
    pub map_id: Option<Patch<SourceId>>,
    pub background_id: Option<Patch<SourceId>>,
    pub transparency: Option<Patch<f64>>,
    pub hide_layer: Option<Patch<String>>,
    pub hide_marker: Option<Patch<bool>>,
}

impl StateUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn position(mut self, position: Position) -> Self {
        self.position = Some(Patch::Set(position));
        self
    }

    #[must_use]
    pub fn map_id(mut self, id: SourceId) -> Self {
        self.map_id = Some(Patch::Set(id));
        self
    }

    #[must_use]
    pub fn background_id(mut self, id: SourceId) -> Self {
        self.background_id = Some(Patch::Set(id));
        self
    }

    #[must_use]
    pub fn delete_background_id(mut self) -> Self {
        self.background_id = Some(Patch::Delete);
        self
    }

    #[must_use]
    pub fn transparency(mut self, percentage: f64) -> Self {
        self.transparency = Some(Patch::Set(percentage));
        self
    }

    #[must_use]
    pub fn hide_layer(mut self, namespaces: String) -> Self {
        self.hide_layer = Some(Patch::Set(namespaces));
        self
    }

    #[must_use]
    pub fn hide_marker(mut self, hidden: bool) -> Self {
        self.hide_marker = Some(Patch::Set(hidden));
        self
    }
}

/// Cumulative state, emitted as the `updateState` payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(rename = "mapID", skip_serializing_if = "Option::is_none")]
    pub map_id: Option<SourceId>,
    #[serde(rename = "backgroundID", skip_serializing_if = "Option::is_none")]
    pub background_id: Option<SourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transparency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hide_layer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hide_marker: Option<bool>,
}

/// Merge one field, recording store keys a deletion must clear.
fn merge_field<T>(slot: &mut Option<T>, patch: Option<Patch<T>>, keys: &[&'static str], removed: &mut BTreeSet<&'static str>) {
    match patch {
        None => {}
        Some(Patch::Set(value)) => {
            *slot = Some(value);
            for key in keys {
                removed.remove(key);
            }
        }
        Some(Patch::Delete) => {
            *slot = None;
            removed.extend(keys.iter().copied());
        }
    }
}

#[derive(Debug, Default)]
struct StateBuffer {
    snapshot: StateSnapshot,
    /// Store keys deleted since the last flush.
    removed: BTreeSet<&'static str>,
    updates_since_flush: usize,
}

impl StateBuffer {
    fn merge(&mut self, update: StateUpdate) {
        let s = &mut self.snapshot;
        let r = &mut self.removed;
        merge_field(&mut s.position, update.position, &[KEY_X, KEY_Y, KEY_ZOOM, KEY_ROTATION], r);
        merge_field(&mut s.map_id, update.map_id, &[KEY_MAP_ID], r);
        merge_field(&mut s.background_id, update.background_id, &[KEY_BACKGROUND_ID], r);
        merge_field(&mut s.transparency, update.transparency, &[KEY_TRANSPARENCY], r);
        merge_field(&mut s.hide_layer, update.hide_layer, &[KEY_HIDE_LAYER], r);
        merge_field(&mut s.hide_marker, update.hide_marker, &[KEY_HIDE_MARKER], r);
        self.updates_since_flush += 1;
    }

    /// Re-queue removals a failed mirror did not apply. Keys set again in
    /// the meantime are not removed.
    fn keep_removals(&mut self, removals: BTreeSet<&'static str>) {
        let s = &self.snapshot;
        let still_unset = |key: &&'static str| match *key {
            KEY_X | KEY_Y | KEY_ZOOM | KEY_ROTATION => s.position.is_none(),
            KEY_MAP_ID => s.map_id.is_none(),
            KEY_BACKGROUND_ID => s.background_id.is_none(),
            KEY_TRANSPARENCY => s.transparency.is_none(),
            KEY_HIDE_LAYER => s.hide_layer.is_none(),
            KEY_HIDE_MARKER => s.hide_marker.is_none(),
            _ => true,
        };
        self.removed.extend(removals.into_iter().filter(still_unset));
    }
}

// =============================================================================
// KEY-VALUE STORE
// =============================================================================

/// Opaque string key-value store used for session mirroring.
pub trait KvStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the backend fails.
    fn get(&self, key: &str) -> Result<Option<String>, SyncError>;

    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the backend fails.
    fn set(&self, key: &str, value: &str) -> Result<(), SyncError>;

    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if the backend fails.
    fn remove(&self, key: &str) -> Result<(), SyncError>;

    /// Remove `removals`, then write `sets`, as one batch. Backends with a
    /// costly write path override this to write once.
    ///
    /// # Errors
    ///
    /// Returns the first backend failure; later changes are not applied.
    fn apply(&self, removals: &[&str], sets: &[(&str, String)]) -> Result<(), SyncError> {
        for key in removals {
            self.remove(key)?;
        }
        for (key, value) in sets {
            self.set(key, value)?;
        }
        Ok(())
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.lock().clone()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.lock().remove(key);
        Ok(())
    }
}

/// Store backed by a JSON object on disk, rewritten on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if an existing file cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| SyncError::Storage(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries: Mutex::new(entries) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_through(&self, entries: &BTreeMap<String, String>) -> Result<(), SyncError> {
        let raw = serde_json::to_string_pretty(entries).map_err(|e| SyncError::Storage(e.to_string()))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.entries.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_owned(), value.to_owned());
        self.write_through(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(key).is_some() {
            self.write_through(&entries)?;
        }
        Ok(())
    }

    fn apply(&self, removals: &[&str], sets: &[(&str, String)]) -> Result<(), SyncError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for key in removals {
            entries.remove(*key);
        }
        for (key, value) in sets {
            entries.insert((*key).to_owned(), value.clone());
        }
        self.write_through(&entries)
    }
}

// =============================================================================
// STATE PERSISTENCE
// =============================================================================

struct Inner {
    buffer: Mutex<StateBuffer>,
    /// Present only when session restore is enabled.
    store: Option<Arc<dyn KvStore>>,
    bus: EventBus,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, StateBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self) {
        let (snapshot, removed, merged) = {
            let mut buffer = self.lock();
            let merged = std::mem::take(&mut buffer.updates_since_flush);
            (buffer.snapshot.clone(), std::mem::take(&mut buffer.removed), merged)
        };
        debug!(merged, "state flush");

        if let Some(store) = &self.store
            && let Err(e) = mirror(store.as_ref(), &snapshot, &removed)
        {
            warn!(error = %e, pending_removals = removed.len(), "session mirror failed; removals kept for next flush");
            self.lock().keep_removals(removed);
        }
        self.bus.emit(AppEvent::UpdateState(snapshot));
    }
}

fn mirror(store: &dyn KvStore, snapshot: &StateSnapshot, removed: &BTreeSet<&'static str>) -> Result<(), SyncError> {
    let mut sets = vec![(KEY_EPOCH, time::OffsetDateTime::now_utc().unix_timestamp().to_string())];
    if let Some(p) = snapshot.position {
        sets.extend([
            (KEY_X, p.x.to_string()),
            (KEY_Y, p.y.to_string()),
            (KEY_ZOOM, p.zoom.to_string()),
            (KEY_ROTATION, p.rotation.to_string()),
        ]);
    }
    if let Some(id) = &snapshot.map_id {
        sets.push((KEY_MAP_ID, id.to_string()));
    }
    if let Some(id) = &snapshot.background_id {
        sets.push((KEY_BACKGROUND_ID, id.to_string()));
    }
    if let Some(t) = snapshot.transparency {
        sets.push((KEY_TRANSPARENCY, t.to_string()));
    }
    if let Some(layers) = &snapshot.hide_layer {
        sets.push((KEY_HIDE_LAYER, layers.clone()));
    }
    if let Some(hidden) = snapshot.hide_marker {
        sets.push((KEY_HIDE_MARKER, if hidden { "1" } else { "0" }.to_owned()));
    }
    let removals: Vec<&str> = removed.iter().copied().collect();
    store.apply(&removals, &sets)
}

/// Debounced state buffer with optional session mirror.
pub struct StatePersistence {
    inner: Arc<Inner>,
    debounce: Duration,
    timer: ScopedTimer,
}

impl std::fmt::Debug for StatePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatePersistence")
            .field("debounce", &self.debounce)
            .field("mirrored", &self.inner.store.is_some())
            .field("flush_pending", &self.timer.is_pending())
            .finish_non_exhaustive()
    }
}

impl StatePersistence {
    #[must_use]
    pub fn new(bus: EventBus, store: Option<Arc<dyn KvStore>>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner { buffer: Mutex::new(StateBuffer::default()), store, bus }),
            debounce,
            timer: ScopedTimer::new(),
        }
    }

    /// Merge `update` now and (re)arm the debounced flush.
    pub fn request_update(&self, update: StateUpdate) {
        self.inner.lock().merge(update);
        let inner = Arc::clone(&self.inner);
        self.timer.schedule(self.debounce, move || inner.flush());
    }

    /// Flush immediately, dropping any pending debounced flush.
    pub fn flush_now(&self) {
        self.timer.cancel();
        self.inner.flush();
    }

    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().snapshot.clone()
    }

    #[must_use]
    pub fn hide_marker(&self) -> bool {
        self.inner.lock().snapshot.hide_marker.unwrap_or(false)
    }

    #[must_use]
    pub fn flush_pending(&self) -> bool {
        self.timer.is_pending()
    }
}

// =============================================================================
// SESSION RESTORE
// =============================================================================

/// What to restore on a (re)start: explicit host options or a fresh session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreOptions {
    #[serde(rename = "mapID")]
    pub map_id: Option<SourceId>,
    #[serde(rename = "backgroundID")]
    pub background_id: Option<SourceId>,
    pub position: Option<Viewpoint>,
    pub transparency: Option<f64>,
    pub hide_marker: bool,
    pub hide_layer: Option<String>,
}

fn read(store: &dyn KvStore, key: &str) -> Option<String> {
    match store.get(key) {
        Ok(value) => value.filter(|v| !v.is_empty()),
        Err(e) => {
            warn!(error = %e, key, "session read failed");
            None
        }
    }
}

fn read_parsed<T: std::str::FromStr>(store: &dyn KvStore, key: &str) -> Option<T> {
    let raw = read(store, key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            debug!(key, raw = %raw, "ignoring unparsable session value");
            None
        }
    }
}

fn read_f64(store: &dyn KvStore, key: &str) -> Option<f64> {
    read_parsed::<f64>(store, key).filter(|v| v.is_finite())
}

/// Read a stored session, or `None` when missing or older than `freshness`.
#[must_use]
pub fn restore_session(store: &dyn KvStore, now_unix: i64, freshness: Duration) -> Option<RestoreOptions> {
    let epoch = read_parsed::<i64>(store, KEY_EPOCH).unwrap_or(0);
    let max_age = i64::try_from(freshness.as_secs()).unwrap_or(i64::MAX);
    if epoch == 0 || now_unix - epoch >= max_age {
        info!(epoch, now_unix, "stored session missing or stale; not restoring");
        return None;
    }

    let map_id = read(store, KEY_MAP_ID).or_else(|| read(store, LEGACY_KEY_MAP_ID)).map(SourceId::from);
    let background_id =
        read(store, KEY_BACKGROUND_ID).or_else(|| read(store, LEGACY_KEY_BACKGROUND_ID)).map(SourceId::from);

    let position = match (read_f64(store, KEY_X), read_f64(store, KEY_Y)) {
        (Some(x), Some(y)) => Some(Viewpoint {
            x: Some(x),
            y: Some(y),
            zoom: read_f64(store, KEY_ZOOM),
            rotation: read_f64(store, KEY_ROTATION),
            ..Viewpoint::default()
        }),
        _ => None,
    };
    let hide_marker = read_parsed::<i64>(store, KEY_HIDE_MARKER).is_some_and(|v| v != 0);

    Some(RestoreOptions {
        map_id,
        background_id,
        position,
        transparency: Some(read_f64(store, KEY_TRANSPARENCY).unwrap_or(0.0)),
        hide_marker,
        hide_layer: read(store, KEY_HIDE_LAYER),
    })
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
