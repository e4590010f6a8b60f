#![allow(clippy::float_cmp)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::*;

const DEBOUNCE: Duration = Duration::from_millis(50);

fn position(x: f64) -> Position {
    Position { x, y: 2.0, zoom: 3.0, rotation: 0.0 }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<AppEvent>) -> Vec<StateSnapshot> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let AppEvent::UpdateState(snapshot) = event {
            out.push(snapshot);
        }
    }
    out
}

async fn settle() {
    tokio::time::sleep(DEBOUNCE * 2).await;
    tokio::task::yield_now().await;
}

#[tokio::test(start_paused = true)]
async fn burst_of_updates_emits_once() {
    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    let state = StatePersistence::new(bus, None, DEBOUNCE);

    state.request_update(StateUpdate::new().position(position(1.0)));
    state.request_update(StateUpdate::new().map_id("a".into()));
    state.request_update(StateUpdate::new().position(position(5.0)).transparency(30.0));
    assert!(state.flush_pending());
    assert!(drain(&mut rx).is_empty());

    settle().await;
    let emitted = drain(&mut rx);
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].position, Some(position(5.0)));
    assert_eq!(emitted[0].map_id, Some(SourceId::from("a")));
    assert_eq!(emitted[0].transparency, Some(30.0));
}

#[tokio::test(start_paused = true)]
async fn buffer_is_visible_before_flush() {
    let state = StatePersistence::new(EventBus::new(4), None, DEBOUNCE);
    state.request_update(StateUpdate::new().hide_marker(true));
    assert!(state.hide_marker());
    assert_eq!(state.snapshot().hide_marker, Some(true));
}

#[tokio::test(start_paused = true)]
async fn snapshot_is_cumulative_across_flushes() {
    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    let state = StatePersistence::new(bus, None, DEBOUNCE);

    state.request_update(StateUpdate::new().map_id("a".into()));
    settle().await;
    state.request_update(StateUpdate::new().transparency(10.0));
    settle().await;

    let emitted = drain(&mut rx);
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[1].map_id, Some(SourceId::from("a")));
    assert_eq!(emitted[1].transparency, Some(10.0));
}

#[tokio::test(start_paused = true)]
async fn delete_removes_field_and_store_key() {
    let store = Arc::new(MemoryStore::new());
    let state = StatePersistence::new(EventBus::new(4), Some(store.clone() as Arc<dyn KvStore>), DEBOUNCE);

    state.request_update(StateUpdate::new().map_id("warp".into()).background_id("osm".into()));
    settle().await;
    assert_eq!(store.get(KEY_BACKGROUND_ID).unwrap().as_deref(), Some("osm"));

    state.request_update(StateUpdate::new().delete_background_id());
    assert_eq!(state.snapshot().background_id, None);
    settle().await;
    assert_eq!(store.get(KEY_BACKGROUND_ID).unwrap(), None);
    assert_eq!(store.get(KEY_MAP_ID).unwrap().as_deref(), Some("warp"));
}

#[tokio::test(start_paused = true)]
async fn mirror_writes_epoch_and_fields() {
    let store = Arc::new(MemoryStore::new());
    let state = StatePersistence::new(EventBus::new(4), Some(store.clone() as Arc<dyn KvStore>), DEBOUNCE);

    state.request_update(StateUpdate::new().position(position(7.5)).hide_marker(true).hide_layer("a,b".into()));
    settle().await;

    let entries = store.entries();
    assert!(entries.get(KEY_EPOCH).is_some_and(|e| e.parse::<i64>().unwrap() > 0));
    assert_eq!(entries.get(KEY_X).map(String::as_str), Some("7.5"));
    assert_eq!(entries.get(KEY_HIDE_MARKER).map(String::as_str), Some("1"));
    assert_eq!(entries.get(KEY_HIDE_LAYER).map(String::as_str), Some("a,b"));
}

#[tokio::test(start_paused = true)]
async fn flush_now_skips_debounce() {
    let bus = EventBus::new(4);
    let mut rx = bus.subscribe();
    let state = StatePersistence::new(bus, None, DEBOUNCE);
    state.request_update(StateUpdate::new().transparency(1.0));
    state.flush_now();
    assert!(!state.flush_pending());
    assert_eq!(drain(&mut rx).len(), 1);
}

/// Memory-backed store that counts batches and can refuse removals.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    refuse_removals: AtomicBool,
    batches: AtomicUsize,
}

impl KvStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        if self.refuse_removals.load(Ordering::SeqCst) {
            return Err(SyncError::Storage(format!("cannot remove {key}")));
        }
        self.inner.remove(key)
    }

    fn apply(&self, removals: &[&str], sets: &[(&str, String)]) -> Result<(), SyncError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        for key in removals {
            self.remove(key)?;
        }
        for (key, value) in sets {
            self.set(key, value)?;
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn each_flush_mirrors_in_one_batch() {
    let store = Arc::new(FlakyStore::default());
    let state = StatePersistence::new(EventBus::new(4), Some(store.clone() as Arc<dyn KvStore>), DEBOUNCE);

    state.request_update(StateUpdate::new().position(position(1.0)).map_id("a".into()).transparency(5.0));
    settle().await;
    assert_eq!(store.batches.load(Ordering::SeqCst), 1);
    assert_eq!(store.inner.entries().len(), 7);
}

#[tokio::test(start_paused = true)]
async fn failed_removal_is_retried_on_next_flush() {
    let store = Arc::new(FlakyStore::default());
    let state = StatePersistence::new(EventBus::new(4), Some(store.clone() as Arc<dyn KvStore>), DEBOUNCE);

    state.request_update(StateUpdate::new().background_id("osm".into()));
    settle().await;

    store.refuse_removals.store(true, Ordering::SeqCst);
    state.request_update(StateUpdate::new().delete_background_id());
    settle().await;
    assert_eq!(store.get(KEY_BACKGROUND_ID).unwrap().as_deref(), Some("osm"));

    store.refuse_removals.store(false, Ordering::SeqCst);
    state.request_update(StateUpdate::new().transparency(1.0));
    settle().await;
    assert_eq!(store.get(KEY_BACKGROUND_ID).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn failed_removal_is_dropped_once_the_key_is_set_again() {
    let store = Arc::new(FlakyStore::default());
    let state = StatePersistence::new(EventBus::new(4), Some(store.clone() as Arc<dyn KvStore>), DEBOUNCE);

    state.request_update(StateUpdate::new().background_id("osm".into()));
    settle().await;
    store.refuse_removals.store(true, Ordering::SeqCst);
    state.request_update(StateUpdate::new().delete_background_id());
    settle().await;

    state.request_update(StateUpdate::new().background_id("gsi".into()));
    settle().await;
    assert_eq!(store.get(KEY_BACKGROUND_ID).unwrap().as_deref(), Some("gsi"));
}

#[test]
fn json_file_store_applies_batches() {
    let path = std::env::temp_dir().join(format!("mapsync-batch-{}.json", std::process::id()));
    let store = JsonFileStore::open(&path).unwrap();
    store.set(KEY_BACKGROUND_ID, "osm").unwrap();
    store.apply(&[KEY_BACKGROUND_ID], &[(KEY_MAP_ID, "warp".to_owned()), (KEY_X, "1".to_owned())]).unwrap();

    let reopened = JsonFileStore::open(&path).unwrap();
    assert_eq!(reopened.get(KEY_BACKGROUND_ID).unwrap(), None);
    assert_eq!(reopened.get(KEY_MAP_ID).unwrap().as_deref(), Some("warp"));
    assert_eq!(reopened.get(KEY_X).unwrap().as_deref(), Some("1"));
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn snapshot_serializes_wire_keys() {
    let snapshot = StateSnapshot {
        map_id: Some("a".into()),
        background_id: Some("b".into()),
        hide_marker: Some(false),
        ..StateSnapshot::default()
    };
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json, serde_json::json!({"mapID": "a", "backgroundID": "b", "hideMarker": false}));
}

// =============================================================================
// SESSION RESTORE
// =============================================================================

const NOW: i64 = 1_700_000_000;
const FRESHNESS: Duration = Duration::from_secs(3600);

fn stored(pairs: &[(&str, &str)]) -> MemoryStore {
    let store = MemoryStore::new();
    for (k, v) in pairs {
        store.set(k, v).unwrap();
    }
    store
}

#[test]
fn restore_fresh_session() {
    let epoch = (NOW - 10).to_string();
    let store = stored(&[
        (KEY_EPOCH, &epoch),
        (KEY_MAP_ID, "warp"),
        (KEY_BACKGROUND_ID, "osm"),
        (KEY_X, "10"),
        (KEY_Y, "20"),
        (KEY_ZOOM, "3"),
        (KEY_ROTATION, "45"),
        (KEY_TRANSPARENCY, "25"),
        (KEY_HIDE_MARKER, "1"),
        (KEY_HIDE_LAYER, "shops"),
    ]);
    let restored = restore_session(&store, NOW, FRESHNESS).unwrap();
    assert_eq!(restored.map_id, Some(SourceId::from("warp")));
    assert_eq!(restored.background_id, Some(SourceId::from("osm")));
    let position = restored.position.unwrap();
    assert_eq!((position.x, position.y, position.zoom, position.rotation), (Some(10.0), Some(20.0), Some(3.0), Some(45.0)));
    assert_eq!(restored.transparency, Some(25.0));
    assert!(restored.hide_marker);
    assert_eq!(restored.hide_layer.as_deref(), Some("shops"));
}

#[test]
fn stale_session_is_ignored() {
    let epoch = (NOW - 3600).to_string();
    let store = stored(&[(KEY_EPOCH, &epoch), (KEY_MAP_ID, "warp")]);
    assert_eq!(restore_session(&store, NOW, FRESHNESS), None);
}

#[test]
fn missing_epoch_is_ignored() {
    let store = stored(&[(KEY_MAP_ID, "warp")]);
    assert_eq!(restore_session(&store, NOW, FRESHNESS), None);
}

#[test]
fn legacy_keys_are_read() {
    let epoch = NOW.to_string();
    let store = stored(&[(KEY_EPOCH, &epoch), ("sourceID", "old"), ("backID", "base")]);
    let restored = restore_session(&store, NOW, FRESHNESS).unwrap();
    assert_eq!(restored.map_id, Some(SourceId::from("old")));
    assert_eq!(restored.background_id, Some(SourceId::from("base")));
    assert_eq!(restored.position, None);
    assert_eq!(restored.transparency, Some(0.0));
    assert!(!restored.hide_marker);
}

#[test]
fn json_file_store_persists_across_opens() {
    let path = std::env::temp_dir().join(format!("mapsync-store-{}.json", std::process::id()));
    let _cleanup = std::fs::remove_file(&path);

    let store = JsonFileStore::open(&path).unwrap();
    store.set(KEY_MAP_ID, "warp").unwrap();
    store.set(KEY_X, "1").unwrap();
    store.remove(KEY_X).unwrap();

    let reopened = JsonFileStore::open(&path).unwrap();
    assert_eq!(reopened.get(KEY_MAP_ID).unwrap().as_deref(), Some("warp"));
    assert_eq!(reopened.get(KEY_X).unwrap(), None);
    std::fs::remove_file(&path).unwrap();
}
