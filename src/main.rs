use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mapsync::config::{AppOptions, AppSetting, RuntimeConfig};
use mapsync::engine::{HeadlessEngine, RenderEngine};
use mapsync::events::EventBus;
use mapsync::geo::{Point, ViewState};
use mapsync::services::gesture::PointerEvent;
use mapsync::services::persistence::{JsonFileStore, KvStore, RestoreOptions};
use mapsync::{App, Engines, SyncError};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

const DEFAULT_SETTING: &str = "demos/setting.json";
const DEFAULT_SESSION: &str = "mapsync-session.json";

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let setting_path = match (std::env::args().nth(1), std::env::var("MAPSYNC_SETTING")) {
        (Some(arg), _) => PathBuf::from(arg),
        (None, Ok(env)) => PathBuf::from(env),
        (None, Err(_)) => PathBuf::from(DEFAULT_SETTING),
    };
    let session_path = std::env::var("MAPSYNC_SESSION_FILE").unwrap_or_else(|_| DEFAULT_SESSION.into());

    let setting = AppSetting::load(&setting_path).await?;
    let runtime = RuntimeConfig::from_env();
    let store: Arc<dyn KvStore> = Arc::new(JsonFileStore::open(&session_path)?);
    let options = AppOptions { restore_session: true, ..AppOptions::default() };

    let bus = EventBus::new(runtime.event_capacity);
    let logger = tokio::spawn(log_events(bus.subscribe()));

    let fg = Arc::new(HeadlessEngine::new());
    let engines = Engines { fg: fg.clone(), bg: Some(Arc::new(HeadlessEngine::new())) };
    let app = App::start(&setting, options, runtime, engines, Some(store), bus).await?;
    tracing::info!(setting = %setting_path.display(), session = %session_path, "viewer ready");

    run_script(&app, &fg).await?;

    app.flush_state();
    drop(app);
    tokio::time::sleep(Duration::from_millis(10)).await;
    logger.abort();
    Ok(())
}

/// A short pan-and-click session against the headless engine.
async fn run_script(app: &App, fg: &HeadlessEngine) -> Result<(), SyncError> {
    app.on_post_render().await?;

    let start = fg.view();
    app.on_pointer_move(start.center).await?;

    app.on_pointer_down(PointerEvent::id(1));
    for step in 1..=3 {
        let offset = f64::from(step) * 150.0;
        fg.gesture_to(ViewState::new(Point::new(start.center.x + offset, start.center.y - offset), start.zoom, 0.1));
        app.on_pointer_drag(PointerEvent::id(1));
        app.on_post_render().await?;
    }
    app.on_pointer_up(PointerEvent::id(1));
    app.on_move_end();

    app.on_click(fg.view().center, None).await?;
    app.set_transparency(30.0);

    let current = app.current_map_info().map_id;
    for meta in app.context().registry.metas() {
        if meta.map_id == current {
            continue;
        }
        app.change_map(&meta.map_id, RestoreOptions::default()).await?;
        app.on_post_render().await?;
    }
    app.change_map(&current, RestoreOptions::default()).await?;
    app.on_post_render().await?;
    Ok(())
}

async fn log_events(mut rx: tokio::sync::broadcast::Receiver<mapsync::events::AppEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(event = event.name(), %json, "event"),
                Err(e) => tracing::warn!(event = event.name(), error = %e, "event not serializable"),
            },
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
