#![allow(clippy::float_cmp)]

use tokio::sync::broadcast;

use super::*;
use crate::engine::RenderEngine;
use crate::geo::Point;
use crate::source::SourceId;
use crate::state::test_helpers::{Fixture, basemap, fixture, warped};

fn viewpoints(rx: &mut broadcast::Receiver<AppEvent>) -> Vec<ViewpointChange> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let AppEvent::ChangeViewpoint(change) = event {
            out.push(change);
        }
    }
    out
}

/// `osm` + warped `a` (scale 2), with `a` active.
fn warped_active(overlay: bool) -> (Fixture, std::sync::Arc<crate::state::test_helpers::MockSource>) {
    let (osm, _) = basemap("osm");
    let (a, a_mock) = warped("a");
    let fx = fixture(vec![osm, a], overlay);
    let a = fx.ctx.registry.get(&SourceId::from("a")).unwrap();
    fx.ctx.active.set(a);
    (fx, a_mock)
}

#[tokio::test]
async fn broadcasts_canonical_and_raw_coordinates() {
    let (fx, _) = warped_active(false);
    let mut rx = fx.ctx.bus.subscribe();
    let sync = ViewSyncLoop::new(&fx.ctx);
    fx.fg.gesture_to(ViewState::new(Point::new(10.0, 20.0), 6.0, std::f64::consts::FRAC_PI_2));

    let outcome = sync.on_post_render().await.unwrap();
    assert!(outcome.viewpoint_emitted);
    assert!(!outcome.background_synced);

    let changes = viewpoints(&mut rx);
    assert_eq!(changes.len(), 1);
    let change = changes[0];
    assert_eq!((change.x, change.y), (10.0, 20.0));
    assert_eq!((change.mercator_x, change.mercator_y), (20.0, 40.0));
    assert_eq!(change.zoom, 6.0);
    assert_eq!(change.merc_zoom, 5.0);
    assert!((change.rotation - 90.0).abs() < 1e-9);
    assert!((change.direction - 90.0).abs() < 1e-6);

    let position = fx.ctx.persistence.snapshot().position.unwrap();
    assert_eq!((position.x, position.y, position.zoom), (10.0, 20.0, 6.0));
}

#[tokio::test]
async fn unchanged_view_is_not_rebroadcast() {
    let (fx, a_mock) = warped_active(false);
    let mut rx = fx.ctx.bus.subscribe();
    let sync = ViewSyncLoop::new(&fx.ctx);
    fx.fg.gesture_to(ViewState::new(Point::new(10.0, 20.0), 6.0, 0.0));

    assert!(sync.on_post_render().await.unwrap().viewpoint_emitted);
    assert!(!sync.on_post_render().await.unwrap().viewpoint_emitted);
    fx.fg.gesture_to(ViewState::new(Point::new(10.0 + 1e-13, 20.0), 6.0, 0.0));
    assert!(!sync.on_post_render().await.unwrap().viewpoint_emitted);

    assert_eq!(viewpoints(&mut rx).len(), 1);
    assert_eq!(a_mock.forward(), 1);

    fx.fg.gesture_to(ViewState::new(Point::new(11.0, 20.0), 6.0, 0.0));
    assert!(sync.on_post_render().await.unwrap().viewpoint_emitted);
    assert_eq!(a_mock.forward(), 2);
}

#[tokio::test]
async fn background_follows_and_shares_the_forward_conversion() {
    let (fx, a_mock) = warped_active(true);
    let bg = fx.bg.clone().unwrap();
    bg.exchange_source(Some(SourceId::from("osm")));
    let sync = ViewSyncLoop::new(&fx.ctx);
    fx.fg.gesture_to(ViewState::new(Point::new(-3.0, 4.0), 7.0, 0.0));

    let outcome = sync.on_post_render().await.unwrap();
    assert!(outcome.background_synced);
    assert!(outcome.viewpoint_emitted);
    assert_eq!(bg.view(), ViewState::new(Point::new(-6.0, 8.0), 6.0, 0.0));
    assert_eq!(a_mock.forward(), 1);
}

#[tokio::test]
async fn background_sync_skips_while_one_is_in_flight() {
    let (fx, _) = warped_active(true);
    let bg = fx.bg.clone().unwrap();
    bg.exchange_source(Some(SourceId::from("osm")));
    let sync = ViewSyncLoop::new(&fx.ctx);

    sync.back_moving.store(true, Ordering::SeqCst);
    let outcome = sync.on_post_render().await.unwrap();
    assert!(!outcome.background_synced);
    assert!(bg.ops().iter().all(|op| !matches!(op, crate::engine::EngineOp::SetCenter(_))));
}

#[tokio::test]
async fn in_flight_flag_clears_after_failure() {
    let (fx, a_mock) = warped_active(true);
    fx.bg.clone().unwrap().exchange_source(Some(SourceId::from("osm")));
    let sync = ViewSyncLoop::new(&fx.ctx);

    a_mock.fail(true);
    assert!(sync.on_post_render().await.is_err());
    assert!(!sync.back_moving.load(Ordering::SeqCst));
    a_mock.fail(false);
    assert!(sync.on_post_render().await.unwrap().background_synced);
}

#[tokio::test]
async fn result_for_replaced_active_source_is_dropped() {
    let (fx, a_mock) = warped_active(false);
    let mut rx = fx.ctx.bus.subscribe();
    let sync = std::sync::Arc::new(ViewSyncLoop::new(&fx.ctx));

    a_mock.hold();
    let task = {
        let sync = std::sync::Arc::clone(&sync);
        tokio::spawn(async move { sync.on_post_render().await })
    };
    tokio::task::yield_now().await;

    let osm = fx.ctx.registry.get(&SourceId::from("osm")).unwrap();
    fx.ctx.active.set(osm);
    a_mock.release();

    let outcome = task.await.unwrap().unwrap();
    assert!(!outcome.viewpoint_emitted);
    assert!(viewpoints(&mut rx).is_empty());
}

#[tokio::test]
async fn move_end_clamps_center_into_area() {
    let (fx, _) = warped_active(false);
    let sync = ViewSyncLoop::new(&fx.ctx);

    fx.fg.gesture_to(ViewState::new(Point::new(5000.0, -20.0), 3.0, 0.0));
    assert!(sync.on_move_end());
    assert_eq!(fx.fg.view().center, Point::new(1000.0, -20.0));
    assert!(!sync.on_move_end());
}
