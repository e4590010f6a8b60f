#![allow(clippy::float_cmp)]

use super::*;

#[test]
fn headless_starts_empty() {
    let engine = HeadlessEngine::new();
    assert!(engine.source().is_none());
    assert!(engine.layer().is_none());
    assert!(engine.ops().is_empty());
    assert_eq!(engine.view(), ViewState::default());
}

#[test]
fn setters_update_view_and_log() {
    let engine = HeadlessEngine::new();
    engine.set_center(Point::new(1.0, 2.0));
    engine.set_zoom(4.0);
    engine.set_rotation(0.5);

    let view = engine.view();
    assert_eq!(view.center, Point::new(1.0, 2.0));
    assert_eq!(view.zoom, 4.0);
    assert_eq!(view.rotation, 0.5);
    assert_eq!(
        engine.ops(),
        vec![EngineOp::SetCenter(Point::new(1.0, 2.0)), EngineOp::SetZoom(4.0), EngineOp::SetRotation(0.5)]
    );
}

#[test]
fn zoom_is_clamped_to_bounds() {
    let engine = HeadlessEngine::new();
    engine.set_zoom_bounds(2.0, 6.0);
    engine.set_zoom(9.0);
    assert_eq!(engine.view().zoom, 6.0);
    engine.set_zoom(1.0);
    assert_eq!(engine.view().zoom, 2.0);
}

#[test]
fn exchange_source_and_layer_are_tracked() {
    let engine = HeadlessEngine::new();
    engine.exchange_source(Some(SourceId::from("osm")));
    engine.set_layer(Some(SourceId::from("tiles")));
    assert_eq!(engine.source(), Some(SourceId::from("osm")));
    assert_eq!(engine.layer(), Some(SourceId::from("tiles")));

    engine.exchange_source(None);
    assert!(engine.source().is_none());
}

#[test]
fn reset_markers_clears_drawn_markers() {
    let engine = HeadlessEngine::new();
    engine.set_marker(DrawnMarker { xy: Point::new(0.0, 0.0), poi_id: "a".into(), icon: None, selected: false });
    assert_eq!(engine.markers().len(), 1);
    engine.reset_markers();
    assert!(engine.markers().is_empty());
}

#[test]
fn gesture_to_moves_without_recording() {
    let engine = HeadlessEngine::new();
    engine.gesture_to(ViewState::new(Point::new(5.0, 5.0), 3.0, 0.0));
    assert_eq!(engine.view().center, Point::new(5.0, 5.0));
    assert!(engine.ops().is_empty());
}

#[test]
fn count_ops_filters_by_predicate() {
    let engine = HeadlessEngine::new();
    engine.render_sync();
    engine.render_sync();
    engine.update_size();
    assert_eq!(engine.count_ops(|op| matches!(op, EngineOp::RenderSync)), 2);
}
