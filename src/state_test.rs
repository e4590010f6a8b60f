#![allow(clippy::float_cmp)]

use super::test_helpers::{basemap, fixture, warped};
use super::*;
use crate::source::SourceId;

#[test]
fn active_source_generation_bumps_on_every_set() {
    let (osm, _) = basemap("osm");
    let (a, _) = warped("a");
    let (osm, a) = (Arc::new(osm), Arc::new(a));
    let active = ActiveSource::new(Arc::clone(&osm));

    let (current, first) = active.snapshot();
    assert_eq!(current.id, SourceId::from("osm"));
    assert!(active.is_current(first));

    let second = active.set(Arc::clone(&a));
    assert_ne!(first, second);
    assert!(!active.is_current(first));
    assert_eq!(active.get().id, SourceId::from("a"));

    // Reassigning the same source still invalidates in-flight work.
    let third = active.set(a);
    assert!(!active.is_current(second));
    assert!(active.is_current(third));
}

#[test]
fn no_rotate_forces_zero_rotation() {
    let free = ViewFlags::default();
    let locked = ViewFlags { no_rotate: true, ..ViewFlags::default() };
    assert_eq!(free.rotation(1.25), 1.25);
    assert_eq!(locked.rotation(1.25), 0.0);
}

#[test]
fn flags_merge_setting_and_options() {
    let setting = AppSetting::from_json(r#"{"noRotate": false, "zoomRestriction": true, "sources": [{"mapID": "osm", "kind": "basemap"}]}"#)
        .unwrap();
    let options = AppOptions { no_rotate: true, gl_adapter: true, ..AppOptions::default() };
    let flags = ViewFlags::from_config(&setting, &options);
    assert_eq!(flags, ViewFlags { zoom_restriction: true, no_rotate: true, gl_adapter: true });
}

#[tokio::test]
async fn transparency_reaches_engine_and_persisted_state() {
    let (osm, _) = basemap("osm");
    let fx = fixture(vec![osm], false);
    fx.ctx.viewport.set_transparency(40.0, &fx.ctx.persistence);

    assert_eq!(fx.ctx.viewport.transparency(), 40.0);
    assert_eq!(fx.fg.transparency(), 40.0);
    assert_eq!(fx.ctx.persistence.snapshot().transparency, Some(40.0));
}

#[tokio::test]
async fn poi_number_is_dispatched_on_request() {
    let (osm, _) = basemap("osm");
    let fx = fixture(vec![osm], false);
    let mut rx = fx.ctx.bus.subscribe();
    fx.ctx.dispatch_poi_number();
    assert_eq!(rx.try_recv().unwrap(), crate::events::AppEvent::PoiNumber(0));
}
