use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use sink_core::sink_screen;
use sink_protocol::{ComputeError, PixelBuffer, PixelFormat, PixelSource, Rect, RegionRequest};

struct SolidSource {
    format: PixelFormat,
    value: u8,
    calls: AtomicU32,
}

impl SolidSource {
    fn new(value: u8) -> Self {
        SolidSource {
            format: PixelFormat::MASK,
            value,
            calls: AtomicU32::new(0),
        }
    }
}

impl PixelSource for SolidSource {
    fn format(&self) -> PixelFormat {
        self.format
    }
    fn compute(&self, buf: &mut PixelBuffer, _area: Rect) -> Result<(), ComputeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        buf.fill_rect_u8(0, 0, buf.width(), buf.height(), self.value);
        Ok(())
    }
}

/// Scenario: a cache built with no `notify` callback is pinned to sync mode
/// (spec §4.1) — a fill blocks until painted, so the result is immediately
/// usable and no registry entry is ever created.
#[test]
fn sync_fill_returns_painted_pixels_immediately() {
    let source = Arc::new(SolidSource::new(42));
    let handle = sink_screen(source.clone(), None, 16, 16, 4, 0).unwrap();

    let mut req = RegionRequest::new(Rect::new(0, 0, 16, 16), PixelFormat::MASK);
    handle.region_fill(&mut req).unwrap();

    assert!(req.buffer.data().iter().all(|&b| b == 42));
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
}

/// Scenario: a cache built with a `notify` callback is pinned to async
/// mode — a fill on a cold tile returns before the paint lands, but
/// `notify` eventually fires once the background worker catches up.
#[test]
fn async_fill_eventually_notifies_once_the_background_worker_paints_it() {
    let source = Arc::new(SolidSource::new(7));
    let (tx, rx) = mpsc::channel::<Rect>();
    let handle = sink_screen(
        source.clone(),
        Some(Box::new(move |area| {
            let _ = tx.send(area);
        })),
        16,
        16,
        4,
        0,
    )
    .unwrap();

    let area = Rect::new(0, 0, 16, 16);
    let mut req = RegionRequest::new(area, PixelFormat::MASK);
    handle.region_fill(&mut req).unwrap();

    let notified = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("background worker should paint the tile and notify");
    assert_eq!(notified, area);

    let mut mask = RegionRequest::new(area, PixelFormat::MASK);
    handle.mask_fill(&mut mask);
    assert!(mask.buffer.data().iter().all(|&b| b == 0xFF));
}

/// Scenario: with room for two tiles, filling three distinct areas evicts
/// exactly the least-recently-touched painted tile, not an arbitrary one.
#[test]
fn lru_eviction_keeps_the_two_most_recently_touched_tiles() {
    let source = Arc::new(SolidSource::new(1));
    let handle = sink_screen(source, None, 8, 8, 2, 0).unwrap();

    let a = Rect::new(0, 0, 8, 8);
    let b = Rect::new(8, 0, 8, 8);
    let c = Rect::new(16, 0, 8, 8);

    for area in [a, b] {
        let mut req = RegionRequest::new(area, PixelFormat::MASK);
        handle.region_fill(&mut req).unwrap();
    }
    // Touch `a` again so `b` becomes the LRU tile.
    let mut req_a = RegionRequest::new(a, PixelFormat::MASK);
    handle.region_fill(&mut req_a).unwrap();

    let mut req_c = RegionRequest::new(c, PixelFormat::MASK);
    handle.region_fill(&mut req_c).unwrap();

    assert_eq!(handle.stats().evictions_painted, 1);

    let mut mask_a = RegionRequest::new(a, PixelFormat::MASK);
    handle.mask_fill(&mut mask_a);
    assert!(mask_a.buffer.data().iter().all(|&b| b == 0xFF), "a should still be cached");

    let mut mask_b = RegionRequest::new(b, PixelFormat::MASK);
    handle.mask_fill(&mut mask_b);
    assert!(mask_b.buffer.data().iter().all(|&b| b == 0), "b should have been evicted");
}

/// Scenario: a single-tile cache evicts its only tile on every distinct
/// area, so every fill is a forced repaint.
#[test]
fn single_tile_cache_repaints_on_every_new_area() {
    let source = Arc::new(SolidSource::new(3));
    let handle = sink_screen(source.clone(), None, 8, 8, 1, 0).unwrap();

    let a = Rect::new(0, 0, 8, 8);
    let b = Rect::new(8, 0, 8, 8);

    let mut req_a = RegionRequest::new(a, PixelFormat::MASK);
    handle.region_fill(&mut req_a).unwrap();
    let mut req_b = RegionRequest::new(b, PixelFormat::MASK);
    handle.region_fill(&mut req_b).unwrap();
    let mut req_a2 = RegionRequest::new(a, PixelFormat::MASK);
    handle.region_fill(&mut req_a2).unwrap();

    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert_eq!(handle.stats().evictions_painted, 2);
}

/// Scenario: cloning an output handle keeps the cache alive for a second
/// logical consumer; dropping the last clone tears down that Render's
/// dirty-registry entries without affecting an unrelated Render.
#[test]
fn dropping_the_last_output_handle_clone_does_not_disturb_other_renders() {
    let source_a = Arc::new(SolidSource::new(1));
    let handle_a = sink_screen(source_a, None, 8, 8, 4, 0).unwrap();
    let handle_a2 = handle_a.clone();

    let source_b = Arc::new(SolidSource::new(2));
    let handle_b = sink_screen(source_b, None, 8, 8, 4, 0).unwrap();

    drop(handle_a);
    drop(handle_a2);

    // handle_b is untouched by handle_a's teardown.
    let mut req = RegionRequest::new(Rect::new(0, 0, 8, 8), PixelFormat::MASK);
    handle_b.region_fill(&mut req).unwrap();
    assert!(req.buffer.data().iter().all(|&b| b == 2));
}

/// Configuration errors are surfaced synchronously and no cache is built.
#[test]
fn invalid_tile_size_is_rejected_before_any_render_is_created() {
    let source = Arc::new(SolidSource::new(0));
    let err = sink_screen(source, None, 0, 8, 4, 0).unwrap_err();
    assert!(matches!(err, sink_protocol::ConfigError::InvalidTileSize));
}
