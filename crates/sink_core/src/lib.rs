//! Asynchronous screen-sink tile cache.
//!
//! A `Render` caches an upstream pixel producer's output in a grid of
//! fixed-size tiles, filling demanded regions either synchronously on the
//! calling thread or asynchronously on a shared background worker pool,
//! with LRU eviction once a configured tile budget is reached.

mod registry;
mod render;
mod tile;
mod worker;

pub use render::OutputHandle;
pub use tile::Stats;

use std::sync::Arc;

use sink_protocol::{ConfigError, PaintNotify, PixelSource};

/// Create a new cache over `source`, tiled at `tile_w x tile_h`, holding at
/// most `max_tiles` tiles (spec §6 `sink_screen`). `notify`, when present,
/// puts this cache in async mode: missing tiles are queued for the
/// background worker pool and `notify` fires from whichever pool thread
/// completes the paint. With `notify` absent, the cache is pinned to sync
/// mode for its lifetime: every fill computes missing tiles on the calling
/// thread and surfaces `compute` failures directly (spec §4.1).
///
/// Returns an error only for bad configuration or a failure to start the
/// process-wide background worker pool; everything else degrades
/// gracefully rather than failing (spec §7).
pub fn sink_screen(
    source: Arc<dyn PixelSource>,
    notify: Option<Box<dyn PaintNotify>>,
    tile_w: u32,
    tile_h: u32,
    max_tiles: i64,
    priority: i32,
) -> Result<OutputHandle, ConfigError> {
    let max_tiles = render::MaxTiles::from_raw(max_tiles)?;
    let render = render::Render::new(source, notify, tile_w, tile_h, max_tiles, priority)?;
    Ok(OutputHandle::new(render))
}
