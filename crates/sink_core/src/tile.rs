use std::collections::VecDeque;

use sink_protocol::{PixelBuffer, PixelFormat, Rect};

/// One rectangular cache cell. Lives in `RenderState::all` for its entire
/// lifetime; only its `area`/`buffer`/`painted` are ever reassigned (the
/// cache relocates tiles under eviction pressure rather than reallocating).
pub(crate) struct Tile {
    pub area: Rect,
    pub painted: bool,
    /// Set by an upstream producer via `Render::invalidate_region` after a
    /// successful paint. Read-side treats an invalid tile as unpainted but
    /// it is not re-queued until a consumer re-requests the area.
    pub invalid: bool,
    pub buffer: PixelBuffer,
    /// LRU key: a snapshot of the owning Render's tick counter, taken each
    /// time the tile is touched.
    pub ticks: u64,
}

impl Tile {
    pub fn new(format: PixelFormat) -> Self {
        Tile {
            area: Rect::new(0, 0, 0, 0),
            painted: false,
            invalid: false,
            buffer: PixelBuffer::new(format, 0, 0),
            ticks: 0,
        }
    }
}

/// Per-Render mutable state, entirely owned behind `Render::lock`.
pub(crate) struct RenderState {
    pub all: Vec<Tile>,
    /// Grid position (`left / tile_w`, `top / tile_h`) to index into `all`.
    pub tiles: std::collections::HashMap<(u32, u32), usize>,
    /// Most-recently-queued tile first; the background worker allocates
    /// from the front, eviction takes from the back.
    pub dirty: VecDeque<usize>,
    pub ticks: u64,
    pub stats: Stats,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub tiles_created: u64,
    pub evictions_painted: u64,
    pub evictions_dirty: u64,
    pub paints_completed: u64,
}

impl RenderState {
    pub fn new() -> Self {
        RenderState {
            all: Vec::new(),
            tiles: std::collections::HashMap::new(),
            dirty: VecDeque::new(),
            ticks: 0,
            stats: Stats::default(),
        }
    }
}

/// spec §4.1 `tile_touch`: bump the LRU tick, and if the tile is unpainted
/// and already queued, bump it to the front of `dirty`. A tile that became
/// dirty but isn't queued yet is deliberately left alone here (see
/// `Render::queue_tile`, which does its own front-insertion) — bumping twice
/// would double-queue it.
pub(crate) fn tile_touch(state: &mut RenderState, idx: usize) {
    let tick = state.ticks;
    state.ticks += 1;
    state.all[idx].ticks = tick;

    if !state.all[idx].painted {
        if let Some(pos) = state.dirty.iter().position(|&i| i == idx) {
            state.dirty.remove(pos);
            state.dirty.push_front(idx);
        }
    }
}

/// LRU scan for eviction: the painted tile with the smallest tick. O(n) over
/// `ntiles`; acceptable at the small `max_tiles` this cache is meant for
/// (spec §4.2 rationale).
pub(crate) fn find_lru_painted(state: &RenderState) -> Option<usize> {
    state
        .all
        .iter()
        .enumerate()
        .filter(|(_, t)| t.painted)
        .min_by_key(|(_, t)| t.ticks)
        .map(|(idx, _)| idx)
}
