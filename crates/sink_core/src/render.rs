//! One screen-sink cache instance (spec §3 "Render", §4.2-§4.4, §4.7).

use std::sync::{Arc, Mutex, Weak};

use sink_protocol::{ComputeError, ConfigError, PaintNotify, PixelBuffer, PixelFormat, PixelSource, Rect, RegionRequest};

use crate::registry;
use crate::tile::{find_lru_painted, tile_touch, RenderState, Stats, Tile};
use crate::worker;

/// How many tiles a `Render` may hold at once. `-1` in spec.md's C-shaped
/// parameter becomes its own variant rather than a sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxTiles {
    Limited(usize),
    Unlimited,
}

impl MaxTiles {
    pub fn from_raw(n: i64) -> Result<Self, ConfigError> {
        if n == -1 {
            Ok(MaxTiles::Unlimited)
        } else if n > 0 {
            Ok(MaxTiles::Limited(n as usize))
        } else {
            Err(ConfigError::InvalidMaxTiles)
        }
    }

    fn allows(self, current: usize) -> bool {
        match self {
            MaxTiles::Unlimited => true,
            MaxTiles::Limited(max) => current < max,
        }
    }
}

/// One cache instance: a grid of tiles over one upstream producer, a
/// dirty-tile queue, and the LRU/eviction bookkeeping needed to keep the
/// tile count within `max_tiles` (spec §3, §4.2).
pub struct Render {
    source: Arc<dyn PixelSource>,
    /// `None` pins this Render in sync mode for its whole lifetime (spec
    /// §4.1: "async mode is active (`notify` set and threads available)").
    notify: Option<Box<dyn PaintNotify>>,
    tile_w: u32,
    tile_h: u32,
    max_tiles: MaxTiles,
    priority: i32,
    format: PixelFormat,
    state: Mutex<RenderState>,
    ref_count: Mutex<usize>,
    self_weak: Weak<Render>,
}

impl Render {
    pub(crate) fn new(
        source: Arc<dyn PixelSource>,
        notify: Option<Box<dyn PaintNotify>>,
        tile_w: u32,
        tile_h: u32,
        max_tiles: MaxTiles,
        priority: i32,
    ) -> Result<Arc<Self>, ConfigError> {
        if tile_w == 0 || tile_h == 0 {
            return Err(ConfigError::InvalidTileSize);
        }
        // Only a Render with a notify callback ever has async work to hand
        // to the background pool, so a pure-sync cache never pays for the
        // worker threads (spec §4.1's "threads available" half of the async
        // condition).
        if notify.is_some() {
            worker::ensure_worker()?;
        }
        let format = source.format();
        Ok(Arc::new_cyclic(|weak| Render {
            source,
            notify,
            tile_w,
            tile_h,
            max_tiles,
            priority,
            format,
            state: Mutex::new(RenderState::new()),
            ref_count: Mutex::new(1),
            self_weak: weak.clone(),
        }))
    }

    /// Demand pixel data covering `req.valid` (spec §4.3 `region_fill`).
    /// Sync vs. async is a fixed property of this Render, not a per-call
    /// choice (spec §4.1): with no `notify` callback, a missing tile is
    /// computed on the calling thread and its error surfaced; with one set,
    /// the fill returns whatever is already painted and schedules the rest
    /// on the background worker, notifying later.
    pub fn region_fill(&self, req: &mut RegionRequest) -> Result<(), ComputeError> {
        if req.valid.is_empty() {
            return Ok(());
        }
        let (l, t, r, b) = req.valid.tile_span(self.tile_w, self.tile_h);
        let mut pending: Vec<usize> = Vec::new();
        {
            let mut state = self.state.lock().expect("render state lock poisoned");
            for ty in t..=b {
                for tx in l..=r {
                    let area = Rect::new(tx * self.tile_w, ty * self.tile_h, self.tile_w, self.tile_h);
                    if let Some((idx, needs_paint)) = self.tile_request(&mut state, (tx, ty), area) {
                        if needs_paint {
                            pending.push(idx);
                        }
                    }
                }
            }
        }

        let mut first_err = None;
        for idx in pending {
            if self.notify.is_some() {
                self.schedule_async(idx);
            } else if let Err(e) = self.compute_tile(idx) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        {
            let state = self.state.lock().expect("render state lock poisoned");
            for ty in t..=b {
                for tx in l..=r {
                    let area = Rect::new(tx * self.tile_w, ty * self.tile_h, self.tile_w, self.tile_h);
                    match state.tiles.get(&(tx, ty)) {
                        Some(&idx) if state.all[idx].painted && !state.all[idx].invalid => {
                            blit_tile_into(req, &state.all[idx]);
                        }
                        // Unpainted, invalidated, or missing: zero-fill rather
                        // than serve a stale or undefined buffer (spec §4.3).
                        _ => zero_region_into(req, area),
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Report current coverage over `req.valid` without triggering any
    /// paint work (spec §4.4 `mask_fill`). `req.buffer` must already be in
    /// `PixelFormat::MASK`.
    pub fn mask_fill(&self, req: &mut RegionRequest) {
        if req.valid.is_empty() {
            return;
        }
        let (l, t, r, b) = req.valid.tile_span(self.tile_w, self.tile_h);
        let state = self.state.lock().expect("render state lock poisoned");
        for ty in t..=b {
            for tx in l..=r {
                let area = Rect::new(tx * self.tile_w, ty * self.tile_h, self.tile_w, self.tile_h);
                let painted = state
                    .tiles
                    .get(&(tx, ty))
                    .map(|&idx| state.all[idx].painted && !state.all[idx].invalid)
                    .unwrap_or(false);
                let value = if painted { 0xFF } else { 0x00 };
                let dst_x = area.left.saturating_sub(req.valid.left);
                let dst_y = area.top.saturating_sub(req.valid.top);
                let w = self.tile_w.saturating_sub(req.valid.left.saturating_sub(area.left));
                let h = self.tile_h.saturating_sub(req.valid.top.saturating_sub(area.top));
                req.buffer.fill_rect_u8(dst_x, dst_y, w, h, value);
            }
        }
    }

    /// Mark any tile overlapping `area` as stale without re-queuing it
    /// (spec §3: invalid is "not automatically re-queued unless a
    /// consumer re-requests the area").
    pub fn invalidate_region(&self, area: Rect) {
        let mut state = self.state.lock().expect("render state lock poisoned");
        for tile in state.all.iter_mut() {
            if !tile.area.intersect(area).is_empty() {
                tile.invalid = true;
            }
        }
    }

    pub fn stats(&self) -> Stats {
        self.state.lock().expect("render state lock poisoned").stats
    }

    /// Lookup/allocate a tile for grid position `key` covering `area`
    /// (spec §4.2). Decision order: hit on an already-painted, valid
    /// tile; hit on an existing but stale/unpainted tile; grow if under
    /// `max_tiles`; evict the LRU painted tile; evict the oldest dirty
    /// tile; otherwise fail. Returns `(tile_idx, needs_paint)`, or `None`
    /// if the cache has no room and nothing evictable (degrades to
    /// leaving that tile position unfilled, per §7's availability-over-
    /// fidelity policy).
    fn tile_request(
        &self,
        state: &mut RenderState,
        key: (u32, u32),
        area: Rect,
    ) -> Option<(usize, bool)> {
        if let Some(&idx) = state.tiles.get(&key) {
            let needs_paint = !state.all[idx].painted || state.all[idx].invalid;
            if needs_paint {
                // spec §4.2 step 1 routes this through tile_queue, which
                // clears painted before the tile is ever handed to
                // schedule_async/compute_tile. Without this, a hit on a
                // painted-but-invalidated tile would get pushed onto
                // `dirty` while still reporting painted == true.
                let tile = &mut state.all[idx];
                tile.painted = false;
                tile.invalid = false;
                tile.buffer.rebind(self.tile_w, self.tile_h);
            }
            tile_touch(state, idx);
            return Some((idx, needs_paint));
        }

        if self.max_tiles.allows(state.all.len()) {
            let mut tile = Tile::new(self.format);
            tile.area = area;
            tile.buffer.rebind(self.tile_w, self.tile_h);
            state.all.push(tile);
            let idx = state.all.len() - 1;
            state.tiles.insert(key, idx);
            tile_touch(state, idx);
            state.stats.tiles_created += 1;
            return Some((idx, true));
        }

        if let Some(idx) = find_lru_painted(state) {
            self.relocate(state, idx, key, area);
            state.stats.evictions_painted += 1;
            return Some((idx, true));
        }

        if let Some(idx) = state.dirty.pop_back() {
            self.relocate(state, idx, key, area);
            state.stats.evictions_dirty += 1;
            return Some((idx, true));
        }

        None
    }

    fn relocate(&self, state: &mut RenderState, idx: usize, key: (u32, u32), area: Rect) {
        let old_key = (
            state.all[idx].area.left / self.tile_w,
            state.all[idx].area.top / self.tile_h,
        );
        state.tiles.remove(&old_key);
        state.tiles.insert(key, idx);
        let tile = &mut state.all[idx];
        tile.area = area;
        tile.painted = false;
        tile.invalid = false;
        tile.buffer.rebind(self.tile_w, self.tile_h);
        tile.buffer.zero_fill();
        tile_touch(state, idx);
    }

    /// Compute one tile's pixels and write the result back, unless the
    /// tile has since been relocated to a different area. The buffer is
    /// swapped out under the lock and computed on outside of it so the
    /// upstream `compute` call never runs while holding `state`'s lock,
    /// and never touches memory another thread could concurrently
    /// rebind.
    pub(crate) fn compute_tile(&self, idx: usize) -> Result<(), ComputeError> {
        let (area, mut buf) = {
            let mut state = self.state.lock().expect("render state lock poisoned");
            // spec §4.6 `work`: "if the popped tile is not painted, call
            // compute". A stale registry entry left over from the
            // evict-dirty-while-queued race (§4.2 edge case) can reference a
            // tile that another pool thread already painted; without this
            // guard that would trigger a redundant compute and a second
            // `notify` for the same area.
            if state.all[idx].painted {
                return Ok(());
            }
            let area = state.all[idx].area;
            let buf = std::mem::replace(&mut state.all[idx].buffer, PixelBuffer::new(self.format, 0, 0));
            (area, buf)
        };

        let result = self.source.compute(&mut buf, area);

        let mut state = self.state.lock().expect("render state lock poisoned");
        // Whether this lands or is discarded as stale, the tile is no
        // longer pending: clear it from the dirty queue so eviction never
        // mistakes a tile that's already been dispatched for one that's
        // still waiting its turn.
        if let Some(pos) = state.dirty.iter().position(|&i| i == idx) {
            state.dirty.remove(pos);
        }
        if state.all[idx].area != area {
            eprintln!("[sink_core] discarding stale compute result: tile relocated during compute");
            return result;
        }

        match result {
            Ok(()) => {
                state.all[idx].buffer = buf;
                state.all[idx].painted = true;
                state.all[idx].invalid = false;
                state.stats.paints_completed += 1;
                tile_touch(&mut state, idx);
                drop(state);
                if let Some(notify) = &self.notify {
                    notify.notify(area);
                }
                Ok(())
            }
            Err(e) => {
                state.all[idx].buffer = buf;
                eprintln!("[sink_core] compute failed for area {area:?}: {e}");
                Err(e)
            }
        }
    }

    /// Queues `idx` for background work. A tile already sitting in `dirty`
    /// (whether still waiting or already picked up by a pool thread that
    /// hasn't finished `compute_tile` yet) is already represented by an
    /// earlier registry entry, so a repeat request for the same unpainted
    /// area must not publish a second one — that would let two pool
    /// threads race on the same tile and double-fire `notify`.
    fn schedule_async(&self, idx: usize) {
        let newly_queued = {
            let mut state = self.state.lock().expect("render state lock poisoned");
            if state.dirty.contains(&idx) {
                false
            } else {
                state.dirty.push_front(idx);
                true
            }
        };
        if newly_queued {
            registry::put(self.self_weak.clone(), idx, self.priority);
        }
    }

    pub(crate) fn ref_inc(&self) {
        *self.ref_count.lock().expect("render ref-count lock poisoned") += 1;
    }

    pub(crate) fn ref_dec(&self) {
        let mut rc = self.ref_count.lock().expect("render ref-count lock poisoned");
        *rc -= 1;
        if *rc == 0 {
            drop(rc);
            registry::remove(self as *const Render);
        }
    }
}

impl Drop for Render {
    fn drop(&mut self) {
        registry::remove(self as *const Render);
    }
}

fn blit_tile_into(req: &mut RegionRequest, tile: &Tile) {
    let area = tile.area;
    let dst_x = area.left.saturating_sub(req.valid.left);
    let dst_y = area.top.saturating_sub(req.valid.top);
    let src_x = req.valid.left.saturating_sub(area.left);
    let src_y = req.valid.top.saturating_sub(area.top);
    let src_rect = Rect::new(src_x, src_y, area.width.saturating_sub(src_x), area.height.saturating_sub(src_y));
    req.buffer.blit_from(dst_x, dst_y, &tile.buffer, src_rect);
}

/// Zero-fills the part of `req.buffer` covered by `area`, for grid cells
/// that are missing, unpainted, or invalidated (spec §4.3: "otherwise paint
/// that intersection with zero").
fn zero_region_into(req: &mut RegionRequest, area: Rect) {
    let dst_x = area.left.saturating_sub(req.valid.left);
    let dst_y = area.top.saturating_sub(req.valid.top);
    let src_x = req.valid.left.saturating_sub(area.left);
    let src_y = req.valid.top.saturating_sub(area.top);
    let w = area.width.saturating_sub(src_x);
    let h = area.height.saturating_sub(src_y);
    req.buffer.zero_rect(dst_x, dst_y, w, h);
}

/// A single logical consumer of a `Render`. `Clone` increments the shared
/// reference count (spec §4.7 `ref`); `Drop` decrements it and, on the
/// last handle, tears down the cache's dirty-registry entries (`unref`).
pub struct OutputHandle {
    render: Arc<Render>,
}

impl OutputHandle {
    pub(crate) fn new(render: Arc<Render>) -> Self {
        OutputHandle { render }
    }

    pub fn region_fill(&self, req: &mut RegionRequest) -> Result<(), ComputeError> {
        self.render.region_fill(req)
    }

    pub fn mask_fill(&self, req: &mut RegionRequest) {
        self.render.mask_fill(req)
    }

    pub fn invalidate_region(&self, area: Rect) {
        self.render.invalidate_region(area)
    }

    pub fn stats(&self) -> Stats {
        self.render.stats()
    }
}

impl Clone for OutputHandle {
    fn clone(&self) -> Self {
        self.render.ref_inc();
        OutputHandle {
            render: self.render.clone(),
        }
    }
}

impl Drop for OutputHandle {
    fn drop(&mut self) {
        self.render.ref_dec();
    }
}
