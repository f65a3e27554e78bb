//! Process-wide dirty-tile registry (spec §4.5, §5).
//!
//! One registry is shared by every `Render` in the process. It holds a
//! priority-ordered list of pending work items and a counting semaphore the
//! background dispatcher blocks on, plus an advisory "reschedule requested"
//! flag a producer can set to ask the dispatcher to re-sort before taking
//! its next item.
//!
//! Lock ordering: `registry_lock` is never acquired while a `Render::lock`
//! is held. Call sites release `render.lock` before calling into this
//! module.

use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, OnceLock, Weak};

use crate::render::Render;

/// One pending dirty-tile job: which Render, which tile index, at what
/// priority. Ordered by priority (higher first), then insertion order
/// (earlier first) so that same-priority work is FIFO.
struct Entry {
    priority: i32,
    seq: u64,
    render: Weak<Render>,
    tile_idx: usize,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; higher priority first, and among equal
        // priorities the earlier sequence number (older) should pop first,
        // so we invert the seq comparison.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A simple counting semaphore: the dispatcher blocks on `take` until a
/// `give` makes a permit available. No semaphore primitive is used
/// anywhere in the teacher's dependency stack, so this is built directly
/// on `Mutex`+`Condvar`, matching the teacher's own hand-rolled
/// coordination style.
struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Semaphore {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn give(&self) {
        let mut count = self.count.lock().expect("registry semaphore lock poisoned");
        *count += 1;
        self.cond.notify_one();
    }

    fn take(&self) {
        let mut count = self.count.lock().expect("registry semaphore lock poisoned");
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Non-blocking permit acquisition. Used by `remove` to keep
    /// `count == entries.len()` even when the caller isn't the dispatcher.
    fn try_take(&self) -> bool {
        let mut count = self.count.lock().expect("registry semaphore lock poisoned");
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    fn drain(&self) {
        let mut count = self.count.lock().expect("registry semaphore lock poisoned");
        *count = 0;
    }
}

struct Inner {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    reschedule: bool,
}

pub(crate) struct Registry {
    inner: Mutex<Inner>,
    sem: Semaphore,
}

impl Registry {
    fn new() -> Self {
        Registry {
            inner: Mutex::new(Inner {
                entries: BinaryHeap::new(),
                next_seq: 0,
                reschedule: false,
            }),
            sem: Semaphore::new(),
        }
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Enqueue one dirty tile for background work (spec §4.5 `registry_put`).
/// Also raises the advisory reschedule flag: the heap already reorders
/// correctly on its own, so nothing strictly depends on the flag, but a
/// producer enqueuing fresh work is exactly the moment a host's dispatcher
/// integration might want to know "priorities may have shifted."
pub(crate) fn put(render: Weak<Render>, tile_idx: usize, priority: i32) {
    let reg = registry();
    let mut inner = reg.inner.lock().expect("dirty registry lock poisoned");
    let seq = inner.next_seq;
    inner.next_seq += 1;
    inner.entries.push(Entry {
        priority,
        seq,
        render,
        tile_idx,
    });
    inner.reschedule = true;
    drop(inner);
    reg.sem.give();
}

/// Block until a job is available, then pop the highest-priority one
/// (spec §4.5 `registry_get`). Returns `None` only if the owning `Render`
/// has since been dropped, in which case the caller should loop and call
/// `get` again.
pub(crate) fn get() -> Option<(Weak<Render>, usize)> {
    let reg = registry();
    reg.sem.take();
    let mut inner = reg.inner.lock().expect("dirty registry lock poisoned");
    let entry = inner.entries.pop()?;
    Some((entry.render, entry.tile_idx))
}

/// Remove every pending entry for a Render that is being destroyed
/// (spec §4.7 teardown). Keeps the semaphore count in lockstep with the
/// number of live entries. Takes a raw identity rather than an `Arc` so it
/// can be called from `Render`'s `Drop` impl, which only has `&self`.
pub(crate) fn remove(target: *const Render) {
    let reg = registry();
    let mut inner = reg.inner.lock().expect("dirty registry lock poisoned");
    let kept: BinaryHeap<Entry> = inner
        .entries
        .drain()
        .filter(|e| {
            let matches = e
                .render
                .upgrade()
                .is_some_and(|r| std::sync::Arc::as_ptr(&r) == target);
            if matches {
                reg.sem.try_take();
            }
            !matches
        })
        .collect();
    inner.entries = kept;
}

pub(crate) fn set_reschedule() {
    let reg = registry();
    let mut inner = reg.inner.lock().expect("dirty registry lock poisoned");
    inner.reschedule = true;
}

pub(crate) fn reschedule_requested() -> bool {
    let reg = registry();
    let inner = reg.inner.lock().expect("dirty registry lock poisoned");
    inner.reschedule
}

pub(crate) fn clear_reschedule() {
    let reg = registry();
    let mut inner = reg.inner.lock().expect("dirty registry lock poisoned");
    inner.reschedule = false;
}

/// Test-only reset of all process-wide registry state. Not for production
/// use: orphans any in-flight dispatcher work for Renders that still
/// expect their entries to be present.
pub(crate) fn reset_for_tests() {
    let reg = registry();
    let mut inner = reg.inner.lock().expect("dirty registry lock poisoned");
    inner.entries.clear();
    inner.next_seq = 0;
    inner.reschedule = false;
    drop(inner);
    reg.sem.drain();
}
