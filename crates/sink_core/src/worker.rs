//! Background dispatch for async paint work (spec §4.6).
//!
//! The pool is started lazily, once per process, the first time any
//! `Render` is created. Every pool thread runs the same loop: block on the
//! registry's semaphore, pop the highest-priority dirty tile, upgrade its
//! `Weak<Render>`, and compute it. A `Render` that has been dropped since
//! its tile was queued is silently skipped — the queued entry is simply
//! discarded, matching spec §4.7's "tolerate dropped references" note.

use std::sync::OnceLock;
use std::thread;

use sink_protocol::ConfigError;

use crate::registry;

/// Hard ceiling on pool size regardless of core count: this cache is
/// meant for a handful of concurrently dirty tiles, not a general compute
/// pool (spec §4.6 design note).
const POOL_SIZE_CAP: usize = 8;

fn pool_size() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(POOL_SIZE_CAP)
}

/// Caches the *outcome* of the one-time spawn attempt, not just whether it
/// ran: a naive `OnceLock<()>` would report success on every call even if
/// the first spawn failed, since the closure passed to `get_or_init`
/// always returns `()`. Caching the `Result` lets every caller observe and
/// propagate a genuine bootstrap failure (spec §7: thread spawn failure is
/// one of the few fatal errors).
static WORKER_STARTED: OnceLock<Result<(), String>> = OnceLock::new();

pub(crate) fn ensure_worker() -> Result<(), ConfigError> {
    WORKER_STARTED
        .get_or_init(spawn_pool)
        .clone()
        .map_err(ConfigError::ThreadSpawnFailed)
}

fn spawn_pool() -> Result<(), String> {
    for n in 0..pool_size() {
        thread::Builder::new()
            .name(format!("sink-worker-{n}"))
            .spawn(dispatcher_loop)
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn dispatcher_loop() {
    loop {
        let Some((weak_render, idx)) = registry::get() else {
            continue;
        };
        let Some(render) = weak_render.upgrade() else {
            continue;
        };
        if registry::reschedule_requested() {
            registry::clear_reschedule();
        }
        let _ = render.compute_tile(idx);
    }
}
