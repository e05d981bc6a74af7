//! Host Scheduling
//!
//! The runtime batches effect flushes by deferring them to "the next turn"
//! of whatever event loop hosts it. What a turn is depends on the host, so
//! the runtime only depends on the [`HostScheduler`] trait:
//!
//! - [`MicrotaskQueue`] (default): tasks wait in a per-thread queue until the
//!   host calls [`run_pending_tasks`].
//! - [`SyncHost`]: no deferral at all. Tasks run as soon as the write that
//!   scheduled them has finished propagating. Effects still run correctly,
//!   they are just not batched across writes.
//! - [`TokioHost`]: tasks are spawned onto the current `tokio` `LocalSet`.

use std::cell::RefCell;
use std::collections::VecDeque;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// A host's deferred-callback primitive.
pub trait HostScheduler {
    /// Arrange for `task` to run after the current synchronous work.
    fn schedule(&self, task: Task);

    /// Whether scheduled tasks run later rather than inside `schedule`.
    fn defers(&self) -> bool {
        true
    }
}

thread_local! {
    static MICROTASKS: RefCell<VecDeque<Task>> = RefCell::new(VecDeque::new());
}

/// Per-thread FIFO of deferred tasks, drained by [`run_pending_tasks`].
///
/// The queue only shrinks when the host drains it. Every effect creation and
/// every flush request adds a task, so a program that only calls
/// `flush_sync` must still call [`run_pending_tasks`] from its event loop, or
/// install [`SyncHost`] or [`TokioHost`] instead. Tasks that find nothing to
/// do return immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct MicrotaskQueue;

impl HostScheduler for MicrotaskQueue {
    fn schedule(&self, task: Task) {
        MICROTASKS.with(|queue| queue.borrow_mut().push_back(task));
    }
}

/// Run queued tasks until the queue is empty, including tasks queued by the
/// tasks themselves. Returns how many ran.
///
/// Effects that keep re-triggering each other never empty the queue; each
/// flush is bounded by `max_flush_rounds` but the next one is queued behind
/// it.
pub fn run_pending_tasks() -> usize {
    let mut ran = 0;
    while let Some(task) = MICROTASKS.with(|queue| queue.borrow_mut().pop_front()) {
        task();
        ran += 1;
    }
    ran
}

/// Number of tasks waiting in this thread's queue.
pub fn pending_task_count() -> usize {
    MICROTASKS.with(|queue| queue.borrow().len())
}

/// Runs every task immediately (unbatched mode).
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncHost;

impl HostScheduler for SyncHost {
    fn schedule(&self, task: Task) {
        task();
    }

    fn defers(&self) -> bool {
        false
    }
}

/// Defers tasks to the next turn of the current `tokio::task::LocalSet`.
///
/// Scheduling outside of a `LocalSet` panics, as `spawn_local` does.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioHost;

impl HostScheduler for TokioHost {
    fn schedule(&self, task: Task) {
        tokio::task::spawn_local(async move { task() });
    }
}
