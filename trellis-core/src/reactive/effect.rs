//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the effect is queued. It does not run
//!    inline with the write: all queued effects run together at the next
//!    flush, so several writes in a row cause a single re-run.
//!
//! 3. Before re-running, the effect disposes what its previous run created,
//!    runs that run's cleanups, and tracks its dependencies afresh.
//!
//! # Differences from Memo
//!
//! - Memos are lazy (compute on access); effects are eager (run at the
//!   flush after a dependency changed).
//! - A memo's value is read by others; an effect's value is only handed back
//!   to its own next run.
//! - A failing memo stores its error; a failing effect hands it to the
//!   nearest handler installed with [`catch_error`](super::catch_error).
//!
//! # Render Effects
//!
//! A [`RenderEffect`] splits the work in two: a tracked compute function
//! produces a value, and an untracked body consumes it. During a flush every
//! pending render effect computes first, then the bodies of those whose value
//! changed run. Render effects are flushed before plain effects.

use std::borrow::Cow;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use super::runtime::{downcast, equals_fn, erase_compute, Runtime};
use crate::error::ReactiveResult;
use crate::graph::node::{AnyValue, Node, RenderFn};
use crate::graph::{NodeId, NodeKind, NodeState};

/// A side-effecting computation that runs when dependencies change.
///
/// The function receives the value returned by its previous run.
///
/// # Example
///
/// ```rust
/// use trellis_core::reactive::{create_effect, flush_sync, Signal};
///
/// let count = Signal::new(0);
///
/// let effect = create_effect(move |_| {
///     println!("Count is: {}", count.get());
///     Ok(())
/// })
/// .unwrap();
///
/// count.set(5);
/// flush_sync().unwrap(); // Prints: "Count is: 5"
/// assert_eq!(effect.run_count(), 2);
/// ```
pub struct Effect<T> {
    id: NodeId,
    runs: Rc<Cell<usize>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + 'static> Effect<T> {
    /// Create a new effect with the given function.
    ///
    /// The function runs immediately to establish initial dependencies. An
    /// error from that first run that no handler accepts is returned.
    pub fn new<F>(run: F) -> ReactiveResult<Self>
    where
        F: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
    {
        Self::build(None, None, run)
    }

    /// Create an effect whose first run sees `initial` as the previous value.
    pub fn with_initial<F>(initial: T, run: F) -> ReactiveResult<Self>
    where
        F: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
    {
        Self::build(None, Some(initial), run)
    }

    pub fn named<F>(name: impl Into<Cow<'static, str>>, run: F) -> ReactiveResult<Self>
    where
        F: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
    {
        Self::build(Some(name.into()), None, run)
    }

    fn build<F>(name: Option<Cow<'static, str>>, initial: Option<T>, run: F) -> ReactiveResult<Self>
    where
        F: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
    {
        let runs = Rc::new(Cell::new(0));
        let counter = Rc::clone(&runs);
        let compute = erase_compute(move |previous: Option<&T>| {
            counter.set(counter.get() + 1);
            run(previous)
        });
        let initial = initial.map(|value| Rc::new(value) as AnyValue);
        let node = Node::derived(NodeKind::Effect, initial, compute, None).with_name(name);

        let id = Runtime::with(|rt| -> ReactiveResult<NodeId> {
            let id = rt.create_node(node, true);
            // Nobody gets a handle to an effect whose first run failed.
            if let Err(error) = rt.update_if_necessary(id) {
                rt.dispose_node(id, true);
                return Err(error);
            }
            rt.schedule_recheck(id);
            Ok(id)
        })?;

        Ok(Self {
            id,
            runs,
            _marker: PhantomData,
        })
    }

    /// Get the effect's node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The value returned by the last successful run.
    pub fn value(&self) -> Option<T> {
        Runtime::with(|rt| rt.value_of(self.id)).map(|value| downcast(&value))
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.runs.get()
    }

    /// Get the number of dependencies.
    pub fn source_count(&self) -> usize {
        Runtime::with(|rt| rt.source_count(self.id))
    }

    pub fn state(&self) -> NodeState {
        Runtime::with(|rt| rt.state_of(self.id)).unwrap_or(NodeState::Disposed)
    }

    /// Dispose of the effect.
    ///
    /// After disposal, the effect will not run again, even if it is already
    /// queued.
    pub fn dispose(&self) {
        Runtime::with(|rt| rt.dispose_node(self.id, true));
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        !Runtime::with(|rt| rt.contains(self.id))
    }
}

impl<T> Clone for Effect<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            runs: Rc::clone(&self.runs),
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for Effect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id)
            .field("run_count", &self.run_count())
            .field("source_count", &self.source_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// A two-phase effect: a tracked compute function and an untracked body that
/// runs with the computed value whenever it changed.
pub struct RenderEffect<T> {
    id: NodeId,
    _marker: PhantomData<(fn() -> T, *const ())>,
}

impl<T: Clone + PartialEq + 'static> RenderEffect<T> {
    /// Create a render effect.
    ///
    /// `compute` runs immediately; `body` first runs at the next flush.
    pub fn new<C, B>(compute: C, body: B) -> ReactiveResult<Self>
    where
        C: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
        B: Fn(&T) -> ReactiveResult<()> + 'static,
    {
        let render: Rc<RenderFn> = Rc::new(move |value: AnyValue| match value.downcast_ref::<T>() {
            Some(value) => body(value),
            None => Ok(()),
        });
        let mut node = Node::derived(
            NodeKind::RenderEffect,
            None,
            erase_compute(compute),
            Some(equals_fn::<T>()),
        );
        node.render = Some(render);

        let id = Runtime::with(|rt| -> ReactiveResult<NodeId> {
            let id = rt.create_node(node, true);
            if let Err(error) = rt.update_if_necessary(id) {
                rt.dispose_node(id, true);
                return Err(error);
            }
            rt.enqueue_effect(id, NodeKind::RenderEffect);
            Ok(id)
        })?;

        Ok(Self {
            id,
            _marker: PhantomData,
        })
    }
}

impl<T: Clone + 'static> RenderEffect<T> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The value produced by the last compute phase.
    pub fn value(&self) -> Option<T> {
        Runtime::with(|rt| rt.value_of(self.id)).map(|value| downcast(&value))
    }

    pub fn dispose(&self) {
        Runtime::with(|rt| rt.dispose_node(self.id, true));
    }

    pub fn is_disposed(&self) -> bool {
        !Runtime::with(|rt| rt.contains(self.id))
    }
}

impl<T> Clone for RenderEffect<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RenderEffect<T> {}

impl<T> fmt::Debug for RenderEffect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderEffect").field("id", &self.id).finish()
    }
}

/// Create an effect owned by the current owner.
pub fn create_effect<T, F>(run: F) -> ReactiveResult<Effect<T>>
where
    T: Clone + 'static,
    F: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
{
    Effect::new(run)
}

/// Create a render effect owned by the current owner.
pub fn create_render_effect<T, C, B>(compute: C, body: B) -> ReactiveResult<RenderEffect<T>>
where
    T: Clone + PartialEq + 'static,
    C: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
    B: Fn(&T) -> ReactiveResult<()> + 'static,
{
    RenderEffect::new(compute, body)
}

/// Run all pending effects now instead of waiting for the deferred flush.
///
/// Does nothing when called from inside a running flush. Returns the first
/// effect failure that no error handler accepted; the remaining effects still
/// run.
pub fn flush_sync() -> ReactiveResult<()> {
    Runtime::with(|rt| rt.flush_sync())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReactiveError;
    use crate::reactive::owner::{catch_error, create_root, on_cleanup};
    use crate::reactive::signal::Signal;
    use std::cell::RefCell;

    #[test]
    fn effect_runs_on_creation() {
        let effect = Effect::new(|_| Ok(())).unwrap();

        // Effect should have run once on creation
        assert_eq!(effect.run_count(), 1);
    }

    #[test]
    fn effect_reruns_at_flush_not_on_write() {
        let source = Signal::new(1);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let effect = create_effect(move |_| {
            log.borrow_mut().push(source.get());
            Ok(())
        })
        .unwrap();

        source.set(2);
        assert_eq!(effect.run_count(), 1);
        assert_eq!(effect.state(), NodeState::Dirty);

        flush_sync().unwrap();
        assert_eq!(*seen.borrow(), vec![1, 2]);
        assert_eq!(effect.run_count(), 2);
    }

    #[test]
    fn writes_are_batched_until_flush() {
        let source = Signal::new(0);
        let effect = create_effect(move |_| source.read().map(drop)).unwrap();

        source.set(1);
        source.set(2);
        source.set(3);
        flush_sync().unwrap();
        assert_eq!(effect.run_count(), 2);
    }

    #[test]
    fn previous_value_is_threaded_through_runs() {
        let source = Signal::new(1);
        let effect = Effect::with_initial(10, move |previous| {
            Ok(previous.copied().unwrap_or_default() + source.get())
        })
        .unwrap();
        assert_eq!(effect.value(), Some(11));

        source.set(4);
        flush_sync().unwrap();
        assert_eq!(effect.value(), Some(15));
    }

    #[test]
    fn effect_does_not_run_after_disposal() {
        let source = Signal::new(0);
        let effect = create_effect(move |_| source.read().map(drop)).unwrap();

        source.set(1);
        effect.dispose();
        assert!(effect.is_disposed());

        flush_sync().unwrap();
        assert_eq!(effect.run_count(), 1);
        assert_eq!(source.observer_count(), 0);
    }

    #[test]
    fn rerun_cleans_up_previous_run() {
        let source = Signal::new(0);
        let cleaned = Rc::new(Cell::new(0));
        let counter = cleaned.clone();
        create_effect(move |_| {
            source.get();
            let counter = counter.clone();
            on_cleanup(move || counter.set(counter.get() + 1));
            Ok(())
        })
        .unwrap();

        source.set(1);
        flush_sync().unwrap();
        assert_eq!(cleaned.get(), 1);
    }

    #[test]
    fn unhandled_failure_is_returned() {
        let result = create_effect(|_| -> ReactiveResult<()> { Err(ReactiveError::msg("boom")) });
        assert!(matches!(result, Err(ReactiveError::Unhandled(_))));
    }

    #[test]
    fn failure_goes_to_handler_and_other_effects_still_run() {
        let source = Signal::new(0);
        let caught = Rc::new(RefCell::new(Vec::new()));
        let sink = caught.clone();

        let healthy = catch_error(
            move || {
                create_effect(move |_| {
                    if source.get() > 0 {
                        return Err(ReactiveError::msg("too big"));
                    }
                    Ok(())
                })?;
                create_effect(move |_| source.read().map(drop))
            },
            move |error| {
                sink.borrow_mut().push(error.to_string());
                Ok(())
            },
        )
        .unwrap()
        .unwrap();

        source.set(1);
        flush_sync().unwrap();
        assert_eq!(*caught.borrow(), vec!["computation failed: too big".to_string()]);
        assert_eq!(healthy.run_count(), 2);
    }

    #[test]
    fn not_ready_skips_the_run() {
        let ready = Signal::new(false);
        let effect = create_effect(move |_| {
            if !ready.get() {
                return Err(ReactiveError::NotReady);
            }
            Ok("ran")
        })
        .unwrap();
        assert_eq!(effect.value(), None);

        ready.set(true);
        flush_sync().unwrap();
        assert_eq!(effect.value(), Some("ran"));
    }

    #[test]
    fn render_effect_runs_body_only_on_change() {
        let source = Signal::new(3);
        let rendered = Rc::new(RefCell::new(Vec::new()));
        let log = rendered.clone();
        let render = create_render_effect(
            move |_| Ok(source.get() / 2),
            move |half: &i32| {
                log.borrow_mut().push(*half);
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(render.value(), Some(1));
        assert!(rendered.borrow().is_empty());

        flush_sync().unwrap();
        assert_eq!(*rendered.borrow(), vec![1]);

        // 2 / 2 == 3 / 2: compute reruns, body does not.
        source.set(2);
        flush_sync().unwrap();
        assert_eq!(*rendered.borrow(), vec![1]);

        source.set(4);
        flush_sync().unwrap();
        assert_eq!(*rendered.borrow(), vec![1, 2]);
    }

    #[test]
    fn render_bodies_run_after_every_compute_phase() {
        let source = Signal::new(0);
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["first", "second"] {
            let compute_log = log.clone();
            let body_log = log.clone();
            create_render_effect(
                move |_| {
                    compute_log.borrow_mut().push(format!("compute {name}"));
                    Ok(source.get())
                },
                move |_| {
                    body_log.borrow_mut().push(format!("body {name}"));
                    Ok(())
                },
            )
            .unwrap();
        }
        flush_sync().unwrap();
        log.borrow_mut().clear();

        source.set(1);
        flush_sync().unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["compute first", "compute second", "body first", "body second"]
        );
    }

    #[test]
    fn effects_inside_disposed_root_never_run() {
        let source = Signal::new(0);
        let (effect, disposer) = create_root(|disposer| {
            let effect = create_effect(move |_| source.read().map(drop)).unwrap();
            (effect, disposer)
        });

        source.set(1);
        disposer.dispose();
        flush_sync().unwrap();
        assert_eq!(effect.run_count(), 1);
    }
}
