//! Memo Implementation
//!
//! A Memo is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Memos Work
//!
//! 1. On first access, the memo runs its computation and caches the result.
//!
//! 2. When accessed again, if no dependencies have changed, returns the
//!    cached value.
//!
//! 3. When a dependency changes, the memo is marked CHECK (something
//!    upstream may have changed) or DIRTY (a direct source changed).
//!
//! 4. On next access, a CHECK memo brings its sources up to date in order.
//!
//! 5. If one of them changed, recompute. Otherwise, mark clean and return the
//!    cache.
//!
//! # Why This Matters
//!
//! This "lazy" approach avoids unnecessary recomputation:
//!
//! - A signal changes
//! - 10 memos depend on it
//! - Only the memos actually accessed will recompute
//! - Memos that are never read stay stale (no wasted work)
//!
//! A recomputation that produces an equal value stops there: observers of
//! the memo are not recomputed.
//!
//! # Failures
//!
//! A compute function that returns an error puts the memo in the error
//! state. The error is returned to every reader until a later recomputation
//! succeeds. Returning [`ReactiveError::NotReady`] instead raises the loading
//! bit and keeps the previous value.

use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use super::runtime::{downcast, equals_fn, equals_with, erase_compute, Runtime};
use crate::error::{ReactiveError, ReactiveResult};
use crate::graph::node::{AnyValue, EqualsFn, Node};
use crate::graph::{Flags, NodeId, NodeKind, NodeState};

/// A cached derived value that recomputes only when dependencies change.
///
/// The compute function receives the previous value, if any.
///
/// # Example
///
/// ```rust
/// use trellis_core::reactive::{Memo, Signal};
///
/// let count = Signal::new(2);
/// let doubled = Memo::new(move |_| Ok(count.get() * 2));
/// assert_eq!(doubled.get(), 4);
///
/// count.set(5);
/// assert_eq!(doubled.get(), 10);
/// ```
pub struct Memo<T> {
    id: NodeId,
    _marker: PhantomData<(fn() -> T, *const ())>,
}

impl<T: Clone + PartialEq + 'static> Memo<T> {
    /// Create a new memo with the given computation function.
    ///
    /// The computation is not run immediately. It runs on first access.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
    {
        Self::build(None, None, compute, Some(equals_fn::<T>()))
    }

    /// Create a memo whose first evaluation sees `initial` as the previous
    /// value.
    pub fn with_initial<F>(initial: T, compute: F) -> Self
    where
        F: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
    {
        Self::build(None, Some(initial), compute, Some(equals_fn::<T>()))
    }

    pub fn named<F>(name: impl Into<Cow<'static, str>>, compute: F) -> Self
    where
        F: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
    {
        Self::build(Some(name.into()), None, compute, Some(equals_fn::<T>()))
    }
}

impl<T: Clone + 'static> Memo<T> {
    /// Create a memo that compares results with `equals`.
    pub fn with_equals<F>(compute: F, equals: impl Fn(&T, &T) -> bool + 'static) -> Self
    where
        F: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
    {
        Self::build(None, None, compute, Some(equals_with(equals)))
    }

    /// Create a memo that treats every recomputation as a change.
    pub fn without_equals<F>(compute: F) -> Self
    where
        F: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
    {
        Self::build(None, None, compute, None)
    }

    fn build<F>(
        name: Option<Cow<'static, str>>,
        initial: Option<T>,
        compute: F,
        equals: Option<Rc<EqualsFn>>,
    ) -> Self
    where
        F: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
    {
        let initial = initial.map(|value| Rc::new(value) as AnyValue);
        let node = Node::derived(NodeKind::Memo, initial, erase_compute(compute), equals)
            .with_name(name);
        let id = Runtime::with(|rt| rt.create_node(node, true));
        Self::from_id(id)
    }

    pub(crate) fn from_id(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Get the memo's node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the current value, recomputing if necessary, and subscribe the
    /// current computation.
    ///
    /// Returns the compute function's error while the memo is in the error
    /// state, and [`ReactiveError::NotReady`] if it is loading and has never
    /// produced a value.
    pub fn read(&self) -> ReactiveResult<T> {
        Runtime::with(|rt| rt.read(self.id)).map(|value| downcast(&value))
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// # Panics
    ///
    /// Panics if the memo is in the error state, has no value yet, or was
    /// disposed.
    pub fn get(&self) -> T {
        self.read().unwrap_or_else(|error| panic!("{error}"))
    }

    /// Get the current value without subscribing the current computation.
    pub fn get_untracked(&self) -> ReactiveResult<T> {
        Runtime::with(|rt| rt.read_untracked(self.id)).map(|value| downcast(&value))
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> ReactiveResult<R> {
        let value = Runtime::with(|rt| rt.read(self.id))?;
        value
            .downcast_ref::<T>()
            .map(f)
            .ok_or_else(|| ReactiveError::msg("memo value has an unexpected type"))
    }

    /// Like [`read`](Self::read), but reports [`ReactiveError::NotReady`]
    /// while the loading bit is set.
    pub fn wait(&self) -> ReactiveResult<T> {
        let value = self.read()?;
        if Runtime::with(|rt| rt.flags_of(self.id)).contains(Flags::LOADING) {
            return Err(ReactiveError::NotReady);
        }
        Ok(value)
    }

    /// A memo reporting whether this memo is loading.
    ///
    /// The view recomputes on error and loading changes alike, so reading
    /// it never fails because of this memo's error.
    pub fn loading(&self) -> ReactiveResult<Memo<bool>> {
        Runtime::with(|rt| rt.status_view(self.id, Flags::LOADING)).map(Memo::from_id)
    }

    /// A memo reporting whether this memo is in the error state.
    pub fn error(&self) -> ReactiveResult<Memo<bool>> {
        Runtime::with(|rt| rt.status_view(self.id, Flags::ERROR)).map(Memo::from_id)
    }

    /// Get the current staleness. `Disposed` once the memo is gone.
    pub fn state(&self) -> NodeState {
        Runtime::with(|rt| rt.state_of(self.id)).unwrap_or(NodeState::Disposed)
    }

    /// Check if the memo has a cached value.
    pub fn has_value(&self) -> bool {
        Runtime::with(|rt| rt.has_value(self.id))
    }

    /// Number of sources found by the last evaluation.
    pub fn source_count(&self) -> usize {
        Runtime::with(|rt| rt.source_count(self.id))
    }

    /// Get the number of observers.
    pub fn observer_count(&self) -> usize {
        Runtime::with(|rt| rt.observer_count(self.id))
    }

    /// Dispose the memo, everything it owns and its cleanups.
    pub fn dispose(&self) {
        Runtime::with(|rt| rt.dispose_node(self.id, true));
    }

    pub fn is_disposed(&self) -> bool {
        !Runtime::with(|rt| rt.contains(self.id))
    }
}

impl<T> Clone for Memo<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Memo<T> {}

impl<T> PartialEq for Memo<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Memo<T> {}

impl<T: Clone + 'static> fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memo")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("has_value", &self.has_value())
            .field("observer_count", &self.observer_count())
            .finish()
    }
}

/// Create a memo owned by the current owner.
pub fn create_memo<T, F>(compute: F) -> Memo<T>
where
    T: Clone + PartialEq + 'static,
    F: Fn(Option<&T>) -> ReactiveResult<T> + 'static,
{
    Memo::new(compute)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
