//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value that only
//! changes through explicit writes, and it tracks which computations read it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within a reactive context (memo/effect), the
//!    signal records that context as an observer.
//!
//! 2. When a signal's value changes, direct observers are marked dirty and
//!    everything below them is marked for checking.
//!
//! 3. Nothing recomputes until it is read, except effects, which are queued
//!    for the next flush.
//!
//! A write of a value equal to the current one (by `PartialEq`, or a custom
//! predicate) changes nothing and notifies nobody. Unique signals skip the
//! comparison and notify on every write.
//!
//! # Handles
//!
//! [`Signal`] is a `Copy` handle to a node in the thread's runtime. The value
//! lives in the runtime, not in the handle. Signals are not part of the
//! ownership tree: disposing or re-running the scope that created one leaves
//! it alive until [`Signal::dispose`] is called.

use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use super::memo::Memo;
use super::runtime::{downcast, equals_fn, equals_with, Runtime};
use crate::error::{ReactiveError, ReactiveResult};
use crate::graph::node::{EqualsFn, Node, Write};
use crate::graph::{Flags, NodeId};

/// A reactive signal holding a value of type `T`.
///
/// # Example
///
/// ```rust
/// use trellis_core::reactive::Signal;
///
/// let count = Signal::new(0);
///
/// // Read the value
/// assert_eq!(count.get(), 0);
///
/// // Update the value (notifies observers)
/// count.set(5);
/// count.update(|n| n + 1);
/// assert_eq!(count.get(), 6);
/// ```
pub struct Signal<T> {
    id: NodeId,
    _marker: PhantomData<(fn() -> T, *const ())>,
}

impl<T: Clone + PartialEq + 'static> Signal<T> {
    /// Create a new signal.
    pub fn new(value: T) -> Self {
        Self::create(value, None, Some(equals_fn::<T>()))
    }

    pub fn named(name: impl Into<Cow<'static, str>>, value: T) -> Self {
        Self::create(value, Some(name.into()), Some(equals_fn::<T>()))
    }
}

impl<T: Clone + 'static> Signal<T> {
    /// Create a signal that treats every write as a change.
    pub fn new_unique(value: T) -> Self {
        Self::create(value, None, None)
    }

    /// Create a signal that compares writes with `equals`.
    pub fn with_equals(value: T, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Self::create(value, None, Some(equals_with(equals)))
    }

    fn create(value: T, name: Option<Cow<'static, str>>, equals: Option<Rc<EqualsFn>>) -> Self {
        let node = Node::signal(Rc::new(value), equals).with_name(name);
        let id = Runtime::with(|rt| rt.create_node(node, false));
        Self::from_id(id)
    }

    pub(crate) fn from_id(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Get the signal's node id.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Read the value, subscribing the current computation.
    ///
    /// Returns the stored error after [`set_error`](Self::set_error) and
    /// [`ReactiveError::Disposed`] once the signal is gone.
    pub fn read(&self) -> ReactiveResult<T> {
        Runtime::with(|rt| rt.read(self.id)).map(|value| downcast(&value))
    }

    /// Get the current value, subscribing the current computation.
    ///
    /// # Panics
    ///
    /// Panics if the signal holds an error or was disposed. Use
    /// [`read`](Self::read) to handle those cases.
    pub fn get(&self) -> T {
        self.read().unwrap_or_else(|error| panic!("{error}"))
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> ReactiveResult<T> {
        Runtime::with(|rt| rt.read_untracked(self.id)).map(|value| downcast(&value))
    }

    /// Borrow the value for the duration of `f`, subscribing the current
    /// computation.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> ReactiveResult<R> {
        let value = Runtime::with(|rt| rt.read(self.id))?;
        value
            .downcast_ref::<T>()
            .map(f)
            .ok_or_else(|| ReactiveError::msg("signal value has an unexpected type"))
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

    /// Set a new value and notify observers if it changed.
    ///
    /// Clears the error and loading bits. Writes to a disposed signal are
    /// ignored.
    pub fn set(&self, value: T) {
        Runtime::with(|rt| rt.write(self.id, Write::Value(Rc::new(value)), Flags::empty()));
    }

    /// Update the value using a function of the previous one.
    ///
    /// The previous value is read without subscribing.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let Some(previous) = Runtime::with(|rt| rt.value_of(self.id)) else {
            return;
        };
        if let Some(previous) = previous.downcast_ref::<T>() {
            self.set(f(previous));
        }
    }

    /// Notify observers as if the value had changed, without writing it.
    pub fn notify(&self) {
        Runtime::with(|rt| rt.touch(self.id));
    }

    /// Put the signal into the error state. Readers get `error` back until
    /// the next [`set`](Self::set).
    pub fn set_error(&self, error: ReactiveError) {
        Runtime::with(|rt| {
            let flags = rt.flags_of(self.id) | Flags::ERROR;
            rt.write(self.id, Write::Error(error), flags);
        });
    }

    /// Raise or clear the loading bit, keeping the value.
    pub fn set_loading(&self, loading: bool) {
        Runtime::with(|rt| {
            let mut flags = rt.flags_of(self.id);
            flags.set(Flags::LOADING, loading);
            rt.write(self.id, Write::Unchanged, flags);
        });
    }

    /// A memo reporting whether the loading bit is set.
    pub fn loading(&self) -> ReactiveResult<Memo<bool>> {
        Runtime::with(|rt| rt.status_view(self.id, Flags::LOADING)).map(Memo::from_id)
    }

    /// A memo reporting whether the error bit is set.
    pub fn error(&self) -> ReactiveResult<Memo<bool>> {
        Runtime::with(|rt| rt.status_view(self.id, Flags::ERROR)).map(Memo::from_id)
    }

    /// Split into separate read and write handles.
    pub fn split(self) -> (ReadSignal<T>, WriteSignal<T>) {
        (ReadSignal(self), WriteSignal(self))
    }

    /// Get the number of observers.
    pub fn observer_count(&self) -> usize {
        Runtime::with(|rt| rt.observer_count(self.id))
    }

    /// Drop the signal's value and detach its observers.
    pub fn dispose(&self) {
        Runtime::with(|rt| rt.dispose_node(self.id, true));
    }

    pub fn is_disposed(&self) -> bool {
        !Runtime::with(|rt| rt.contains(self.id))
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Signal<T> {}

impl<T> PartialEq for Signal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Signal<T> {}

impl<T> fmt::Debug for Signal<T>
where
    T: Clone + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = Runtime::with(|rt| rt.value_of(self.id));
        let value = value.as_deref().and_then(|value| value.downcast_ref::<T>());
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("value", &value)
            .field("observer_count", &self.observer_count())
            .finish()
    }
}

/// Read half of a signal.
pub struct ReadSignal<T>(Signal<T>);

impl<T: Clone + 'static> ReadSignal<T> {
    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn read(&self) -> ReactiveResult<T> {
        self.0.read()
    }

    /// See [`Signal::get`].
    pub fn get(&self) -> T {
        self.0.get()
    }

    pub fn get_untracked(&self) -> ReactiveResult<T> {
        self.0.get_untracked()
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> ReactiveResult<R> {
        self.0.with(f)
    }

    pub fn wait(&self) -> ReactiveResult<T> {
        self.0.wait()
    }

    pub fn loading(&self) -> ReactiveResult<Memo<bool>> {
        self.0.loading()
    }

    pub fn error(&self) -> ReactiveResult<Memo<bool>> {
        self.0.error()
    }
}

impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ReadSignal<T> {}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for ReadSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadSignal").field(&self.0).finish()
    }
}

/// Write half of a signal.
pub struct WriteSignal<T>(Signal<T>);

impl<T: Clone + 'static> WriteSignal<T> {
    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn set(&self, value: T) {
        self.0.set(value);
    }

    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        self.0.update(f);
    }

    pub fn notify(&self) {
        self.0.notify();
    }

    pub fn set_error(&self, error: ReactiveError) {
        self.0.set_error(error);
    }

    pub fn set_loading(&self, loading: bool) {
        self.0.set_loading(loading);
    }
}

impl<T> Clone for WriteSignal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for WriteSignal<T> {}

impl<T> fmt::Debug for WriteSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriteSignal").field(&self.0.id).finish()
    }
}

/// Create a signal and return its read and write halves.
pub fn create_signal<T: Clone + PartialEq + 'static>(value: T) -> (ReadSignal<T>, WriteSignal<T>) {
    Signal::new(value).split()
}

/// Like [`create_signal`], but every write notifies.
pub fn create_unique_signal<T: Clone + 'static>(value: T) -> (ReadSignal<T>, WriteSignal<T>) {
    Signal::new_unique(value).split()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
