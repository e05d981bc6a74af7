//! Error types for the reactive runtime.
//!
//! A failing computation does not unwind through the graph. Its error is
//! stored on the node next to the error bit and handed back to every reader
//! until the node recomputes successfully.

use std::error::Error as StdError;
use std::fmt;
use std::rc::Rc;

use crate::graph::NodeId;

/// Result alias used throughout the crate.
pub type ReactiveResult<T> = Result<T, ReactiveError>;

/// Errors surfaced by reads, writes and flushes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReactiveError {
    /// A compute function, effect body or explicit `set_error` failed.
    #[error("computation failed: {0}")]
    Compute(ComputeError),

    /// The node was disposed together with its owner.
    #[error("read of disposed node {node:?}")]
    Disposed { node: NodeId },

    /// The value is still loading.
    #[error("value is not ready")]
    NotReady,

    /// An effect failed and no error handler accepted the failure.
    #[error("unhandled error in effect: {0}")]
    Unhandled(Box<ReactiveError>),
}

impl ReactiveError {
    /// Wrap an arbitrary error as a compute failure.
    pub fn compute<E>(error: E) -> Self
    where
        E: StdError + 'static,
    {
        Self::Compute(ComputeError(Rc::new(error)))
    }

    /// Build a compute failure from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Compute(ComputeError(Rc::new(Message(message.into()))))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed { .. })
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady)
    }

    /// Strip any number of `Unhandled` wrappers.
    pub fn root_cause(&self) -> &ReactiveError {
        match self {
            Self::Unhandled(inner) => inner.root_cause(),
            other => other,
        }
    }
}

/// A shared, cloneable user error.
///
/// The same failure is returned to every reader of the errored node, so the
/// underlying error lives behind an `Rc`.
#[derive(Clone)]
pub struct ComputeError(Rc<dyn StdError>);

impl ComputeError {
    pub fn inner(&self) -> &(dyn StdError + 'static) {
        &*self.0
    }

    /// Attempt to view the underlying error as a concrete type.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Debug for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}
