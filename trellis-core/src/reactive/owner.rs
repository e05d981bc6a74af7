//! Ownership Scopes
//!
//! Every memo and effect is owned by the scope it was created in, and a
//! scope owns everything created while it is current. Disposing a scope
//! disposes the whole subtree, children first, and runs the cleanups
//! registered with [`on_cleanup`].
//!
//! Scopes also carry context values. Error handlers installed with
//! [`catch_error`] are looked up this way when an effect fails.

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::rc::Rc;

use indexmap::IndexMap;

use super::context::ReactiveContext;
use super::runtime::Runtime;
use crate::error::{ReactiveError, ReactiveResult};
use crate::graph::node::Node;
use crate::graph::NodeId;

/// Context entry holding the error handler of an error boundary.
pub(crate) struct ErrorHandler(pub Rc<dyn Fn(ReactiveError) -> ReactiveResult<()>>);

/// Handle to an ownership scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner {
    id: NodeId,
}

impl Owner {
    /// Create a new scope under the current owner.
    pub fn new() -> Self {
        Self::create(None)
    }

    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self::create(Some(name.into()))
    }

    fn create(name: Option<Cow<'static, str>>) -> Self {
        let id = Runtime::with(|rt| rt.create_node(Node::owner().with_name(name), true));
        Self { id }
    }

    /// The scope new nodes are currently created under.
    pub fn current() -> Option<Self> {
        ReactiveContext::current_owner().map(|id| Self { id })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Dispose this scope and everything it owns. Idempotent.
    pub fn dispose(&self) {
        Runtime::with(|rt| rt.dispose_node(self.id, true));
    }

    pub fn is_disposed(&self) -> bool {
        !Runtime::with(|rt| rt.contains(self.id))
    }

    /// Run `f` with this scope as the current owner and nothing tracking.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        let _ctx = Runtime::with(|rt| ReactiveContext::enter(rt, Some(self.id), None));
        f()
    }

    fn set_context(&self, key: TypeId, value: Rc<dyn Any>) -> bool {
        Runtime::with(|rt| {
            let mut nodes = rt.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(self.id) else {
                return false;
            };
            node.context
                .get_or_insert_with(IndexMap::new)
                .insert(key, value);
            true
        })
    }
}

impl Default for Owner {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposes the scope opened by [`create_root`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disposer(Owner);

impl Disposer {
    pub fn dispose(&self) {
        self.0.dispose();
    }

    pub fn owner(&self) -> Owner {
        self.0
    }
}

/// Open a new ownership scope and run `f` inside it, untracked.
///
/// `f` receives the scope's [`Disposer`]; nothing is disposed until it is
/// called.
pub fn create_root<R>(f: impl FnOnce(Disposer) -> R) -> R {
    let owner = Owner::new();
    owner.with(|| f(Disposer(owner)))
}

/// Re-enter `owner` (or no owner) and run `f` untracked.
///
/// A failure is routed to the nearest error handler above `owner`; when one
/// accepts it the result is `Ok(None)`.
pub fn run_with_owner<R>(
    owner: Option<Owner>,
    f: impl FnOnce() -> ReactiveResult<R>,
) -> ReactiveResult<Option<R>> {
    let id = owner.map(|owner| owner.id);
    let result = {
        let _ctx = Runtime::with(|rt| ReactiveContext::enter(rt, id, None));
        f()
    };
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error) => Runtime::with(|rt| rt.handle_error(id, error)).map(|()| None),
    }
}

/// Run `f` in a new scope whose failures, and those of every effect created
/// inside it, go to `handler`.
///
/// If `handler` itself fails, the error moves on to the next handler further
/// up; with none left it is returned as [`ReactiveError::Unhandled`].
pub fn catch_error<R>(
    f: impl FnOnce() -> ReactiveResult<R>,
    handler: impl Fn(ReactiveError) -> ReactiveResult<()> + 'static,
) -> ReactiveResult<Option<R>> {
    let owner = Owner::named("error boundary");
    let handler = ErrorHandler(Rc::new(handler));
    owner.set_context(TypeId::of::<ErrorHandler>(), Rc::new(handler));
    run_with_owner(Some(owner), f)
}

/// Run `callback` when the current owner is disposed or re-runs.
///
/// Outside of any owner this does nothing.
pub fn on_cleanup(callback: impl FnOnce() + 'static) {
    Runtime::with(|rt| rt.on_cleanup(Box::new(callback)));
}

/// Run `f` without subscribing the current computation to anything it reads.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    let _ctx = Runtime::with(ReactiveContext::untracked);
    f()
}

/// Whether a computation is currently observing reads.
pub fn is_tracking() -> bool {
    ReactiveContext::is_active()
}

/// Attach `value` to the current owner, visible to everything created under
/// it. Returns `false` when there is no owner.
pub fn provide_context<T: 'static>(value: T) -> bool {
    match Owner::current() {
        Some(owner) => owner.set_context(TypeId::of::<T>(), Rc::new(value)),
        None => false,
    }
}

/// The nearest value of type `T` provided by the current owner or one of
/// its ancestors.
pub fn use_context<T: Clone + 'static>() -> Option<T> {
    Runtime::with(|rt| {
        let nodes = rt.nodes.borrow();
        let (_, value) = crate::graph::owner::lookup(&nodes, rt.owner.get(), TypeId::of::<T>())?;
        value.downcast_ref::<T>().cloned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[test]
    fn root_scopes_owner_and_restores_it() {
        assert!(Owner::current().is_none());
        let inner = create_root(|disposer| {
            assert_eq!(Owner::current(), Some(disposer.owner()));
            disposer.owner()
        });
        assert!(Owner::current().is_none());
        assert!(!inner.is_disposed());

        inner.dispose();
        assert!(inner.is_disposed());
        // Disposing twice is fine.
        inner.dispose();
    }

    #[test]
    fn cleanups_run_in_order_on_dispose() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let disposer = create_root(|disposer| {
            for label in ["first", "second"] {
                let log = log.clone();
                on_cleanup(move || log.borrow_mut().push(label));
            }
            disposer
        });
        assert!(log.borrow().is_empty());

        disposer.dispose();
        assert_eq!(*log.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn cleanup_without_owner_is_dropped() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        on_cleanup(move || flag.set(true));
        assert!(!ran.get());
    }

    #[test]
    fn nested_roots_are_disposed_with_their_parent() {
        let (outer, inner) = create_root(|outer| {
            let inner = create_root(|inner| inner);
            (outer, inner)
        });
        outer.dispose();
        assert!(inner.owner().is_disposed());
    }

    #[test]
    fn context_values_are_inherited() {
        create_root(|_| {
            assert!(provide_context(7_u32));
            let seen = Owner::new().with(use_context::<u32>);
            assert_eq!(seen, Some(7));
            assert_eq!(use_context::<i64>(), None);
        });
        assert!(!provide_context(1_u8));
    }

    #[test]
    fn catch_error_handles_failures() {
        let caught = Rc::new(RefCell::new(None));
        let sink = caught.clone();
        let result: ReactiveResult<Option<()>> = catch_error(
            || Err(ReactiveError::msg("nope")),
            move |error| {
                *sink.borrow_mut() = Some(error.to_string());
                Ok(())
            },
        );
        assert!(matches!(result, Ok(None)));
        assert_eq!(caught.borrow().as_deref(), Some("computation failed: nope"));
    }

    #[test]
    fn failing_handler_escalates_to_outer_handler() {
        let outer_calls = Rc::new(Cell::new(0));
        let counter = outer_calls.clone();
        let result = catch_error(
            || catch_error(|| -> ReactiveResult<()> { Err(ReactiveError::msg("inner")) }, Err),
            move |_| {
                counter.set(counter.get() + 1);
                Ok(())
            },
        );
        // The inner boundary's handler rethrew, the outer one took it.
        assert!(matches!(result, Ok(Some(None))));
        assert_eq!(outer_calls.get(), 1);
    }

    #[test]
    fn run_with_owner_without_handler_returns_unhandled() {
        let result: ReactiveResult<Option<()>> =
            run_with_owner(None, || Err(ReactiveError::msg("lost")));
        assert!(matches!(result, Err(ReactiveError::Unhandled(_))));
    }

    #[test]
    fn untrack_hides_the_observer() {
        assert!(!is_tracking());
        assert_eq!(untrack(|| 5), 5);
    }
}
