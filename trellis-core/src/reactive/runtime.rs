//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals, memos, and
//! effects. It owns the node arena, the tracking state and the effect queue,
//! and implements the propagation algorithm.
//!
//! # How It Works
//!
//! 1. A write to a source stores the new value and pushes markers down the
//!    graph: direct observers become DIRTY, everything further down becomes
//!    CHECK. Nothing is recomputed on the way down.
//!
//! 2. A read pulls. A CHECK node brings its sources up to date one by one
//!    and recomputes only if one of them actually changed; otherwise it goes
//!    back to CLEAN with its old value.
//!
//! 3. Status flags (error, loading) ride along writes. An observer whose
//!    handler mask covers a changed flag recomputes; any other observer just
//!    forwards the flag without recomputing.
//!
//! 4. Effects leaving CLEAN are queued and run at the next flush.
//!
//! # Thread Safety
//!
//! There is one runtime per thread and nothing in it is `Send`. No `RefCell`
//! borrow is ever held while user code (compute functions, equality
//! predicates, effect bodies, cleanups, error handlers) runs, so user code
//! may freely read, write and create nodes.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use smallvec::SmallVec;

use super::context::{ReactiveContext, ScratchGuard, Tracking};
use super::host::{HostScheduler, MicrotaskQueue};
use super::owner::ErrorHandler;
use crate::config::RuntimeConfig;
use crate::error::{ReactiveError, ReactiveResult};
use crate::graph::node::{AnyValue, Arena, ComputeFn, EqualsFn, Node, Write};
use crate::graph::owner::{self, Teardown};
use crate::graph::scheduler::{stale_ancestors, EffectQueue};
use crate::graph::{Flags, NodeId, NodeKind, NodeState};

thread_local! {
    static RUNTIME: Runtime = Runtime::new();
}

/// The per-thread reactive runtime.
pub(crate) struct Runtime {
    pub(crate) nodes: RefCell<Arena>,
    pub(crate) tracking: RefCell<Tracking>,
    pub(crate) owner: Cell<Option<NodeId>>,
    queue: RefCell<EffectQueue>,
    host: RefCell<Rc<dyn HostScheduler>>,
    config: RefCell<RuntimeConfig>,
    trace: Cell<bool>,
    /// Depth of nested write propagation. Host flush requests made while a
    /// write is still propagating wait until it has finished.
    propagating: Cell<usize>,
    flush_requested: Cell<bool>,
}

impl Runtime {
    fn new() -> Self {
        let config = RuntimeConfig::default();
        Self {
            nodes: RefCell::new(Arena::with_key()),
            tracking: RefCell::new(Tracking::default()),
            owner: Cell::new(None),
            queue: RefCell::new(EffectQueue::new()),
            host: RefCell::new(Rc::new(MicrotaskQueue)),
            trace: Cell::new(config.trace_propagation),
            config: RefCell::new(config),
            propagating: Cell::new(0),
            flush_requested: Cell::new(false),
        }
    }

    pub(crate) fn with<R>(f: impl FnOnce(&Runtime) -> R) -> R {
        RUNTIME.with(f)
    }

    /// Like [`with`](Self::with) but silently does nothing once the thread's
    /// runtime has been torn down.
    pub(crate) fn try_with(f: impl FnOnce(&Runtime)) {
        let _ = RUNTIME.try_with(f);
    }

    pub(crate) fn set_host(&self, host: Rc<dyn HostScheduler>) {
        *self.host.borrow_mut() = host;
    }

    pub(crate) fn set_config(&self, config: RuntimeConfig) {
        self.trace.set(config.trace_propagation);
        *self.config.borrow_mut() = config;
    }

    pub(crate) fn config(&self) -> RuntimeConfig {
        self.config.borrow().clone()
    }

    // ------------------------------------------------------------------
    // Node access
    // ------------------------------------------------------------------

    /// Insert `node`, attaching it to the current owner when `attach` is set.
    pub(crate) fn create_node(&self, node: Node, attach: bool) -> NodeId {
        let owner = if attach { self.owner.get() } else { None };
        self.create_node_under(node, owner)
    }

    pub(crate) fn create_node_under(&self, node: Node, owner: Option<NodeId>) -> NodeId {
        let mut nodes = self.nodes.borrow_mut();
        let kind = node.kind;
        let id = nodes.insert(node);
        if let Some(owner) = owner {
            owner::append(&mut nodes, owner, id);
        }
        if self.trace.get() {
            tracing::trace!(node = ?id, ?kind, owner = ?owner, "created");
        }
        id
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.nodes.borrow().contains_key(id)
    }

    pub(crate) fn state_of(&self, id: NodeId) -> Option<NodeState> {
        self.nodes.borrow().get(id).map(|node| node.state)
    }

    pub(crate) fn flags_of(&self, id: NodeId) -> Flags {
        self.nodes
            .borrow()
            .get(id)
            .map(|node| node.flags)
            .unwrap_or(Flags::empty())
    }

    pub(crate) fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.borrow().get(id).and_then(|node| node.parent)
    }

    pub(crate) fn source_count(&self, id: NodeId) -> usize {
        self.nodes.borrow().get(id).map_or(0, |node| node.sources.len())
    }

    pub(crate) fn observer_count(&self, id: NodeId) -> usize {
        self.nodes.borrow().get(id).map_or(0, |node| node.observers.len())
    }

    pub(crate) fn has_value(&self, id: NodeId) -> bool {
        self.nodes.borrow().get(id).is_some_and(|node| node.value.is_some())
    }

    /// The stored value, ignoring staleness, flags and tracking.
    pub(crate) fn value_of(&self, id: NodeId) -> Option<AnyValue> {
        self.nodes.borrow().get(id).and_then(|node| node.value.clone())
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    /// Read a node: bring it up to date, subscribe the current observer and
    /// return its value, or its stored error when the error bit is set.
    pub(crate) fn read(&self, id: NodeId) -> ReactiveResult<AnyValue> {
        let derived = {
            let nodes = self.nodes.borrow();
            let node = nodes.get(id).ok_or(ReactiveError::Disposed { node: id })?;
            node.compute.is_some()
        };

        if derived {
            // A failed evaluation is recorded on the node itself and
            // returned below, after the reader has subscribed to it.
            if let Err(error) = self.update_if_necessary(id) {
                if error.is_disposed() {
                    return Err(error);
                }
            }
        }

        self.track(id);

        let nodes = self.nodes.borrow();
        let node = nodes.get(id).ok_or(ReactiveError::Disposed { node: id })?;
        {
            let mut tracking = self.tracking.borrow_mut();
            let mask = tracking.mask;
            tracking.scratch.flags |= node.flags & !mask;
        }

        if node.flags.contains(Flags::ERROR) {
            return Err(node.error.clone().unwrap_or_else(|| {
                ReactiveError::msg(format!("{} is in an error state", node.display_name()))
            }));
        }
        node.value.clone().ok_or(ReactiveError::NotReady)
    }

    /// Read without subscribing the current observer.
    pub(crate) fn read_untracked(&self, id: NodeId) -> ReactiveResult<AnyValue> {
        let _ctx = ReactiveContext::untracked(self);
        self.read(id)
    }

    /// Record `id` as a source of the current observer.
    pub(crate) fn track(&self, id: NodeId) {
        let mut tracking = self.tracking.borrow_mut();
        let Some(observer) = tracking.observer else {
            return;
        };
        if observer == id {
            return;
        }
        let nodes = self.nodes.borrow();
        let previous: &[NodeId] = nodes
            .get(observer)
            .map(|node| node.sources.as_slice())
            .unwrap_or(&[]);
        tracking.track(id, previous);
    }

    /// Resolve pending staleness of `id`.
    pub(crate) fn update_if_necessary(&self, id: NodeId) -> ReactiveResult<()> {
        let (state, sources) = {
            let nodes = self.nodes.borrow();
            let node = nodes.get(id).ok_or(ReactiveError::Disposed { node: id })?;
            (node.state, node.sources.clone())
        };

        match state {
            NodeState::Clean => return Ok(()),
            NodeState::Disposed => return Err(ReactiveError::Disposed { node: id }),
            NodeState::Check | NodeState::Dirty => {}
        }

        let mut observed = Flags::empty();
        if state == NodeState::Check {
            for source in sources {
                if !self.contains(source) {
                    continue;
                }
                // A failing source stores its error and marks this node
                // dirty through the write, so the error itself can be
                // dropped here.
                let _ = self.update_if_necessary(source);
                observed |= self.flags_of(source);

                if self.state_of(id) == Some(NodeState::Dirty) {
                    break;
                }
            }
        }

        match self.state_of(id) {
            None => Err(ReactiveError::Disposed { node: id }),
            Some(NodeState::Dirty) => self.update(id),
            Some(_) => {
                self.write(id, Write::Unchanged, observed);
                self.set_state(id, NodeState::Clean);
                Ok(())
            }
        }
    }

    /// Recompute `id`, re-track its sources and store the result.
    fn update(&self, id: NodeId) -> ReactiveResult<()> {
        let (compute, previous) = {
            let nodes = self.nodes.borrow();
            let node = nodes.get(id).ok_or(ReactiveError::Disposed { node: id })?;
            (node.compute.clone(), node.value.clone())
        };
        let Some(compute) = compute else {
            self.set_state(id, NodeState::Clean);
            return Ok(());
        };

        if self.trace.get() {
            tracing::trace!(node = ?id, "recomputing");
        }

        let scratch = ScratchGuard::new(self);

        // Children created by the previous run must not observe the new
        // value, so they go first, then the previous run's cleanups.
        self.dispose_node(id, false);
        self.run_cleanups(id);

        let result = {
            let _ctx = ReactiveContext::enter(self, Some(id), Some(id));
            compute(previous)
        };
        let scratch = scratch.finish(self);

        let outcome = match result {
            Ok(value) => {
                self.write(id, Write::Value(value), scratch.flags);
                Ok(())
            }
            Err(ReactiveError::NotReady) => {
                self.write(id, Write::Unchanged, scratch.flags | Flags::LOADING);
                Ok(())
            }
            Err(error) => self.set_error(id, error),
        };

        self.reconcile_sources(id, scratch.index, scratch.new_sources);
        self.set_state(id, NodeState::Clean);
        outcome
    }

    /// Bring the adjacency lists in line with the sources discovered by the
    /// last evaluation.
    fn reconcile_sources(
        &self,
        id: NodeId,
        reused: usize,
        new_sources: Option<SmallVec<[NodeId; 4]>>,
    ) {
        let mut nodes = self.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(id) else {
            return;
        };
        let previous = std::mem::take(&mut node.sources);
        let reused = reused.min(previous.len());
        let mut sources: SmallVec<[NodeId; 4]> = previous[..reused].iter().copied().collect();

        for &stale in &previous[reused..] {
            if let Some(source) = nodes.get_mut(stale) {
                source.remove_observer(id);
            }
        }
        for added in new_sources.into_iter().flatten() {
            if let Some(source) = nodes.get_mut(added) {
                source.observers.push(id);
                sources.push(added);
            }
        }

        if let Some(node) = nodes.get_mut(id) {
            node.sources = sources;
        }
    }

    fn set_state(&self, id: NodeId, state: NodeState) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            node.state = state;
        }
    }

    // ------------------------------------------------------------------
    // Writing and notification
    // ------------------------------------------------------------------

    /// Store a value and/or flags on `id` and notify its observers.
    pub(crate) fn write(&self, id: NodeId, write: Write, flags: Flags) {
        let (kind, equals, old) = {
            let nodes = self.nodes.borrow();
            let Some(node) = nodes.get(id) else {
                return;
            };
            (node.kind, node.equals.clone(), node.value.clone())
        };

        let changed = match &write {
            Write::Unchanged => false,
            Write::Error(_) => true,
            Write::Value(value) => !values_equal(equals.as_deref(), old.as_ref(), value),
        };

        if kind.is_effect() {
            // Effects keep their value to themselves and never notify.
            if let Write::Value(value) = write {
                if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
                    node.value = Some(value);
                    if kind == NodeKind::RenderEffect && changed {
                        node.modified = true;
                    }
                }
            }
            return;
        }

        let (observers, changed_mask, changed_flags) = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else {
                return;
            };
            if changed {
                match write {
                    Write::Value(value) => {
                        node.value = Some(value);
                        node.error = None;
                    }
                    Write::Error(error) => node.error = Some(error),
                    Write::Unchanged => {}
                }
            }
            let changed_mask = node.flags ^ flags;
            node.flags = flags;
            if !changed && changed_mask.is_empty() {
                return;
            }
            (node.observers.clone(), changed_mask, changed_mask & flags)
        };

        self.propagating.set(self.propagating.get() + 1);
        for observer in observers {
            if changed {
                self.notify(observer, NodeState::Dirty);
            } else {
                self.notify_flags(observer, changed_mask, changed_flags);
            }
        }
        self.end_propagation();
    }

    /// Mark every observer of `id` dirty as if its value had changed.
    pub(crate) fn touch(&self, id: NodeId) {
        let observers = match self.nodes.borrow().get(id) {
            Some(node) => node.observers.clone(),
            None => return,
        };
        self.propagating.set(self.propagating.get() + 1);
        for observer in observers {
            self.notify(observer, NodeState::Dirty);
        }
        self.end_propagation();
    }

    fn end_propagation(&self) {
        let depth = self.propagating.get().saturating_sub(1);
        self.propagating.set(depth);
        if depth == 0 && self.flush_requested.replace(false) {
            self.request_host_flush();
        }
    }

    /// Raise the state of `id` to `state` and mark everything below it for
    /// checking.
    pub(crate) fn notify(&self, id: NodeId, state: NodeState) {
        let (kind, was_clean, observers) = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else {
                return;
            };
            if node.state >= state {
                return;
            }
            let was_clean = node.state == NodeState::Clean;
            node.state = state;
            let observers = if node.kind.is_effect() {
                SmallVec::new()
            } else {
                node.observers.clone()
            };
            (node.kind, was_clean, observers)
        };

        if self.trace.get() {
            tracing::trace!(node = ?id, ?state, "notified");
        }

        if kind.is_effect() {
            if was_clean {
                self.enqueue_effect(id, kind);
            }
            return;
        }

        for observer in observers {
            self.notify(observer, NodeState::Check);
        }
    }

    /// Forward a flag change that did not come with a value change.
    pub(crate) fn notify_flags(&self, id: NodeId, mask: Flags, new_flags: Flags) {
        let observers = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else {
                return;
            };
            if node.state >= NodeState::Dirty {
                return;
            }
            if mask.intersects(node.handler_mask) {
                drop(nodes);
                self.notify(id, NodeState::Dirty);
                return;
            }
            if node.state >= NodeState::Check {
                return;
            }

            let prev_flags = node.flags & mask;
            let delta = prev_flags ^ new_flags;
            if new_flags == prev_flags {
                return;
            }
            if (delta & prev_flags & mask).is_empty() {
                node.flags ^= delta;
                node.observers.clone()
            } else {
                // Cannot tell what the flags should become without
                // re-checking the sources.
                drop(nodes);
                self.notify(id, NodeState::Check);
                return;
            }
        };

        for observer in observers {
            self.notify_flags(observer, mask, new_flags);
        }
    }

    /// Record a failed evaluation of `id`.
    ///
    /// Computations store the error with the error bit and hand it back.
    /// Effects route it to the nearest error handler instead.
    pub(crate) fn set_error(&self, id: NodeId, error: ReactiveError) -> ReactiveResult<()> {
        let Some(kind) = self.nodes.borrow().get(id).map(|node| node.kind) else {
            return Err(error);
        };
        if kind.is_effect() {
            return self.handle_error(Some(id), error);
        }
        let flags = self.flags_of(id) | Flags::ERROR;
        self.write(id, Write::Error(error.clone()), flags);
        Err(error)
    }

    /// Hand `error` to the nearest error handler above `owner`.
    ///
    /// A handler that fails passes the error on to the next handler above
    /// the owner that registered it.
    pub(crate) fn handle_error(&self, owner: Option<NodeId>, error: ReactiveError) -> ReactiveResult<()> {
        let mut from = owner;
        loop {
            let found = owner::lookup(&self.nodes.borrow(), from, TypeId::of::<ErrorHandler>());
            let Some((definer, handler)) = found else {
                return Err(ReactiveError::Unhandled(Box::new(error)));
            };
            let Ok(handler) = handler.downcast::<ErrorHandler>() else {
                return Err(ReactiveError::Unhandled(Box::new(error)));
            };

            let handled = {
                let _ctx = ReactiveContext::untracked(self);
                (handler.0)(error.clone())
            };
            match handled {
                Ok(()) => return Ok(()),
                Err(failure) => {
                    tracing::debug!(%failure, "error handler failed, escalating");
                    from = self.parent_of(definer);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Ownership
    // ------------------------------------------------------------------

    /// Dispose the subtree of `id`, and `id` itself when `include_self`.
    pub(crate) fn dispose_node(&self, id: NodeId, include_self: bool) {
        let mut teardown = Teardown::default();
        owner::dispose(&mut self.nodes.borrow_mut(), id, include_self, &mut teardown);
        if !teardown.is_empty() {
            let _ctx = ReactiveContext::untracked(self);
            teardown.finish();
        }
    }

    /// Run and forget the pending cleanups of `id`.
    fn run_cleanups(&self, id: NodeId) {
        let cleanups = owner::take_cleanups(&mut self.nodes.borrow_mut(), id);
        if cleanups.is_empty() {
            return;
        }
        let _ctx = ReactiveContext::untracked(self);
        for cleanup in cleanups {
            cleanup();
        }
    }

    /// Register `cleanup` on the current owner. Dropped without an owner.
    pub(crate) fn on_cleanup(&self, cleanup: Box<dyn FnOnce()>) {
        let Some(owner) = self.owner.get() else {
            return;
        };
        // The owner is already gone; its teardown has run.
        let _ = owner::push_cleanup(&mut self.nodes.borrow_mut(), owner, cleanup);
    }

    // ------------------------------------------------------------------
    // Status views
    // ------------------------------------------------------------------

    /// The memo reporting whether `bit` is set on `id`, created on first use
    /// under the node's parent.
    pub(crate) fn status_view(&self, id: NodeId, bit: Flags) -> ReactiveResult<NodeId> {
        let (existing, parent, name) = {
            let nodes = self.nodes.borrow();
            let node = nodes.get(id).ok_or(ReactiveError::Disposed { node: id })?;
            let existing = if bit == Flags::LOADING {
                node.loading_view
            } else {
                node.error_view
            };
            (existing, node.parent, node.display_name().to_owned())
        };
        if let Some(view) = existing.filter(|&view| self.contains(view)) {
            return Ok(view);
        }

        let compute: Rc<ComputeFn> = Rc::new(move |_: Option<AnyValue>| {
            Runtime::with(|rt| {
                rt.track(id);
                if let Err(error) = rt.update_if_necessary(id) {
                    if error.is_disposed() {
                        return Err(error);
                    }
                }
                Ok(Rc::new(rt.flags_of(id).contains(bit)) as AnyValue)
            })
        });

        let (label, handler_mask) = if bit == Flags::LOADING {
            ("loading", Flags::ERROR | Flags::LOADING)
        } else {
            ("error", Flags::ERROR)
        };
        let mut node = Node::derived(NodeKind::Memo, None, compute, Some(equals_fn::<bool>()))
            .with_name(Some(format!("{label} {name}").into()));
        node.handler_mask = handler_mask;

        let view = self.create_node_under(node, parent);
        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            if bit == Flags::LOADING {
                node.loading_view = Some(view);
            } else {
                node.error_view = Some(view);
            }
        }
        Ok(view)
    }

    // ------------------------------------------------------------------
    // Effect scheduling
    // ------------------------------------------------------------------

    pub(crate) fn enqueue_effect(&self, id: NodeId, kind: NodeKind) {
        let request = self.queue.borrow_mut().enqueue(id, kind);
        if request {
            self.flush_effects();
        }
    }

    /// Request one deferred flush from the host.
    pub(crate) fn flush_effects(&self) {
        self.queue.borrow_mut().scheduled = true;
        if self.propagating.get() > 0 {
            self.flush_requested.set(true);
        } else {
            self.request_host_flush();
        }
    }

    fn request_host_flush(&self) {
        let host = Rc::clone(&self.host.borrow());
        host.schedule(Box::new(|| {
            if let Err(error) = Runtime::with(|rt| rt.run_effects()) {
                tracing::error!(%error, "unhandled error in deferred effect flush");
            }
        }));
    }

    /// Schedule a deferred re-check of a freshly created effect.
    pub(crate) fn schedule_recheck(&self, id: NodeId) {
        let host = Rc::clone(&self.host.borrow());
        host.schedule(Box::new(move || {
            let result = Runtime::with(|rt| {
                if rt.state_of(id).is_some_and(|state| state != NodeState::Clean) {
                    rt.update_if_necessary(id)
                } else {
                    Ok(())
                }
            });
            if let Err(error) = result {
                tracing::error!(%error, node = ?id, "unhandled error in effect re-check");
            }
        }));
    }

    /// Flush now unless a flush is already running.
    pub(crate) fn flush_sync(&self) -> ReactiveResult<()> {
        if self.queue.borrow().running {
            return Ok(());
        }
        self.run_effects()
    }

    /// Run every pending render effect and effect.
    ///
    /// Effects queued while flushing are handled by further rounds of the
    /// same flush. Every pending effect gets its turn even if an earlier one
    /// fails without a handler; the first such failure is returned.
    pub(crate) fn run_effects(&self) -> ReactiveResult<()> {
        {
            let mut queue = self.queue.borrow_mut();
            if queue.running {
                return Ok(());
            }
            if !queue.has_pending() {
                queue.scheduled = false;
                return Ok(());
            }
            queue.running = true;
            queue.scheduled = true;
        }
        let running = FlushGuard(self);

        let max_rounds = self.config.borrow().max_flush_rounds;
        let mut first_error: Option<ReactiveError> = None;
        let mut rounds = 0;
        let mut unsettled = false;

        while self.queue.borrow().has_pending() {
            if rounds == max_rounds {
                let deferred = self.queue.borrow().pending_count();
                tracing::warn!(
                    rounds,
                    deferred,
                    "effect flush did not settle, leaving effects for the next flush"
                );
                unsettled = true;
                break;
            }
            rounds += 1;

            let render_effects = self.queue.borrow_mut().take_render_effects();
            for &id in &render_effects {
                if self.is_pending(id) {
                    if let Err(error) = self.update_if_necessary(id) {
                        first_error.get_or_insert(error);
                    }
                }
            }
            for &id in &render_effects {
                if let Err(error) = self.run_render_body(id) {
                    first_error.get_or_insert(error);
                }
            }

            let effects = self.queue.borrow_mut().take_effects();
            for id in effects {
                if self.is_pending(id) {
                    if let Err(error) = self.run_top(id) {
                        first_error.get_or_insert(error);
                    }
                }
            }
        }

        tracing::debug!(rounds, "flushed effects");
        drop(running);

        // Leftover effects are already stale, so no later write queues them
        // again. A synchronous host would re-enter right here; there they
        // wait for the next flush instead.
        if unsettled && self.host.borrow().defers() {
            self.flush_effects();
        }
        first_error.map_or(Ok(()), Err)
    }

    fn is_pending(&self, id: NodeId) -> bool {
        matches!(
            self.state_of(id),
            Some(NodeState::Check) | Some(NodeState::Dirty)
        )
    }

    /// Second phase of a render effect: run the body if the value changed.
    fn run_render_body(&self, id: NodeId) -> ReactiveResult<()> {
        let (body, value) = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else {
                return Ok(());
            };
            if !std::mem::take(&mut node.modified) {
                return Ok(());
            }
            match (node.render.clone(), node.value.clone()) {
                (Some(body), Some(value)) => (body, value),
                _ => return Ok(()),
            }
        };

        let result = {
            let _ctx = ReactiveContext::enter(self, Some(id), None);
            body(value)
        };
        match result {
            Ok(()) | Err(ReactiveError::NotReady) => Ok(()),
            Err(error) => self.handle_error(Some(id), error),
        }
    }

    /// Update the stale ancestors of an effect root-most first, then the
    /// effect itself.
    fn run_top(&self, id: NodeId) -> ReactiveResult<()> {
        let ancestors = stale_ancestors(&self.nodes.borrow(), id);
        for ancestor in ancestors {
            let Some(kind) = self.nodes.borrow().get(ancestor).map(|node| node.kind) else {
                continue;
            };
            let result = self.update_if_necessary(ancestor);
            // Memo failures stay on the memo; only effects report here.
            if kind.is_effect() {
                result?;
            }
        }
        Ok(())
    }
}

/// Clears the running and scheduled guards when a flush ends, even by
/// unwinding.
struct FlushGuard<'a>(&'a Runtime);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        let mut queue = self.0.queue.borrow_mut();
        queue.running = false;
        queue.scheduled = false;
    }
}

fn values_equal(equals: Option<&EqualsFn>, old: Option<&AnyValue>, new: &AnyValue) -> bool {
    match (equals, old) {
        (Some(equals), Some(old)) => equals(&**old, &**new),
        _ => false,
    }
}

/// Equality predicate backed by `PartialEq`.
pub(crate) fn equals_fn<T: PartialEq + 'static>() -> Rc<EqualsFn> {
    Rc::new(|a, b| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    })
}

/// Equality predicate backed by a user function.
pub(crate) fn equals_with<T: 'static>(f: impl Fn(&T, &T) -> bool + 'static) -> Rc<EqualsFn> {
    Rc::new(move |a, b| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    })
}

/// Wrap a typed compute function for storage in a node.
pub(crate) fn erase_compute<T: 'static>(
    f: impl Fn(Option<&T>) -> ReactiveResult<T> + 'static,
) -> Rc<ComputeFn> {
    Rc::new(move |previous: Option<AnyValue>| {
        let previous = previous.as_deref().and_then(|value| value.downcast_ref::<T>());
        f(previous).map(|value| Rc::new(value) as AnyValue)
    })
}

/// Downcast a node value to the type of the handle that produced it.
pub(crate) fn downcast<T: Clone + 'static>(value: &AnyValue) -> T {
    value
        .downcast_ref::<T>()
        .cloned()
        .expect("node value has the type of its handle")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(rt: &Runtime, value: i32) -> NodeId {
        rt.create_node(Node::signal(Rc::new(value), Some(equals_fn::<i32>())), false)
    }

    fn memo(rt: &Runtime, f: impl Fn(Option<&i32>) -> ReactiveResult<i32> + 'static) -> NodeId {
        let node = Node::derived(NodeKind::Memo, None, erase_compute(f), Some(equals_fn::<i32>()));
        rt.create_node(node, true)
    }

    fn value(rt: &Runtime, id: NodeId) -> i32 {
        downcast::<i32>(&rt.read(id).unwrap())
    }

    #[test]
    fn write_marks_direct_observers_dirty_and_the_rest_check() {
        Runtime::with(|rt| {
            let a = signal(rt, 1);
            let b = memo(rt, move |_| Ok(Runtime::with(|rt| value(rt, a)) + 1));
            let c = memo(rt, move |_| Ok(Runtime::with(|rt| value(rt, b)) + 1));
            assert_eq!(value(rt, c), 3);

            rt.write(a, Write::Value(Rc::new(10)), Flags::empty());
            assert_eq!(rt.state_of(b), Some(NodeState::Dirty));
            assert_eq!(rt.state_of(c), Some(NodeState::Check));

            assert_eq!(value(rt, c), 12);
            assert_eq!(rt.state_of(b), Some(NodeState::Clean));
            assert_eq!(rt.state_of(c), Some(NodeState::Clean));
        });
    }

    #[test]
    fn sources_and_observers_stay_symmetric() {
        Runtime::with(|rt| {
            let a = signal(rt, 1);
            let b = signal(rt, 2);
            let sum = memo(rt, move |_| Runtime::with(|rt| Ok(value(rt, a) + value(rt, b))));
            assert_eq!(value(rt, sum), 3);

            let nodes = rt.nodes.borrow();
            assert_eq!(nodes[sum].sources.as_slice(), &[a, b]);
            assert_eq!(nodes[a].observers.as_slice(), &[sum]);
            assert_eq!(nodes[b].observers.as_slice(), &[sum]);
        });
    }

    #[test]
    fn unchanged_flags_do_not_notify() {
        Runtime::with(|rt| {
            let a = signal(rt, 1);
            let b = memo(rt, move |_| Ok(Runtime::with(|rt| value(rt, a))));
            assert_eq!(value(rt, b), 1);

            rt.write(a, Write::Value(Rc::new(1)), Flags::empty());
            assert_eq!(rt.state_of(b), Some(NodeState::Clean));
        });
    }

    #[test]
    fn flag_outside_handler_mask_is_forwarded_without_recompute() {
        Runtime::with(|rt| {
            let a = signal(rt, 1);
            let b = memo(rt, move |_| Ok(Runtime::with(|rt| value(rt, a))));
            assert_eq!(value(rt, b), 1);

            rt.write(a, Write::Unchanged, Flags::LOADING);
            assert_eq!(rt.state_of(b), Some(NodeState::Clean));
            assert!(rt.flags_of(b).contains(Flags::LOADING));
        });
    }

    #[test]
    fn ambiguous_flag_delta_escalates_to_check() {
        Runtime::with(|rt| {
            let a = signal(rt, 1);
            let b = memo(rt, move |_| Ok(Runtime::with(|rt| value(rt, a))));
            assert_eq!(value(rt, b), 1);

            // b already carries LOADING; a clears a bit b has set.
            if let Some(node) = rt.nodes.borrow_mut().get_mut(b) {
                node.flags = Flags::LOADING;
            }
            rt.notify_flags(b, Flags::LOADING, Flags::empty());
            assert_eq!(rt.state_of(b), Some(NodeState::Check));
        });
    }

    #[test]
    fn flag_in_handler_mask_forces_dirty() {
        Runtime::with(|rt| {
            let a = signal(rt, 1);
            let b = memo(rt, move |_| Ok(Runtime::with(|rt| value(rt, a))));
            assert_eq!(value(rt, b), 1);

            rt.notify_flags(b, Flags::ERROR, Flags::ERROR);
            assert_eq!(rt.state_of(b), Some(NodeState::Dirty));
        });
    }
}
