//! Graph Nodes
//!
//! This module defines the node record stored in the runtime arena. A single
//! record type covers owners, signals, memos and both effect flavours; the
//! [`NodeKind`] decides which of its fields are meaningful and how writes and
//! notifications behave.

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;

use super::flags::Flags;
use crate::error::{ReactiveError, ReactiveResult};

new_key_type! {
    /// Stable identifier for a node in the runtime arena.
    ///
    /// Keys of disposed nodes are never reused for a different node, so a
    /// stale key simply stops resolving.
    pub struct NodeId;
}

/// Type-erased node value.
pub(crate) type AnyValue = Rc<dyn Any>;

/// Compute function of a derived node. Receives the previous value.
pub(crate) type ComputeFn = dyn Fn(Option<AnyValue>) -> ReactiveResult<AnyValue>;

/// Equality predicate over two type-erased values.
pub(crate) type EqualsFn = dyn Fn(&dyn Any, &dyn Any) -> bool;

/// Second-phase body of a render effect.
pub(crate) type RenderFn = dyn Fn(AnyValue) -> ReactiveResult<()>;

pub(crate) type Cleanup = Box<dyn FnOnce()>;

pub(crate) type Arena = SlotMap<NodeId, Node>;

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A plain ownership scope (root, error boundary).
    Owner,

    /// A leaf holding a value that only changes through explicit writes.
    Signal,

    /// A cached, lazily re-evaluated derivation.
    Memo,

    /// A deferred side effect.
    Effect,

    /// A two-phase side effect: compute, then run the body if the value
    /// changed.
    RenderEffect,
}

impl NodeKind {
    pub fn is_effect(self) -> bool {
        matches!(self, NodeKind::Effect | NodeKind::RenderEffect)
    }
}

/// Staleness of a computation.
///
/// Ordered so that a propagation pass only ever raises it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeState {
    /// The value is up to date.
    Clean,

    /// Some upstream node might have changed; sources must be checked
    /// before the value can be trusted.
    Check,

    /// A source definitely changed; the node must recompute.
    Dirty,

    /// Terminal.
    Disposed,
}

/// Pending write handed to the runtime's write path.
pub(crate) enum Write {
    /// Keep the value, only update the flags.
    Unchanged,
    Value(AnyValue),
    Error(ReactiveError),
}

/// A node in the arena.
pub(crate) struct Node {
    pub name: Option<Cow<'static, str>>,
    pub kind: NodeKind,

    // Ownership tree.
    pub parent: Option<NodeId>,
    pub prev_sibling: Option<NodeId>,
    pub next_sibling: Option<NodeId>,
    pub disposal: SmallVec<[Cleanup; 1]>,
    pub context: Option<IndexMap<TypeId, Rc<dyn Any>>>,

    // Computation.
    pub state: NodeState,
    pub value: Option<AnyValue>,
    pub error: Option<ReactiveError>,
    pub compute: Option<Rc<ComputeFn>>,
    pub equals: Option<Rc<EqualsFn>>,
    pub sources: SmallVec<[NodeId; 4]>,
    pub observers: SmallVec<[NodeId; 4]>,
    pub flags: Flags,
    pub handler_mask: Flags,

    // Lazily created introspection views.
    pub loading_view: Option<NodeId>,
    pub error_view: Option<NodeId>,

    // Render effects only.
    pub modified: bool,
    pub render: Option<Rc<RenderFn>>,
}

impl Node {
    fn blank(kind: NodeKind) -> Self {
        Self {
            name: None,
            kind,
            parent: None,
            prev_sibling: None,
            next_sibling: None,
            disposal: SmallVec::new(),
            context: None,
            state: NodeState::Clean,
            value: None,
            error: None,
            compute: None,
            equals: None,
            sources: SmallVec::new(),
            observers: SmallVec::new(),
            flags: Flags::empty(),
            handler_mask: Flags::DEFAULT_HANDLER,
            loading_view: None,
            error_view: None,
            modified: false,
            render: None,
        }
    }

    /// A plain ownership scope.
    pub fn owner() -> Self {
        Self::blank(NodeKind::Owner)
    }

    /// A signal holding `value`.
    pub fn signal(value: AnyValue, equals: Option<Rc<EqualsFn>>) -> Self {
        Self {
            value: Some(value),
            equals,
            ..Self::blank(NodeKind::Signal)
        }
    }

    /// A derived node. Starts dirty so the first read evaluates it.
    pub fn derived(
        kind: NodeKind,
        initial: Option<AnyValue>,
        compute: Rc<ComputeFn>,
        equals: Option<Rc<EqualsFn>>,
    ) -> Self {
        debug_assert!(kind != NodeKind::Owner && kind != NodeKind::Signal);
        Self {
            state: NodeState::Dirty,
            value: initial,
            compute: Some(compute),
            equals,
            ..Self::blank(kind)
        }
    }

    pub fn with_name(mut self, name: Option<Cow<'static, str>>) -> Self {
        self.name = name;
        self
    }

    pub fn is_clean(&self) -> bool {
        self.state == NodeState::Clean
    }

    /// Remove `observer` from this node's observer list.
    ///
    /// Order of observers carries no meaning, so this swaps with the last
    /// entry.
    pub fn remove_observer(&mut self, observer: NodeId) {
        if let Some(pos) = self.observers.iter().position(|&o| o == observer) {
            self.observers.swap_remove(pos);
        }
    }

    pub fn display_name(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => match self.kind {
                NodeKind::Owner => "owner",
                NodeKind::Signal => "signal",
                NodeKind::Memo => "memo",
                NodeKind::Effect => "effect",
                NodeKind::RenderEffect => "render effect",
            },
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.display_name())
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("sources", &self.sources.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
