//! Ownership Tree
//!
//! Owners form a tree stored as an intrusive doubly-linked sibling chain: a
//! node's children are the contiguous run of nodes right after it whose
//! `parent` points back at it. Appending splices the new child directly
//! after its parent, so every subtree occupies one contiguous run of the
//! chain.
//!
//! These functions only restructure the arena. Disposal callbacks and the
//! removed node records are handed back in a [`Teardown`] so the caller can
//! run user code after releasing its borrow of the arena.

use std::any::{Any, TypeId};
use std::rc::Rc;

use super::node::{Arena, Cleanup, Node, NodeId, NodeState};

/// Work left over after a structural disposal.
#[derive(Default)]
pub(crate) struct Teardown {
    /// Disposal callbacks, children before parents, each owner's callbacks
    /// in registration order.
    pub cleanups: Vec<Cleanup>,
    /// Removed node records. Dropped only after the cleanups ran.
    pub nodes: Vec<Node>,
}

impl Teardown {
    pub fn is_empty(&self) -> bool {
        self.cleanups.is_empty() && self.nodes.is_empty()
    }

    /// Run every cleanup, then drop the removed records.
    pub fn finish(self) {
        for cleanup in self.cleanups {
            cleanup();
        }
        drop(self.nodes);
    }
}

/// Splice `child` into the chain immediately after `parent`.
pub(crate) fn append(arena: &mut Arena, parent: NodeId, child: NodeId) {
    debug_assert!(
        arena.get(child).is_some_and(|c| c.parent.is_none()),
        "child already belongs to an ownership tree"
    );
    let Some(next) = arena.get(parent).map(|p| p.next_sibling) else {
        return;
    };

    if let Some(next) = next {
        if let Some(next_node) = arena.get_mut(next) {
            next_node.prev_sibling = Some(child);
        }
    }
    if let Some(child_node) = arena.get_mut(child) {
        child_node.parent = Some(parent);
        child_node.prev_sibling = Some(parent);
        child_node.next_sibling = next;
    }
    if let Some(parent_node) = arena.get_mut(parent) {
        parent_node.next_sibling = Some(child);
    }
}

/// Dispose every descendant of `id`, and `id` itself when `include_self`.
///
/// Disposing a node that is already gone is a no-op.
pub(crate) fn dispose(arena: &mut Arena, id: NodeId, include_self: bool, out: &mut Teardown) {
    if !arena.contains_key(id) {
        return;
    }
    let after = dispose_children(arena, id, out);
    if include_self {
        tear_down(arena, id, after, out);
    }
}

/// Dispose the children of `id` and return the first node following its
/// subtree.
fn dispose_children(arena: &mut Arena, id: NodeId, out: &mut Teardown) -> Option<NodeId> {
    let mut current = arena.get(id).and_then(|n| n.next_sibling);

    while let Some(child) = current {
        if arena.get(child).and_then(|c| c.parent) != Some(id) {
            break;
        }
        let after = dispose_children(arena, child, out);
        tear_down(arena, child, after, out);
        current = after;
    }

    if let Some(node) = arena.get_mut(id) {
        node.next_sibling = current;
    }
    if let Some(next) = current.and_then(|next| arena.get_mut(next)) {
        next.prev_sibling = Some(id);
    }
    current
}

/// Remove a single node whose children are already gone.
///
/// `after` is the node following it in the chain.
fn tear_down(arena: &mut Arena, id: NodeId, after: Option<NodeId>, out: &mut Teardown) {
    let Some(mut node) = arena.remove(id) else {
        return;
    };

    if let Some(prev) = node.prev_sibling.and_then(|prev| arena.get_mut(prev)) {
        prev.next_sibling = after;
    }
    if let Some(next) = after.and_then(|next| arena.get_mut(next)) {
        next.prev_sibling = node.prev_sibling;
    }

    // Stop being retained by former sources.
    for source in node.sources.drain(..) {
        if let Some(source) = arena.get_mut(source) {
            source.remove_observer(id);
        }
    }

    node.parent = None;
    node.prev_sibling = None;
    node.next_sibling = None;
    node.context = None;
    node.state = NodeState::Disposed;
    out.cleanups.extend(node.disposal.drain(..));

    tracing::trace!(node = ?id, name = node.display_name(), "disposed");
    out.nodes.push(node);
}

/// Register `cleanup` on `owner`. Returns the callback if the owner is gone.
pub(crate) fn push_cleanup(arena: &mut Arena, owner: NodeId, cleanup: Cleanup) -> Option<Cleanup> {
    match arena.get_mut(owner) {
        Some(node) => {
            node.disposal.push(cleanup);
            None
        }
        None => Some(cleanup),
    }
}

/// Detach the pending cleanups of `owner` without disposing it.
pub(crate) fn take_cleanups(arena: &mut Arena, owner: NodeId) -> Vec<Cleanup> {
    arena
        .get_mut(owner)
        .map(|node| node.disposal.drain(..).collect())
        .unwrap_or_default()
}

/// Walk from `owner` up the parent chain and return the nearest context
/// entry for `key`, with the node that defines it.
pub(crate) fn lookup(
    arena: &Arena,
    owner: Option<NodeId>,
    key: TypeId,
) -> Option<(NodeId, Rc<dyn Any>)> {
    let mut current = owner;
    while let Some(id) = current {
        let node = arena.get(id)?;
        if let Some(value) = node.context.as_ref().and_then(|ctx| ctx.get(&key)) {
            return Some((id, Rc::clone(value)));
        }
        current = node.parent;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn chain(arena: &Arena, start: NodeId) -> Vec<NodeId> {
        let mut out = vec![start];
        let mut current = arena[start].next_sibling;
        while let Some(id) = current {
            out.push(id);
            current = arena[id].next_sibling;
        }
        out
    }

    fn child_of(arena: &mut Arena, parent: NodeId) -> NodeId {
        let id = arena.insert(Node::owner());
        append(arena, parent, id);
        id
    }

    #[test]
    fn append_splices_after_parent() {
        let mut arena = Arena::with_key();
        let root = arena.insert(Node::owner());
        let a = child_of(&mut arena, root);
        let b = child_of(&mut arena, root);
        let a1 = child_of(&mut arena, a);

        assert_eq!(chain(&arena, root), vec![root, b, a, a1]);
        assert_eq!(arena[a1].parent, Some(a));
        assert_eq!(arena[a].prev_sibling, Some(b));
    }

    #[test]
    fn dispose_children_keeps_self() {
        let mut arena = Arena::with_key();
        let root = arena.insert(Node::owner());
        let a = child_of(&mut arena, root);
        let _a1 = child_of(&mut arena, a);
        let b = child_of(&mut arena, root);

        let mut out = Teardown::default();
        dispose(&mut arena, a, false, &mut out);

        assert_eq!(out.nodes.len(), 1);
        assert_eq!(chain(&arena, root), vec![root, b, a]);
        assert!(arena.contains_key(a));
    }

    #[test]
    fn dispose_never_touches_outside_subtree() {
        let mut arena = Arena::with_key();
        let root = arena.insert(Node::owner());
        let a = child_of(&mut arena, root);
        let b = child_of(&mut arena, root);
        let b1 = child_of(&mut arena, b);
        let c = child_of(&mut arena, root);

        let mut out = Teardown::default();
        dispose(&mut arena, b, true, &mut out);

        assert_eq!(out.nodes.len(), 2);
        assert!(!arena.contains_key(b));
        assert!(!arena.contains_key(b1));
        assert_eq!(chain(&arena, root), vec![root, c, a]);
        assert_eq!(arena[a].prev_sibling, Some(c));
    }

    #[test]
    fn cleanups_run_children_first_and_once() {
        let mut arena = Arena::with_key();
        let log = Rc::new(RefCell::new(Vec::new()));
        let root = arena.insert(Node::owner());
        let child = child_of(&mut arena, root);

        for (id, label) in [(root, "root-1"), (child, "child"), (root, "root-2")] {
            let log = log.clone();
            assert!(push_cleanup(&mut arena, id, Box::new(move || log.borrow_mut().push(label)))
                .is_none());
        }

        let mut out = Teardown::default();
        dispose(&mut arena, root, true, &mut out);
        out.finish();
        assert_eq!(*log.borrow(), vec!["child", "root-1", "root-2"]);

        let mut again = Teardown::default();
        dispose(&mut arena, root, true, &mut again);
        assert!(again.is_empty());
    }

    #[test]
    fn lookup_finds_nearest_ancestor() {
        let mut arena = Arena::with_key();
        let root = arena.insert(Node::owner());
        let mid = child_of(&mut arena, root);
        let leaf = child_of(&mut arena, mid);

        let key = TypeId::of::<u32>();
        arena[root].context = Some([(key, Rc::new(1_u32) as Rc<dyn Any>)].into_iter().collect());
        arena[mid].context = Some([(key, Rc::new(2_u32) as Rc<dyn Any>)].into_iter().collect());

        let (found, value) = lookup(&arena, Some(leaf), key).unwrap();
        assert_eq!(found, mid);
        assert_eq!(value.downcast_ref::<u32>(), Some(&2));

        assert!(lookup(&arena, Some(leaf), TypeId::of::<i8>()).is_none());
        assert!(lookup(&arena, None, key).is_none());
    }
}
