//! Effect Queue
//!
//! Effects never run inline on a write. When an effect first leaves the
//! clean state it is appended here, and the runtime asks the host for one
//! deferred flush. The flush drains render effects first (compute phase for
//! all of them, then the bodies of the ones whose value changed) and general
//! effects after that.
//!
//! Two guards keep flushing well-behaved:
//!
//! - `scheduled`: a deferred flush has already been requested, so further
//!   notifications only enqueue.
//! - `running`: a flush is in progress; a nested flush request is a no-op and
//!   anything enqueued meanwhile is picked up by the running flush.

use super::node::{Arena, NodeId, NodeKind};

/// Pending effect bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct EffectQueue {
    effects: Vec<NodeId>,
    render_effects: Vec<NodeId>,
    pub scheduled: bool,
    pub running: bool,
}

impl EffectQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an effect node. Returns `true` when the caller should request a
    /// deferred flush.
    pub fn enqueue(&mut self, id: NodeId, kind: NodeKind) -> bool {
        match kind {
            NodeKind::RenderEffect => self.render_effects.push(id),
            NodeKind::Effect => self.effects.push(id),
            _ => return false,
        }
        !self.scheduled
    }

    pub fn has_pending(&self) -> bool {
        !self.effects.is_empty() || !self.render_effects.is_empty()
    }

    pub fn take_render_effects(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.render_effects)
    }

    pub fn take_effects(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.effects)
    }

    pub fn pending_count(&self) -> usize {
        self.effects.len() + self.render_effects.len()
    }
}

/// Collect `id` and its ancestors that are not clean, root-most first.
///
/// An effect nested inside a stale scope must not run before that scope has
/// been brought up to date, since re-running the scope may dispose it.
pub(crate) fn stale_ancestors(arena: &Arena, id: NodeId) -> Vec<NodeId> {
    let mut ancestors = Vec::new();
    let mut current = Some(id);
    while let Some(node_id) = current {
        let Some(node) = arena.get(node_id) else {
            break;
        };
        if !node.is_clean() {
            ancestors.push(node_id);
        }
        current = node.parent;
    }
    ancestors.reverse();
    ancestors
}
