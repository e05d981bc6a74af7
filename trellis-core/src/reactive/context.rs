//! Reactive Context
//!
//! The reactive context tracks which computation is currently running and
//! which owner new nodes are created under. This enables automatic
//! dependency tracking: when a node is read, it is recorded as a source of
//! the current observer.
//!
//! # Implementation
//!
//! The state lives in the thread-local runtime and is swapped, not pushed:
//! entering a context replaces the current owner, observer and flag mask and
//! the guard puts the previous ones back when dropped. Nested evaluation (a
//! memo that reads another memo) simply nests guards.
//!
//! Source discovery for the evaluation in progress goes through a scratch
//! buffer with a same-position fast path: as long as the computation reads
//! the same sources in the same order as last time, tracking only advances an
//! index and allocates nothing.

use std::marker::PhantomData;

use smallvec::SmallVec;

use super::runtime::Runtime;
use crate::graph::{Flags, NodeId};

/// Sources discovered during one evaluation.
#[derive(Debug, Default)]
pub(crate) struct Scratch {
    /// Sources that diverged from the previous list, in discovery order.
    pub new_sources: Option<SmallVec<[NodeId; 4]>>,
    /// Length of the prefix of the previous source list that was reused.
    pub index: usize,
    /// Flags folded in from every read.
    pub flags: Flags,
}

/// Per-thread tracking state.
#[derive(Debug)]
pub(crate) struct Tracking {
    pub observer: Option<NodeId>,
    pub mask: Flags,
    pub scratch: Scratch,
}

impl Default for Tracking {
    fn default() -> Self {
        Self {
            observer: None,
            mask: Flags::DEFAULT_HANDLER,
            scratch: Scratch::default(),
        }
    }
}

impl Tracking {
    /// Record a read of `source`. `previous` is the observer's source list
    /// from its last evaluation.
    pub fn track(&mut self, source: NodeId, previous: &[NodeId]) {
        let scratch = &mut self.scratch;
        let reused = &previous[..scratch.index.min(previous.len())];

        match &mut scratch.new_sources {
            None => {
                if previous.get(scratch.index) == Some(&source) {
                    scratch.index += 1;
                } else if !reused.contains(&source) {
                    let mut list = SmallVec::new();
                    list.push(source);
                    scratch.new_sources = Some(list);
                }
            }
            Some(list) => {
                if !list.contains(&source) && !reused.contains(&source) {
                    list.push(source);
                }
            }
        }
    }
}

/// Guard that restores the previous owner and observer when dropped.
///
/// This ensures the tracking state is properly maintained even if the
/// computation panics.
pub struct ReactiveContext {
    prev_owner: Option<NodeId>,
    prev_observer: Option<NodeId>,
    prev_mask: Flags,
    _not_send: PhantomData<*const ()>,
}

impl ReactiveContext {
    /// Make `owner` the current owner and `observer` the current observer.
    ///
    /// The flag mask becomes the observer's handler mask, or the default
    /// mask when nothing is observing.
    pub(crate) fn enter(rt: &Runtime, owner: Option<NodeId>, observer: Option<NodeId>) -> Self {
        let mask = observer
            .and_then(|id| rt.nodes.borrow().get(id).map(|node| node.handler_mask))
            .unwrap_or(Flags::DEFAULT_HANDLER);

        let prev_owner = rt.owner.replace(owner);
        let mut tracking = rt.tracking.borrow_mut();
        let prev_observer = std::mem::replace(&mut tracking.observer, observer);
        let prev_mask = std::mem::replace(&mut tracking.mask, mask);

        Self {
            prev_owner,
            prev_observer,
            prev_mask,
            _not_send: PhantomData,
        }
    }

    /// Keep the current owner but stop tracking reads.
    pub(crate) fn untracked(rt: &Runtime) -> Self {
        Self::enter(rt, rt.owner.get(), None)
    }

    /// Check if a computation is currently observing reads.
    pub fn is_active() -> bool {
        Self::current_observer().is_some()
    }

    /// The computation currently observing reads, if any.
    pub fn current_observer() -> Option<NodeId> {
        Runtime::with(|rt| rt.tracking.borrow().observer)
    }

    /// The owner new nodes are created under, if any.
    pub fn current_owner() -> Option<NodeId> {
        Runtime::with(|rt| rt.owner.get())
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        let prev_owner = self.prev_owner;
        let prev_observer = self.prev_observer;
        let prev_mask = self.prev_mask;
        Runtime::try_with(|rt| {
            rt.owner.set(prev_owner);
            let mut tracking = rt.tracking.borrow_mut();
            tracking.observer = prev_observer;
            tracking.mask = prev_mask;
        });
    }
}

/// Saves the caller's scratch buffer and starts an empty one.
///
/// [`finish`](Self::finish) hands back the buffer filled by the nested
/// evaluation and reinstates the saved one. If the evaluation unwinds, the
/// saved buffer is reinstated on drop.
pub(crate) struct ScratchGuard {
    saved: Option<Scratch>,
}

impl ScratchGuard {
    pub fn new(rt: &Runtime) -> Self {
        let saved = std::mem::take(&mut rt.tracking.borrow_mut().scratch);
        Self { saved: Some(saved) }
    }

    pub fn finish(mut self, rt: &Runtime) -> Scratch {
        let saved = self.saved.take().unwrap_or_default();
        std::mem::replace(&mut rt.tracking.borrow_mut().scratch, saved)
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            Runtime::try_with(|rt| rt.tracking.borrow_mut().scratch = saved);
        }
    }
}
