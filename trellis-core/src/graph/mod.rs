//! Dependency Graph
//!
//! This module holds the storage side of the runtime: the node arena, the
//! status flags, the ownership tree and the pending effect queue.
//!
//! # Overview
//!
//! Every signal, memo, effect and plain owner is one [`node`] record in a
//! `slotmap` arena. Two independent relations connect the records:
//!
//! - Ownership: a parent/sibling chain that scopes lifetime. Disposing an
//!   owner disposes everything created under it.
//! - Dependency: each computation lists its sources in discovery order, and
//!   each source lists its observers. The two lists are kept symmetric.
//!
//! # Design Decisions
//!
//! 1. Nodes are addressed by arena keys rather than shared pointers, so the
//!    ownership tree and the dependency edges can point in every direction
//!    without reference cycles.
//!
//! 2. A disposed node is removed from the arena. Stale keys stop resolving,
//!    which is how reads of disposed nodes are detected.
//!
//! 3. The functions here never call user code. They hand callbacks back to
//!    the runtime so it can run them without holding a borrow.

mod flags;
pub(crate) mod node;
pub(crate) mod owner;
pub(crate) mod scheduler;

pub use flags::Flags;
pub use node::{NodeId, NodeKind, NodeState};
