//! Trellis Core
//!
//! This crate provides the runtime of the Trellis fine-grained reactive
//! engine. It implements:
//!
//! - Reactive primitives (signals, memos, effects, render effects)
//! - Glitch-free push/pull propagation with lazy re-evaluation
//! - An ownership tree that scopes lifetimes and cascades disposal
//! - Deferred, batched effect scheduling behind a pluggable host primitive
//! - Error and loading status bits that travel alongside values
//!
//! Everything is single-threaded: each thread has its own runtime and the
//! handles are neither `Send` nor `Sync`.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: public handles, the runtime and dependency tracking
//! - `graph`: node arena, status flags, ownership tree and effect queue
//! - `error`: the error type returned by reads and flushes
//! - `config`: per-thread runtime tunables
//!
//! # Example
//!
//! ```rust
//! use trellis_core::reactive::{create_effect, create_memo, flush_sync, Signal};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! // Create a signal
//! let count = Signal::new(1);
//!
//! // Create a derived value
//! let doubled = create_memo(move |_| Ok(count.get() * 2));
//!
//! // Create an effect
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let sink = log.clone();
//! create_effect(move |_| {
//!     sink.borrow_mut().push(doubled.get());
//!     Ok(())
//! })
//! .unwrap();
//!
//! // Update the signal; the effect runs at the next flush
//! count.set(5);
//! flush_sync().unwrap();
//! assert_eq!(*log.borrow(), vec![2, 10]);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use config::RuntimeConfig;
pub use error::{ComputeError, ReactiveError, ReactiveResult};
pub use graph::{Flags, NodeId, NodeKind, NodeState};
pub use reactive::{
    catch_error, configure, create_effect, create_memo, create_render_effect, create_root,
    create_signal, flush_sync, on_cleanup, run_with_owner, untrack, Effect, Memo, Owner,
    RenderEffect, Signal,
};
