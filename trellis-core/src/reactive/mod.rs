//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, memos, and effects.
//! These primitives form the foundation of Trellis's fine-grained reactivity.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within a tracking context (such as a memo or effect), the signal
//! automatically registers that context as an observer. When the signal's
//! value changes, all observers are notified.
//!
//! ## Memos
//!
//! A Memo is a derived value that caches its result. It re-evaluates only when
//! one of its dependencies changes, and only when it is read.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its dependencies
//! change. Effects are used to synchronize reactive state with external systems.
//! They never run inline with a write; they are flushed by the host's
//! deferred scheduling primitive, or right away with [`flush_sync`].
//!
//! ## Owners
//!
//! Every node belongs to the owner that was current when it was created.
//! Disposing an owner disposes everything below it. See [`create_root`].
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local runtime to detect dependencies.
//! When a node is read, we check if there is an active observer and, if so,
//! record the dependency. Writes push staleness markers down the graph and
//! reads pull fresh values, which keeps evaluation glitch-free: no
//! computation ever sees a mix of old and new inputs.

mod context;
mod effect;
mod host;
mod memo;
mod owner;
mod runtime;
mod signal;

pub use context::ReactiveContext;
pub use effect::{create_effect, create_render_effect, flush_sync, Effect, RenderEffect};
pub use host::{
    pending_task_count, run_pending_tasks, HostScheduler, MicrotaskQueue, SyncHost, Task,
    TokioHost,
};
pub use memo::{create_memo, Memo};
pub use owner::{
    catch_error, create_root, is_tracking, on_cleanup, provide_context, run_with_owner, untrack,
    use_context, Disposer, Owner,
};
pub use signal::{create_signal, create_unique_signal, ReadSignal, Signal, WriteSignal};

use std::rc::Rc;

use crate::config::RuntimeConfig;
use runtime::Runtime;

/// Install `config` for this thread's runtime.
pub fn configure(config: RuntimeConfig) {
    tracing::debug!(?config, "configuring reactive runtime");
    Runtime::with(|rt| rt.set_config(config));
}

/// The configuration of this thread's runtime.
pub fn current_config() -> RuntimeConfig {
    Runtime::with(|rt| rt.config())
}

/// Replace the primitive used to defer effect flushes on this thread.
///
/// The default is [`MicrotaskQueue`], which the host has to drain with
/// [`run_pending_tasks`].
pub fn set_host_scheduler(host: Rc<dyn HostScheduler>) {
    Runtime::with(|rt| rt.set_host(host));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn configure_round_trips() {
        let config = RuntimeConfig {
            max_flush_rounds: 3,
            trace_propagation: true,
        };
        configure(config.clone());
        assert_eq!(current_config(), config);
        configure(RuntimeConfig::default());
    }

    #[test]
    fn default_host_defers_flush_to_pending_tasks() {
        let source = Signal::new(0);
        let effect = create_effect(move |_| source.read().map(drop)).unwrap();
        run_pending_tasks();

        source.set(1);
        assert_eq!(effect.run_count(), 1);
        assert!(pending_task_count() > 0);

        run_pending_tasks();
        assert_eq!(effect.run_count(), 2);
    }

    #[test]
    fn sync_host_runs_effects_after_the_write() {
        set_host_scheduler(Rc::new(SyncHost));
        let source = Signal::new(0);
        let seen = Rc::new(Cell::new(0));
        let sink = seen.clone();
        create_effect(move |_| {
            sink.set(source.get());
            Ok(())
        })
        .unwrap();

        source.set(7);
        assert_eq!(seen.get(), 7);
        set_host_scheduler(Rc::new(MicrotaskQueue));
    }

    #[test]
    fn flush_round_limit_leaves_work_queued() {
        configure(RuntimeConfig {
            max_flush_rounds: 2,
            ..RuntimeConfig::default()
        });
        let x = Signal::new(0);
        let y = Signal::new(0);
        // Two effects that keep re-triggering each other.
        let ping = create_effect(move |_| {
            y.set(x.get() + 1);
            Ok(())
        })
        .unwrap();
        let pong = create_effect(move |_| {
            x.set(y.get() + 1);
            Ok(())
        })
        .unwrap();

        flush_sync().unwrap();
        assert_eq!((ping.run_count(), pong.run_count()), (2, 2));

        flush_sync().unwrap();
        assert_eq!((ping.run_count(), pong.run_count()), (3, 3));

        ping.dispose();
        pong.dispose();
        configure(RuntimeConfig::default());
    }
}
