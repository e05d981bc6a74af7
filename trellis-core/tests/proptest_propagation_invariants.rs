//! Property-based invariant tests for propagation through random graphs.
//!
//! Each case builds a random acyclic graph of integer signals and memos,
//! applies a random sequence of writes and checks after every write that:
//!
//! 1. Every memo agrees with a direct evaluation of the graph.
//! 2. No memo computes more than once per write.
//! 3. An effect reading every memo runs at most once per flush and only ever
//!    observes a consistent snapshot.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use proptest::prelude::*;
use proptest::sample::Index;
use trellis_core::reactive::{create_effect, create_root, flush_sync, Memo, Signal};

/// Graph shape: the number of signals, then the inputs of each memo. An
/// input refers to any earlier node (signals first, then memos).
fn graph_strategy() -> impl Strategy<Value = (usize, Vec<Vec<Index>>)> {
    (
        1usize..=4,
        proptest::collection::vec(proptest::collection::vec(any::<Index>(), 1..=3), 1..=8),
    )
}

fn writes_strategy() -> impl Strategy<Value = Vec<(Index, i64)>> {
    proptest::collection::vec((any::<Index>(), -50i64..=50), 1..=16)
}

#[derive(Clone, Copy)]
enum Node {
    Source(Signal<i64>),
    Derived(Memo<i64>),
}

impl Node {
    fn get(self) -> i64 {
        match self {
            Node::Source(signal) => signal.get(),
            Node::Derived(memo) => memo.get(),
        }
    }
}

fn evaluate(signal_values: &[i64], inputs: &[Vec<usize>]) -> Vec<i64> {
    let mut values = signal_values.to_vec();
    for memo_inputs in inputs {
        let value = memo_inputs.iter().map(|&i| values[i]).sum::<i64>() + 1;
        values.push(value);
    }
    values.split_off(signal_values.len())
}

proptest! {
    #[test]
    fn memos_match_direct_evaluation(
        (signal_count, raw_inputs) in graph_strategy(),
        writes in writes_strategy(),
    ) {
        let inputs: Vec<Vec<usize>> = raw_inputs
            .iter()
            .enumerate()
            .map(|(j, memo_inputs)| {
                memo_inputs.iter().map(|index| index.index(signal_count + j)).collect()
            })
            .collect();

        create_root(|disposer| -> Result<(), TestCaseError> {
            let mut signal_values = vec![0i64; signal_count];
            let mut nodes: Vec<Node> = (0..signal_count)
                .map(|_| Node::Source(Signal::new(0)))
                .collect();

            let computes: Vec<Rc<Cell<u32>>> = inputs.iter().map(|_| Rc::new(Cell::new(0))).collect();
            let mut memos = Vec::new();
            for (memo_inputs, count) in inputs.iter().zip(&computes) {
                let sources: Vec<Node> = memo_inputs.iter().map(|&i| nodes[i]).collect();
                let count = count.clone();
                let memo = Memo::new(move |_| {
                    count.set(count.get() + 1);
                    Ok(sources.iter().map(|node| node.get()).sum::<i64>() + 1)
                });
                nodes.push(Node::Derived(memo));
                memos.push(memo);
            }

            let snapshots = Rc::new(RefCell::new(Vec::new()));
            let sink = snapshots.clone();
            let observed = memos.clone();
            let effect = create_effect(move |_| {
                let snapshot: Vec<i64> = observed.iter().map(|memo| memo.get()).collect();
                sink.borrow_mut().push(snapshot);
                Ok(())
            })
            .map_err(|error| TestCaseError::fail(error.to_string()))?;

            prop_assert_eq!(
                snapshots.borrow().last().cloned(),
                Some(evaluate(&signal_values, &inputs))
            );

            for (target, value) in &writes {
                let target = target.index(signal_count);
                signal_values[target] = *value;

                let before: Vec<u32> = computes.iter().map(|count| count.get()).collect();
                let runs_before = effect.run_count();

                if let Node::Source(signal) = nodes[target] {
                    signal.set(*value);
                }
                flush_sync().map_err(|error| TestCaseError::fail(error.to_string()))?;

                let expected = evaluate(&signal_values, &inputs);
                let actual: Vec<i64> = memos.iter().map(|memo| memo.get()).collect();
                prop_assert_eq!(&actual, &expected);

                for (count, before) in computes.iter().zip(&before) {
                    prop_assert!(count.get() - before <= 1);
                }
                prop_assert!(effect.run_count() - runs_before <= 1);
                prop_assert_eq!(snapshots.borrow().last().cloned(), Some(expected));
            }

            disposer.dispose();
            Ok(())
        })?;
    }
}
