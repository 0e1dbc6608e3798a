//! Property-based invariant tests for the barrier join counter.
//!
//! 1. Waiters never fire while work is pending.
//! 2. Every waiter fires exactly once, at the first zero crossing after it
//!    was registered (or immediately when registered at zero).
//! 3. A token completes its unit at most once; re-invocation is reported
//!    and leaves the count unchanged.
//! 4. The pending count always equals issued tokens minus completed ones.

use std::cell::Cell;
use std::rc::Rc;

use proptest::prelude::*;
use ripple_core::{Barrier, Error, PendingToken, Scheduler};

// ── Strategies ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Pending,
    Complete(usize),
    Reinvoke(usize),
    Wait,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Pending),
        3 => any::<usize>().prop_map(Op::Complete),
        1 => any::<usize>().prop_map(Op::Reinvoke),
        2 => Just(Op::Wait),
    ]
}

// ── Model ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ModelState {
    pending: usize,
    waiting: usize,
    fired: usize,
}

proptest! {
    #[test]
    fn barrier_matches_counting_model(ops in proptest::collection::vec(op_strategy(), 1..80)) {
        let barrier = Barrier::new("prop", Scheduler::default(), false);
        let fired = Rc::new(Cell::new(0usize));
        let mut open: Vec<PendingToken> = Vec::new();
        let mut used: Vec<PendingToken> = Vec::new();
        let mut model = ModelState::default();

        for op in ops {
            match op {
                Op::Pending => {
                    open.push(barrier.pending());
                    model.pending += 1;
                }
                Op::Complete(i) => {
                    if open.is_empty() {
                        continue;
                    }
                    let token = open.remove(i % open.len());
                    token.invoke().unwrap();
                    used.push(token);
                    model.pending -= 1;
                    if model.pending == 0 {
                        model.fired += model.waiting;
                        model.waiting = 0;
                    }
                }
                Op::Reinvoke(i) => {
                    if used.is_empty() {
                        continue;
                    }
                    let token = &used[i % used.len()];
                    let err = token.invoke().unwrap_err();
                    prop_assert_eq!(err, Error::TokenReused { barrier: "prop".into() });
                }
                Op::Wait => {
                    let f = Rc::clone(&fired);
                    barrier.wait_for_all(move || f.set(f.get() + 1), true);
                    if model.pending == 0 {
                        model.fired += 1;
                    } else {
                        model.waiting += 1;
                    }
                }
            }

            prop_assert_eq!(barrier.pending_count(), model.pending);
            prop_assert_eq!(barrier.waiter_count(), model.waiting);
            prop_assert_eq!(fired.get(), model.fired);
        }
    }

    #[test]
    fn deferred_tokens_complete_on_flush(n in 1usize..20) {
        let sched = Scheduler::default();
        let barrier = Barrier::new("deferred", sched.clone(), false);
        let fired = Rc::new(Cell::new(0usize));
        let tokens: Vec<_> = (0..n).map(|_| barrier.pending_with(|| {}, false)).collect();
        let f = Rc::clone(&fired);
        barrier.wait_for_all(move || f.set(f.get() + 1), true);

        for token in &tokens {
            token.invoke().unwrap();
        }
        prop_assert_eq!(fired.get(), 0);
        prop_assert_eq!(barrier.pending_count(), n);

        prop_assert_eq!(sched.run_until_idle(), n);
        prop_assert_eq!(fired.get(), 1);
        prop_assert!(barrier.is_idle());
    }
}
