//! Property-based invariant tests for the timer queue.
//!
//! 1. Expired timers come out in non-decreasing deadline order
//! 2. Cancelled timers never fire
//! 3. `len()` always equals scheduled minus cancelled minus fired

use core::time::Duration;

use iopar_reactor::TimerQueue;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Schedule(u64),
    Cancel(usize),
    Advance(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..500).prop_map(Op::Schedule),
        (0usize..64).prop_map(Op::Cancel),
        (0u64..200).prop_map(Op::Advance),
    ]
}

proptest! {
    #[test]
    fn timers_fire_in_order_and_cancel_sticks(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let mut q = TimerQueue::new();
        let mut now = Duration::ZERO;
        let mut handles = Vec::new();
        let mut cancelled = std::collections::HashSet::new();
        let mut last_fired = Duration::ZERO;
        let mut live = 0usize;

        for op in ops {
            match op {
                Op::Schedule(delay) => {
                    let at = now + Duration::from_millis(delay);
                    handles.push(q.schedule_at(at, handles.len()));
                    live += 1;
                }
                Op::Cancel(idx) => {
                    if let Some(h) = handles.get(idx) {
                        if q.cancel(*h) {
                            cancelled.insert(idx);
                            live -= 1;
                        }
                    }
                }
                Op::Advance(step) => {
                    now += Duration::from_millis(step);
                    while let Some(exp) = q.pop_expired(now) {
                        prop_assert!(exp.deadline <= now);
                        prop_assert!(exp.deadline >= last_fired);
                        prop_assert!(!cancelled.contains(&exp.target));
                        last_fired = exp.deadline;
                        live -= 1;
                    }
                }
            }
            prop_assert_eq!(q.len(), live);
        }
    }
}
