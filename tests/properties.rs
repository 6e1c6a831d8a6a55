//! Property tests: interval coverage, monotonic writes and pool reuse.

use proptest::prelude::*;
use statehistory::{
    AttributePool, InMemoryBackend, PoolOrder, StateError, StateSystem, StateValue, Timestamp,
};

fn in_memory() -> StateSystem {
    StateSystem::new(Box::new(InMemoryBackend::new("props", 0)))
}

proptest! {
    #[test]
    fn prop_history_covers_store_range(
        steps in prop::collection::vec((1i64..50, 0usize..3, 0i32..4), 1..80),
        tail in 0i64..100,
    ) {
        let ss = in_memory();
        let quarks: Vec<_> = ["A", "B", "C"]
            .iter()
            .map(|name| ss.quark_absolute_and_add(&[*name]).unwrap())
            .collect();

        let mut t: Timestamp = 0;
        for (delta, attr, value) in steps {
            t += delta;
            let v = if value == 0 { StateValue::Null } else { StateValue::Int(value) };
            ss.modify_attribute(t, v, quarks[attr]).unwrap();
        }
        let end = t + tail;
        ss.close_history(end).unwrap();

        for &q in &quarks {
            let range = ss.query_history_range(q, 0, end, 0).unwrap();
            prop_assert_eq!(range.first().unwrap().start, 0);
            prop_assert_eq!(range.last().unwrap().end, end);
            for pair in range.windows(2) {
                prop_assert_eq!(pair[0].end + 1, pair[1].start);
                prop_assert_ne!(&pair[0].value, &pair[1].value);
            }
        }
    }

    #[test]
    fn prop_monotonic_writes(
        deltas in prop::collection::vec(1i64..1000, 1..50),
        back in 1i64..1000,
    ) {
        let ss = in_memory();
        let q = ss.quark_absolute_and_add(&["A"]).unwrap();

        let mut t: Timestamp = 0;
        for (i, delta) in deltas.iter().enumerate() {
            t += delta;
            prop_assert!(ss.modify_attribute(t, StateValue::Long(i as i64), q).is_ok());
        }

        let late = t - back;
        let result = ss.modify_attribute(late, StateValue::Long(-1), q);
        prop_assert!(
            matches!(result, Err(StateError::OutOfOrder { .. })),
            "write at {} after {} was accepted",
            late,
            t
        );
    }

    #[test]
    fn prop_pool_never_shares_live_quarks(
        ops in prop::collection::vec(any::<bool>(), 1..100),
        priority in any::<bool>(),
    ) {
        let ss = in_memory();
        let base = ss.quark_absolute_and_add(&["Pool"]).unwrap();
        let order = if priority { PoolOrder::Priority } else { PoolOrder::Fifo };
        let mut pool = AttributePool::new(&ss, base, order).unwrap();

        let mut live = Vec::new();
        let mut created = std::collections::HashSet::new();
        for (t, acquire) in ops.into_iter().enumerate() {
            let t = t as Timestamp;
            if acquire || live.is_empty() {
                let q = pool.acquire(&ss).unwrap();
                prop_assert!(!live.contains(&q));
                live.push(q);
                created.insert(q);
            } else {
                let q = live.remove(0);
                pool.release(&ss, q, t).unwrap();
            }
            prop_assert_eq!(pool.in_use_count(), live.len());
        }
        // Every quark ever handed out is either live or back in the pool.
        prop_assert_eq!(created.len(), pool.in_use_count() + pool.available_count());
    }
}
