//! Fuzz target for [`TimerQueue`] ordering
//!
//! # Strategy
//!
//! - Operation sequences: interleaved inserts, cancels and dispatch batches
//! - Deadline collisions: narrow deadline range forces FIFO tie-breaking
//! - Late insertions: entries added after a batch watermark is taken
//!
//! # Invariants
//!
//! - A batch pops in nondecreasing `(deadline, sequence)` order
//! - Nothing due after `now` or inserted after the watermark is popped
//! - A cancelled entry is NEVER popped
//! - `len()` matches a reference model after every operation

#![no_main]

use std::{collections::BTreeMap, time::Duration};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tidepool_core::scheduler::{TimerId, TimerQueue};

#[derive(Debug, Arbitrary)]
enum Op {
    Insert { deadline: u8 },
    Cancel { pick: u8 },
    Dispatch { now: u8, late_inserts: u8 },
}

fuzz_target!(|ops: Vec<Op>| {
    let mut queue = TimerQueue::new();
    // sequence -> deadline, live entries only
    let mut model: BTreeMap<u64, Duration> = BTreeMap::new();
    let mut issued: Vec<TimerId> = Vec::new();

    for op in ops {
        match op {
            Op::Insert { deadline } => {
                let deadline = Duration::from_millis(u64::from(deadline % 16));
                let id = queue.insert(deadline, ());
                model.insert(id.sequence(), deadline);
                issued.push(id);
            },
            Op::Cancel { pick } => {
                if issued.is_empty() {
                    continue;
                }
                let id = issued[usize::from(pick) % issued.len()];
                let was_live = model.remove(&id.sequence()).is_some();
                assert_eq!(queue.cancel(id), was_live);
            },
            Op::Dispatch { now, late_inserts } => {
                let now = Duration::from_millis(u64::from(now % 16));
                let watermark = queue.watermark();

                for _ in 0..late_inserts % 4 {
                    // Scheduled from inside the batch, so never before `now`
                    let id = queue.insert(now, ());
                    model.insert(id.sequence(), now);
                    issued.push(id);
                }

                let mut last: Option<(Duration, u64)> = None;
                while let Some(due) = queue.pop_due(now, watermark) {
                    let key = (due.deadline, due.id.sequence());
                    assert!(due.deadline <= now);
                    assert!(due.id.sequence() < watermark);
                    assert_eq!(model.remove(&due.id.sequence()), Some(due.deadline));
                    if let Some(prev) = last {
                        assert!(prev < key, "batch out of order: {prev:?} then {key:?}");
                    }
                    last = Some(key);
                }

                let leftover_due =
                    model.iter().any(|(seq, deadline)| *seq < watermark && *deadline <= now);
                assert!(!leftover_due, "due entry left behind");
            },
        }
        assert_eq!(queue.len(), model.len());
    }
});

