//! Pluggable 64-bit id generation for talks, messages and sessions.

use std::sync::atomic::{AtomicU64, Ordering};

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> u64;
}

/// 2020-01-01T00:00:00Z in unix milliseconds.
const EPOCH_MS: u64 = 1_577_836_800_000;
const NODE_BITS: u32 = 10;
const SEQ_BITS: u32 = 12;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;

/// Largest node number that fits the node field. Processes sharing a store
/// need distinct node numbers.
pub const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;

/// Snowflake-style ids: 41 bits of milliseconds, 10 bits of node, 12 bits of
/// sequence. Ids from one generator are strictly increasing even if the wall
/// clock steps backwards.
pub struct SnowflakeIds {
    node: u64,
    // (milliseconds << SEQ_BITS) | sequence of the last id handed out
    state: AtomicU64,
}

impl SnowflakeIds {
    pub fn new(node: u16) -> Self {
        Self {
            node: u64::from(node & MAX_NODE_ID),
            state: AtomicU64::new(0),
        }
    }

    fn now_ms() -> u64 {
        let ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        ms.saturating_sub(EPOCH_MS)
    }
}

impl Default for SnowflakeIds {
    fn default() -> Self {
        Self::new(0)
    }
}

impl IdGenerator for SnowflakeIds {
    fn next_id(&self) -> u64 {
        loop {
            let now = Self::now_ms();
            let prev = self.state.load(Ordering::Acquire);
            let prev_ms = prev >> SEQ_BITS;
            let next = if now > prev_ms {
                now << SEQ_BITS
            } else if prev & SEQ_MASK < SEQ_MASK {
                prev + 1
            } else {
                // sequence exhausted for this millisecond, borrow the next one
                (prev_ms + 1) << SEQ_BITS
            };
            if self
                .state
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let ms = next >> SEQ_BITS;
                return (ms << (NODE_BITS + SEQ_BITS)) | (self.node << SEQ_BITS) | (next & SEQ_MASK);
            }
        }
    }
}

/// Plain counter starting at 1. Predictable ids for tests.
#[derive(Default)]
pub struct SequentialIds {
    last: AtomicU64,
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn snowflake_ids_are_increasing() {
        let ids = SnowflakeIds::new(3);
        let mut last = 0;
        for _ in 0..10_000 {
            let id = ids.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn snowflake_embeds_node() {
        let id = SnowflakeIds::new(5).next_id();
        assert_eq!((id >> SEQ_BITS) & ((1 << NODE_BITS) - 1), 5);
    }

    #[test]
    fn distinct_nodes_never_collide() {
        let a = SnowflakeIds::new(1);
        let b = SnowflakeIds::new(2);
        let mut seen = HashSet::new();
        for _ in 0..2_000 {
            assert!(seen.insert(a.next_id()));
            assert!(seen.insert(b.next_id()));
        }
    }

    #[test]
    fn snowflake_unique_across_threads() {
        let ids = Arc::new(SnowflakeIds::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..2_000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8_000);
    }

    #[test]
    fn sequential_starts_at_one() {
        let ids = SequentialIds::default();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }
}
