// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use coverage::{HitId, HitsInfo};

pub const SHARD_COUNT: usize = 64;

type Shard = RwLock<HashMap<HitId, AtomicU64>>;

/// Hit counts, sharded by id.
///
/// Counting an id that has been seen before only takes the read lock of its
/// shard. The first hit of an id takes that shard's write lock once.
pub struct HitCounters {
    shards: Box<[Shard]>,
}

impl HitCounters {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        Self { shards }
    }

    fn shard(&self, id: HitId) -> &Shard {
        &self.shards[id.0 as usize % self.shards.len()]
    }

    pub fn increment(&self, id: HitId) {
        let shard = self.shard(id);

        {
            let counts = shard.read().unwrap_or_else(PoisonError::into_inner);

            if let Some(count) = counts.get(&id) {
                count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let mut counts = shard.write().unwrap_or_else(PoisonError::into_inner);
        counts
            .entry(id)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, id: HitId) -> u64 {
        let counts = self.shard(id).read().unwrap_or_else(PoisonError::into_inner);

        counts
            .get(&id)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    /// Copy of every count. Shards are read one at a time.
    pub fn snapshot(&self) -> HitsInfo {
        let mut hits = HitsInfo::new();

        for shard in self.shards.iter() {
            let counts = shard.read().unwrap_or_else(PoisonError::into_inner);

            for (id, count) in counts.iter() {
                hits.add(*id, count.load(Ordering::Relaxed));
            }
        }

        hits
    }

    /// Number of distinct ids hit.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HitCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_concurrent_increments() {
        let counters = Arc::new(HitCounters::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counters = counters.clone();
                thread::spawn(move || {
                    for _ in 0..125 {
                        counters.increment(HitId(7));
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(counters.get(HitId(7)), 1000);
        assert_eq!(counters.len(), 1);
    }

    #[test]
    fn test_snapshot() {
        let counters = HitCounters::new();
        assert!(counters.is_empty());
        assert!(counters.snapshot().is_empty());

        counters.increment(HitId(1));
        counters.increment(HitId(1));
        counters.increment(HitId(1 + SHARD_COUNT as u32));
        counters.increment(HitId(2));

        let hits: Vec<(HitId, u64)> = counters.snapshot().iter().collect();
        assert_eq!(
            hits,
            vec![
                (HitId(1), 2),
                (HitId(2), 1),
                (HitId(1 + SHARD_COUNT as u32), 1)
            ]
        );

        assert_eq!(counters.get(HitId(3)), 0);
    }
}
