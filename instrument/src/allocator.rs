// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicU32, Ordering};

use coverage::HitId;

/// Source of hit ids for one instrumentation run.
///
/// Shared by every assembly of the run, so ids never collide across assemblies.
#[derive(Debug)]
pub struct HitIdAllocator {
    next: AtomicU32,
}

impl HitIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// The next id, or `None` once the id space is used up.
    pub fn next(&self) -> Option<HitId> {
        self.reserve(1).and_then(|mut ids| ids.next())
    }

    /// Reserve `count` consecutive ids, or none at all if fewer remain.
    pub fn reserve(&self, count: u32) -> Option<impl Iterator<Item = HitId>> {
        let first = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                next.checked_add(count)
            })
            .ok()?;

        Some((first..first + count).map(HitId))
    }

    /// The id the next call to `next()` will return.
    pub fn peek(&self) -> HitId {
        HitId(self.next.load(Ordering::Relaxed))
    }
}

impl Default for HitIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_ids_are_unique_across_threads() {
        let allocator = Arc::new(HitIdAllocator::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                thread::spawn(move || {
                    (0..500)
                        .filter_map(|_| allocator.next())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(ids.insert(id), "duplicate {id}");
            }
        }

        assert_eq!(ids.len(), 4000);
        assert_eq!(allocator.peek(), HitId(4001));
    }

    #[test]
    fn test_exhausted() {
        let allocator = HitIdAllocator::starting_at(u32::MAX - 3);

        let ids: Vec<HitId> = allocator.reserve(2).into_iter().flatten().collect();
        assert_eq!(ids, vec![HitId(u32::MAX - 3), HitId(u32::MAX - 2)]);

        // A block that does not fit takes nothing.
        assert!(allocator.reserve(2).is_none());
        assert_eq!(allocator.peek(), HitId(u32::MAX - 1));

        assert_eq!(allocator.next(), Some(HitId(u32::MAX - 1)));
        assert_eq!(allocator.next(), None);
        assert_eq!(allocator.peek(), HitId(u32::MAX));
    }
}
