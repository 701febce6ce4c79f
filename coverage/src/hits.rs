// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{btree_map, BTreeMap};

use serde::{Deserialize, Serialize};

use crate::map::HitId;

/// Hit counts by `HitId`. Absent ids were never hit.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HitsInfo {
    counts: BTreeMap<HitId, u64>,
}

impl HitsInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: HitId) -> u64 {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    pub fn is_hit(&self, id: HitId) -> bool {
        self.get(id) > 0
    }

    pub fn add(&mut self, id: HitId, count: u64) {
        if count == 0 {
            return;
        }

        let total = self.counts.entry(id).or_insert(0);
        *total = total.saturating_add(count);
    }

    /// Sum the counts of `other` into `self`.
    pub fn merge(&mut self, other: &HitsInfo) {
        for (id, count) in other.iter() {
            self.add(id, count);
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HitId, u64)> + '_ {
        self.counts.iter().map(|(id, count)| (*id, *count))
    }
}

impl FromIterator<(HitId, u64)> for HitsInfo {
    fn from_iter<I: IntoIterator<Item = (HitId, u64)>>(iter: I) -> Self {
        let mut hits = HitsInfo::new();

        for (id, count) in iter {
            hits.add(id, count);
        }

        hits
    }
}

impl IntoIterator for HitsInfo {
    type Item = (HitId, u64);
    type IntoIter = btree_map::IntoIter<HitId, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.counts.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn hits(pairs: &[(u32, u64)]) -> HitsInfo {
        pairs.iter().map(|(id, n)| (HitId(*id), *n)).collect()
    }

    #[test]
    fn test_merge_sums_counts() {
        let files = [hits(&[(1, 5)]), hits(&[(1, 3)]), hits(&[(2, 7)])];
        let expected = hits(&[(1, 8), (2, 7)]);

        for order in [[0, 1, 2], [2, 1, 0], [1, 2, 0]] {
            let mut merged = HitsInfo::new();
            for index in order {
                merged.merge(&files[index]);
            }
            assert_eq!(merged, expected);
        }
    }

    #[test]
    fn test_zero_counts_are_not_hits() {
        let info = hits(&[(1, 0), (2, 1)]);
        assert_eq!(info.len(), 1);
        assert!(!info.is_hit(HitId(1)));
        assert!(info.is_hit(HitId(2)));
        assert_eq!(info.get(HitId(3)), 0);
    }

    proptest! {
        #[test]
        fn merge_is_order_independent(
            files in prop::collection::vec(
                prop::collection::vec((0u32..16, 0u64..1000), 0..8),
                0..6,
            )
        ) {
            let files: Vec<HitsInfo> = files.iter().map(|f| hits(f)).collect();

            let mut forward = HitsInfo::new();
            for file in &files {
                forward.merge(file);
            }

            let mut backward = HitsInfo::new();
            for file in files.iter().rev() {
                backward.merge(file);
            }

            prop_assert_eq!(forward, backward);
        }
    }
}
