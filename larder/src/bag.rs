// Copyright 2026 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt::Debug, hash::Hash};

use hashbrown::HashMap;
use larder_common::{fatal, fatal_assert};
use rand::{rngs::SmallRng, Rng, SeedableRng};

/// Default number of members sampled per victim selection.
pub const DEFAULT_EVICTION_SAMPLES: usize = 5;

/// Unordered set of cached pages with an aggregate byte size and randomized victim selection.
///
/// Membership is O(1) to test, add and remove. Victims are chosen by sampling a fixed number of
/// members uniformly at random and keeping the one least recently accessed, which approximates
/// LRU without maintaining any order on access.
pub struct EvictionBag<K> {
    members: Vec<K>,
    positions: HashMap<K, usize>,
    size: u64,
    samples: usize,
    rng: SmallRng,
}

impl<K> Debug for EvictionBag<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionBag")
            .field("len", &self.members.len())
            .field("size", &self.size)
            .field("samples", &self.samples)
            .finish()
    }
}

impl<K> Default for EvictionBag<K>
where
    K: Copy + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new(DEFAULT_EVICTION_SAMPLES)
    }
}

impl<K> EvictionBag<K>
where
    K: Copy + Eq + Hash + Debug,
{
    /// Create an empty bag sampling `samples` members per selection.
    pub fn new(samples: usize) -> Self {
        Self::with_rng(samples, SmallRng::from_rng(&mut rand::rng()))
    }

    /// Create an empty bag with a deterministic sampling sequence.
    pub fn with_seed(samples: usize, seed: u64) -> Self {
        Self::with_rng(samples, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(samples: usize, rng: SmallRng) -> Self {
        fatal_assert!(samples > 0, "eviction bag must sample at least one member");
        Self {
            members: vec![],
            positions: HashMap::new(),
            size: 0,
            samples,
            rng,
        }
    }

    /// Insert `key`, accounting `size` bytes to the bag.
    ///
    /// A page belongs to at most one bag; adding a member twice is fatal.
    pub fn add(&mut self, key: K, size: u64) {
        if self.positions.insert(key, self.members.len()).is_some() {
            fatal!("{key:?} added to an eviction bag twice");
        }
        self.members.push(key);
        self.size += size;
    }

    /// Remove `key`, releasing `size` bytes from the bag.
    ///
    /// Removing a non-member or releasing more bytes than accounted is fatal.
    pub fn remove(&mut self, key: K, size: u64) {
        let Some(pos) = self.positions.remove(&key) else {
            fatal!("{key:?} removed from an eviction bag it is not in");
        };
        fatal_assert!(
            self.size >= size,
            "eviction bag size underflow: removing {size} bytes of {key:?} from {}",
            self.size
        );
        self.size -= size;

        self.members.swap_remove(pos);
        if let Some(moved) = self.members.get(pos) {
            self.positions.insert(*moved, pos);
        }
    }

    /// Returns `true` if `key` is a member.
    pub fn has(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    /// Aggregate byte size of the members.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns `true` if the bag has no member.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.members.iter()
    }

    /// Sample members and return the one with the largest age, `time_offset - access_time(key)`.
    ///
    /// The age is computed with wrapping subtraction, so a clock that overflowed between two
    /// accesses yields a small age instead of a huge one. Returns `None` if the bag is empty.
    pub fn select_oldish<F>(&mut self, time_offset: u64, access_time: F) -> Option<K>
    where
        F: Fn(&K) -> u64,
    {
        if self.members.is_empty() {
            return None;
        }
        let mut oldest: Option<(K, u64)> = None;
        for _ in 0..self.samples {
            let key = self.members[self.rng.random_range(0..self.members.len())];
            oldest = older(oldest, key, time_offset.wrapping_sub(access_time(&key)));
        }
        oldest.map(|(key, _)| key)
    }

    /// Like [`EvictionBag::select_oldish`], but samples uniformly across the members of `self`
    /// and `other` together, so each bag contributes in proportion to its member count.
    pub fn select_oldish2<F>(&mut self, other: &EvictionBag<K>, time_offset: u64, access_time: F) -> Option<K>
    where
        F: Fn(&K) -> u64,
    {
        let total = self.members.len() + other.members.len();
        if total == 0 {
            return None;
        }
        let mut oldest: Option<(K, u64)> = None;
        for _ in 0..self.samples {
            let index = self.rng.random_range(0..total);
            let key = match self.members.get(index) {
                Some(key) => *key,
                None => other.members[index - self.members.len()],
            };
            oldest = older(oldest, key, time_offset.wrapping_sub(access_time(&key)));
        }
        oldest.map(|(key, _)| key)
    }
}

#[inline(always)]
fn older<K>(current: Option<(K, u64)>, key: K, age: u64) -> Option<(K, u64)> {
    match current {
        Some((_, oldest)) if oldest >= age => current,
        _ => Some((key, age)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use itertools::Itertools;

    use super::*;

    #[test_log::test]
    fn test_add_remove_accounting() {
        let mut bag = EvictionBag::with_seed(5, 42);
        bag.add(1u64, 100);
        bag.add(2u64, 200);
        assert_eq!(bag.size(), 300);
        bag.remove(1, 100);
        assert_eq!(bag.size(), 200);
        assert!(!bag.has(&1));
        assert!(bag.has(&2));
        assert_eq!(bag.len(), 1);
    }

    #[test_log::test]
    fn test_swap_remove_keeps_positions() {
        let mut bag = EvictionBag::with_seed(5, 7);
        for i in 0..10u64 {
            bag.add(i, 1);
        }
        for i in [0, 9, 4, 5] {
            bag.remove(i, 1);
        }
        let members = bag.iter().copied().sorted().collect_vec();
        assert_eq!(members, vec![1, 2, 3, 6, 7, 8]);
        for i in members {
            bag.remove(i, 1);
        }
        assert!(bag.is_empty());
        assert_eq!(bag.size(), 0);
    }

    #[test_log::test]
    #[should_panic(expected = "eviction bag size underflow")]
    fn test_size_underflow_is_fatal() {
        let mut bag = EvictionBag::with_seed(5, 0);
        bag.add(1u64, 10);
        bag.remove(1, 11);
    }

    #[test_log::test]
    #[should_panic(expected = "added to an eviction bag twice")]
    fn test_double_add_is_fatal() {
        let mut bag = EvictionBag::with_seed(5, 0);
        bag.add(1u64, 10);
        bag.add(1u64, 10);
    }

    #[test_log::test]
    fn test_select_oldish_empty() {
        let mut a = EvictionBag::<u64>::with_seed(5, 0);
        let b = EvictionBag::<u64>::with_seed(5, 1);
        assert_eq!(a.select_oldish(100, |_| 0), None);
        assert_eq!(a.select_oldish2(&b, 100, |_| 0), None);
    }

    #[test_log::test]
    fn test_select_oldish_prefers_old() {
        let mut bag = EvictionBag::with_seed(5, 3);
        for i in 0..3u64 {
            bag.add(i, 1);
        }
        // With 3 members and 5 samples the oldest is almost always drawn; count how often.
        let access = |k: &u64| [10u64, 90, 50][*k as usize];
        let hits = (0..1000).filter(|_| bag.select_oldish(100, access) == Some(0)).count();
        assert!(hits > 800, "oldest selected {hits} times");
    }

    #[test_log::test]
    fn test_select_oldish_wraps_clock() {
        let mut bag = EvictionBag::with_seed(1, 11);
        bag.add(1u64, 1);
        bag.add(2u64, 1);
        // Key 1 was accessed just before the clock wrapped, key 2 long before.
        let access = |k: &u64| if *k == 1 { u64::MAX - 1 } else { u64::MAX - 1000 };
        let time = 5;
        for _ in 0..100 {
            let key = bag.select_oldish(time, access).unwrap();
            assert!(bag.has(&key));
        }
        let mut bag = EvictionBag::with_seed(64, 11);
        bag.add(1u64, 1);
        bag.add(2u64, 1);
        assert_eq!(bag.select_oldish(time, access), Some(2));
    }

    #[test_log::test]
    fn test_select_oldish2_is_proportional() {
        let mut small = EvictionBag::with_seed(1, 5);
        let mut large = EvictionBag::with_seed(1, 6);
        for i in 0..100u64 {
            small.add(i, 1);
        }
        for i in 100..400u64 {
            large.add(i, 1);
        }

        let trials = 40_000;
        let mut counts = BTreeMap::new();
        for _ in 0..trials {
            let key = small.select_oldish2(&large, 0, |_| 0).unwrap();
            *counts.entry(key < 100).or_insert(0usize) += 1;
        }
        let from_small = counts[&true] as f64 / trials as f64;
        assert!((from_small - 0.25).abs() < 0.02, "small bag share: {from_small}");

        // Any sample count only returns members.
        let mut small = EvictionBag::with_seed(5, 8);
        small.add(1000u64, 1);
        for _ in 0..100 {
            let key = small.select_oldish2(&large, 7, |k| *k).unwrap();
            assert!(small.has(&key) || large.has(&key));
        }
    }
}
