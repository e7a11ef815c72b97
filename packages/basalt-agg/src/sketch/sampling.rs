//! Deterministic uniform sample: keep the values with the k smallest hashes.
//!
//! Hash-ordered selection makes the sample mergeable and reproducible across
//! nodes without a shared random seed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use basalt_core::Scalar;

use super::hash_scalar;

pub const DEFAULT_SAMPLE_SIZE: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinHashSample {
    k: usize,
    entries: BTreeMap<u64, Scalar>,
}

impl MinHashSample {
    pub fn new(k: usize) -> MinHashSample {
        MinHashSample {
            k: k.max(1),
            entries: BTreeMap::new(),
        }
    }

    pub fn update(&mut self, value: &Scalar) {
        if value.is_null() {
            return;
        }
        let hash = hash_scalar(value);
        self.entries.insert(hash, value.clone());
        while self.entries.len() > self.k {
            let largest = *self.entries.keys().next_back().expect("non-empty");
            self.entries.remove(&largest);
        }
    }

    pub fn merge(&mut self, other: &MinHashSample) {
        self.k = self.k.max(other.k);
        for (hash, value) in &other.entries {
            self.entries.insert(*hash, value.clone());
        }
        while self.entries.len() > self.k {
            let largest = *self.entries.keys().next_back().expect("non-empty");
            self.entries.remove(&largest);
        }
    }

    pub fn values(&self) -> Vec<Scalar> {
        self.entries.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_is_bounded_and_deduplicated() {
        let mut s = MinHashSample::new(10);
        for i in 0..1_000 {
            s.update(&Scalar::Long(i % 50));
        }
        assert_eq!(s.values().len(), 10);
    }

    #[test]
    fn test_merge_equals_whole_stream() {
        let mut a = MinHashSample::new(16);
        let mut b = MinHashSample::new(16);
        let mut whole = MinHashSample::new(16);
        for i in 0..500 {
            let v = Scalar::Long(i);
            if i % 2 == 0 {
                a.update(&v);
            } else {
                b.update(&v);
            }
            whole.update(&v);
        }
        a.merge(&b);
        assert_eq!(a, whole);
    }
}
