//! KMV theta sketch: keep the k smallest hashes, estimate from the kth.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use basalt_core::Scalar;

use super::hash_scalar;

pub const DEFAULT_NOMINAL_ENTRIES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThetaSketch {
    k: usize,
    /// Hashes strictly below theta are retained.
    theta: u64,
    hashes: BTreeSet<u64>,
}

impl ThetaSketch {
    pub fn new(k: usize) -> ThetaSketch {
        ThetaSketch {
            k: k.max(16),
            theta: u64::MAX,
            hashes: BTreeSet::new(),
        }
    }

    pub fn nominal_entries(&self) -> usize {
        self.k
    }

    pub fn update(&mut self, value: &Scalar) {
        if value.is_null() {
            return;
        }
        self.update_hash(hash_scalar(value));
    }

    fn update_hash(&mut self, hash: u64) {
        if hash >= self.theta {
            return;
        }
        self.hashes.insert(hash);
        self.trim();
    }

    fn trim(&mut self) {
        while self.hashes.len() > self.k {
            let largest = *self.hashes.iter().next_back().expect("non-empty");
            self.hashes.remove(&largest);
            self.theta = largest;
        }
    }

    pub fn union(&mut self, other: &ThetaSketch) {
        self.theta = self.theta.min(other.theta);
        self.k = self.k.max(other.k);
        let theta = self.theta;
        self.hashes.retain(|h| *h < theta);
        for h in &other.hashes {
            if *h < theta {
                self.hashes.insert(*h);
            }
        }
        self.trim();
    }

    pub fn intersect(&self, other: &ThetaSketch) -> ThetaSketch {
        let theta = self.theta.min(other.theta);
        let hashes: BTreeSet<u64> = self
            .hashes
            .iter()
            .filter(|h| **h < theta && other.hashes.contains(h))
            .copied()
            .collect();
        ThetaSketch {
            k: self.k.max(other.k),
            theta,
            hashes,
        }
    }

    pub fn a_not_b(&self, other: &ThetaSketch) -> ThetaSketch {
        let theta = self.theta.min(other.theta);
        let hashes: BTreeSet<u64> = self
            .hashes
            .iter()
            .filter(|h| **h < theta && !other.hashes.contains(h))
            .copied()
            .collect();
        ThetaSketch {
            k: self.k,
            theta,
            hashes,
        }
    }

    pub fn estimate(&self) -> f64 {
        if self.theta == u64::MAX {
            return self.hashes.len() as f64;
        }
        let theta_fraction = self.theta as f64 / u64::MAX as f64;
        self.hashes.len() as f64 / theta_fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_below_k() {
        let mut s = ThetaSketch::new(64);
        for i in 0..50 {
            s.update(&Scalar::Long(i));
        }
        assert_eq!(s.estimate(), 50.0);
    }

    #[test]
    fn test_estimate_above_k() {
        let mut s = ThetaSketch::new(512);
        for i in 0..20_000 {
            s.update(&Scalar::String(format!("id-{i}")));
        }
        let est = s.estimate();
        assert!((est - 20_000.0).abs() / 20_000.0 < 0.15, "estimate {est}");
    }

    #[test]
    fn test_union_and_intersection() {
        let mut a = ThetaSketch::new(256);
        let mut b = ThetaSketch::new(256);
        for i in 0..1_000 {
            a.update(&Scalar::Long(i));
        }
        for i in 500..1_500 {
            b.update(&Scalar::Long(i));
        }
        let inter = a.intersect(&b);
        let est = inter.estimate();
        assert!((est - 500.0).abs() < 150.0, "intersection {est}");
        a.union(&b);
        let est = a.estimate();
        assert!((est - 1_500.0).abs() / 1_500.0 < 0.15, "union {est}");
    }
}
