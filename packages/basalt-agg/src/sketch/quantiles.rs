//! Mergeable sampled-quantile sketch.
//!
//! Keeps a bounded sorted sample with a per-sample weight; compaction keeps
//! alternating elements and doubles the weight, which is deterministic and
//! merge-stable. Accuracy degrades gracefully as weight grows.

use serde::{Deserialize, Serialize};

use basalt_core::Scalar;

pub const DEFAULT_MAX_SAMPLES: usize = 2048;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantilesSketch {
    max_samples: usize,
    weight: u64,
    /// Kept sorted ascending.
    samples: Vec<f64>,
    count: u64,
    min: f64,
    max: f64,
}

impl QuantilesSketch {
    pub fn new(max_samples: usize) -> QuantilesSketch {
        QuantilesSketch {
            max_samples: max_samples.max(32),
            weight: 1,
            samples: Vec::new(),
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn update(&mut self, value: &Scalar) {
        let Some(v) = value.as_double() else {
            return;
        };
        self.count += 1;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        // with weight w, keep every wth input to stay uniform
        if self.count % self.weight == 0 {
            let idx = self.samples.partition_point(|s| *s < v);
            self.samples.insert(idx, v);
            if self.samples.len() > self.max_samples {
                self.compact();
            }
        }
    }

    fn compact(&mut self) {
        let kept: Vec<f64> = self.samples.iter().copied().step_by(2).collect();
        self.samples = kept;
        self.weight *= 2;
    }

    pub fn merge(&mut self, other: &QuantilesSketch) {
        if other.count == 0 {
            return;
        }
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.max_samples = self.max_samples.max(other.max_samples);

        // align weights before concatenating
        let mut theirs = other.samples.clone();
        let mut their_weight = other.weight;
        while self.weight > their_weight {
            theirs = theirs.iter().copied().step_by(2).collect();
            their_weight *= 2;
        }
        while their_weight > self.weight {
            self.compact();
        }
        self.samples.extend(theirs);
        self.samples.sort_by(|a, b| a.partial_cmp(b).expect("no NaN samples"));
        while self.samples.len() > self.max_samples {
            self.compact();
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Quantile at `q` in [0, 1].
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        if q <= 0.0 {
            return Some(self.min);
        }
        if q >= 1.0 {
            return Some(self.max);
        }
        let idx = ((self.samples.len() as f64 - 1.0) * q).round() as usize;
        Some(self.samples[idx])
    }

    pub fn quantiles(&self, qs: &[f64]) -> Vec<Option<f64>> {
        qs.iter().map(|q| self.quantile(*q)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_of_uniform_stream() {
        let mut s = QuantilesSketch::new(256);
        for i in 0..10_000 {
            s.update(&Scalar::Long(i));
        }
        let median = s.quantile(0.5).unwrap();
        assert!((median - 5_000.0).abs() < 500.0, "median {median}");
        assert_eq!(s.quantile(0.0), Some(0.0));
        assert_eq!(s.quantile(1.0), Some(9_999.0));
    }

    #[test]
    fn test_merge_of_split_stream() {
        let mut a = QuantilesSketch::new(256);
        let mut b = QuantilesSketch::new(256);
        for i in 0..5_000 {
            a.update(&Scalar::Long(i));
            b.update(&Scalar::Long(5_000 + i));
        }
        a.merge(&b);
        assert_eq!(a.count(), 10_000);
        let median = a.quantile(0.5).unwrap();
        assert!((median - 5_000.0).abs() < 700.0, "median {median}");
    }
}
