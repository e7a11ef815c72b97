//! Streaming approximate histogram (centroid binning).
//!
//! Online updates insert a unit-count centroid and, past the resolution
//! limit, merge the closest pair. Folding another histogram replays its
//! centroids. The finalizer emits an equal-width bucket histogram.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproxHistogram {
    resolution: usize,
    num_buckets: usize,
    lower_limit: Option<f64>,
    upper_limit: Option<f64>,
    /// Centroid positions, sorted ascending, with parallel counts.
    positions: Vec<f64>,
    counts: Vec<i64>,
    min: f64,
    max: f64,
    total: i64,
}

impl ApproxHistogram {
    pub fn new(
        resolution: usize,
        num_buckets: usize,
        lower_limit: Option<f64>,
        upper_limit: Option<f64>,
    ) -> ApproxHistogram {
        ApproxHistogram {
            resolution: resolution.max(2),
            num_buckets: num_buckets.max(1),
            lower_limit,
            upper_limit,
            positions: Vec::new(),
            counts: Vec::new(),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            total: 0,
        }
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    pub fn limits(&self) -> (Option<f64>, Option<f64>) {
        (self.lower_limit, self.upper_limit)
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn update(&mut self, value: f64) {
        self.insert(self.clamp(value), 1);
    }

    fn clamp(&self, value: f64) -> f64 {
        let mut v = value;
        if let Some(lo) = self.lower_limit {
            v = v.max(lo);
        }
        if let Some(hi) = self.upper_limit {
            v = v.min(hi);
        }
        v
    }

    fn insert(&mut self, value: f64, count: i64) {
        if count <= 0 || value.is_nan() {
            return;
        }
        self.total += count;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let idx = self.positions.partition_point(|p| *p < value);
        if idx < self.positions.len() && self.positions[idx] == value {
            self.counts[idx] += count;
            return;
        }
        self.positions.insert(idx, value);
        self.counts.insert(idx, count);
        if self.positions.len() > self.resolution {
            self.merge_closest();
        }
    }

    fn merge_closest(&mut self) {
        let mut best = 0;
        let mut best_gap = f64::INFINITY;
        for i in 0..self.positions.len() - 1 {
            let gap = self.positions[i + 1] - self.positions[i];
            if gap < best_gap {
                best_gap = gap;
                best = i;
            }
        }
        let c1 = self.counts[best];
        let c2 = self.counts[best + 1];
        let merged_count = c1 + c2;
        let merged_pos = (self.positions[best] * c1 as f64
            + self.positions[best + 1] * c2 as f64)
            / merged_count as f64;
        self.positions[best] = merged_pos;
        self.counts[best] = merged_count;
        self.positions.remove(best + 1);
        self.counts.remove(best + 1);
    }

    /// Fold another histogram in by replaying its centroids.
    pub fn fold(&mut self, other: &ApproxHistogram) {
        for (pos, count) in other.positions.iter().zip(other.counts.iter()) {
            self.insert(self.clamp(*pos), *count);
        }
    }

    /// Widening rules when two factories over the same metric merge:
    /// resolution = max, lower = min, upper = max.
    pub fn widen(a: &ApproxHistogram, b: &ApproxHistogram) -> ApproxHistogram {
        let lower = match (a.lower_limit, b.lower_limit) {
            (Some(x), Some(y)) => Some(x.min(y)),
            _ => None,
        };
        let upper = match (a.upper_limit, b.upper_limit) {
            (Some(x), Some(y)) => Some(x.max(y)),
            _ => None,
        };
        ApproxHistogram::new(
            a.resolution.max(b.resolution),
            a.num_buckets.max(b.num_buckets),
            lower,
            upper,
        )
    }

    /// Equal-width bucket histogram over [min, max]; centroid counts land in
    /// the bucket containing their position.
    pub fn to_buckets(&self) -> (Vec<f64>, Vec<i64>) {
        if self.total == 0 {
            return (Vec::new(), Vec::new());
        }
        let n = self.num_buckets;
        let width = if self.max > self.min {
            (self.max - self.min) / n as f64
        } else {
            1.0
        };
        let breaks: Vec<f64> = (0..=n).map(|i| self.min + width * i as f64).collect();
        let mut counts = vec![0i64; n];
        for (pos, count) in self.positions.iter().zip(self.counts.iter()) {
            let mut bucket = ((pos - self.min) / width) as usize;
            if bucket >= n {
                bucket = n - 1;
            }
            counts[bucket] += count;
        }
        (breaks, counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_below_resolution() {
        let mut h = ApproxHistogram::new(32, 4, None, None);
        for v in [1.0, 2.0, 2.0, 3.0] {
            h.update(v);
        }
        assert_eq!(h.total(), 4);
        let (breaks, counts) = h.to_buckets();
        assert_eq!(breaks.len(), 5);
        assert_eq!(counts.iter().sum::<i64>(), 4);
    }

    #[test]
    fn test_resolution_bound_holds() {
        let mut h = ApproxHistogram::new(16, 4, None, None);
        for i in 0..10_000 {
            h.update((i % 977) as f64);
        }
        assert!(h.positions.len() <= 16);
        assert_eq!(h.total(), 10_000);
    }

    #[test]
    fn test_clamping() {
        let mut h = ApproxHistogram::new(16, 4, Some(0.0), Some(10.0));
        h.update(-5.0);
        h.update(50.0);
        let (breaks, _) = h.to_buckets();
        assert!(breaks.first().copied().unwrap() >= 0.0);
        assert!(breaks.last().copied().unwrap() <= 10.0);
    }

    #[test]
    fn test_fold_preserves_total() {
        let mut a = ApproxHistogram::new(16, 4, None, None);
        let mut b = ApproxHistogram::new(16, 4, None, None);
        for i in 0..500 {
            a.update(i as f64);
            b.update((i + 500) as f64);
        }
        a.fold(&b);
        assert_eq!(a.total(), 1_000);
    }
}
