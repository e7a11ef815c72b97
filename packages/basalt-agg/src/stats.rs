//! Numerically stable online statistics: variance, covariance, Pearson
//! correlation, kurtosis. Updates are Welford-style; merges use the parallel
//! (Chan et al.) formulas so combining partials from any stream partition
//! reproduces the whole-stream result.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VarianceState {
    pub count: i64,
    pub mean: f64,
    pub m2: f64,
}

impl VarianceState {
    pub fn add(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn merge(&mut self, other: &VarianceState) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let delta = other.mean - self.mean;
        let total = n1 + n2;
        self.m2 += other.m2 + delta * delta * n1 * n2 / total;
        self.mean += delta * n2 / total;
        self.count += other.count;
    }

    pub fn variance_population(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.m2 / self.count as f64
    }

    pub fn variance_sample(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        self.m2 / (self.count - 1) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CovarianceState {
    pub count: i64,
    pub mean_x: f64,
    pub mean_y: f64,
    /// Co-moment sum((x - mean_x)(y - mean_y)).
    pub c2: f64,
    pub m2_x: f64,
    pub m2_y: f64,
}

impl CovarianceState {
    pub fn add(&mut self, x: f64, y: f64) {
        self.count += 1;
        let n = self.count as f64;
        let dx = x - self.mean_x;
        let dy = y - self.mean_y;
        self.mean_x += dx / n;
        self.mean_y += dy / n;
        // dx is pre-update, (y - mean_y) post-update
        self.c2 += dx * (y - self.mean_y);
        self.m2_x += dx * (x - self.mean_x);
        self.m2_y += dy * (y - self.mean_y);
    }

    pub fn merge(&mut self, other: &CovarianceState) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let total = n1 + n2;
        let dx = other.mean_x - self.mean_x;
        let dy = other.mean_y - self.mean_y;
        self.c2 += other.c2 + dx * dy * n1 * n2 / total;
        self.m2_x += other.m2_x + dx * dx * n1 * n2 / total;
        self.m2_y += other.m2_y + dy * dy * n1 * n2 / total;
        self.mean_x += dx * n2 / total;
        self.mean_y += dy * n2 / total;
        self.count += other.count;
    }

    pub fn covariance_population(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.c2 / self.count as f64
    }

    pub fn pearson(&self) -> f64 {
        let denom = (self.m2_x * self.m2_y).sqrt();
        if denom == 0.0 {
            return 0.0;
        }
        self.c2 / denom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct KurtosisState {
    pub count: i64,
    pub mean: f64,
    pub m2: f64,
    pub m3: f64,
    pub m4: f64,
}

impl KurtosisState {
    pub fn add(&mut self, x: f64) {
        let n1 = self.count as f64;
        self.count += 1;
        let n = self.count as f64;
        let delta = x - self.mean;
        let delta_n = delta / n;
        let delta_n2 = delta_n * delta_n;
        let term1 = delta * delta_n * n1;

        self.mean += delta_n;
        self.m4 += term1 * delta_n2 * (n * n - 3.0 * n + 3.0) + 6.0 * delta_n2 * self.m2
            - 4.0 * delta_n * self.m3;
        self.m3 += term1 * delta_n * (n - 2.0) - 3.0 * delta_n * self.m2;
        self.m2 += term1;
    }

    pub fn merge(&mut self, other: &KurtosisState) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n1 = self.count as f64;
        let n2 = other.count as f64;
        let n = n1 + n2;
        let delta = other.mean - self.mean;
        let delta2 = delta * delta;
        let delta3 = delta2 * delta;
        let delta4 = delta2 * delta2;

        let m4 = self.m4
            + other.m4
            + delta4 * n1 * n2 * (n1 * n1 - n1 * n2 + n2 * n2) / (n * n * n)
            + 6.0 * delta2 * (n1 * n1 * other.m2 + n2 * n2 * self.m2) / (n * n)
            + 4.0 * delta * (n1 * other.m3 - n2 * self.m3) / n;
        let m3 = self.m3
            + other.m3
            + delta3 * n1 * n2 * (n1 - n2) / (n * n)
            + 3.0 * delta * (n1 * other.m2 - n2 * self.m2) / n;
        let m2 = self.m2 + other.m2 + delta2 * n1 * n2 / n;

        self.mean = (n1 * self.mean + n2 * other.mean) / n;
        self.m2 = m2;
        self.m3 = m3;
        self.m4 = m4;
        self.count += other.count;
    }

    /// Excess kurtosis of the population.
    pub fn kurtosis(&self) -> f64 {
        if self.count == 0 || self.m2 == 0.0 {
            return 0.0;
        }
        let n = self.count as f64;
        n * self.m4 / (self.m2 * self.m2) - 3.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variance_split_matches_whole() {
        // spec scenario: [1..6] split into three pairs, population variance 3.5
        let mut parts = Vec::new();
        for chunk in [[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]] {
            let mut s = VarianceState::default();
            s.add(chunk[0]);
            s.add(chunk[1]);
            parts.push(s);
        }
        let mut merged = VarianceState::default();
        for p in &parts {
            merged.merge(p);
        }
        assert!((merged.variance_population() - 3.5).abs() < 1e-12);
        assert_eq!(merged.count, 6);
    }

    #[test]
    fn test_shuffle_stability() {
        let data: Vec<f64> = (0..1_000).map(|i| ((i * 37) % 1000) as f64 * 0.25).collect();
        let mut forward = VarianceState::default();
        let mut reverse = VarianceState::default();
        for v in &data {
            forward.add(*v);
        }
        for v in data.iter().rev() {
            reverse.add(*v);
        }
        let a = forward.variance_population();
        let b = reverse.variance_population();
        assert!((a - b).abs() / a.abs().max(1e-12) < 1e-9);
    }

    #[test]
    fn test_pearson_of_linear_data() {
        let mut s = CovarianceState::default();
        for i in 0..100 {
            let x = i as f64;
            s.add(x, 3.0 * x + 1.0);
        }
        assert!((s.pearson() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_kurtosis_merge_matches_whole() {
        let data: Vec<f64> = (0..500).map(|i| ((i * 13) % 101) as f64).collect();
        let mut whole = KurtosisState::default();
        for v in &data {
            whole.add(*v);
        }
        let mut left = KurtosisState::default();
        let mut right = KurtosisState::default();
        for (i, v) in data.iter().enumerate() {
            if i < 200 {
                left.add(*v);
            } else {
                right.add(*v);
            }
        }
        left.merge(&right);
        assert!((left.kurtosis() - whole.kurtosis()).abs() < 1e-9);
    }
}
