//! Misra-Gries heavy hitters.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use basalt_core::Scalar;

pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencySketch {
    capacity: usize,
    counters: HashMap<String, i64>,
    /// Total decrement applied; an upper error bound on reported counts.
    decremented: i64,
}

impl FrequencySketch {
    pub fn new(capacity: usize) -> FrequencySketch {
        FrequencySketch {
            capacity: capacity.max(8),
            counters: HashMap::new(),
            decremented: 0,
        }
    }

    pub fn update(&mut self, value: &Scalar) {
        let key = match value {
            Scalar::Null => return,
            Scalar::String(s) => s.clone(),
            other => other.to_json().to_string(),
        };
        self.add(key, 1);
    }

    fn add(&mut self, key: String, count: i64) {
        *self.counters.entry(key).or_insert(0) += count;
        if self.counters.len() > self.capacity {
            self.decrement();
        }
    }

    fn decrement(&mut self) {
        let min = self.counters.values().copied().min().unwrap_or(0);
        self.decremented += min;
        self.counters.retain(|_, c| {
            *c -= min;
            *c > 0
        });
    }

    pub fn merge(&mut self, other: &FrequencySketch) {
        self.capacity = self.capacity.max(other.capacity);
        self.decremented += other.decremented;
        for (key, count) in &other.counters {
            self.add(key.clone(), *count);
        }
    }

    /// Top-n entries, descending by retained count.
    pub fn top(&self, n: usize) -> Vec<(String, i64)> {
        let mut entries: Vec<(String, i64)> = self
            .counters
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
    }

    pub fn error_bound(&self) -> i64 {
        self.decremented
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heavy_hitter_survives() {
        let mut s = FrequencySketch::new(16);
        for i in 0..2_000 {
            s.update(&Scalar::String(format!("noise-{}", i % 400)));
            if i % 2 == 0 {
                s.update(&Scalar::String("heavy".into()));
            }
        }
        let top = s.top(1);
        assert_eq!(top[0].0, "heavy");
    }

    #[test]
    fn test_merge_accumulates() {
        let mut a = FrequencySketch::new(16);
        let mut b = FrequencySketch::new(16);
        for _ in 0..100 {
            a.update(&Scalar::String("x".into()));
            b.update(&Scalar::String("x".into()));
        }
        a.merge(&b);
        assert_eq!(a.top(1)[0], ("x".to_string(), 200));
    }
}
