//! HyperLogLog cardinality collector with sparse/dense register storage.

use serde::{Deserialize, Serialize};

use basalt_core::Scalar;

use super::hash_scalar;

/// Register index bits; 2^11 = 2048 registers.
const INDEX_BITS: u32 = 11;
const NUM_REGISTERS: usize = 1 << INDEX_BITS;
/// Sparse maps promote to dense past this many occupied registers.
const SPARSE_LIMIT: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Registers {
    Sparse(std::collections::BTreeMap<u16, u8>),
    Dense(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HllCollector {
    registers: Registers,
}

impl Default for HllCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl HllCollector {
    pub fn new() -> HllCollector {
        HllCollector {
            registers: Registers::Sparse(Default::default()),
        }
    }

    /// Bytes a dense serialization occupies; callers pre-size buffers with
    /// this.
    pub fn num_bytes_for_dense_storage() -> usize {
        NUM_REGISTERS
    }

    pub fn add_value(&mut self, value: &Scalar) {
        if value.is_null() {
            return;
        }
        self.add_hash(hash_scalar(value));
    }

    pub fn add_hash(&mut self, hash: u64) {
        let index = (hash >> (64 - INDEX_BITS)) as u16;
        let remainder = hash << INDEX_BITS;
        let rank = (remainder.leading_zeros() + 1).min(64 - INDEX_BITS) as u8;
        self.set_register(index, rank);
    }

    fn set_register(&mut self, index: u16, rank: u8) {
        let needs_promote = match &mut self.registers {
            Registers::Sparse(map) => {
                let entry = map.entry(index).or_insert(0);
                if rank > *entry {
                    *entry = rank;
                }
                map.len() > SPARSE_LIMIT
            }
            Registers::Dense(regs) => {
                let slot = &mut regs[index as usize];
                if rank > *slot {
                    *slot = rank;
                }
                false
            }
        };
        if needs_promote {
            self.promote();
        }
    }

    fn promote(&mut self) {
        if let Registers::Sparse(map) = &self.registers {
            let mut dense = vec![0u8; NUM_REGISTERS];
            for (idx, rank) in map {
                dense[*idx as usize] = *rank;
            }
            self.registers = Registers::Dense(dense);
        }
    }

    /// Fold another collector in; register-wise max.
    pub fn fold(&mut self, other: &HllCollector) {
        match &other.registers {
            Registers::Sparse(map) => {
                for (idx, rank) in map {
                    self.set_register(*idx, *rank);
                }
            }
            Registers::Dense(regs) => {
                for (idx, rank) in regs.iter().enumerate() {
                    if *rank > 0 {
                        self.set_register(idx as u16, *rank);
                    }
                }
            }
        }
    }

    pub fn estimate(&self) -> f64 {
        let m = NUM_REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);

        let (sum, zeros) = match &self.registers {
            Registers::Sparse(map) => {
                let occupied: f64 = map.values().map(|r| 2f64.powi(-(*r as i32))).sum();
                let zero_count = NUM_REGISTERS - map.len();
                (occupied + zero_count as f64, zero_count)
            }
            Registers::Dense(regs) => {
                let sum: f64 = regs.iter().map(|r| 2f64.powi(-(*r as i32))).sum();
                let zeros = regs.iter().filter(|r| **r == 0).count();
                (sum, zeros)
            }
        };

        let raw = alpha * m * m / sum;
        if raw <= 2.5 * m && zeros > 0 {
            // linear counting for the small range
            m * (m / zeros as f64).ln()
        } else {
            raw
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_within_tolerance() {
        let mut hll = HllCollector::new();
        for i in 0..10_000 {
            hll.add_value(&Scalar::String(format!("value-{i}")));
        }
        let est = hll.estimate();
        assert!((est - 10_000.0).abs() / 10_000.0 < 0.05, "estimate {est}");
    }

    #[test]
    fn test_fold_matches_union() {
        let mut a = HllCollector::new();
        let mut b = HllCollector::new();
        let mut whole = HllCollector::new();
        for i in 0..2_000 {
            let v = Scalar::Long(i);
            if i % 2 == 0 {
                a.add_value(&v);
            } else {
                b.add_value(&v);
            }
            whole.add_value(&v);
        }
        a.fold(&b);
        assert_eq!(a, whole);
    }

    #[test]
    fn test_duplicates_do_not_grow_estimate() {
        let mut hll = HllCollector::new();
        for _ in 0..1_000 {
            hll.add_value(&Scalar::String("same".into()));
        }
        assert!(hll.estimate() < 2.0);
    }
}
