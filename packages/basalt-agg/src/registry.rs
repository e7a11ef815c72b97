//! Complex-type serde registry.
//!
//! Every complex metric name maps to a serde strategy used when segments
//! persist aggregate state and when partials travel between nodes. The
//! registry is plain owned state inside the runtime; nothing global.

use std::collections::HashMap;
use std::sync::Arc;

use basalt_core::{BasaltError, Result, ValueDesc};

use crate::state::AggState;

pub trait ComplexSerde: Send + Sync {
    fn type_name(&self) -> &str;

    fn serialize(&self, state: &AggState) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<AggState>;
}

/// Default strategy: the binary codec over the tagged state, validated
/// against the expected variant on read.
struct BincodeSerde {
    name: String,
    accepts: fn(&AggState) -> bool,
}

impl ComplexSerde for BincodeSerde {
    fn type_name(&self) -> &str {
        &self.name
    }

    fn serialize(&self, state: &AggState) -> Result<Vec<u8>> {
        if !(self.accepts)(state) {
            return Err(BasaltError::IllegalArgument(format!(
                "state does not match complex type {}",
                self.name
            )));
        }
        state.to_bytes()
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<AggState> {
        let state = AggState::from_bytes(bytes)?;
        if !(self.accepts)(&state) {
            return Err(BasaltError::ParseFailure(format!(
                "bytes do not decode as {}",
                self.name
            )));
        }
        Ok(state)
    }
}

#[derive(Clone)]
pub struct ComplexRegistry {
    serdes: HashMap<String, Arc<dyn ComplexSerde>>,
}

impl ComplexRegistry {
    /// Registry with every built-in complex metric type registered.
    pub fn with_builtins() -> ComplexRegistry {
        let mut registry = ComplexRegistry {
            serdes: HashMap::new(),
        };
        let builtins: Vec<(&str, fn(&AggState) -> bool)> = vec![
            ("hyperUnique", |s| matches!(s, AggState::Hll(_))),
            ("thetaSketch", |s| matches!(s, AggState::Theta(_))),
            ("quantilesSketch", |s| matches!(s, AggState::Quantiles(_))),
            ("frequency", |s| matches!(s, AggState::Frequency(_))),
            ("sampling", |s| matches!(s, AggState::Sample(_))),
            ("approximateHistogram", |s| {
                matches!(s, AggState::Histogram(_))
            }),
            ("approximateHistogramCompact", |s| {
                matches!(s, AggState::Histogram(_))
            }),
            ("variance", |s| matches!(s, AggState::Variance(_))),
            ("covariance", |s| matches!(s, AggState::Covariance(_))),
            ("pearson", |s| matches!(s, AggState::Covariance(_))),
            ("kurtosis", |s| matches!(s, AggState::Kurtosis(_))),
        ];
        for (name, accepts) in builtins {
            registry.register(Arc::new(BincodeSerde {
                name: name.to_string(),
                accepts,
            }));
        }
        registry
    }

    pub fn register(&mut self, serde: Arc<dyn ComplexSerde>) {
        self.serdes.insert(serde.type_name().to_string(), serde);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn ComplexSerde>> {
        self.serdes.get(name).ok_or_else(|| {
            BasaltError::IllegalArgument(format!("unregistered complex type: {name}"))
        })
    }

    pub fn knows(&self, desc: &ValueDesc) -> bool {
        desc.complex_name()
            .map(|n| self.serdes.contains_key(n))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::hll::HllCollector;
    use basalt_core::Scalar;

    #[test]
    fn test_round_trip_through_registry() {
        let registry = ComplexRegistry::with_builtins();
        let serde = registry.get("hyperUnique").unwrap();
        let mut hll = HllCollector::new();
        hll.add_value(&Scalar::String("a".into()));
        let state = AggState::Hll(hll);
        let bytes = serde.serialize(&state).unwrap();
        assert_eq!(serde.deserialize(&bytes).unwrap(), state);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let registry = ComplexRegistry::with_builtins();
        let serde = registry.get("variance").unwrap();
        assert!(serde.serialize(&AggState::Long(1)).is_err());
    }

    #[test]
    fn test_unknown_type() {
        let registry = ComplexRegistry::with_builtins();
        assert!(registry.get("nope").is_err());
    }
}
