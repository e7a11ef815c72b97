//! Tagged partial-aggregate state, one variant per family.
//!
//! Flattening the state into a sum type keeps combine/finalize free of
//! any runtime type inspection: every operation is a match on the pair.

use serde::{Deserialize, Serialize};

use basalt_core::{BasaltError, Result, Scalar};

use crate::histogram::ApproxHistogram;
use crate::sketch::frequency::FrequencySketch;
use crate::sketch::hll::HllCollector;
use crate::sketch::quantiles::QuantilesSketch;
use crate::sketch::sampling::MinHashSample;
use crate::sketch::theta::ThetaSketch;
use crate::stats::{CovarianceState, KurtosisState, VarianceState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggState {
    Null,
    Long(i64),
    Double(f64),
    Float(f32),
    /// Verbatim value plus the row timestamp that selected it (first/last).
    Relay { timestamp: i64, value: Scalar },
    List(Vec<Scalar>),
    Set(std::collections::BTreeSet<String>),
    /// Expression-aggregation accumulator.
    Value(Scalar),
    Hll(HllCollector),
    Theta(ThetaSketch),
    Quantiles(QuantilesSketch),
    Frequency(FrequencySketch),
    Sample(MinHashSample),
    Histogram(ApproxHistogram),
    Variance(VarianceState),
    Covariance(CovarianceState),
    Kurtosis(KurtosisState),
}

impl AggState {
    pub fn is_null(&self) -> bool {
        matches!(self, AggState::Null)
    }

    /// Numeric view used by typed accessors and arithmetic post-aggregators.
    /// Sketch states surface their estimate.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            AggState::Long(v) => Some(*v as f64),
            AggState::Double(v) => Some(*v),
            AggState::Float(v) => Some(*v as f64),
            AggState::Value(v) | AggState::Relay { value: v, .. } => v.as_double(),
            AggState::Hll(h) => Some(h.estimate()),
            AggState::Theta(t) => Some(t.estimate()),
            AggState::Variance(v) => Some(v.variance_population()),
            AggState::Kurtosis(k) => Some(k.kurtosis()),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            AggState::Long(v) => Some(*v),
            other => other.as_double().map(|v| v as i64),
        }
    }

    /// Ordering key used when results sort by a metric.
    pub fn order_key(&self) -> Scalar {
        match self {
            AggState::Null => Scalar::Null,
            AggState::Long(v) => Scalar::Long(*v),
            AggState::Double(v) => Scalar::Double(*v),
            AggState::Float(v) => Scalar::Float(*v),
            AggState::Value(v) | AggState::Relay { value: v, .. } => v.clone(),
            other => other
                .as_double()
                .map(Scalar::Double)
                .unwrap_or(Scalar::Null),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| BasaltError::Internal(format!("state serialize: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<AggState> {
        bincode::deserialize(bytes)
            .map_err(|e| BasaltError::ParseFailure(format!("state deserialize: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_round_trip() {
        let mut hll = HllCollector::new();
        hll.add_value(&Scalar::String("x".into()));
        let state = AggState::Hll(hll);
        let bytes = state.to_bytes().unwrap();
        assert_eq!(AggState::from_bytes(&bytes).unwrap(), state);
    }

    #[test]
    fn test_order_key_numeric_view() {
        assert_eq!(AggState::Long(3).order_key(), Scalar::Long(3));
        assert_eq!(AggState::Null.order_key(), Scalar::Null);
    }
}
