//! Aggregator factories, one serde-tagged variant per family.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use basalt_core::{
    compare_scalars, BasaltError, ColumnSelectorFactory, Result, Scalar, ValueDesc, TIME_COLUMN,
};

use crate::fold::{ExprAgg, PairFoldAgg, RelayAgg, RelayMode, StateFoldAgg, ACCUMULATOR_NAME};
use crate::histogram::ApproxHistogram;
use crate::simple::{
    CountAgg, CountBufferAgg, DoubleFoldAgg, DoubleFoldBufferAgg, FloatFoldAgg, LongFoldAgg,
    LongFoldBufferAgg,
};
use crate::sketch::frequency::FrequencySketch;
use crate::sketch::hll::HllCollector;
use crate::sketch::quantiles::QuantilesSketch;
use crate::sketch::sampling::MinHashSample;
use crate::sketch::theta::ThetaSketch;
use crate::state::AggState;
use crate::{Aggregator, BufferAggregator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Estimator {
    #[default]
    Population,
    Sample,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AggregatorSpec {
    #[serde(rename = "count")]
    Count { name: String },

    #[serde(rename = "longSum")]
    LongSum {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "doubleSum")]
    DoubleSum {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "floatSum")]
    FloatSum {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    /// Generic sum; aggregates as double whatever the column type.
    #[serde(rename = "sum")]
    Sum {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },

    #[serde(rename = "longMin")]
    LongMin {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "longMax")]
    LongMax {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "doubleMin")]
    DoubleMin {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "doubleMax")]
    DoubleMax {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "floatMin")]
    FloatMin {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "floatMax")]
    FloatMax {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "min")]
    Min {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "max")]
    Max {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },

    #[serde(rename = "hyperUnique")]
    HyperUnique {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
        #[serde(default)]
        round: bool,
    },

    #[serde(rename = "thetaSketch")]
    Theta {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
        #[serde(default = "default_theta_size")]
        size: usize,
    },

    #[serde(rename = "quantilesSketch")]
    Quantiles {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
        #[serde(default = "default_quantiles_k")]
        k: usize,
    },

    #[serde(rename = "frequency")]
    Frequency {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
        #[serde(default = "default_frequency_k")]
        k: usize,
    },

    #[serde(rename = "sampling")]
    Sampling {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
        #[serde(default = "default_sampling_k")]
        k: usize,
    },

    #[serde(rename = "approximateHistogram")]
    Histogram {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
        #[serde(default = "default_resolution")]
        resolution: usize,
        #[serde(rename = "numBuckets", default = "default_num_buckets")]
        num_buckets: usize,
        #[serde(rename = "lowerLimit", default)]
        lower_limit: Option<f64>,
        #[serde(rename = "upperLimit", default)]
        upper_limit: Option<f64>,
        /// Compact form finalizes to the bucket histogram directly; the
        /// non-compact form keeps centroids in the wire state.
        #[serde(default)]
        compact: bool,
    },

    #[serde(rename = "variance")]
    Variance {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
        #[serde(default)]
        estimator: Estimator,
    },
    #[serde(rename = "covariance")]
    Covariance {
        name: String,
        #[serde(rename = "fieldNames")]
        field_names: Vec<String>,
    },
    #[serde(rename = "pearson")]
    Pearson {
        name: String,
        #[serde(rename = "fieldNames")]
        field_names: Vec<String>,
    },
    #[serde(rename = "kurtosis")]
    Kurtosis {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },

    #[serde(rename = "first")]
    First {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "last")]
    Last {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },

    #[serde(rename = "list")]
    List {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "set")]
    Set {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
        #[serde(rename = "maxSize", default)]
        max_size: Option<usize>,
    },

    /// Expression-language aggregation; replaces embedded scripting.
    #[serde(rename = "expr")]
    Expression {
        name: String,
        expression: String,
        #[serde(rename = "combineExpression", default)]
        combine_expression: Option<String>,
    },
}

fn default_theta_size() -> usize {
    crate::sketch::theta::DEFAULT_NOMINAL_ENTRIES
}

fn default_quantiles_k() -> usize {
    crate::sketch::quantiles::DEFAULT_MAX_SAMPLES
}

fn default_frequency_k() -> usize {
    crate::sketch::frequency::DEFAULT_CAPACITY
}

fn default_sampling_k() -> usize {
    crate::sketch::sampling::DEFAULT_SAMPLE_SIZE
}

fn default_resolution() -> usize {
    50
}

fn default_num_buckets() -> usize {
    7
}

use AggregatorSpec::*;

impl AggregatorSpec {
    pub fn output_name(&self) -> &str {
        match self {
            Count { name }
            | LongSum { name, .. }
            | DoubleSum { name, .. }
            | FloatSum { name, .. }
            | Sum { name, .. }
            | LongMin { name, .. }
            | LongMax { name, .. }
            | DoubleMin { name, .. }
            | DoubleMax { name, .. }
            | FloatMin { name, .. }
            | FloatMax { name, .. }
            | Min { name, .. }
            | Max { name, .. }
            | HyperUnique { name, .. }
            | Theta { name, .. }
            | Quantiles { name, .. }
            | Frequency { name, .. }
            | Sampling { name, .. }
            | Histogram { name, .. }
            | Variance { name, .. }
            | Covariance { name, .. }
            | Pearson { name, .. }
            | Kurtosis { name, .. }
            | First { name, .. }
            | Last { name, .. }
            | List { name, .. }
            | Set { name, .. }
            | Expression { name, .. } => name,
        }
    }

    pub fn field_names(&self) -> Vec<String> {
        match self {
            Count { .. } => Vec::new(),
            Covariance { field_names, .. } | Pearson { field_names, .. } => field_names.clone(),
            Expression { expression, .. } => basalt_expr::parse(expression)
                .map(|e| {
                    e.required_bindings()
                        .into_iter()
                        .filter(|n| n != ACCUMULATOR_NAME)
                        .collect()
                })
                .unwrap_or_default(),
            LongSum { field_name, .. }
            | DoubleSum { field_name, .. }
            | FloatSum { field_name, .. }
            | Sum { field_name, .. }
            | LongMin { field_name, .. }
            | LongMax { field_name, .. }
            | DoubleMin { field_name, .. }
            | DoubleMax { field_name, .. }
            | FloatMin { field_name, .. }
            | FloatMax { field_name, .. }
            | Min { field_name, .. }
            | Max { field_name, .. }
            | HyperUnique { field_name, .. }
            | Theta { field_name, .. }
            | Quantiles { field_name, .. }
            | Frequency { field_name, .. }
            | Sampling { field_name, .. }
            | Histogram { field_name, .. }
            | Variance { field_name, .. }
            | Kurtosis { field_name, .. }
            | First { field_name, .. }
            | Last { field_name, .. }
            | List { field_name, .. }
            | Set { field_name, .. } => vec![field_name.clone()],
        }
    }

    /// Type of the unfinalized partial.
    pub fn intermediate_type(&self) -> ValueDesc {
        match self {
            Count { .. } | LongSum { .. } | LongMin { .. } | LongMax { .. } => ValueDesc::Long,
            DoubleSum { .. } | Sum { .. } | DoubleMin { .. } | DoubleMax { .. } | Min { .. }
            | Max { .. } => ValueDesc::Double,
            FloatSum { .. } | FloatMin { .. } | FloatMax { .. } => ValueDesc::Float,
            HyperUnique { .. } => ValueDesc::Complex("hyperUnique".into()),
            Theta { .. } => ValueDesc::Complex("thetaSketch".into()),
            Quantiles { .. } => ValueDesc::Complex("quantilesSketch".into()),
            Frequency { .. } => ValueDesc::Complex("frequency".into()),
            Sampling { .. } => ValueDesc::Complex("sampling".into()),
            Histogram { compact, .. } => ValueDesc::Complex(
                if *compact {
                    "approximateHistogramCompact"
                } else {
                    "approximateHistogram"
                }
                .into(),
            ),
            Variance { .. } => ValueDesc::Complex("variance".into()),
            Covariance { .. } => ValueDesc::Complex("covariance".into()),
            Pearson { .. } => ValueDesc::Complex("pearson".into()),
            Kurtosis { .. } => ValueDesc::Complex("kurtosis".into()),
            First { .. } | Last { .. } | Expression { .. } => ValueDesc::String,
            List { .. } => ValueDesc::Array(Box::new(ValueDesc::String)),
            Set { .. } => ValueDesc::Array(Box::new(ValueDesc::String)),
        }
    }

    /// Type after finalization.
    pub fn finalized_type(&self) -> ValueDesc {
        match self {
            HyperUnique { round: true, .. } => ValueDesc::Long,
            HyperUnique { .. } | Theta { .. } | Quantiles { .. } | Variance { .. }
            | Covariance { .. } | Pearson { .. } | Kurtosis { .. } => ValueDesc::Double,
            Histogram { .. } => ValueDesc::Complex("histogramBuckets".into()),
            Frequency { .. } | Sampling { .. } => {
                ValueDesc::Array(Box::new(ValueDesc::String))
            }
            other => other.intermediate_type(),
        }
    }

    /// Max bytes of the off-heap slot; heap-only families report a nominal
    /// serialized bound.
    pub fn max_intermediate_size(&self) -> usize {
        match self {
            Count { .. } => 8,
            LongSum { .. } | DoubleSum { .. } | FloatSum { .. } | Sum { .. } | LongMin { .. }
            | LongMax { .. } | DoubleMin { .. } | DoubleMax { .. } | FloatMin { .. }
            | FloatMax { .. } | Min { .. } | Max { .. } => 9,
            HyperUnique { .. } => HllCollector::num_bytes_for_dense_storage(),
            Theta { size, .. } => size * 8 + 24,
            Quantiles { k, .. } => k * 8 + 48,
            Frequency { k, .. } => k * 64,
            Sampling { k, .. } => k * 64,
            Histogram { resolution, .. } => resolution * 16 + 64,
            Variance { .. } => 24,
            Covariance { .. } | Pearson { .. } => 48,
            Kurtosis { .. } => 40,
            First { .. } | Last { .. } | List { .. } | Set { .. } | Expression { .. } => 1024,
        }
    }

    /// Combine identity.
    pub fn init_state(&self) -> AggState {
        match self {
            Count { .. } | LongSum { .. } => AggState::Long(0),
            DoubleSum { .. } | Sum { .. } => AggState::Double(0.0),
            FloatSum { .. } => AggState::Float(0.0),
            HyperUnique { .. } => AggState::Hll(HllCollector::new()),
            Theta { size, .. } => AggState::Theta(ThetaSketch::new(*size)),
            Quantiles { k, .. } => AggState::Quantiles(QuantilesSketch::new(*k)),
            Frequency { k, .. } => AggState::Frequency(FrequencySketch::new(*k)),
            Sampling { k, .. } => AggState::Sample(MinHashSample::new(*k)),
            Histogram {
                resolution,
                num_buckets,
                lower_limit,
                upper_limit,
                ..
            } => AggState::Histogram(ApproxHistogram::new(
                *resolution,
                *num_buckets,
                *lower_limit,
                *upper_limit,
            )),
            Variance { .. } => AggState::Variance(Default::default()),
            Covariance { .. } | Pearson { .. } => AggState::Covariance(Default::default()),
            Kurtosis { .. } => AggState::Kurtosis(Default::default()),
            List { .. } => AggState::List(Vec::new()),
            Set { .. } => AggState::Set(Default::default()),
            _ => AggState::Null,
        }
    }

    pub fn create(&self, factory: &dyn ColumnSelectorFactory) -> Result<Box<dyn Aggregator>> {
        Ok(match self {
            Count { .. } => Box::new(CountAgg::new()),
            LongSum { field_name, .. } => Box::new(LongFoldAgg::new(
                factory.long_selector(field_name)?,
                |a, b| a.wrapping_add(b),
                AggState::Long(0),
            )),
            DoubleSum { field_name, .. } | Sum { field_name, .. } => Box::new(DoubleFoldAgg::new(
                factory.double_selector(field_name)?,
                |a, b| a + b,
                AggState::Double(0.0),
            )),
            FloatSum { field_name, .. } => Box::new(FloatFoldAgg::new(
                factory.float_selector(field_name)?,
                |a, b| a + b,
                AggState::Float(0.0),
            )),
            LongMin { field_name, .. } => Box::new(LongFoldAgg::new(
                factory.long_selector(field_name)?,
                i64::min,
                AggState::Null,
            )),
            LongMax { field_name, .. } => Box::new(LongFoldAgg::new(
                factory.long_selector(field_name)?,
                i64::max,
                AggState::Null,
            )),
            DoubleMin { field_name, .. } | Min { field_name, .. } => Box::new(DoubleFoldAgg::new(
                factory.double_selector(field_name)?,
                f64::min,
                AggState::Null,
            )),
            DoubleMax { field_name, .. } | Max { field_name, .. } => Box::new(DoubleFoldAgg::new(
                factory.double_selector(field_name)?,
                f64::max,
                AggState::Null,
            )),
            FloatMin { field_name, .. } => Box::new(FloatFoldAgg::new(
                factory.float_selector(field_name)?,
                f32::min,
                AggState::Null,
            )),
            FloatMax { field_name, .. } => Box::new(FloatFoldAgg::new(
                factory.float_selector(field_name)?,
                f32::max,
                AggState::Null,
            )),
            HyperUnique { field_name, .. } => Box::new(StateFoldAgg::new(
                factory.object_selector(field_name)?,
                self.init_state(),
                update_hll,
            )),
            Theta { field_name, .. } => Box::new(StateFoldAgg::new(
                factory.object_selector(field_name)?,
                self.init_state(),
                update_theta,
            )),
            Quantiles { field_name, .. } => Box::new(StateFoldAgg::new(
                factory.object_selector(field_name)?,
                self.init_state(),
                update_quantiles,
            )),
            Frequency { field_name, .. } => Box::new(StateFoldAgg::new(
                factory.object_selector(field_name)?,
                self.init_state(),
                update_frequency,
            )),
            Sampling { field_name, .. } => Box::new(StateFoldAgg::new(
                factory.object_selector(field_name)?,
                self.init_state(),
                update_sampling,
            )),
            Histogram { field_name, .. } => Box::new(StateFoldAgg::new(
                factory.object_selector(field_name)?,
                self.init_state(),
                update_histogram,
            )),
            Variance { field_name, .. } => Box::new(StateFoldAgg::new(
                factory.object_selector(field_name)?,
                self.init_state(),
                update_variance,
            )),
            Kurtosis { field_name, .. } => Box::new(StateFoldAgg::new(
                factory.object_selector(field_name)?,
                self.init_state(),
                update_kurtosis,
            )),
            Covariance { field_names, .. } | Pearson { field_names, .. } => {
                let [x, y] = two_fields(field_names)?;
                Box::new(PairFoldAgg::new(
                    factory.double_selector(&x)?,
                    factory.double_selector(&y)?,
                ))
            }
            First { field_name, .. } => Box::new(RelayAgg::new(
                RelayMode::First,
                factory.long_selector(TIME_COLUMN)?,
                factory.object_selector(field_name)?,
            )),
            Last { field_name, .. } => Box::new(RelayAgg::new(
                RelayMode::Last,
                factory.long_selector(TIME_COLUMN)?,
                factory.object_selector(field_name)?,
            )),
            List { field_name, .. } => Box::new(StateFoldAgg::new(
                factory.object_selector(field_name)?,
                self.init_state(),
                update_list,
            )),
            Set { field_name, .. } => Box::new(StateFoldAgg::new(
                factory.object_selector(field_name)?,
                self.init_state(),
                update_set,
            )),
            Expression { expression, .. } => {
                let expr = basalt_expr::parse(expression)?;
                let mut inputs = Vec::new();
                for name in expr.required_bindings() {
                    if name == ACCUMULATOR_NAME {
                        continue;
                    }
                    inputs.push((name.clone(), factory.object_selector(&name)?));
                }
                Box::new(ExprAgg::new(expr, inputs))
            }
        })
    }

    /// Buffer form, when the family supports a fixed-size slot; heap-only
    /// families return `None` and the engine falls back to boxed state.
    pub fn create_buffer(
        &self,
        factory: &dyn ColumnSelectorFactory,
    ) -> Result<Option<Box<dyn BufferAggregator>>> {
        Ok(match self {
            Count { .. } => Some(Box::new(CountBufferAgg)),
            LongSum { field_name, .. } => Some(Box::new(LongFoldBufferAgg::new(
                factory.long_selector(field_name)?,
                |a, b| a.wrapping_add(b),
                AggState::Long(0),
            ))),
            DoubleSum { field_name, .. } | Sum { field_name, .. } => {
                Some(Box::new(DoubleFoldBufferAgg::new(
                    factory.double_selector(field_name)?,
                    |a, b| a + b,
                    AggState::Double(0.0),
                )))
            }
            LongMin { field_name, .. } => Some(Box::new(LongFoldBufferAgg::new(
                factory.long_selector(field_name)?,
                i64::min,
                AggState::Null,
            ))),
            LongMax { field_name, .. } => Some(Box::new(LongFoldBufferAgg::new(
                factory.long_selector(field_name)?,
                i64::max,
                AggState::Null,
            ))),
            DoubleMin { field_name, .. } | Min { field_name, .. } => {
                Some(Box::new(DoubleFoldBufferAgg::new(
                    factory.double_selector(field_name)?,
                    f64::min,
                    AggState::Null,
                )))
            }
            DoubleMax { field_name, .. } | Max { field_name, .. } => {
                Some(Box::new(DoubleFoldBufferAgg::new(
                    factory.double_selector(field_name)?,
                    f64::max,
                    AggState::Null,
                )))
            }
            Variance { field_name, .. } => Some(Box::new(crate::fold::VarianceBufferAgg::new(
                factory.double_selector(field_name)?,
            ))),
            _ => None,
        })
    }

    /// Associative combine of two partials. `Null` is the identity for every
    /// family.
    pub fn combine(&self, a: AggState, b: AggState) -> Result<AggState> {
        if a.is_null() {
            return Ok(b);
        }
        if b.is_null() {
            return Ok(a);
        }
        let mismatch = || {
            BasaltError::NotMergeable(format!(
                "cannot combine states for {}",
                self.output_name()
            ))
        };
        Ok(match (self, a, b) {
            (Count { .. } | LongSum { .. }, AggState::Long(x), AggState::Long(y)) => {
                AggState::Long(x.wrapping_add(y))
            }
            (DoubleSum { .. } | Sum { .. }, x, y) => {
                AggState::Double(num(&x)? + num(&y)?)
            }
            (FloatSum { .. }, x, y) => AggState::Float((num(&x)? + num(&y)?) as f32),
            (LongMin { .. }, AggState::Long(x), AggState::Long(y)) => AggState::Long(x.min(y)),
            (LongMax { .. }, AggState::Long(x), AggState::Long(y)) => AggState::Long(x.max(y)),
            (DoubleMin { .. } | Min { .. }, x, y) => AggState::Double(num(&x)?.min(num(&y)?)),
            (DoubleMax { .. } | Max { .. }, x, y) => AggState::Double(num(&x)?.max(num(&y)?)),
            (FloatMin { .. }, x, y) => AggState::Float(num(&x)?.min(num(&y)?) as f32),
            (FloatMax { .. }, x, y) => AggState::Float(num(&x)?.max(num(&y)?) as f32),
            (HyperUnique { .. }, AggState::Hll(mut x), AggState::Hll(y)) => {
                x.fold(&y);
                AggState::Hll(x)
            }
            (Theta { .. }, AggState::Theta(mut x), AggState::Theta(y)) => {
                x.union(&y);
                AggState::Theta(x)
            }
            (Quantiles { .. }, AggState::Quantiles(mut x), AggState::Quantiles(y)) => {
                x.merge(&y);
                AggState::Quantiles(x)
            }
            (Frequency { .. }, AggState::Frequency(mut x), AggState::Frequency(y)) => {
                x.merge(&y);
                AggState::Frequency(x)
            }
            (Sampling { .. }, AggState::Sample(mut x), AggState::Sample(y)) => {
                x.merge(&y);
                AggState::Sample(x)
            }
            (Histogram { .. }, AggState::Histogram(mut x), AggState::Histogram(y)) => {
                x.fold(&y);
                AggState::Histogram(x)
            }
            (Variance { .. }, AggState::Variance(mut x), AggState::Variance(y)) => {
                x.merge(&y);
                AggState::Variance(x)
            }
            (
                Covariance { .. } | Pearson { .. },
                AggState::Covariance(mut x),
                AggState::Covariance(y),
            ) => {
                x.merge(&y);
                AggState::Covariance(x)
            }
            (Kurtosis { .. }, AggState::Kurtosis(mut x), AggState::Kurtosis(y)) => {
                x.merge(&y);
                AggState::Kurtosis(x)
            }
            // ordered families break ties with the row timestamp
            (First { .. }, x @ AggState::Relay { .. }, y @ AggState::Relay { .. }) => {
                if relay_ts(&x) <= relay_ts(&y) {
                    x
                } else {
                    y
                }
            }
            (Last { .. }, x @ AggState::Relay { .. }, y @ AggState::Relay { .. }) => {
                if relay_ts(&y) >= relay_ts(&x) {
                    y
                } else {
                    x
                }
            }
            (List { .. }, AggState::List(mut x), AggState::List(y)) => {
                x.extend(y);
                AggState::List(x)
            }
            (Set { max_size, .. }, AggState::Set(mut x), AggState::Set(y)) => {
                x.extend(y);
                if let Some(cap) = max_size {
                    while x.len() > *cap {
                        let last = x.iter().next_back().cloned();
                        if let Some(last) = last {
                            x.remove(&last);
                        }
                    }
                }
                AggState::Set(x)
            }
            (
                Expression {
                    combine_expression, ..
                },
                AggState::Value(x),
                AggState::Value(y),
            ) => {
                if let Some(combine) = combine_expression {
                    let expr = basalt_expr::parse(combine)?;
                    let binding: std::collections::HashMap<String, Scalar> =
                        [("a".to_string(), x), ("b".to_string(), y)]
                            .into_iter()
                            .collect();
                    AggState::Value(expr.eval(&binding)?)
                } else if let (Some(xa), Some(ya)) = (x.as_double(), y.as_double()) {
                    AggState::Value(Scalar::Double(xa + ya))
                } else {
                    return Err(mismatch());
                }
            }
            _ => return Err(mismatch()),
        })
    }

    /// Idempotent finalizer; see `finalize_json` for the wire shape of
    /// structured outputs.
    pub fn finalize(&self, state: &AggState) -> Scalar {
        match (self, state) {
            (_, AggState::Null) => Scalar::Null,
            (HyperUnique { round: true, .. }, s) => s
                .as_double()
                .map(|v| Scalar::Long(v.round() as i64))
                .unwrap_or(Scalar::Null),
            (HyperUnique { .. }, AggState::Hll(h)) => Scalar::Double(h.estimate()),
            (Theta { .. }, AggState::Theta(t)) => Scalar::Double(t.estimate()),
            (Quantiles { .. }, AggState::Quantiles(q)) => q
                .quantile(0.5)
                .map(Scalar::Double)
                .unwrap_or(Scalar::Null),
            (Frequency { .. }, AggState::Frequency(f)) => Scalar::Array(
                f.top(usize::MAX)
                    .into_iter()
                    .map(|(v, c)| Scalar::Array(vec![Scalar::String(v), Scalar::Long(c)]))
                    .collect(),
            ),
            (Sampling { .. }, AggState::Sample(s)) => Scalar::Array(s.values()),
            (Histogram { .. }, AggState::Histogram(h)) => Scalar::Long(h.total()),
            (Variance { estimator, .. }, AggState::Variance(v)) => {
                Scalar::Double(match estimator {
                    Estimator::Population => v.variance_population(),
                    Estimator::Sample => v.variance_sample(),
                })
            }
            (Covariance { .. }, AggState::Covariance(c)) => {
                Scalar::Double(c.covariance_population())
            }
            (Pearson { .. }, AggState::Covariance(c)) => Scalar::Double(c.pearson()),
            (Kurtosis { .. }, AggState::Kurtosis(k)) => Scalar::Double(k.kurtosis()),
            (_, AggState::Relay { value, .. }) => value.clone(),
            (_, AggState::List(items)) => Scalar::Array(items.clone()),
            (_, AggState::Set(items)) => Scalar::Array(
                items.iter().cloned().map(Scalar::String).collect(),
            ),
            (_, AggState::Value(v)) => v.clone(),
            (_, AggState::Long(v)) => Scalar::Long(*v),
            (_, AggState::Double(v)) => Scalar::Double(*v),
            (_, AggState::Float(v)) => Scalar::Float(*v),
            _ => Scalar::Null,
        }
    }

    /// JSON-facing finalization; histograms emit `{breaks, counts}`.
    pub fn finalize_json(&self, state: &AggState) -> serde_json::Value {
        match (self, state) {
            (Histogram { .. }, AggState::Histogram(h)) => {
                let (breaks, counts) = h.to_buckets();
                serde_json::json!({ "breaks": breaks, "counts": counts })
            }
            _ => self.finalize(state).to_json(),
        }
    }

    /// Ordering of finalized results for this metric.
    pub fn compare(&self, a: &AggState, b: &AggState) -> Ordering {
        compare_scalars(&self.finalize(a), &self.finalize(b))
    }

    /// Deterministic cache key: the type tag, configuration and UTF-8 field
    /// strings in declaration order.
    pub fn cache_key(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Widened factory for merging partials produced by two factories over
    /// the same metric name.
    pub fn merging_factory(&self, other: &AggregatorSpec) -> Result<AggregatorSpec> {
        if self == other {
            return Ok(self.clone());
        }
        if self.output_name() != other.output_name() {
            return Err(BasaltError::NotMergeable(format!(
                "different outputs: {} vs {}",
                self.output_name(),
                other.output_name()
            )));
        }
        match (self, other) {
            (
                Histogram {
                    name,
                    field_name,
                    resolution: r1,
                    num_buckets: b1,
                    lower_limit: l1,
                    upper_limit: u1,
                    compact: c1,
                },
                Histogram {
                    resolution: r2,
                    num_buckets: b2,
                    lower_limit: l2,
                    upper_limit: u2,
                    compact: c2,
                    ..
                },
            ) => Ok(Histogram {
                name: name.clone(),
                field_name: field_name.clone(),
                resolution: (*r1).max(*r2),
                num_buckets: (*b1).max(*b2),
                lower_limit: opt_min(*l1, *l2),
                upper_limit: opt_max(*u1, *u2),
                compact: *c1 || *c2,
            }),
            (Theta { name, field_name, size: s1 }, Theta { size: s2, .. }) => Ok(Theta {
                name: name.clone(),
                field_name: field_name.clone(),
                size: (*s1).max(*s2),
            }),
            (Quantiles { name, field_name, k: k1 }, Quantiles { k: k2, .. }) => Ok(Quantiles {
                name: name.clone(),
                field_name: field_name.clone(),
                k: (*k1).max(*k2),
            }),
            (Frequency { name, field_name, k: k1 }, Frequency { k: k2, .. }) => Ok(Frequency {
                name: name.clone(),
                field_name: field_name.clone(),
                k: (*k1).max(*k2),
            }),
            (Sampling { name, field_name, k: k1 }, Sampling { k: k2, .. }) => Ok(Sampling {
                name: name.clone(),
                field_name: field_name.clone(),
                k: (*k1).max(*k2),
            }),
            _ => Err(BasaltError::NotMergeable(format!(
                "incompatible factories for {}",
                self.output_name()
            ))),
        }
    }
}

fn opt_min(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        _ => None,
    }
}

fn opt_max(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        _ => None,
    }
}

fn num(state: &AggState) -> Result<f64> {
    state
        .as_double()
        .ok_or_else(|| BasaltError::NotMergeable("non-numeric state".into()))
}

fn relay_ts(state: &AggState) -> i64 {
    match state {
        AggState::Relay { timestamp, .. } => *timestamp,
        _ => i64::MAX,
    }
}

fn two_fields(names: &[String]) -> Result<[String; 2]> {
    if names.len() != 2 {
        return Err(BasaltError::IllegalArgument(format!(
            "exactly two field names required, got {}",
            names.len()
        )));
    }
    Ok([names[0].clone(), names[1].clone()])
}

// ---- update fns for the stateful families ----
//
// Complex input values are partial states from another segment; everything
// else is a raw value.

fn decode_state(value: &Scalar) -> Option<AggState> {
    match value {
        Scalar::Complex { data, .. } => AggState::from_bytes(data).ok(),
        Scalar::String(s) if looks_like_state(s) => BASE64
            .decode(s.as_bytes())
            .ok()
            .and_then(|bytes| AggState::from_bytes(&bytes).ok()),
        _ => None,
    }
}

/// Base64-transported states are long and decode cleanly; short dimension
/// values fall through to raw handling.
fn looks_like_state(s: &str) -> bool {
    s.len() >= 24 && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

fn update_hll(state: &mut AggState, value: Scalar) {
    let AggState::Hll(h) = state else { return };
    match decode_state(&value) {
        Some(AggState::Hll(other)) => h.fold(&other),
        _ => h.add_value(&value),
    }
}

fn update_theta(state: &mut AggState, value: Scalar) {
    let AggState::Theta(t) = state else { return };
    match decode_state(&value) {
        Some(AggState::Theta(other)) => t.union(&other),
        _ => t.update(&value),
    }
}

fn update_quantiles(state: &mut AggState, value: Scalar) {
    let AggState::Quantiles(q) = state else { return };
    match decode_state(&value) {
        Some(AggState::Quantiles(other)) => q.merge(&other),
        _ => q.update(&value),
    }
}

fn update_frequency(state: &mut AggState, value: Scalar) {
    let AggState::Frequency(f) = state else { return };
    match decode_state(&value) {
        Some(AggState::Frequency(other)) => f.merge(&other),
        _ => f.update(&value),
    }
}

fn update_sampling(state: &mut AggState, value: Scalar) {
    let AggState::Sample(s) = state else { return };
    match decode_state(&value) {
        Some(AggState::Sample(other)) => s.merge(&other),
        _ => s.update(&value),
    }
}

fn update_histogram(state: &mut AggState, value: Scalar) {
    let AggState::Histogram(h) = state else { return };
    match decode_state(&value) {
        Some(AggState::Histogram(other)) => h.fold(&other),
        _ => {
            if let Some(v) = value.as_double() {
                h.update(v);
            }
        }
    }
}

fn update_variance(state: &mut AggState, value: Scalar) {
    let AggState::Variance(s) = state else { return };
    match decode_state(&value) {
        Some(AggState::Variance(other)) => s.merge(&other),
        _ => {
            if let Some(v) = value.as_double() {
                s.add(v);
            }
        }
    }
}

fn update_kurtosis(state: &mut AggState, value: Scalar) {
    let AggState::Kurtosis(s) = state else { return };
    match decode_state(&value) {
        Some(AggState::Kurtosis(other)) => s.merge(&other),
        _ => {
            if let Some(v) = value.as_double() {
                s.add(v);
            }
        }
    }
}

fn update_list(state: &mut AggState, value: Scalar) {
    let AggState::List(items) = state else { return };
    match value {
        Scalar::Null => {}
        Scalar::Array(vs) => items.extend(vs),
        v => items.push(v),
    }
}

fn update_set(state: &mut AggState, value: Scalar) {
    let AggState::Set(items) = state else { return };
    match value {
        Scalar::Null => {}
        Scalar::Array(vs) => {
            for v in vs {
                if let Scalar::String(s) = v {
                    items.insert(s);
                } else {
                    items.insert(v.to_json().to_string());
                }
            }
        }
        Scalar::String(s) => {
            items.insert(s);
        }
        v => {
            items.insert(v.to_json().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: &str) -> AggregatorSpec {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_combiner_associativity_for_variance() {
        let v = spec(r#"{"type":"variance","name":"var","fieldName":"x"}"#);
        let mut parts = Vec::new();
        for chunk in [[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]] {
            let mut s = crate::stats::VarianceState::default();
            s.add(chunk[0]);
            s.add(chunk[1]);
            parts.push(AggState::Variance(s));
        }
        let merged = parts
            .into_iter()
            .try_fold(v.init_state(), |acc, p| v.combine(acc, p))
            .unwrap();
        assert_eq!(v.finalize(&merged), Scalar::Double(3.5));
    }

    #[test]
    fn test_null_is_combine_identity() {
        let c = spec(r#"{"type":"count","name":"c"}"#);
        assert_eq!(
            c.combine(AggState::Null, AggState::Long(4)).unwrap(),
            AggState::Long(4)
        );
    }

    #[test]
    fn test_histogram_merging_factory_widens() {
        let a = spec(
            r#"{"type":"approximateHistogram","name":"h","fieldName":"x","resolution":20,"lowerLimit":0.0,"upperLimit":10.0}"#,
        );
        let b = spec(
            r#"{"type":"approximateHistogram","name":"h","fieldName":"x","resolution":50,"lowerLimit":-5.0,"upperLimit":5.0}"#,
        );
        let merged = a.merging_factory(&b).unwrap();
        match merged {
            Histogram {
                resolution,
                lower_limit,
                upper_limit,
                ..
            } => {
                assert_eq!(resolution, 50);
                assert_eq!(lower_limit, Some(-5.0));
                assert_eq!(upper_limit, Some(10.0));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_not_mergeable_kinds() {
        let a = spec(r#"{"type":"count","name":"m"}"#);
        let b = spec(r#"{"type":"doubleSum","name":"m","fieldName":"x"}"#);
        assert!(matches!(
            a.merging_factory(&b),
            Err(BasaltError::NotMergeable(_))
        ));
    }

    #[test]
    fn test_relay_combine_respects_order() {
        let first = spec(r#"{"type":"first","name":"f","fieldName":"x"}"#);
        let a = AggState::Relay {
            timestamp: 10,
            value: Scalar::String("early".into()),
        };
        let b = AggState::Relay {
            timestamp: 20,
            value: Scalar::String("late".into()),
        };
        let merged = first.combine(b.clone(), a.clone()).unwrap();
        assert_eq!(first.finalize(&merged), Scalar::String("early".into()));

        let last = spec(r#"{"type":"last","name":"l","fieldName":"x"}"#);
        let merged = last.combine(a, b).unwrap();
        assert_eq!(last.finalize(&merged), Scalar::String("late".into()));
    }

    #[test]
    fn test_cache_key_deterministic_and_distinct() {
        let a = spec(r#"{"type":"doubleSum","name":"m","fieldName":"x"}"#);
        let b = spec(r#"{"type":"doubleSum","name":"m","fieldName":"y"}"#);
        assert_eq!(a.cache_key(), a.cache_key());
        assert_ne!(a.cache_key(), b.cache_key());
    }
}
