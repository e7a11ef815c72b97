//! Post-aggregators: pure functions over the aggregated row.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use basalt_core::{BasaltError, Result, Scalar};

use crate::state::AggState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PostAggregatorSpec {
    #[serde(rename = "arithmetic")]
    Arithmetic {
        name: String,
        #[serde(rename = "fn")]
        op: String,
        fields: Vec<PostAggregatorSpec>,
    },
    #[serde(rename = "fieldAccess")]
    FieldAccess {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "constant")]
    Constant { name: String, value: f64 },
    #[serde(rename = "hyperUniqueCardinality")]
    HyperUniqueCardinality {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "sketchEstimate")]
    SketchEstimate {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
    #[serde(rename = "quantiles")]
    Quantiles {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
        #[serde(default = "default_fractions")]
        fractions: Vec<f64>,
    },
    #[serde(rename = "stddev")]
    StdDev {
        name: String,
        #[serde(rename = "fieldName")]
        field_name: String,
    },
}

fn default_fractions() -> Vec<f64> {
    vec![0.25, 0.5, 0.75]
}

impl PostAggregatorSpec {
    pub fn output_name(&self) -> &str {
        match self {
            PostAggregatorSpec::Arithmetic { name, .. }
            | PostAggregatorSpec::FieldAccess { name, .. }
            | PostAggregatorSpec::Constant { name, .. }
            | PostAggregatorSpec::HyperUniqueCardinality { name, .. }
            | PostAggregatorSpec::SketchEstimate { name, .. }
            | PostAggregatorSpec::Quantiles { name, .. }
            | PostAggregatorSpec::StdDev { name, .. } => name,
        }
    }

    /// Aggregator outputs this post-aggregator reads.
    pub fn required_fields(&self) -> Vec<String> {
        match self {
            PostAggregatorSpec::Arithmetic { fields, .. } => {
                fields.iter().flat_map(|f| f.required_fields()).collect()
            }
            PostAggregatorSpec::Constant { .. } => Vec::new(),
            PostAggregatorSpec::FieldAccess { field_name, .. }
            | PostAggregatorSpec::HyperUniqueCardinality { field_name, .. }
            | PostAggregatorSpec::SketchEstimate { field_name, .. }
            | PostAggregatorSpec::Quantiles { field_name, .. }
            | PostAggregatorSpec::StdDev { field_name, .. } => vec![field_name.clone()],
        }
    }

    pub fn compute(&self, row: &HashMap<String, AggState>) -> Result<Scalar> {
        match self {
            PostAggregatorSpec::Constant { value, .. } => Ok(Scalar::Double(*value)),
            PostAggregatorSpec::FieldAccess { field_name, .. } => Ok(row
                .get(field_name)
                .map(|s| s.order_key())
                .unwrap_or(Scalar::Null)),
            PostAggregatorSpec::HyperUniqueCardinality { field_name, .. }
            | PostAggregatorSpec::SketchEstimate { field_name, .. } => {
                match row.get(field_name) {
                    Some(AggState::Hll(h)) => Ok(Scalar::Double(h.estimate())),
                    Some(AggState::Theta(t)) => Ok(Scalar::Double(t.estimate())),
                    Some(other) => other.as_double().map(Scalar::Double).ok_or_else(|| {
                        BasaltError::IllegalArgument(format!(
                            "{field_name} holds no estimable state"
                        ))
                    }),
                    None => Ok(Scalar::Null),
                }
            }
            PostAggregatorSpec::Quantiles {
                field_name,
                fractions,
                ..
            } => match row.get(field_name) {
                Some(AggState::Quantiles(q)) => Ok(Scalar::Array(
                    q.quantiles(fractions)
                        .into_iter()
                        .map(|v| v.map(Scalar::Double).unwrap_or(Scalar::Null))
                        .collect(),
                )),
                _ => Err(BasaltError::IllegalArgument(format!(
                    "{field_name} is not a quantiles sketch"
                ))),
            },
            PostAggregatorSpec::StdDev { field_name, .. } => match row.get(field_name) {
                Some(AggState::Variance(v)) => {
                    Ok(Scalar::Double(v.variance_population().sqrt()))
                }
                _ => Err(BasaltError::IllegalArgument(format!(
                    "{field_name} is not a variance state"
                ))),
            },
            PostAggregatorSpec::Arithmetic { op, fields, .. } => {
                let mut values = Vec::with_capacity(fields.len());
                for f in fields {
                    let v = f.compute(row)?;
                    values.push(v.as_double().unwrap_or(f64::NAN));
                }
                if values.is_empty() {
                    return Err(BasaltError::IllegalArgument(
                        "arithmetic post-aggregator needs fields".into(),
                    ));
                }
                let mut acc = values[0];
                for v in &values[1..] {
                    acc = match op.as_str() {
                        "+" => acc + v,
                        "-" => acc - v,
                        "*" => acc * v,
                        "/" => {
                            if *v == 0.0 {
                                0.0
                            } else {
                                acc / v
                            }
                        }
                        other => {
                            return Err(BasaltError::IllegalArgument(format!(
                                "unknown arithmetic fn: {other}"
                            )))
                        }
                    };
                }
                Ok(Scalar::Double(acc))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_via_arithmetic() {
        let spec: PostAggregatorSpec = serde_json::from_str(
            r#"{"type":"arithmetic","name":"avg","fn":"/","fields":[
                {"type":"fieldAccess","name":"s","fieldName":"sum"},
                {"type":"fieldAccess","name":"c","fieldName":"count"}]}"#,
        )
        .unwrap();
        let row: HashMap<String, AggState> = [
            ("sum".to_string(), AggState::Double(10.0)),
            ("count".to_string(), AggState::Long(4)),
        ]
        .into_iter()
        .collect();
        assert_eq!(spec.compute(&row).unwrap(), Scalar::Double(2.5));
        assert_eq!(spec.required_fields(), vec!["sum", "count"]);
    }

    #[test]
    fn test_division_by_zero_yields_zero() {
        let spec: PostAggregatorSpec = serde_json::from_str(
            r#"{"type":"arithmetic","name":"r","fn":"/","fields":[
                {"type":"constant","name":"a","value":1.0},
                {"type":"constant","name":"b","value":0.0}]}"#,
        )
        .unwrap();
        assert_eq!(spec.compute(&HashMap::new()).unwrap(), Scalar::Double(0.0));
    }
}
