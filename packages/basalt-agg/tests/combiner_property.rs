//! Property: combining per-partition partials equals aggregating the whole
//! stream, for every partitioning.

use proptest::prelude::*;

use basalt_agg::{AggState, AggregatorSpec};
use basalt_core::Scalar;

fn spec(json: serde_json::Value) -> AggregatorSpec {
    serde_json::from_value(json).unwrap()
}

/// Fold a slice of doubles into a partial for the given factory.
fn partial(agg: &AggregatorSpec, values: &[f64]) -> AggState {
    let mut state = agg.init_state();
    for v in values {
        state = match state {
            AggState::Long(n) => AggState::Long(n + 1), // count
            AggState::Double(sum) => AggState::Double(sum + v),
            AggState::Variance(mut s) => {
                s.add(*v);
                AggState::Variance(s)
            }
            AggState::Kurtosis(mut s) => {
                s.add(*v);
                AggState::Kurtosis(s)
            }
            AggState::Hll(mut h) => {
                h.add_value(&Scalar::Long(*v as i64));
                AggState::Hll(h)
            }
            AggState::Theta(mut t) => {
                t.update(&Scalar::Long(*v as i64));
                AggState::Theta(t)
            }
            other => other,
        };
    }
    state
}

fn close_enough(a: f64, b: f64) -> bool {
    let scale = a.abs().max(b.abs()).max(1e-12);
    ((a - b) / scale).abs() < 1e-9
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn partitioned_combine_equals_whole(
        values in prop::collection::vec(-1e6..1e6f64, 1..120),
        split in 0usize..120,
    ) {
        let split = split % values.len();
        let (left, right) = values.split_at(split);

        for json in [
            serde_json::json!({"type": "count", "name": "m"}),
            serde_json::json!({"type": "doubleSum", "name": "m", "fieldName": "x"}),
            serde_json::json!({"type": "variance", "name": "m", "fieldName": "x"}),
            serde_json::json!({"type": "kurtosis", "name": "m", "fieldName": "x"}),
        ] {
            let agg = spec(json);
            let whole = partial(&agg, &values);
            let combined = agg
                .combine(partial(&agg, left), partial(&agg, right))
                .unwrap();
            let a = agg.finalize(&whole).as_double().unwrap_or(0.0);
            let b = agg.finalize(&combined).as_double().unwrap_or(0.0);
            prop_assert!(
                close_enough(a, b),
                "{}: whole={a} combined={b}",
                agg.output_name()
            );
        }
    }

    /// Sketch folds are exactly associative: any partition produces the
    /// identical state, not just an equal estimate.
    #[test]
    fn sketch_fold_is_partition_independent(
        values in prop::collection::vec(0i64..5_000, 1..300),
        split in 0usize..300,
    ) {
        let split = split % values.len();
        let doubles: Vec<f64> = values.iter().map(|v| *v as f64).collect();
        let (left, right) = doubles.split_at(split);

        for json in [
            serde_json::json!({"type": "hyperUnique", "name": "m", "fieldName": "x"}),
            serde_json::json!({"type": "thetaSketch", "name": "m", "fieldName": "x", "size": 256}),
        ] {
            let agg = spec(json);
            let whole = partial(&agg, &doubles);
            let combined = agg
                .combine(partial(&agg, left), partial(&agg, right))
                .unwrap();
            prop_assert_eq!(whole, combined);
        }
    }

    /// Combining is commutative for the unordered families.
    #[test]
    fn combine_is_commutative(
        values in prop::collection::vec(-1e4..1e4f64, 2..60),
        split in 1usize..59,
    ) {
        let split = split % (values.len() - 1) + 1;
        let (left, right) = values.split_at(split);
        for json in [
            serde_json::json!({"type": "doubleSum", "name": "m", "fieldName": "x"}),
            serde_json::json!({"type": "variance", "name": "m", "fieldName": "x"}),
        ] {
            let agg = spec(json);
            let ab = agg
                .combine(partial(&agg, left), partial(&agg, right))
                .unwrap();
            let ba = agg
                .combine(partial(&agg, right), partial(&agg, left))
                .unwrap();
            let a = agg.finalize(&ab).as_double().unwrap_or(0.0);
            let b = agg.finalize(&ba).as_double().unwrap_or(0.0);
            prop_assert!(close_enough(a, b));
        }
    }
}
