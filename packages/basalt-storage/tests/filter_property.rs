//! Property: for every filter and row, the bitmap (plus residual) produced
//! by compilation agrees with direct per-row evaluation.

use std::sync::Arc;

use proptest::prelude::*;

use basalt_agg::ComplexRegistry;
use basalt_core::{Granularity, Interval, QueryCancel, Row};
use basalt_storage::{
    DimFilter, FilterContext, IncrementalAdapter, IncrementalIndex, IndexSchema, ScanSpec,
    Segment, SegmentAdapter, SegmentId, StorageAdapter,
};

const VALUES: &[&str] = &["a", "b", "c", "d", "e"];

fn build_index(rows: &[(u8, u8)]) -> Arc<IncrementalIndex> {
    let schema = IndexSchema {
        dimensions: vec!["k".into(), "j".into()],
        metrics: vec![
            serde_json::from_value(serde_json::json!({"type":"count","name":"c"})).unwrap(),
        ],
        granularity: Granularity::None,
        rollup: false,
        max_row_count: 100_000,
        off_heap: false,
    };
    let index = IncrementalIndex::new(schema).unwrap();
    for (i, (k, j)) in rows.iter().enumerate() {
        index
            .add(Row::new(
                i as i64 * 1_000,
                [
                    (
                        "k".to_string(),
                        serde_json::json!(VALUES[*k as usize % VALUES.len()]),
                    ),
                    (
                        "j".to_string(),
                        serde_json::json!(VALUES[*j as usize % VALUES.len()]),
                    ),
                ]
                .into_iter()
                .collect(),
            ))
            .unwrap();
    }
    Arc::new(index)
}

fn filter_strategy() -> impl Strategy<Value = DimFilter> {
    let leaf = prop_oneof![
        (0..5u8).prop_map(|v| DimFilter::selector("k", VALUES[v as usize])),
        (0..5u8).prop_map(|v| DimFilter::selector("j", VALUES[v as usize])),
        (0..5u8, 0..5u8).prop_map(|(a, b)| DimFilter::In {
            dimension: "k".into(),
            values: vec![
                VALUES[a as usize].to_string(),
                VALUES[b as usize].to_string()
            ],
        }),
        (0..5u8, 0..5u8).prop_map(|(lo, hi)| DimFilter::Bound {
            dimension: "j".into(),
            lower: Some(VALUES[lo.min(hi) as usize].to_string()),
            upper: Some(VALUES[lo.max(hi) as usize].to_string()),
            lower_strict: false,
            upper_strict: false,
            numeric: false,
        }),
        Just(DimFilter::All),
        Just(DimFilter::None),
    ];
    leaf.prop_recursive(3, 24, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..3)
                .prop_map(|fields| DimFilter::And { fields }),
            prop::collection::vec(inner.clone(), 1..3)
                .prop_map(|fields| DimFilter::Or { fields }),
            inner.prop_map(DimFilter::not),
        ]
    })
}

fn matching_rows(adapter: &dyn StorageAdapter, filter: &DimFilter) -> Vec<(i64, String, String)> {
    let spec = ScanSpec {
        filter: Some(filter.clone()),
        interval: Interval::ETERNITY,
        virtual_columns: Arc::new(basalt_storage::VirtualColumns::empty()),
        granularity: Granularity::All,
        descending: false,
        cancel: QueryCancel::new(),
    };
    let mut out = Vec::new();
    for cursor in adapter.make_cursors(spec).unwrap() {
        let mut cursor = cursor.unwrap();
        while !cursor.is_done() {
            out.push((
                cursor.timestamp(),
                cursor.dim_values("k").join(","),
                cursor.dim_values("j").join(","),
            ));
            cursor.advance().unwrap();
        }
    }
    out.sort();
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Bitmap-compiled (segment) and residual-only (incremental) execution
    /// agree on every generated filter over every generated row set.
    #[test]
    fn bitmap_and_residual_agree(
        rows in prop::collection::vec((0..5u8, 0..5u8), 1..40),
        filter in filter_strategy(),
    ) {
        let index = build_index(&rows);
        let segment = Arc::new(
            Segment::from_incremental(
                &index,
                SegmentId {
                    datasource: "t".into(),
                    interval: Interval::ETERNITY,
                    version: "v1".into(),
                    shard: 0,
                },
                Arc::new(ComplexRegistry::with_builtins()),
            )
            .unwrap(),
        );
        let inc = IncrementalAdapter::new(Arc::clone(&index));
        let seg = SegmentAdapter::new(Arc::clone(&segment));

        let from_incremental = matching_rows(&inc, &filter);
        let from_segment = matching_rows(&seg, &filter);
        prop_assert_eq!(&from_incremental, &from_segment);

        // compiled exact bitmaps must match the scan exactly
        let ctx = FilterContext {
            source: Some(segment.as_ref()),
            num_rows: segment.num_rows(),
        };
        let compiled = filter.optimize().to_cnf().compile(&ctx);
        if compiled.exact {
            let bitmap = compiled.bitmap.expect("exact filters carry a bitmap");
            prop_assert_eq!(bitmap.len() as usize, from_segment.len());
        }
    }

    /// CNF and optimization never change filter semantics.
    #[test]
    fn optimize_and_cnf_preserve_semantics(
        rows in prop::collection::vec((0..5u8, 0..5u8), 1..30),
        filter in filter_strategy(),
    ) {
        let index = build_index(&rows);
        let inc = IncrementalAdapter::new(index);
        let plain = matching_rows(&inc, &filter);
        let optimized = matching_rows(&inc, &filter.optimize());
        let cnf = matching_rows(&inc, &filter.to_cnf());
        prop_assert_eq!(&plain, &optimized);
        prop_assert_eq!(&plain, &cnf);
    }
}
