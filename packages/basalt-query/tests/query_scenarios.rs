//! End-to-end engine scenarios over immutable segments.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use basalt_agg::ComplexRegistry;
use basalt_core::{parse_timestamp, Granularity, Interval, QueryCancel, Row};
use basalt_query::{render, DataNode, Query};
use basalt_storage::{
    IncrementalIndex, IndexSchema, Segment, SegmentAdapter, SegmentId,
};

fn base() -> i64 {
    parse_timestamp("2020-01-01T00:00:00Z").unwrap()
}

fn build_segment(rows: Vec<(i64, serde_json::Value)>) -> Arc<Segment> {
    let schema = IndexSchema {
        dimensions: vec!["country".into(), "device".into()],
        metrics: vec![
            serde_json::from_value(json!({"type":"count","name":"rows"})).unwrap(),
            serde_json::from_value(json!({"type":"doubleSum","name":"revenue","fieldName":"price"}))
                .unwrap(),
            serde_json::from_value(json!({"type":"variance","name":"priceVar","fieldName":"price"}))
                .unwrap(),
            serde_json::from_value(json!({"type":"hyperUnique","name":"users","fieldName":"user"}))
                .unwrap(),
        ],
        granularity: Granularity::Minute,
        rollup: true,
        max_row_count: 100_000,
        off_heap: false,
    };
    let index = IncrementalIndex::new(schema).unwrap();
    for (ts, event) in rows {
        let event = event.as_object().unwrap().clone().into_iter().collect();
        index.add(Row::new(ts, event)).unwrap();
    }
    Arc::new(
        Segment::from_incremental(
            &index,
            SegmentId {
                datasource: "sales".into(),
                interval: Interval::new(base(), base() + 86_400_000),
                version: "v1".into(),
                shard: 0,
            },
            Arc::new(ComplexRegistry::with_builtins()),
        )
        .unwrap(),
    )
}

fn sales_node() -> DataNode {
    let rows = vec![
        (base() + 1_000, json!({"country":"jp","device":"phone","price":10.0,"user":"u1"})),
        (base() + 2_000, json!({"country":"jp","device":"tablet","price":20.0,"user":"u2"})),
        (base() + 3_000, json!({"country":"us","device":"phone","price":30.0,"user":"u1"})),
        (base() + 61_000, json!({"country":"us","device":"phone","price":40.0,"user":"u3"})),
        (base() + 62_000, json!({"country":"de","device":"tablet","price":50.0,"user":"u2"})),
    ];
    let segment = build_segment(rows);
    let node = DataNode::new();
    node.add_segment(
        "sales",
        "sales_2020-01-01_v1_0",
        Interval::new(base(), base() + 86_400_000),
        Arc::new(SegmentAdapter::new(segment)),
    );
    node
}

fn run(node: &DataNode, query: serde_json::Value) -> Vec<serde_json::Value> {
    let query: Query = serde_json::from_value(query).unwrap();
    let items = node.run(&query, QueryCancel::new()).unwrap();
    render(&query, items).unwrap()
}

#[test]
fn test_timeseries_sum_per_minute() {
    let node = sales_node();
    let rows = run(
        &node,
        json!({
            "queryType": "timeseries",
            "dataSource": "sales",
            "intervals": ["2020-01-01/P1D"],
            "granularity": "MINUTE",
            "aggregations": [
                {"type": "count", "name": "rows"},
                {"type": "doubleSum", "name": "revenue", "fieldName": "revenue"}
            ]
        }),
    );
    assert_eq!(
        rows,
        vec![
            json!({"timestamp": "2020-01-01T00:00:00Z", "result": {"rows": 3, "revenue": 60.0}}),
            json!({"timestamp": "2020-01-01T00:01:00Z", "result": {"rows": 2, "revenue": 90.0}}),
        ]
    );
}

#[test]
fn test_topn_orders_by_metric() {
    let node = sales_node();
    let rows = run(
        &node,
        json!({
            "queryType": "topN",
            "dataSource": "sales",
            "intervals": ["2020-01-01/P1D"],
            "dimension": "country",
            "metric": "revenue",
            "threshold": 2,
            "granularity": "ALL",
            "aggregations": [
                {"type": "doubleSum", "name": "revenue", "fieldName": "revenue"}
            ]
        }),
    );
    assert_eq!(rows.len(), 1);
    let entries = rows[0]["result"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["country"], json!("us"));
    assert_eq!(entries[0]["revenue"], json!(70.0));
    assert_eq!(entries[1]["country"], json!("de"));
}

#[test]
fn test_groupby_with_having_and_postagg() {
    let node = sales_node();
    let rows = run(
        &node,
        json!({
            "queryType": "groupBy",
            "dataSource": "sales",
            "intervals": ["2020-01-01/P1D"],
            "dimensions": ["country"],
            "granularity": "ALL",
            "aggregations": [
                {"type": "count", "name": "rows"},
                {"type": "doubleSum", "name": "revenue", "fieldName": "revenue"}
            ],
            "postAggregations": [
                {"type": "arithmetic", "name": "avg", "fn": "/", "fields": [
                    {"type": "fieldAccess", "name": "r", "fieldName": "revenue"},
                    {"type": "fieldAccess", "name": "c", "fieldName": "rows"}
                ]}
            ],
            "having": "revenue > 40"
        }),
    );
    // de has 50, us has 70; jp (30) is filtered out
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row["version"], json!("v1"));
        let event = row["event"].as_object().unwrap();
        assert!(event.get("avg").is_some());
        assert!(event["revenue"].as_f64().unwrap() > 40.0);
    }
}

#[test]
fn test_variance_finalizes_across_rollup() {
    let node = sales_node();
    let rows = run(
        &node,
        json!({
            "queryType": "timeseries",
            "dataSource": "sales",
            "intervals": ["2020-01-01/P1D"],
            "granularity": "ALL",
            "aggregations": [
                {"type": "variance", "name": "priceVar", "fieldName": "priceVar"}
            ]
        }),
    );
    // prices 10,20,30,40,50: population variance = 200
    let got = rows[0]["result"]["priceVar"].as_f64().unwrap();
    assert!((got - 200.0).abs() < 1e-9, "variance {got}");
}

#[test]
fn test_hyperunique_counts_distinct_users() {
    let node = sales_node();
    let rows = run(
        &node,
        json!({
            "queryType": "timeseries",
            "dataSource": "sales",
            "intervals": ["2020-01-01/P1D"],
            "granularity": "ALL",
            "aggregations": [
                {"type": "hyperUnique", "name": "users", "fieldName": "users", "round": true}
            ]
        }),
    );
    assert_eq!(rows[0]["result"]["users"], json!(3));
}

#[test]
fn test_search_finds_values() {
    let node = sales_node();
    let rows = run(
        &node,
        json!({
            "queryType": "search",
            "dataSource": "sales",
            "intervals": ["2020-01-01/P1D"],
            "granularity": "ALL",
            "query": "ta"
        }),
    );
    let hits = rows[0]["result"].as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["dimension"], json!("device"));
    assert_eq!(hits[0]["value"], json!("tablet"));
    assert_eq!(hits[0]["count"], json!(2));
}

#[test]
fn test_select_pages_through_rows() {
    let node = sales_node();
    let first = run(
        &node,
        json!({
            "queryType": "select",
            "dataSource": "sales",
            "intervals": ["2020-01-01/P1D"],
            "granularity": "ALL",
            "pagingSpec": {"threshold": 3}
        }),
    );
    let result = &first[0]["result"];
    assert_eq!(result["events"].as_array().unwrap().len(), 3);
    let identifiers = result["pagingIdentifiers"].as_object().unwrap().clone();

    let second = run(
        &node,
        json!({
            "queryType": "select",
            "dataSource": "sales",
            "intervals": ["2020-01-01/P1D"],
            "granularity": "ALL",
            "pagingSpec": {"threshold": 3, "pagingIdentifiers": identifiers}
        }),
    );
    assert_eq!(second[0]["result"]["events"].as_array().unwrap().len(), 2);
}

#[test]
fn test_segment_metadata_reports_columns() {
    let node = sales_node();
    let rows = run(
        &node,
        json!({
            "queryType": "segmentMetadata",
            "dataSource": "sales",
            "intervals": ["2020-01-01/P1D"]
        }),
    );
    assert_eq!(rows.len(), 1);
    let columns = rows[0]["columns"].as_object().unwrap();
    assert_eq!(columns["country"]["cardinality"], json!(3));
    assert_eq!(columns["country"]["type"], json!("dimension.string"));
    assert_eq!(columns["users"]["type"], json!("hyperUnique"));
    assert_eq!(rows[0]["numRows"], json!(5));
    assert_eq!(rows[0]["ingestedNumRows"], json!(5));
}

#[test]
fn test_empty_interval_is_empty_not_error() {
    let node = sales_node();
    let rows = run(
        &node,
        json!({
            "queryType": "timeseries",
            "dataSource": "sales",
            "intervals": ["2021-06-01/P1D"],
            "granularity": "ALL",
            "aggregations": [{"type": "count", "name": "rows"}]
        }),
    );
    assert!(rows.is_empty());
}

#[test]
fn test_virtual_column_filter_and_grouping() {
    let node = sales_node();
    let rows = run(
        &node,
        json!({
            "queryType": "groupBy",
            "dataSource": "sales",
            "intervals": ["2020-01-01/P1D"],
            "dimensions": ["priceBand"],
            "granularity": "ALL",
            "virtualColumns": [
                {"type": "expr", "name": "priceBand", "expression": "revenue >= 40"}
            ],
            "aggregations": [{"type": "count", "name": "rows"}]
        }),
    );
    assert_eq!(rows.len(), 2);
}
