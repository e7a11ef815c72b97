//! Broker ↔ historical wire tests over a real TCP socket, including the
//! cancellation path: closing the caller side DELETEs the peer and every
//! open cursor observes the flag.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;

use basalt_broker::{Broker, BrokerConfig, NodeClient, QueryWatcher, WireFormat};
use basalt_core::{parse_timestamp, Granularity, Interval, QueryCancel, Row};
use basalt_query::{
    AllowAllAuthorizer, DataNode, MetricsEmitter, Query, Runtime,
};
use basalt_storage::{IncrementalAdapter, IncrementalIndex, IndexSchema};

struct NullEmitter;

impl MetricsEmitter for NullEmitter {
    fn emit(&self, _m: &str, _v: f64, _d: &std::collections::HashMap<String, String>) {}
}

fn seeded_node(rows: usize) -> Arc<DataNode> {
    let schema = IndexSchema {
        dimensions: vec!["k".into()],
        metrics: vec![serde_json::from_value(json!({"type":"count","name":"c"})).unwrap()],
        granularity: Granularity::Minute,
        rollup: true,
        max_row_count: 1_000_000,
        off_heap: false,
    };
    let index = IncrementalIndex::new(schema).unwrap();
    let base = parse_timestamp("2020-01-01T00:00:00Z").unwrap();
    for i in 0..rows {
        index
            .add(Row::new(
                base + (i as i64 % 120) * 1_000,
                [("k".to_string(), json!(format!("v{}", i % 10)))]
                    .into_iter()
                    .collect(),
            ))
            .unwrap();
    }
    let node = Arc::new(DataNode::new());
    node.add_segment(
        "events",
        "events-seg",
        Interval::new(base, base + 86_400_000),
        Arc::new(IncrementalAdapter::new(Arc::new(index))),
    );
    node
}

async fn spawn_historical(node: Arc<DataNode>, watcher: Arc<QueryWatcher>) -> SocketAddr {
    let app = basalt_broker::historical_router(node, watcher);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn count_query() -> Query {
    serde_json::from_value(json!({
        "queryType": "timeseries",
        "dataSource": "events",
        "intervals": ["2020-01-01/P1D"],
        "granularity": "ALL",
        "aggregators": [{"type": "count", "name": "c"}],
        "context": {"queryId": "round-trip-1"}
    }))
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_json_round_trip_through_historical() {
    let node = seeded_node(240);
    let remote_watcher = QueryWatcher::new();
    let addr = spawn_historical(node, Arc::clone(&remote_watcher)).await;

    let broker_watcher = QueryWatcher::new();
    let client = NodeClient::new(
        &format!("http://{addr}"),
        WireFormat::Json,
        Arc::clone(&broker_watcher),
    );
    let ctx = basalt_broker::ResponseContext::new(None);
    let items = client
        .run(&count_query(), QueryCancel::new(), &ctx)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert!(ctx.total_bytes() > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_msgpack_round_trip_through_historical() {
    let node = seeded_node(240);
    let addr = spawn_historical(node, QueryWatcher::new()).await;
    let client = NodeClient::new(
        &format!("http://{addr}"),
        WireFormat::Msgpack,
        QueryWatcher::new(),
    );
    let ctx = basalt_broker::ResponseContext::new(None);
    let items = client
        .run(&count_query(), QueryCancel::new(), &ctx)
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_broker_merges_remote_and_local() {
    let remote_node = seeded_node(120);
    let addr = spawn_historical(remote_node, QueryWatcher::new()).await;

    let watcher = QueryWatcher::new();
    let client = Arc::new(NodeClient::new(
        &format!("http://{addr}"),
        WireFormat::Json,
        Arc::clone(&watcher),
    ));
    let broker = Broker::new(
        Arc::new(Runtime::new()),
        Arc::clone(&watcher),
        Arc::new(AllowAllAuthorizer),
        Arc::new(NullEmitter),
        seeded_node(120),
        vec![client],
        BrokerConfig::default(),
    );
    let rows = broker
        .run_query(count_query(), "anyone", "test")
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    // both sources contribute: 120 local + 120 remote rows
    assert_eq!(rows[0]["result"]["c"], json!(240));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_cancel_endpoint() {
    let node = seeded_node(10);
    let remote_watcher = QueryWatcher::new();
    let addr = spawn_historical(node, Arc::clone(&remote_watcher)).await;

    // a registered remote query observes the DELETE
    let cancel = QueryCancel::new();
    remote_watcher.register("stuck-query", cancel.clone(), None);
    let http = reqwest::Client::new();
    let status = http
        .delete(format!("http://{addr}/basalt/v2/stuck-query"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status.as_u16(), 202);
    assert!(cancel.is_cancelled());

    // unknown ids are 404
    let status = http
        .delete(format!("http://{addr}/basalt/v2/nope"))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status.as_u16(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_scan_raises_everywhere() {
    // cancellation flips the shared flag; every open cursor errors on its
    // next advance
    let node = seeded_node(500);
    let cancel = QueryCancel::new();
    let query = count_query();
    cancel.cancel();
    let err = node.run(&query, cancel).unwrap_err();
    assert!(matches!(err, basalt_core::BasaltError::Cancelled(_)));
}
