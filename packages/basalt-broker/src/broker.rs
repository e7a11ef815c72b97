//! The broker proper: lifecycle-wrapped scatter, gather, merge, render,
//! forward.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::Value as Json;

use basalt_core::{BasaltError, QueryCancel, Result, Sequence};
use basalt_query::{
    forward_results, merge_items, render, Authorizer, DataNode, ForwardSpec, MetricsEmitter,
    PlannerResult, Query, QueryLifecycle, ResultItem, Runtime,
};

use crate::client::{NodeClient, ResponseContext};
use crate::watcher::QueryWatcher;

pub struct BrokerConfig {
    pub node_name: String,
    pub principal_header: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            node_name: "broker".into(),
            principal_header: "x-basalt-principal".into(),
        }
    }
}

pub struct Broker {
    runtime: Arc<Runtime>,
    watcher: Arc<QueryWatcher>,
    authorizer: Arc<dyn Authorizer>,
    emitter: Arc<dyn MetricsEmitter>,
    /// Segments held locally (a broker colocated with a realtime index).
    local: Arc<DataNode>,
    nodes: Vec<Arc<NodeClient>>,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(
        runtime: Arc<Runtime>,
        watcher: Arc<QueryWatcher>,
        authorizer: Arc<dyn Authorizer>,
        emitter: Arc<dyn MetricsEmitter>,
        local: Arc<DataNode>,
        nodes: Vec<Arc<NodeClient>>,
        config: BrokerConfig,
    ) -> Broker {
        Broker {
            runtime,
            watcher,
            authorizer,
            emitter,
            local,
            nodes,
            config,
        }
    }

    pub fn watcher(&self) -> &Arc<QueryWatcher> {
        &self.watcher
    }

    pub fn local(&self) -> &Arc<DataNode> {
        &self.local
    }

    /// Full per-query path: initialize, plan, authorize, scatter/gather,
    /// merge, render, optionally forward, emit. Returns the client-facing
    /// rows.
    pub async fn run_query(
        &self,
        query: Query,
        principal: &str,
        remote_address: &str,
    ) -> Result<Vec<Json>> {
        let lifecycle = QueryLifecycle::new(
            Arc::clone(&self.authorizer),
            Arc::clone(&self.emitter),
        );
        let outcome = self
            .run_with_lifecycle(&lifecycle, query, principal)
            .await;
        let bytes = outcome
            .as_ref()
            .map(|rows| serde_json::to_vec(rows).map(|v| v.len() as i64).unwrap_or(-1))
            .unwrap_or(-1);
        lifecycle.emit_logs_and_metrics(outcome.as_ref().err(), remote_address, bytes);
        outcome
    }

    async fn run_with_lifecycle(
        &self,
        lifecycle: &QueryLifecycle,
        mut query: Query,
        principal: &str,
    ) -> Result<Vec<Json>> {
        // stamp the id before the copy fans out so peers see it too
        query.context_mut().ensure_query_id();
        let query_id = lifecycle.initialize(query.clone())?;
        let cancel = lifecycle.cancel_handle();

        let fail_time = query
            .context()
            .timeout_ms()
            .map(|t| now_ms() + t.max(0));
        self.watcher.register(&query_id, cancel.clone(), fail_time);

        let result = self
            .run_registered(lifecycle, query, principal, &query_id, cancel, fail_time)
            .await;
        self.watcher.remove(&query_id);
        result
    }

    async fn run_registered(
        &self,
        lifecycle: &QueryLifecycle,
        query: Query,
        principal: &str,
        query_id: &str,
        cancel: QueryCancel,
        fail_time: Option<i64>,
    ) -> Result<Vec<Json>> {
        // the rendered rows land in this cell; the planner's runnable reads
        // it when the lifecycle executes
        let cell: Arc<Mutex<Option<Vec<Json>>>> = Arc::new(Mutex::new(None));
        let cell_for_run = Arc::clone(&cell);
        lifecycle.plan(|q| {
            let mut datasources = HashSet::new();
            datasources.insert(q.data_source().to_string());
            Ok(PlannerResult {
                datasources,
                row_type: row_type_of(q),
                run: Box::new(move || {
                    let rows = cell_for_run
                        .lock()
                        .map_err(|_| BasaltError::Internal("result cell poisoned".into()))?
                        .take()
                        .ok_or_else(|| {
                            BasaltError::Internal("executed before results gathered".into())
                        })?;
                    Ok(Sequence::from_vec(rows))
                }),
            })
        })?;
        lifecycle.authorize(principal)?;

        let response_context = ResponseContext::new(fail_time);
        let gathered = self
            .scatter_gather(&query, &cancel, &response_context)
            .await;
        let rows = match gathered {
            Ok(items) => {
                let merged = if query.context().by_segment() {
                    items.into_iter().flatten().collect()
                } else {
                    merge_items(&query, items)?
                };
                let rendered = render(&query, merged)?;
                let rendered = self.runtime.apply_post_processing(&query, rendered)?;
                match ForwardSpec::from_context(query.context()) {
                    Some(forward) => {
                        let meta = forward_results(
                            &forward,
                            Sequence::from_vec(rendered),
                            &self.config.node_name,
                        )?;
                        vec![meta]
                    }
                    None => rendered,
                }
            }
            Err(e) => {
                // any upstream failure cancels the rest of the fan-out
                cancel.cancel();
                self.cancel_peers(query_id);
                return Err(e);
            }
        };

        *cell.lock().map_err(|_| BasaltError::Internal("result cell poisoned".into()))? =
            Some(rows);
        let sequence = lifecycle.execute()?;
        let mut out = Vec::new();
        for row in sequence {
            out.push(row?);
        }
        Ok(out)
    }

    /// One partial result set per source: the local shelf plus every remote
    /// node, called concurrently.
    async fn scatter_gather(
        &self,
        query: &Query,
        cancel: &QueryCancel,
        response_context: &ResponseContext,
    ) -> Result<Vec<Vec<ResultItem>>> {
        let mut results = Vec::new();

        let local = Arc::clone(&self.local);
        let local_query = query.clone();
        let local_cancel = cancel.clone();
        let local_task = tokio::task::spawn_blocking(move || {
            local.run(&local_query, local_cancel)
        });

        let mut remote_tasks = Vec::new();
        for node in &self.nodes {
            let node = Arc::clone(node);
            let query = query.clone();
            let cancel = cancel.clone();
            let ctx = response_context.clone();
            remote_tasks.push(tokio::spawn(async move {
                node.run(&query, cancel, &ctx).await
            }));
        }

        results.push(
            local_task
                .await
                .map_err(|e| BasaltError::Internal(format!("local task: {e}")))??,
        );
        for task in remote_tasks {
            let partial = task
                .await
                .map_err(|e| BasaltError::Internal(format!("remote task: {e}")))??;
            results.push(partial);
        }

        if let Some(fail_time) = response_context.fail_time {
            if now_ms() > fail_time {
                cancel.cancel();
                return Err(BasaltError::Cancelled(
                    "query ran past its fail time during merge".into(),
                ));
            }
        }
        Ok(results)
    }

    /// Async DELETE to every configured peer.
    pub fn cancel_peers(&self, query_id: &str) {
        for node in &self.nodes {
            node.cancel_async(query_id);
        }
    }

    /// Cancel a running query by id: flips the flag and notifies peers.
    pub fn cancel_query(&self, query_id: &str) -> bool {
        let known = self.watcher.cancel(query_id);
        if known {
            self.cancel_peers(query_id);
        }
        known
    }
}

fn row_type_of(query: &Query) -> String {
    let mut parts = vec!["__time:long".to_string()];
    for d in query.dimensions() {
        parts.push(format!("{d}:string"));
    }
    for a in query.aggregations() {
        parts.push(format!("{}:{}", a.output_name(), a.finalized_type()));
    }
    parts.join(",")
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::{Granularity, Interval, Row};
    use basalt_query::{AllowAllAuthorizer, LifecycleState};
    use basalt_storage::{IncrementalAdapter, IncrementalIndex, IndexSchema};
    use serde_json::json;
    use std::collections::HashMap;

    struct NullEmitter;

    impl MetricsEmitter for NullEmitter {
        fn emit(&self, _m: &str, _v: f64, _d: &HashMap<String, String>) {}
    }

    fn local_broker() -> Broker {
        let schema = IndexSchema {
            dimensions: vec!["k".into()],
            metrics: vec![
                serde_json::from_value(json!({"type":"count","name":"c"})).unwrap(),
            ],
            granularity: Granularity::Minute,
            rollup: true,
            max_row_count: 10_000,
            off_heap: false,
        };
        let index = IncrementalIndex::new(schema).unwrap();
        let base = basalt_core::parse_timestamp("2020-01-01T00:00:00Z").unwrap();
        for (offset, k) in [(10_000, "a"), (20_000, "b"), (65_000, "a")] {
            index
                .add(Row::new(
                    base + offset,
                    [("k".to_string(), json!(k))].into_iter().collect(),
                ))
                .unwrap();
        }
        let node = Arc::new(DataNode::new());
        node.add_segment(
            "events",
            "events-rt",
            Interval::new(base, base + 86_400_000),
            Arc::new(IncrementalAdapter::new(Arc::new(index))),
        );
        Broker::new(
            Arc::new(Runtime::new()),
            QueryWatcher::new(),
            Arc::new(AllowAllAuthorizer),
            Arc::new(NullEmitter),
            node,
            Vec::new(),
            BrokerConfig::default(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeseries_end_to_end() {
        let broker = local_broker();
        let query: Query = serde_json::from_value(json!({
            "queryType": "timeseries",
            "dataSource": "events",
            "intervals": ["2020-01-01/P1D"],
            "granularity": "MINUTE",
            "aggregators": [{"type": "count", "name": "c"}]
        }))
        .unwrap();
        let rows = broker.run_query(query, "anyone", "127.0.0.1").await.unwrap();
        assert_eq!(
            rows,
            vec![
                json!({"timestamp": "2020-01-01T00:00:00Z", "result": {"c": 2}}),
                json!({"timestamp": "2020-01-01T00:01:00Z", "result": {"c": 1}}),
            ]
        );
        // watcher cleared after completion
        assert_eq!(broker.watcher().running_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_forwarded_query_returns_metadata_row() {
        let broker = local_broker();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.json");
        let query: Query = serde_json::from_value(json!({
            "queryType": "timeseries",
            "dataSource": "events",
            "intervals": ["2020-01-01/P1D"],
            "granularity": "MINUTE",
            "aggregators": [{"type": "count", "name": "c"}],
            "context": {
                "forwardURL": format!("file://{}", out.display()),
                "forwardContext": {"wrapAsList": true}
            }
        }))
        .unwrap();
        let rows = broker.run_query(query, "anyone", "local").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["rowCount"], json!(2));
        assert!(out.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lifecycle_state_trace() {
        let broker = local_broker();
        let lifecycle = QueryLifecycle::new(
            Arc::new(AllowAllAuthorizer),
            Arc::new(NullEmitter),
        );
        let query: Query = serde_json::from_value(json!({
            "queryType": "timeseries",
            "dataSource": "events",
            "intervals": ["2020-01-01/P1D"],
            "aggregators": [{"type": "count", "name": "c"}]
        }))
        .unwrap();
        broker
            .run_with_lifecycle(&lifecycle, query, "anyone")
            .await
            .unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Executing);
        lifecycle.emit_logs_and_metrics(None, "local", -1);
        assert_eq!(lifecycle.state(), LifecycleState::Done);
    }
}
