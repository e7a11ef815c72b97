//! Per-query lifecycle: one state machine per request, guarding phase order
//! and emitting metrics exactly once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value as Json;

use basalt_core::{BasaltError, QueryCancel, Result, Sequence};

use crate::auth::Authorizer;
use crate::query::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    New,
    Initialized,
    Planned,
    Authorizing,
    Authorized,
    Unauthorized,
    Executing,
    Done,
}

impl LifecycleState {
    fn name(&self) -> &'static str {
        match self {
            LifecycleState::New => "NEW",
            LifecycleState::Initialized => "INITIALIZED",
            LifecycleState::Planned => "PLANNED",
            LifecycleState::Authorizing => "AUTHORIZING",
            LifecycleState::Authorized => "AUTHORIZED",
            LifecycleState::Unauthorized => "UNAUTHORIZED",
            LifecycleState::Executing => "EXECUTING",
            LifecycleState::Done => "DONE",
        }
    }
}

/// Plan output: datasources for authorization, a row-type description, and
/// the runnable producing the lazy result sequence.
pub struct PlannerResult {
    pub datasources: HashSet<String>,
    pub row_type: String,
    pub run: Box<dyn FnOnce() -> Result<Sequence<Json>> + Send>,
}

pub trait MetricsEmitter: Send + Sync {
    fn emit(&self, metric: &str, value: f64, dimensions: &HashMap<String, String>);
}

/// Default emitter: structured events through tracing.
pub struct LogMetricsEmitter;

impl MetricsEmitter for LogMetricsEmitter {
    fn emit(&self, metric: &str, value: f64, dimensions: &HashMap<String, String>) {
        tracing::info!(metric, value, ?dimensions, "metric");
    }
}

struct Inner {
    state: LifecycleState,
    query: Option<Query>,
    query_id: Option<String>,
    planned: Option<PlannerResult>,
    emitted: bool,
}

pub struct QueryLifecycle {
    authorizer: Arc<dyn Authorizer>,
    emitter: Arc<dyn MetricsEmitter>,
    cancel: QueryCancel,
    started: Instant,
    inner: Mutex<Inner>,
}

impl QueryLifecycle {
    pub fn new(authorizer: Arc<dyn Authorizer>, emitter: Arc<dyn MetricsEmitter>) -> QueryLifecycle {
        QueryLifecycle {
            authorizer,
            emitter,
            cancel: QueryCancel::new(),
            started: Instant::now(),
            inner: Mutex::new(Inner {
                state: LifecycleState::New,
                query: None,
                query_id: None,
                planned: None,
                emitted: false,
            }),
        }
    }

    pub fn cancel_handle(&self) -> QueryCancel {
        self.cancel.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    fn transition(inner: &mut Inner, from: LifecycleState, to: LifecycleState) -> Result<()> {
        if inner.state != from {
            return Err(BasaltError::IllegalState {
                from: from.name().to_string(),
                to: to.name().to_string(),
                current: inner.state.name().to_string(),
            });
        }
        inner.state = to;
        Ok(())
    }

    /// Stamp a query id into the context when absent; returns the id.
    pub fn initialize(&self, mut query: Query) -> Result<String> {
        let mut inner = self.inner.lock();
        Self::transition(&mut inner, LifecycleState::New, LifecycleState::Initialized)?;
        let id = query.context_mut().ensure_query_id();
        inner.query_id = Some(id.clone());
        inner.query = Some(query);
        Ok(id)
    }

    /// Validate the query and invoke the planner collaborator.
    pub fn plan(
        &self,
        planner: impl FnOnce(&Query) -> Result<PlannerResult>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::transition(&mut inner, LifecycleState::Initialized, LifecycleState::Planned)?;
        let query = inner
            .query
            .as_ref()
            .ok_or_else(|| BasaltError::Internal("no query after initialize".into()))?;
        query.validate()?;
        let planned = planner(query)?;
        inner.planned = Some(planned);
        Ok(())
    }

    /// Consult the authorizer with the planner-declared datasource set. Even
    /// a disabled (allow-all) setup routes PLANNED → AUTHORIZING →
    /// AUTHORIZED.
    pub fn authorize(&self, principal: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::transition(&mut inner, LifecycleState::Planned, LifecycleState::Authorizing)?;
        let datasources = inner
            .planned
            .as_ref()
            .map(|p| p.datasources.clone())
            .unwrap_or_default();
        if self.authorizer.authorize(principal, &datasources) {
            Self::transition(&mut inner, LifecycleState::Authorizing, LifecycleState::Authorized)
        } else {
            Self::transition(
                &mut inner,
                LifecycleState::Authorizing,
                LifecycleState::Unauthorized,
            )?;
            Err(BasaltError::Unauthorized(format!(
                "{principal} may not read {datasources:?}"
            )))
        }
    }

    /// Run the planned query; closing (dropping) the returned sequence is
    /// the cancellation signal.
    pub fn execute(&self) -> Result<Sequence<Json>> {
        let planned = {
            let mut inner = self.inner.lock();
            Self::transition(&mut inner, LifecycleState::Authorized, LifecycleState::Executing)?;
            inner
                .planned
                .take()
                .ok_or_else(|| BasaltError::Internal("no plan after authorize".into()))?
        };
        let cancel = self.cancel.clone();
        let sequence = (planned.run)()?;
        Ok(sequence.on_close(move || cancel.cancel()))
    }

    /// Exactly once per terminated query; re-entry logs a warning and emits
    /// nothing.
    pub fn emit_logs_and_metrics(
        &self,
        error: Option<&BasaltError>,
        remote_address: &str,
        bytes_written: i64,
    ) {
        let mut inner = self.inner.lock();
        if inner.emitted {
            tracing::warn!(
                query_id = inner.query_id.as_deref().unwrap_or("unknown"),
                "emitLogsAndMetrics already called"
            );
            return;
        }
        inner.emitted = true;
        inner.state = LifecycleState::Done;

        let id = inner.query_id.clone().unwrap_or_default();
        let datasource = inner
            .query
            .as_ref()
            .map(|q| q.data_source().to_string())
            .unwrap_or_default();
        let success = error.is_none();
        let elapsed_ms = self.started.elapsed().as_millis() as f64;

        let mut dims = HashMap::new();
        dims.insert("id".to_string(), id.clone());
        dims.insert("dataSource".to_string(), datasource.clone());
        dims.insert("remoteAddress".to_string(), remote_address.to_string());
        dims.insert("success".to_string(), success.to_string());

        self.emitter.emit("query/time", elapsed_ms, &dims);
        if bytes_written >= 0 {
            self.emitter.emit("query/bytes", bytes_written as f64, &dims);
        }

        let disable_log = inner
            .query
            .as_ref()
            .map(|q| q.context().disable_log())
            .unwrap_or(false);
        if !disable_log {
            tracing::info!(
                query_id = %id,
                data_source = %datasource,
                remote_address,
                success,
                elapsed_ms,
                error = error.map(|e| e.to_string()),
                "request log"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAllAuthorizer;
    use parking_lot::Mutex as PMutex;
    use serde_json::json;

    fn query() -> Query {
        serde_json::from_value(json!({
            "queryType": "timeseries",
            "dataSource": "events",
            "intervals": ["2020-01-01/P1D"],
            "aggregators": [{"type": "count", "name": "c"}]
        }))
        .unwrap()
    }

    fn planner(q: &Query) -> Result<PlannerResult> {
        let mut datasources = HashSet::new();
        datasources.insert(q.data_source().to_string());
        Ok(PlannerResult {
            datasources,
            row_type: "timestamp:long,c:long".into(),
            run: Box::new(|| Ok(Sequence::from_vec(vec![json!({"c": 1})]))),
        })
    }

    struct CountingEmitter(PMutex<Vec<String>>);

    impl MetricsEmitter for CountingEmitter {
        fn emit(&self, metric: &str, _value: f64, _dims: &HashMap<String, String>) {
            self.0.lock().push(metric.to_string());
        }
    }

    #[test]
    fn test_full_lifecycle_path() {
        let emitter = Arc::new(CountingEmitter(PMutex::new(Vec::new())));
        let lc = QueryLifecycle::new(Arc::new(AllowAllAuthorizer), Arc::clone(&emitter) as _);
        lc.initialize(query()).unwrap();
        lc.plan(planner).unwrap();
        lc.authorize("anyone").unwrap();
        let rows = lc.execute().unwrap().to_vec().unwrap();
        assert_eq!(rows.len(), 1);
        lc.emit_logs_and_metrics(None, "127.0.0.1", 42);
        assert_eq!(
            emitter.0.lock().as_slice(),
            &["query/time".to_string(), "query/bytes".to_string()]
        );
    }

    /// Spec scenario S3: execute on a NEW lifecycle names all three states.
    #[test]
    fn test_execute_on_new_fails_with_named_states() {
        let lc = QueryLifecycle::new(Arc::new(AllowAllAuthorizer), Arc::new(LogMetricsEmitter));
        let err = lc.execute().unwrap_err();
        assert_eq!(
            err.to_string(),
            "illegal state: from=AUTHORIZED,to=EXECUTING,current=NEW"
        );
    }

    #[test]
    fn test_double_emit_does_not_duplicate() {
        let emitter = Arc::new(CountingEmitter(PMutex::new(Vec::new())));
        let lc = QueryLifecycle::new(Arc::new(AllowAllAuthorizer), Arc::clone(&emitter) as _);
        lc.initialize(query()).unwrap();
        lc.emit_logs_and_metrics(None, "local", -1);
        lc.emit_logs_and_metrics(None, "local", -1);
        assert_eq!(emitter.0.lock().len(), 1); // only query/time, once
    }

    #[test]
    fn test_out_of_order_plan() {
        let lc = QueryLifecycle::new(Arc::new(AllowAllAuthorizer), Arc::new(LogMetricsEmitter));
        assert!(matches!(
            lc.plan(planner),
            Err(BasaltError::IllegalState { .. })
        ));
    }

    #[test]
    fn test_close_cancels() {
        let lc = QueryLifecycle::new(Arc::new(AllowAllAuthorizer), Arc::new(LogMetricsEmitter));
        lc.initialize(query()).unwrap();
        lc.plan(planner).unwrap();
        lc.authorize("anyone").unwrap();
        let cancel = lc.cancel_handle();
        let mut seq = lc.execute().unwrap();
        assert!(!cancel.is_cancelled());
        seq.close();
        assert!(cancel.is_cancelled());
    }
}
