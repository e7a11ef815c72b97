//! Explicit runtime state: complex serdes and post-processor registry.
//!
//! Constructed once at process startup and passed by reference; nothing
//! lives in process-wide mutable tables.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as Json;

use basalt_agg::ComplexRegistry;
use basalt_core::{BasaltError, Result};

use crate::postproc::{ArrayToMap, PostProcessor, RowToList, TopK};
use crate::query::Query;

pub struct Runtime {
    complex: Arc<ComplexRegistry>,
    post_processors: HashMap<String, Arc<dyn PostProcessor>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Runtime with every built-in serde and post-processor registered.
    pub fn new() -> Runtime {
        let mut post_processors: HashMap<String, Arc<dyn PostProcessor>> = HashMap::new();
        post_processors.insert("arrayToMap".into(), Arc::new(ArrayToMap));
        post_processors.insert("rowToList".into(), Arc::new(RowToList));
        post_processors.insert("topK".into(), Arc::new(TopK));
        Runtime {
            complex: Arc::new(ComplexRegistry::with_builtins()),
            post_processors,
        }
    }

    pub fn complex(&self) -> &Arc<ComplexRegistry> {
        &self.complex
    }

    pub fn register_post_processor(&mut self, name: &str, p: Arc<dyn PostProcessor>) {
        self.post_processors.insert(name.to_string(), p);
    }

    /// Apply the context's `postProcessing` spec, when present.
    pub fn apply_post_processing(&self, query: &Query, rows: Vec<Json>) -> Result<Vec<Json>> {
        let Some(spec) = query.context().post_processing().cloned() else {
            return Ok(rows);
        };
        let kind = spec
            .get("type")
            .and_then(Json::as_str)
            .ok_or_else(|| {
                BasaltError::IllegalArgument("postProcessing requires a type".into())
            })?;
        let processor = self.post_processors.get(kind).ok_or_else(|| {
            BasaltError::IllegalArgument(format!("unknown post-processor: {kind}"))
        })?;
        processor.process(&spec, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_post_processor() {
        let runtime = Runtime::new();
        let query: Query = serde_json::from_value(json!({
            "queryType": "timeseries",
            "dataSource": "d",
            "intervals": ["2020-01-01/P1D"],
            "aggregations": [{"type": "count", "name": "c"}],
            "context": {"postProcessing": {"type": "nope"}}
        }))
        .unwrap();
        assert!(runtime.apply_post_processing(&query, vec![]).is_err());
    }
}
