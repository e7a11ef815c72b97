//! Query context map with its reserved keys.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Free-form per-query options. Reserved keys: `queryId`, `timeout`,
/// `priority`, `bySegment`, `finalize`, `populateCache`, `useCache`,
/// `forwardURL`, `forwardContext`, `disableLog`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryContext(pub HashMap<String, Json>);

impl QueryContext {
    pub fn get(&self, key: &str) -> Option<&Json> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: Json) {
        self.0.insert(key.to_string(), value);
    }

    fn bool_flag(&self, key: &str) -> bool {
        self.0.get(key).and_then(Json::as_bool).unwrap_or(false)
    }

    pub fn query_id(&self) -> Option<String> {
        self.0
            .get("queryId")
            .and_then(Json::as_str)
            .map(|s| s.to_string())
    }

    /// Stamp a fresh uuid when absent; returns the effective id.
    pub fn ensure_query_id(&mut self) -> String {
        if let Some(id) = self.query_id() {
            return id;
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.set("queryId", Json::String(id.clone()));
        id
    }

    pub fn timeout_ms(&self) -> Option<i64> {
        self.0.get("timeout").and_then(Json::as_i64)
    }

    pub fn priority(&self) -> i64 {
        self.0.get("priority").and_then(Json::as_i64).unwrap_or(0)
    }

    pub fn by_segment(&self) -> bool {
        self.bool_flag("bySegment")
    }

    pub fn finalize(&self) -> bool {
        self.0
            .get("finalize")
            .and_then(Json::as_bool)
            .unwrap_or(true)
    }

    pub fn populate_cache(&self) -> bool {
        self.0
            .get("populateCache")
            .and_then(Json::as_bool)
            .unwrap_or(true)
    }

    pub fn use_cache(&self) -> bool {
        self.0
            .get("useCache")
            .and_then(Json::as_bool)
            .unwrap_or(true)
    }

    pub fn forward_url(&self) -> Option<String> {
        self.0
            .get("forwardURL")
            .and_then(Json::as_str)
            .map(|s| s.to_string())
    }

    pub fn forward_context(&self) -> HashMap<String, Json> {
        self.0
            .get("forwardContext")
            .and_then(Json::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn disable_log(&self) -> bool {
        self.bool_flag("disableLog")
    }

    pub fn post_processing(&self) -> Option<&Json> {
        self.0.get("postProcessing")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_id_stamped_once() {
        let mut ctx = QueryContext::default();
        let id = ctx.ensure_query_id();
        assert_eq!(ctx.ensure_query_id(), id);
        assert_eq!(ctx.query_id(), Some(id));
    }

    #[test]
    fn test_defaults() {
        let ctx = QueryContext::default();
        assert!(!ctx.by_segment());
        assert!(ctx.finalize());
        assert!(ctx.use_cache());
        assert_eq!(ctx.priority(), 0);
        assert_eq!(ctx.forward_url(), None);
    }
}
