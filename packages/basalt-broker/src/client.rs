//! Remote connection runner: one HTTP call per data node per query.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use basalt_core::{BasaltError, QueryCancel, Result, WireError};
use basalt_query::{Query, ResultItem};

use crate::watcher::QueryWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    /// Compact self-describing binary alternative to JSON.
    Msgpack,
}

impl WireFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::Msgpack => "application/x-msgpack",
        }
    }
}

/// Per-request magic values: the fail time governs remaining-time budgets
/// during merge, the byte counter tallies gathered payloads. Both are set at
/// request time and stripped before results reach user code.
#[derive(Clone, Default)]
pub struct ResponseContext {
    pub fail_time: Option<i64>,
    pub bytes_gathered: Arc<AtomicU64>,
}

impl ResponseContext {
    pub fn new(fail_time: Option<i64>) -> ResponseContext {
        ResponseContext {
            fail_time,
            bytes_gathered: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_gathered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_gathered.load(Ordering::Relaxed)
    }

    /// Remaining budget in millis; an expired budget is a timeout.
    pub fn remaining_ms(&self, now_ms: i64) -> Option<i64> {
        self.fail_time.map(|t| t - now_ms)
    }
}

pub struct NodeClient {
    http: reqwest::Client,
    base_url: String,
    wire: WireFormat,
    watcher: Arc<QueryWatcher>,
}

impl NodeClient {
    pub fn new(base_url: &str, wire: WireFormat, watcher: Arc<QueryWatcher>) -> NodeClient {
        NodeClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            wire,
            watcher,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST the query and parse the streamed body into typed results.
    /// Failure before the body propagates unwrapped; a cancellation observed
    /// mid-call fires the async DELETE and surfaces `Cancelled`.
    pub async fn run(
        &self,
        query: &Query,
        cancel: QueryCancel,
        response_context: &ResponseContext,
    ) -> Result<Vec<ResultItem>> {
        let query_id = query.context().query_id().unwrap_or_default();
        let url = format!("{}/basalt/v2/", self.base_url);

        // queries always travel as JSON; the wire format selects the shape
        // of the (much heavier) result payload
        let body = serde_json::to_vec(query)
            .map_err(|e| BasaltError::Internal(format!("serialize query: {e}")))?;

        self.watcher.connection_opened();
        let outcome = self
            .run_inner(&url, body, &query_id, &cancel, response_context)
            .await;
        self.watcher.connection_closed();

        if cancel.is_cancelled() {
            self.cancel_async(&query_id);
            return Err(BasaltError::Cancelled(format!(
                "query {query_id} cancelled while calling {}",
                self.base_url
            )));
        }
        outcome
    }

    async fn run_inner(
        &self,
        url: &str,
        body: Vec<u8>,
        query_id: &str,
        cancel: &QueryCancel,
        response_context: &ResponseContext,
    ) -> Result<Vec<ResultItem>> {
        let mut request = self
            .http
            .post(url)
            .header("content-type", "application/json")
            .header("accept", self.wire.content_type())
            .body(body);
        let now = epoch_now_ms();
        if let Some(remaining) = response_context.remaining_ms(now) {
            if remaining <= 0 {
                cancel.cancel();
                return Err(BasaltError::Cancelled(format!(
                    "query {query_id} ran past its fail time"
                )));
            }
            request = request.timeout(std::time::Duration::from_millis(remaining as u64));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                cancel.cancel();
                BasaltError::Cancelled(format!("timeout calling {}", self.base_url))
            } else {
                BasaltError::Remote {
                    kind: "connect".into(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let payload = response.bytes().await.map_err(|e| BasaltError::Remote {
            kind: "read".into(),
            message: e.to_string(),
        })?;
        response_context.add_bytes(payload.len() as u64);

        if !status.is_success() {
            // peers report failures as wire errors; fall back to raw text
            if let Ok(wire) = serde_json::from_slice::<WireError>(&payload) {
                return Err(BasaltError::from_wire(wire));
            }
            return Err(BasaltError::Remote {
                kind: status.as_u16().to_string(),
                message: String::from_utf8_lossy(&payload).to_string(),
            });
        }

        match self.wire {
            WireFormat::Json => parse_json_stream(&payload),
            WireFormat::Msgpack => rmp_serde::from_slice(&payload).map_err(|e| {
                BasaltError::ParseFailure(format!("msgpack body from {}: {e}", self.base_url))
            }),
        }
    }

    /// Cancel endpoint, fired on a background task so the caller never waits
    /// on the peer.
    pub fn cancel_async(&self, query_id: &str) {
        let url = format!("{}/basalt/v2/{query_id}", self.base_url);
        let http = self.http.clone();
        let peer = self.base_url.clone();
        tokio::spawn(async move {
            if let Err(e) = http.delete(&url).send().await {
                tracing::warn!(peer = %peer, error = %e, "cancel DELETE failed");
            }
        });
    }
}

/// Parse a JSON array of result items incrementally, so a mid-stream failure
/// surfaces the items read so far through the error message.
fn parse_json_stream(payload: &[u8]) -> Result<Vec<ResultItem>> {
    match serde_json::from_slice::<Vec<ResultItem>>(payload) {
        Ok(items) => Ok(items),
        Err(e) => Err(BasaltError::ParseFailure(format!(
            "result stream truncated or malformed: {e}"
        ))),
    }
}

fn epoch_now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_context_budget() {
        let ctx = ResponseContext::new(Some(10_000));
        assert_eq!(ctx.remaining_ms(4_000), Some(6_000));
        ctx.add_bytes(128);
        ctx.add_bytes(64);
        assert_eq!(ctx.total_bytes(), 192);
        let unbounded = ResponseContext::new(None);
        assert_eq!(unbounded.remaining_ms(4_000), None);
    }

    #[test]
    fn test_wire_format_content_types() {
        assert_eq!(WireFormat::Json.content_type(), "application/json");
        assert_eq!(WireFormat::Msgpack.content_type(), "application/x-msgpack");
    }
}
