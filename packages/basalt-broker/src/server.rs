//! HTTP surface: `POST /basalt/v2/` runs a query, `DELETE /basalt/v2/:id`
//! cancels it. The broker serves merged client rows; a historical serves
//! typed partial results for the broker to merge.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::Router;

use basalt_core::{BasaltError, QueryCancel};
use basalt_query::{DataNode, Query};

use crate::broker::Broker;
use crate::client::WireFormat;
use crate::watcher::QueryWatcher;

fn status_for(e: &BasaltError) -> StatusCode {
    match e {
        BasaltError::IllegalArgument(_) | BasaltError::ParseFailure(_) => StatusCode::BAD_REQUEST,
        BasaltError::Unauthorized(_) => StatusCode::FORBIDDEN,
        BasaltError::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
        BasaltError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &BasaltError) -> Response {
    let body = serde_json::to_vec(&e.to_wire()).unwrap_or_default();
    (
        status_for(e),
        [("content-type", "application/json")],
        body,
    )
        .into_response()
}

/// Queries are always JSON; the `accept` header picks the result wire.
fn parse_query(headers: &HeaderMap, body: &Bytes) -> Result<(Query, WireFormat), BasaltError> {
    let query = serde_json::from_slice(body)
        .map_err(|e| BasaltError::ParseFailure(e.to_string()))?;
    let accept = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    let wire = if accept.starts_with("application/x-msgpack") {
        WireFormat::Msgpack
    } else {
        WireFormat::Json
    };
    Ok((query, wire))
}

// ---- broker role ----

#[derive(Clone)]
struct BrokerState {
    broker: Arc<Broker>,
    principal_header: String,
}

async fn broker_query(
    State(state): State<BrokerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (query, _wire) = match parse_query(&headers, &body) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(&e),
    };
    let principal = headers
        .get(&state.principal_header)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();
    let remote = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    match state.broker.run_query(query, &principal, &remote).await {
        Ok(rows) => axum::Json(rows).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn broker_cancel(
    State(state): State<BrokerState>,
    Path(query_id): Path<String>,
) -> Response {
    if state.broker.cancel_query(&query_id) {
        StatusCode::ACCEPTED.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

pub fn broker_router(broker: Arc<Broker>, principal_header: &str) -> Router {
    let state = BrokerState {
        broker,
        principal_header: principal_header.to_string(),
    };
    Router::new()
        .route("/basalt/v2/", post(broker_query))
        .route("/basalt/v2/:id", delete(broker_cancel))
        .with_state(state)
}

pub async fn serve_broker(
    broker: Arc<Broker>,
    principal_header: &str,
    addr: std::net::SocketAddr,
) -> anyhow::Result<()> {
    let app = broker_router(broker, principal_header);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "broker listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

// ---- historical role ----

#[derive(Clone)]
struct HistoricalState {
    node: Arc<DataNode>,
    watcher: Arc<QueryWatcher>,
}

async fn historical_query(
    State(state): State<HistoricalState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (mut query, wire) = match parse_query(&headers, &body) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(&e),
    };
    let query_id = query.context_mut().ensure_query_id();
    let cancel = QueryCancel::new();
    state.watcher.register(&query_id, cancel.clone(), None);

    let node = Arc::clone(&state.node);
    let run_query = query.clone();
    let run_cancel = cancel.clone();
    let outcome =
        tokio::task::spawn_blocking(move || node.run(&run_query, run_cancel)).await;
    state.watcher.remove(&query_id);

    let items = match outcome {
        Ok(Ok(items)) => items,
        Ok(Err(e)) => return error_response(&e),
        Err(e) => return error_response(&BasaltError::Internal(e.to_string())),
    };
    match wire {
        WireFormat::Json => axum::Json(items).into_response(),
        WireFormat::Msgpack => match rmp_serde::to_vec(&items) {
            Ok(bytes) => (
                StatusCode::OK,
                [("content-type", "application/x-msgpack")],
                bytes,
            )
                .into_response(),
            Err(e) => error_response(&BasaltError::Internal(e.to_string())),
        },
    }
}

async fn historical_cancel(
    State(state): State<HistoricalState>,
    Path(query_id): Path<String>,
) -> Response {
    if state.watcher.cancel(&query_id) {
        StatusCode::ACCEPTED.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

pub fn historical_router(node: Arc<DataNode>, watcher: Arc<QueryWatcher>) -> Router {
    let state = HistoricalState { node, watcher };
    Router::new()
        .route("/basalt/v2/", post(historical_query))
        .route("/basalt/v2/:id", delete(historical_cancel))
        .with_state(state)
}

pub async fn serve_historical(
    node: Arc<DataNode>,
    watcher: Arc<QueryWatcher>,
    addr: std::net::SocketAddr,
) -> anyhow::Result<()> {
    let app = historical_router(node, watcher);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "historical listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "shutdown signal handler failed");
    }
    tracing::info!("shutdown signal received");
}
