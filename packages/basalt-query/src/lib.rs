//! Basalt query plane.
//!
//! Declarative queries deserialize into [`Query`], per-kind engines execute
//! them against storage adapters, tool-chests merge and render results, and
//! [`QueryLifecycle`] serializes the per-request phases (plan, authorize,
//! execute, emit). Result forwarding writes rows to an external sink instead
//! of returning them.

mod auth;
mod context;
mod engine;
mod forward;
mod lifecycle;
mod postproc;
mod query;
mod result;
mod runner;
mod runtime;
mod toolchest;

pub use auth::{AllowAllAuthorizer, Authorizer};
pub use context::QueryContext;
pub use engine::run_engine;
pub use forward::{forward_results, ForwardSpec};
pub use lifecycle::{
    LifecycleState, LogMetricsEmitter, MetricsEmitter, PlannerResult, QueryLifecycle,
};
pub use postproc::PostProcessor;
pub use query::{
    GroupByQuery, Query, SearchQuery, SegmentMetadataQuery, SelectQuery, TimeseriesQuery,
    TopNQuery,
};
pub use result::{CompactRow, ResultItem, SearchHit, SegmentAnalysis, SelectBatch, SelectEvent};
pub use runner::{DataNode, ShelfSegment};
pub use runtime::Runtime;
pub use toolchest::{merge_items, render, result_ordering};
