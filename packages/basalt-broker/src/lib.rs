//! Basalt broker: the scatter/gather side of the engine.
//!
//! Queries arrive over HTTP, run through the lifecycle, fan out to the data
//! nodes holding segments, and stream partial results back for merging.
//! Cancellation (caller close, timeout, upstream error) flips the shared
//! flag and fires async DELETEs at every contacted peer.

mod broker;
mod client;
mod server;
mod watcher;

pub use broker::{Broker, BrokerConfig};
pub use client::{NodeClient, ResponseContext, WireFormat};
pub use server::{broker_router, historical_router, serve_broker, serve_historical};
pub use watcher::QueryWatcher;
