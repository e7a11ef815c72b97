//! `basalt <role>` server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use basalt_core::{Interval, Row};
use basalt_query::{AllowAllAuthorizer, DataNode, LogMetricsEmitter, Runtime};
use basalt_storage::{IncrementalAdapter, IncrementalIndex, IndexSchema};

use basalt_broker::{
    serve_broker, serve_historical, Broker, BrokerConfig, NodeClient, QueryWatcher, WireFormat,
};

#[derive(Parser)]
#[command(name = "basalt", about = "Basalt analytics engine node")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Query broker: accepts client queries, scatters to data nodes, merges.
    Broker {
        #[arg(long, default_value = "0.0.0.0:8082")]
        listen: SocketAddr,
        /// Data node base URLs, e.g. http://host:8083 (repeatable).
        #[arg(long = "data-node")]
        data_nodes: Vec<String>,
        /// Wire format for data-node calls.
        #[arg(long, default_value = "json")]
        wire: String,
        #[arg(long, default_value = "broker")]
        node_name: String,
    },
    /// Historical data node: serves the segments it holds.
    Historical {
        #[arg(long, default_value = "0.0.0.0:8083")]
        listen: SocketAddr,
        /// Optional seed file: `{"dataSource", "schema", "rows": [...]}`.
        #[arg(long)]
        seed: Option<std::path::PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match cli.role {
            Role::Broker {
                listen,
                data_nodes,
                wire,
                node_name,
            } => {
                let wire = match wire.as_str() {
                    "json" => WireFormat::Json,
                    "msgpack" => WireFormat::Msgpack,
                    other => anyhow::bail!("unknown wire format: {other}"),
                };
                let watcher = QueryWatcher::new();
                let nodes = data_nodes
                    .iter()
                    .map(|url| Arc::new(NodeClient::new(url, wire, Arc::clone(&watcher))))
                    .collect();
                let broker = Arc::new(Broker::new(
                    Arc::new(Runtime::new()),
                    Arc::clone(&watcher),
                    Arc::new(AllowAllAuthorizer),
                    Arc::new(LogMetricsEmitter),
                    Arc::new(DataNode::new()),
                    nodes,
                    BrokerConfig {
                        node_name,
                        ..Default::default()
                    },
                ));
                tracing::info!("🪨 basalt broker starting");
                serve_broker(broker, "x-basalt-principal", listen).await
            }
            Role::Historical { listen, seed } => {
                let node = Arc::new(DataNode::new());
                if let Some(path) = seed {
                    seed_node(&node, &path)?;
                }
                tracing::info!("🪨 basalt historical starting");
                serve_historical(node, QueryWatcher::new(), listen).await
            }
        }
    })
}

#[derive(serde::Deserialize)]
struct SeedFile {
    #[serde(rename = "dataSource")]
    data_source: String,
    schema: IndexSchema,
    rows: Vec<serde_json::Value>,
    #[serde(rename = "timestampField", default = "default_ts_field")]
    timestamp_field: String,
}

fn default_ts_field() -> String {
    "timestamp".to_string()
}

/// Load a JSON seed file into an incremental index registered on the shelf.
fn seed_node(node: &DataNode, path: &std::path::Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let seed: SeedFile = serde_json::from_str(&raw)?;
    let index = IncrementalIndex::new(seed.schema)?;
    for event in seed.rows {
        index.add(Row::from_json(event, &seed.timestamp_field)?)?;
    }
    let interval = match (index.min_time(), index.max_time()) {
        (Some(min), Some(max)) => Interval::new(min, max + 1),
        _ => Interval::ETERNITY,
    };
    let count = index.ingested_rows();
    node.add_segment(
        &seed.data_source,
        &format!("{}-seed", seed.data_source),
        interval,
        Arc::new(IncrementalAdapter::new(Arc::new(index))),
    );
    tracing::info!(rows = count, datasource = %seed.data_source, "seeded");
    Ok(())
}
