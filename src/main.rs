use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use marshal_cluster::{spawn_sweeper, Cluster, Node, TrackedSession};
use marshal_core::config::MarshalConfig;
use marshal_dispatch::{Dispatcher, TransportRegistry};
use marshal_policy::{FixedCostProvider, PolicyEngine};
use marshal_router::Router;
use marshal_server::start;
use marshal_store::{Database, NodeRepo, NodeRow, SessionRepo, SessionRow};
use marshal_telemetry::{init_telemetry, TelemetryConfig};

/// Supervisor daemon for remote agent workers.
#[derive(Parser, Debug)]
#[command(name = "marshald", version)]
struct Args {
    /// Path to a JSON config file. Env vars override file values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen port from the config.
    #[arg(long)]
    port: Option<u16>,

    /// Override the SQLite database path from the config.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_telemetry(&TelemetryConfig { log_level: Level::INFO, json: args.json_logs });

    let mut config = MarshalConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(db_path) = args.db_path {
        config.store.db_path = db_path;
    }

    // A migration checksum mismatch means the database was written by an
    // incompatible build; refuse to start rather than risk corruption.
    let db = Database::open(&config.store.db_path)?;
    tracing::info!(path = %config.store.db_path.display(), "database opened");

    let cluster = Arc::new(Cluster::new(config.heartbeat.clone(), config.degraded));
    hydrate(&cluster, &db)?;

    let transports = Arc::new(TransportRegistry::new());
    let dispatcher = Arc::new(Dispatcher::new(
        cluster.clone(),
        transports.clone(),
        db.clone(),
        config.dispatch.clone(),
    ));
    let event_router = Arc::new(Router::from_config(&config.routes)?);

    let shutdown = CancellationToken::new();
    let handle = start(
        &config,
        db.clone(),
        cluster.clone(),
        dispatcher.clone(),
        transports,
        event_router,
        shutdown.clone(),
    )
    .await?;
    tracing::info!(port = handle.port, "marshald listening");

    let sweeper = spawn_sweeper(
        cluster.clone(),
        Duration::from_secs(config.heartbeat.interval_secs.max(1)),
        shutdown.clone(),
    );

    let engine = Arc::new(PolicyEngine::new(
        cluster,
        dispatcher,
        db,
        Arc::new(FixedCostProvider::new()),
        config.policies.clone(),
        handle.events.clone(),
        shutdown.clone(),
    ));
    let policy_task = engine.spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    let _ = sweeper.await;
    let _ = policy_task.await;
    Ok(())
}

/// Rebuild in-memory cluster state from the store. Nodes come back
/// offline and their sessions unreachable until workers reconnect
/// and report.
fn hydrate(cluster: &Cluster, db: &Database) -> anyhow::Result<()> {
    let node_rows = NodeRepo::new(db.clone()).list()?;
    let session_rows = SessionRepo::new(db.clone()).list()?;
    let nodes: Vec<Node> = node_rows.into_iter().map(node_from_row).collect();
    let sessions: Vec<TrackedSession> =
        session_rows.into_iter().map(session_from_row).collect();
    tracing::info!(nodes = nodes.len(), sessions = sessions.len(), "hydrated from store");
    cluster.hydrate(nodes, sessions);
    Ok(())
}

fn node_from_row(row: NodeRow) -> Node {
    let fallback = chrono::Utc::now();
    Node {
        id: row.id,
        identity: row.identity,
        hostname: row.hostname,
        projects: row.projects,
        capabilities: row.capabilities,
        resources: row.resources,
        status: row.status,
        last_heartbeat: row.last_heartbeat.unwrap_or(fallback),
        connected_at: row.connected_at.unwrap_or(fallback),
    }
}

fn session_from_row(row: SessionRow) -> TrackedSession {
    TrackedSession {
        id: row.id,
        node_id: row.node_id,
        project: row.project,
        status: row.status,
        tokens: row.tokens,
        compactions: row.compactions,
        cost_usd: row.cost_usd,
        model: row.model,
        last_activity: row.last_activity,
        started_at: row.started_at,
    }
}
