use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use marshal_cluster::{Cluster, ClusterChange};
use marshal_core::config::MarshalConfig;
use marshal_core::event::WorkerEvent;
use marshal_dispatch::{Dispatcher, TransportRegistry};
use marshal_router::{spawn_delivery, LogDelivery, Router as EventRouter, SinkDelivery};
use marshal_store::{Database, EventRepo, NodeRepo, SessionRepo};
use marshal_telemetry::MetricsRecorder;

use crate::rpc;
use crate::worker;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<Cluster>,
    pub dispatcher: Arc<Dispatcher>,
    pub transports: Arc<TransportRegistry>,
    pub db: Database,
    pub ingest: mpsc::Sender<WorkerEvent>,
    pub metrics: MetricsRecorder,
    pub heartbeat_interval_secs: u64,
    pub max_send_queue: usize,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/worker", get(worker::ws_handler))
        .route("/rpc", post(rpc::rpc_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Handle returned by `start()` — keeps background tasks alive and exposes
/// the ingest sender so other components (policy engine) can emit events
/// into the same pipeline.
pub struct ServerHandle {
    pub port: u16,
    pub events: mpsc::Sender<WorkerEvent>,
    _server: tokio::task::JoinHandle<()>,
    _pipeline: tokio::task::JoinHandle<()>,
    _delivery: tokio::task::JoinHandle<()>,
    _changes: tokio::task::JoinHandle<()>,
}

/// Create and start the server with its event pipeline.
pub async fn start(
    config: &MarshalConfig,
    db: Database,
    cluster: Arc<Cluster>,
    dispatcher: Arc<Dispatcher>,
    transports: Arc<TransportRegistry>,
    event_router: Arc<EventRouter>,
    shutdown: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let (ingest_tx, ingest_rx) = mpsc::channel::<WorkerEvent>(1024);
    let metrics = MetricsRecorder::new();

    let (match_tx, match_rx) = mpsc::channel(1024);
    let delivery: Arc<dyn SinkDelivery> = Arc::new(LogDelivery);
    let delivery_handle = spawn_delivery(match_rx, delivery, shutdown.clone());

    let pipeline_handle = tokio::spawn(run_event_pipeline(
        ingest_rx,
        EventRepo::new(db.clone()),
        event_router,
        match_tx,
        metrics.clone(),
    ));

    let changes_handle = tokio::spawn(run_change_feed(
        cluster.subscribe(),
        db.clone(),
        ingest_tx.clone(),
        shutdown.clone(),
    ));

    let state = AppState {
        cluster,
        dispatcher,
        transports,
        db,
        ingest: ingest_tx.clone(),
        metrics,
        heartbeat_interval_secs: config.heartbeat.interval_secs,
        max_send_queue: config.server.max_send_queue,
    };

    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "marshal server started");

    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        events: ingest_tx,
        _server: server_handle,
        _pipeline: pipeline_handle,
        _delivery: delivery_handle,
        _changes: changes_handle,
    })
}

/// Persist every event and fan matching ones out to the delivery task.
/// Routing failure modes (full channel, no rules) never push back on the
/// worker read loops.
async fn run_event_pipeline(
    mut ingest: mpsc::Receiver<WorkerEvent>,
    events: EventRepo,
    router: Arc<EventRouter>,
    matches: mpsc::Sender<marshal_router::RouteMatch>,
    metrics: MetricsRecorder,
) {
    while let Some(event) = ingest.recv().await {
        metrics.increment("events.ingested", 1);
        if let Err(err) = events.append(&event) {
            tracing::warn!(kind = %event.kind, error = %err, "failed to persist event");
        }
        for matched in router.evaluate(&event) {
            metrics.increment("events.routed", 1);
            if matches.try_send(matched).is_err() {
                tracing::warn!(kind = %event.kind, "delivery queue full, dropping match");
            }
        }
    }
    tracing::debug!("event pipeline stopped");
}

/// Mirror cluster status changes into the store and synthesize the
/// corresponding `node.*` events.
async fn run_change_feed(
    mut changes: tokio::sync::broadcast::Receiver<ClusterChange>,
    db: Database,
    ingest: mpsc::Sender<WorkerEvent>,
    shutdown: CancellationToken,
) {
    use marshal_core::status::{NodeStatus, SessionStatus};

    let nodes = NodeRepo::new(db.clone());
    let sessions = SessionRepo::new(db);
    loop {
        let change = tokio::select! {
            _ = shutdown.cancelled() => break,
            change = changes.recv() => change,
        };
        let change = match change {
            Ok(change) => change,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "change feed lagged");
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        let (node_id, kind, fields, status) = match change {
            ClusterChange::NodeOnline { node_id, reconnected } => (
                node_id,
                "node.online",
                serde_json::json!({ "reconnected": reconnected }),
                Some(NodeStatus::Online),
            ),
            ClusterChange::NodeDegraded { node_id } => (
                node_id,
                "node.degraded",
                serde_json::json!({}),
                Some(NodeStatus::Degraded),
            ),
            ClusterChange::NodeOffline { node_id, unreachable } => {
                for session_id in &unreachable {
                    if let Err(err) = sessions.set_status(session_id, SessionStatus::Unreachable) {
                        tracing::debug!(%session_id, error = %err, "session row not updated");
                    }
                }
                (
                    node_id,
                    "node.offline",
                    serde_json::json!({ "unreachable_sessions": unreachable }),
                    Some(NodeStatus::Offline),
                )
            }
            ClusterChange::NodeDeregistered { node_id, removed_sessions } => {
                if let Err(err) = nodes.delete(&node_id) {
                    tracing::debug!(%node_id, error = %err, "node row not deleted");
                }
                for session_id in &removed_sessions {
                    if let Err(err) = sessions.delete(session_id) {
                        tracing::debug!(%session_id, error = %err, "session row not deleted");
                    }
                }
                (
                    node_id,
                    "node.deregistered",
                    serde_json::json!({ "removed_sessions": removed_sessions }),
                    None,
                )
            }
        };

        if let Some(status) = status {
            if let Err(err) = nodes.set_status(&node_id, status) {
                tracing::debug!(%node_id, error = %err, "node row not updated");
            }
        }
        let fields = fields.as_object().cloned().unwrap_or_default();
        let event = WorkerEvent::new(node_id, None, kind, fields);
        if ingest.send(event).await.is_err() {
            break;
        }
    }
    tracing::debug!("change feed stopped");
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "nodes": state.cluster.node_count(),
        "sessions": state.cluster.list_sessions(&Default::default()).len(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.metrics.snapshot())
}
