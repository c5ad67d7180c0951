//! Per-worker WebSocket lifecycle: register handshake, writer/reader task
//! pair, and the offline transition when the socket goes away.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use marshal_core::event::WorkerEvent;
use marshal_core::ids::NodeId;
use marshal_core::wire::{ServerFrame, WorkerFrame};
use marshal_store::{NodeRepo, NodeRow, SessionRepo};

use crate::server::AppState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // The first frame must be a register; anything else ends the
    // connection before it touches shared state.
    let register = tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv()).await;
    let frame = match register {
        Ok(Some(Ok(WsMessage::Text(text)))) => serde_json::from_str::<WorkerFrame>(&text),
        Ok(_) => {
            tracing::debug!("worker connection closed before registering");
            return;
        }
        Err(_) => {
            let _ = send_error(&mut socket, "register timeout").await;
            return;
        }
    };
    let (identity, hostname, projects, capabilities) = match frame {
        Ok(WorkerFrame::Register { identity, hostname, projects, capabilities }) => {
            (identity, hostname, projects, capabilities)
        }
        Ok(other) => {
            tracing::warn!(frame = ?other, "first frame was not register");
            let _ = send_error(&mut socket, "first frame must be register").await;
            return;
        }
        Err(err) => {
            let _ = send_error(&mut socket, &format!("malformed frame: {err}")).await;
            return;
        }
    };

    let node_id = state
        .cluster
        .register(&identity, &hostname, projects, capabilities);
    persist_node(&state, &node_id);

    let (tx, mut rx) = mpsc::channel::<ServerFrame>(state.max_send_queue);
    // Queue the ack before attaching so no command can jump ahead of it.
    let registered = ServerFrame::Registered {
        node_id: node_id.clone(),
        heartbeat_interval_secs: state.heartbeat_interval_secs,
    };
    if tx.send(registered).await.is_err() {
        return;
    }
    state.transports.attach(node_id.clone(), tx.clone());

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: drain the send queue, ping on the heartbeat cadence.
    let ping_interval = Duration::from_secs(state.heartbeat_interval_secs.max(1));
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Reader: route inbound frames until the socket closes.
    let reader_state = state.clone();
    let reader_node = node_id.clone();
    let reader_tx = tx.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    match serde_json::from_str::<WorkerFrame>(&text) {
                        Ok(frame) => {
                            if !handle_frame(&reader_state, &reader_node, &reader_tx, frame).await {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::debug!(node_id = %reader_node, error = %err, "unparseable frame");
                            let _ = reader_tx
                                .send(ServerFrame::Error { message: format!("malformed frame: {err}") })
                                .await;
                        }
                    }
                }
                WsMessage::Close(_) => break,
                // axum answers pings itself; worker pongs need no action
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    // Only the connection that owns the current transport may take the
    // node offline; a stale close racing a reconnect does nothing.
    if state.transports.detach(&node_id, &tx) {
        tracing::info!(node_id = %node_id, identity, "worker disconnected");
        if let Err(err) = state.cluster.mark_offline(&node_id) {
            tracing::debug!(node_id = %node_id, error = %err, "offline transition skipped");
        }
    }
}

/// Returns false when the connection should be dropped.
async fn handle_frame(
    state: &AppState,
    node_id: &NodeId,
    tx: &mpsc::Sender<ServerFrame>,
    frame: WorkerFrame,
) -> bool {
    match frame {
        WorkerFrame::Heartbeat { resources } => {
            match state.cluster.heartbeat(node_id, resources) {
                Ok(_) => {
                    let _ = tx.send(ServerFrame::HeartbeatAck).await;
                    true
                }
                Err(err) => {
                    // Deregistered mid-connection
                    tracing::warn!(node_id = %node_id, error = %err, "heartbeat rejected");
                    let _ = tx
                        .send(ServerFrame::Error { message: err.to_string() })
                        .await;
                    false
                }
            }
        }
        WorkerFrame::Event { session_id, kind, fields } => {
            let event = WorkerEvent::new(node_id.clone(), session_id, kind, fields);
            if state.cluster.apply_event(&event) {
                persist_session(state, &event);
            }
            if state.ingest.send(event).await.is_err() {
                tracing::warn!("event pipeline closed");
            }
            true
        }
        frame @ WorkerFrame::Result { .. } => {
            if let Some((command_id, result)) = frame.into_command_result() {
                state.dispatcher.complete(&command_id, result);
            }
            true
        }
        WorkerFrame::Register { .. } => {
            tracing::debug!(node_id = %node_id, "duplicate register ignored");
            true
        }
    }
}

fn persist_node(state: &AppState, node_id: &NodeId) {
    let Ok(node) = state.cluster.get_node(node_id) else {
        return;
    };
    let row = NodeRow {
        id: node.id,
        identity: node.identity,
        hostname: node.hostname,
        projects: node.projects,
        capabilities: node.capabilities,
        resources: node.resources,
        status: node.status,
        last_heartbeat: Some(node.last_heartbeat),
        connected_at: Some(node.connected_at),
    };
    if let Err(err) = NodeRepo::new(state.db.clone()).upsert(&row) {
        tracing::warn!(node_id = %node_id, error = %err, "failed to persist node");
    }
}

/// Keep the durable session projection in step with tracker updates.
fn persist_session(state: &AppState, event: &WorkerEvent) {
    let Some(session_id) = &event.session_id else { return };
    let Ok(session) = state.cluster.get_session(session_id) else { return };
    let repo = SessionRepo::new(state.db.clone());
    if let Err(err) = repo.upsert(&marshal_dispatch::session_row(&session)) {
        tracing::warn!(session_id = %session_id, error = %err, "session row not updated");
    }
}

async fn send_error(socket: &mut WebSocket, message: &str) -> Result<(), axum::Error> {
    let frame = ServerFrame::Error { message: message.to_string() };
    let text = serde_json::to_string(&frame).unwrap_or_default();
    socket.send(WsMessage::Text(text.into())).await?;
    socket.send(WsMessage::Close(None)).await
}
