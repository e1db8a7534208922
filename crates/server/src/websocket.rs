//! WebSocket handling

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use armdock_protocol::{ClientMessage, ServerMessage};

use crate::error::SessionError;
use crate::fanout::Topic;
use crate::orchestrator;
use crate::state::AppState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const OUTBOUND_CAPACITY: usize = 100;

/// Messages that can be sent through the WebSocket
#[allow(clippy::large_enum_variant)]
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
}

/// One client connection and the topics it is subscribed to
struct Connection {
    id: u64,
    outbound: mpsc::Sender<OutboundMessage>,
    forwarders: HashMap<Topic, JoinHandle<()>>,
}

impl Connection {
    fn new(id: u64, outbound: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            id,
            outbound,
            forwarders: HashMap::new(),
        }
    }

    async fn send(&self, msg: ServerMessage) {
        send_json(&self.outbound, msg).await;
    }

    async fn send_error(&self, err: &SessionError, session_id: Option<String>) {
        self.send(ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            session_id,
        })
        .await;
    }

    async fn ack(&self, session_id: Option<String>, message: &str) {
        self.send(ServerMessage::Ack {
            session_id,
            message: message.to_string(),
        })
        .await;
    }

    fn unsubscribe(&mut self, topic: &Topic) {
        if let Some(task) = self.forwarders.remove(topic) {
            task.abort();
        }
    }

    fn close(&mut self) {
        for (_, task) in self.forwarders.drain() {
            task.abort();
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let mut conn = Connection::new(conn_id, outbound_tx);

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = conn.outbound.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    "Failed to parse client message"
                );
                conn.send(ServerMessage::Error {
                    code: "parse_error".into(),
                    message: e.to_string(),
                    session_id: None,
                })
                .await;
                continue;
            }
        };

        handle_client_message(client_msg, &mut conn, &state).await;
    }

    conn.close();
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

/// Send a ServerMessage through the outbound channel
async fn send_json(tx: &mpsc::Sender<OutboundMessage>, msg: ServerMessage) {
    let _ = tx.send(OutboundMessage::Json(msg)).await;
}

/// Relay a topic to the client until it closes or the client falls behind.
///
/// A lagged client gets an error and must resubscribe for a fresh snapshot.
fn spawn_broadcast_forwarder(
    mut rx: broadcast::Receiver<ServerMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    topic: Topic,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if outbound_tx.send(OutboundMessage::Json(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        component = "websocket",
                        event = "ws.broadcast.lagged",
                        topic = %topic,
                        skipped = n,
                        "Broadcast subscriber lagged, skipped {n} messages"
                    );
                    let session_id = match &topic {
                        Topic::Session(id) => Some(id.clone()),
                        Topic::Fleet => None,
                    };
                    let _ = outbound_tx
                        .send(OutboundMessage::Json(ServerMessage::Error {
                            code: "lagged".to_string(),
                            message: format!("Subscriber lagged, skipped {n} messages"),
                            session_id,
                        }))
                        .await;
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Subscribe the connection to `topic`, replacing any earlier subscription.
async fn subscribe(conn: &mut Connection, state: &AppState, topic: Topic) -> Result<(), SessionError> {
    let fallback = match &topic {
        Topic::Fleet => ServerMessage::FleetStatus {
            fleet: orchestrator::fleet_snapshot(state).await?,
        },
        Topic::Session(id) => ServerMessage::SessionSnapshot {
            session: orchestrator::get_session(state, id)?,
        },
    };

    conn.unsubscribe(&topic);
    let subscription = state.fanout.subscribe(topic.clone());
    conn.send(subscription.initial.unwrap_or(fallback)).await;
    let task = spawn_broadcast_forwarder(subscription.rx, conn.outbound.clone(), topic.clone());
    debug!(
        component = "websocket",
        event = "ws.subscribed",
        connection_id = conn.id,
        topic = %topic,
    );
    conn.forwarders.insert(topic, task);
    Ok(())
}

async fn reply_unit(
    conn: &Connection,
    session_id: String,
    result: Result<(), SessionError>,
    ack: &str,
) {
    match result {
        Ok(()) => conn.ack(Some(session_id), ack).await,
        Err(e) => conn.send_error(&e, Some(session_id)).await,
    }
}

async fn handle_client_message(msg: ClientMessage, conn: &mut Connection, state: &AppState) {
    debug!(
        component = "websocket",
        event = "ws.message.received",
        connection_id = conn.id,
        message = ?msg,
    );

    match msg {
        ClientMessage::SubscribeFleet => {
            if let Err(e) = subscribe(conn, state, Topic::Fleet).await {
                conn.send_error(&e, None).await;
            }
        }
        ClientMessage::UnsubscribeFleet => conn.unsubscribe(&Topic::Fleet),
        ClientMessage::SubscribeSession { session_id } => {
            if let Err(e) = subscribe(conn, state, Topic::Session(session_id.clone())).await {
                conn.send_error(&e, Some(session_id)).await;
            }
        }
        ClientMessage::UnsubscribeSession { session_id } => {
            conn.unsubscribe(&Topic::Session(session_id))
        }

        ClientMessage::StartCalibration { robot_id } => {
            let result = orchestrator::start_calibration(state, &robot_id).await;
            started(conn, state, result).await;
        }
        ClientMessage::OverrideDecision {
            session_id,
            overwrite,
        } => {
            let result = orchestrator::override_decision(state, &session_id, overwrite).await;
            reply_unit(conn, session_id, result, "override_sent").await;
        }
        ClientMessage::BeginSweep { session_id } => {
            let result = orchestrator::begin_sweep(state, &session_id).await;
            reply_unit(conn, session_id, result, "sweep_started").await;
        }
        ClientMessage::FinishSweep { session_id } => {
            let result = orchestrator::finish_sweep(state, &session_id).await;
            reply_unit(conn, session_id, result, "sweep_finished").await;
        }
        ClientMessage::SendInput { session_id, data } => {
            let result = orchestrator::send_input(state, &session_id, data).await;
            reply_unit(conn, session_id, result, "input_sent").await;
        }
        ClientMessage::SaveCalibration { session_id } => {
            let result = orchestrator::save_calibration(state, &session_id)
                .await
                .map(|_| ());
            conn.unsubscribe(&Topic::Session(session_id.clone()));
            reply_unit(conn, session_id, result, "saved").await;
        }

        ClientMessage::StartTeleop {
            leader_id,
            follower_id,
        } => {
            let result = orchestrator::start_teleop(state, &leader_id, &follower_id).await;
            started(conn, state, result).await;
        }
        ClientMessage::StopTeleop { session_id } => {
            let result = orchestrator::stop_teleop(state, &session_id).await;
            reply_unit(conn, session_id, result, "stopped").await;
        }
        ClientMessage::ClearDisconnects { session_id } => {
            let result = orchestrator::clear_disconnects(state, &session_id).await;
            reply_unit(conn, session_id, result, "disconnects_cleared").await;
        }

        ClientMessage::GetSession { session_id } => {
            match orchestrator::get_session(state, &session_id) {
                Ok(session) => conn.send(ServerMessage::SessionSnapshot { session }).await,
                Err(e) => conn.send_error(&e, Some(session_id)).await,
            }
        }
        ClientMessage::CancelSession { session_id } => {
            conn.unsubscribe(&Topic::Session(session_id.clone()));
            match orchestrator::cancel_session(state, &session_id).await {
                Ok(()) => conn.ack(Some(session_id), "cancelled").await,
                Err(SessionError::NotFound(_)) => conn.ack(Some(session_id), "already_closed").await,
                Err(e) => conn.send_error(&e, Some(session_id)).await,
            }
        }
    }
}

/// Report a started session and subscribe the requester to it.
async fn started(
    conn: &mut Connection,
    state: &AppState,
    result: Result<armdock_protocol::SessionSnapshot, SessionError>,
) {
    match result {
        Ok(session) => {
            let session_id = session.id.clone();
            conn.send(ServerMessage::SessionStarted { session }).await;
            if let Err(e) = subscribe(conn, state, Topic::Session(session_id.clone())).await {
                conn.send_error(&e, Some(session_id)).await;
            }
        }
        Err(e) => conn.send_error(&e, None).await,
    }
}
