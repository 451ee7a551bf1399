//! WebSocket connection lifecycle: one worker per socket, read/write loops.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_core::protocol::{HostMessage, WorkerMessage};
use parley_worker::spawn_worker;

use crate::state::GatewayState;

/// Parse an inbound text frame, or build the error reply for it.
fn decode_frame(text: &str) -> Result<HostMessage, WorkerMessage> {
    serde_json::from_str::<HostMessage>(text).map_err(|e| WorkerMessage::Error {
        model_kind: None,
        reason: format!("Invalid message: {e}"),
        request_id: None,
    })
}

fn rejection(reason: impl Into<String>, request_id: Option<String>) -> WorkerMessage {
    WorkerMessage::Error {
        model_kind: None,
        reason: reason.into(),
        request_id,
    }
}

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    let pipeline = state.new_pipeline();
    state.register(&conn_id, pipeline.clone()).await;
    let (commands, mut events, worker_task) =
        spawn_worker(pipeline, state.pipeline_options()).split();

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Replies produced by the gateway itself (unreadable frames)
    let (reject_tx, mut reject_rx) = mpsc::unbounded_channel::<WorkerMessage>();

    let send_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(message) = events.recv() => message,
                Some(message) = reject_rx.recv() => message,
                else => break,
            };
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(conn_id = %send_conn_id, %e, "Failed to encode worker message");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Main read loop
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match decode_frame(text.as_str()) {
                Ok(message) => {
                    let request_id = message.request_id().map(str::to_string);
                    if let Err(e) = commands.send(message) {
                        debug!(conn_id = %conn_id, "Request after worker stopped");
                        let _ = reject_tx.send(rejection(e.reason(), request_id));
                    }
                }
                Err(reply) => {
                    warn!(conn_id = %conn_id, "Invalid frame received");
                    let _ = reject_tx.send(reply);
                }
            },
            Ok(Message::Binary(_)) => {
                let _ = reject_tx.send(rejection("Binary frames are not supported", None));
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // Closing the command channel tears the worker down
    drop(commands);
    drop(reject_tx);
    if let Err(e) = worker_task.await {
        error!(conn_id = %conn_id, %e, "Worker did not exit cleanly");
    }
    send_task.abort();
    state.unregister(&conn_id).await;
    info!(conn_id = %conn_id, "WebSocket connection closed");
}
