//! WebSocket stream of a run's progress events.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use mps_relay_core::{ProgressEvent, ProgressSnapshot, RunHandle, RunId, RunReport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::runs::ErrorResponse;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_LAG_EVENTS, WS_MESSAGES_SENT};
use crate::state::AppState;

/// WebSocket message sent to clients watching a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Every job's state at connection time.
    Snapshot { snapshot: ProgressSnapshot },
    /// One job event, as recorded by the run's progress aggregator.
    Progress { event: ProgressEvent },
    /// The client fell behind and missed this many events.
    Lagged { skipped: u64 },
    /// Every job finished. Sent last, before the server closes the socket.
    RunFinished { report: RunReport },
}

impl WsMessage {
    fn kind(&self) -> &'static str {
        match self {
            WsMessage::Snapshot { .. } => "snapshot",
            WsMessage::Progress { .. } => "progress",
            WsMessage::Lagged { .. } => "lagged",
            WsMessage::RunFinished { .. } => "run_finished",
        }
    }
}

/// WebSocket upgrade handler.
pub async fn run_events(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let run_id = RunId::from(id.as_str());
    match state.run(&run_id) {
        Some(handle) => ws.on_upgrade(move |socket| handle_socket(socket, handle)),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Run not found: {}", run_id),
            }),
        )
            .into_response(),
    }
}

type Sender = SplitSink<WebSocket, Message>;

async fn send(sender: &mut Sender, msg: &WsMessage) -> bool {
    WS_MESSAGES_SENT.with_label_values(&[msg.kind()]).inc();
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize WsMessage: {}", e);
            true
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_socket(socket: WebSocket, handle: RunHandle) {
    let (mut sender, mut receiver) = socket.split();
    let run_id = handle.run_id().clone();

    // Subscribe before the snapshot so nothing falls between the two.
    let mut rx = handle.subscribe();

    WS_CONNECTIONS_TOTAL.inc();
    WS_CONNECTIONS_ACTIVE.inc();
    info!(run_id = %run_id, "WebSocket client connected");

    let send_task = tokio::spawn(async move {
        let snapshot = WsMessage::Snapshot {
            snapshot: handle.snapshot(),
        };
        if !send(&mut sender, &snapshot).await {
            return;
        }

        let finished = handle.wait();
        tokio::pin!(finished);

        let report = loop {
            tokio::select! {
                biased;
                result = rx.recv() => match result {
                    Ok(event) => {
                        if !send(&mut sender, &WsMessage::Progress { event }).await {
                            debug!("WebSocket send failed, client disconnected");
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("WebSocket client lagged, skipped {} events", skipped);
                        WS_LAG_EVENTS.inc();
                        if !send(&mut sender, &WsMessage::Lagged { skipped }).await {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break handle.report(),
                },
                report = &mut finished => break report,
            }
        };

        // Flush events recorded before the report was published.
        while let Ok(event) = rx.try_recv() {
            if !send(&mut sender, &WsMessage::Progress { event }).await {
                return;
            }
        }
        if let Some(report) = report {
            let finished = WsMessage::RunFinished {
                report: report.as_ref().clone(),
            };
            if send(&mut sender, &finished).await {
                let _ = sender.send(Message::Close(None)).await;
            }
        }
    });

    // Handle incoming messages from client (ping/pong, close)
    let mut send_task = send_task;
    loop {
        tokio::select! {
            _ = &mut send_task => break,
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket client requested close");
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    debug!("Received text message: {}", text);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
            },
        }
    }

    send_task.abort();
    WS_CONNECTIONS_ACTIVE.dec();
    info!(run_id = %run_id, "WebSocket client disconnected");
}
