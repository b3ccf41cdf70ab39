//! Streaming channel for interactive clients (spec.md §6.1): a persistent
//! WebSocket carrying typed JSON frames, one connection per client. Grounded
//! on `openagents`'s `WebSocketTransport::handle_socket` split-socket plus
//! `mpsc`-forwarding-task pattern, generalized from free-text chat messages
//! to the `run`/`input`/`stop` and `output`/`exit`/`error` frame union.

use crate::api::AppState;
use crate::orchestrator::task::{ChannelSink, ExecutionRequest};
use crate::protocol::{ClientFrame, Priority, ServerFrame, SessionId};
use crate::runtime::Language;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let sink = Arc::new(ChannelSink(frame_tx));

    let send_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut connected_session: Option<SessionId> = None;

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => {
                let frame: Result<ClientFrame, _> = serde_json::from_str(&text);
                match frame {
                    Ok(ClientFrame::Run {
                        session_id,
                        request_id,
                        language,
                        entry_path,
                        files,
                    }) => {
                        if connected_session != Some(session_id) {
                            state.sessions.mark_stream_open(&session_id.to_string());
                            connected_session = Some(session_id);
                        }
                        let request = ExecutionRequest {
                            session_id,
                            request_id,
                            language: Language::from(language),
                            entry_path,
                            files,
                            priority: Priority::Interactive,
                            interactive: true,
                        };
                        if let Err(e) = state.orchestrator.submit(request, sink.clone()).await {
                            sink.emit(ServerFrame::Error {
                                session_id,
                                request_id: Some(request_id),
                                code: e.code(),
                                message: e.to_string(),
                            });
                        }
                    }
                    Ok(ClientFrame::Input {
                        request_id, data, ..
                    }) => {
                        state
                            .orchestrator
                            .send_input(request_id, data.into_bytes())
                            .await;
                    }
                    Ok(ClientFrame::Stop { request_id, .. }) => {
                        state.orchestrator.stop(request_id);
                    }
                    Err(e) => {
                        warn!(error = %e, "malformed client frame");
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(session_id) = connected_session {
        info!(%session_id, "client disconnected, tearing down session");
        state.orchestrator.on_disconnect(session_id).await;
    }
    send_task.abort();
}
