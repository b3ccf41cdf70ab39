//! `POST /execute`: the request/response transport (spec.md §6.2). Drives
//! the same `Orchestrator::submit` path as the WebSocket channel, buffering
//! every streamed frame instead of forwarding it, under the same output cap.

use crate::api::AppState;
use crate::orchestrator::task::{ChannelSink, ExecutionRequest};
use crate::protocol::{ExecuteRequest, ExecuteResponse, OutputStream, Priority, RequestId, ServerFrame};
use crate::runtime::Language;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

pub async fn execute_handler(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, (StatusCode, Json<ErrorBody>)> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = Arc::new(ChannelSink(tx));
    let request_id = RequestId::new_v4();

    let execution_request = ExecutionRequest {
        session_id: request.session_id,
        request_id,
        language: Language::from(request.language),
        entry_path: request.entry_path,
        files: request.files,
        priority: Priority::OneShot,
        interactive: false,
    };

    if let Err(e) = state.orchestrator.submit(execution_request, sink).await {
        return Err(error_response(e.code(), &e.to_string()));
    }

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut exit_code = 0i32;
    let mut execution_time_ms = 0u64;
    let mut truncated = false;

    while let Some(frame) = rx.recv().await {
        match frame {
            ServerFrame::Output { stream, data, .. } => match stream {
                OutputStream::Stdout => stdout.push_str(&data),
                OutputStream::Stderr => stderr.push_str(&data),
                OutputStream::System => {
                    if data == "TRUNCATED" {
                        truncated = true;
                    }
                }
            },
            ServerFrame::Exit {
                code,
                execution_time_ms: elapsed,
                ..
            } => {
                exit_code = code;
                execution_time_ms = elapsed;
                break;
            }
            ServerFrame::Error { code, message, .. } => {
                return Err(error_response(code, &message));
            }
        }
    }

    Ok(Json(ExecuteResponse {
        stdout,
        stderr,
        exit_code,
        execution_time_ms,
        truncated,
    }))
}

fn error_response(code: &'static str, message: &str) -> (StatusCode, Json<ErrorBody>) {
    let status = match code {
        "QUEUE_FULL" | "QUEUE_TIMEOUT" | "CAPACITY" => StatusCode::SERVICE_UNAVAILABLE,
        "INPUT_TOO_LARGE" => StatusCode::PAYLOAD_TOO_LARGE,
        "LANGUAGE_UNSUPPORTED" | "MALFORMED_FRAME" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            code,
            message: message.to_string(),
        }),
    )
}
