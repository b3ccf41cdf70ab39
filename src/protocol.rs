//! Wire types for the two client-facing transports (WebSocket streaming and
//! request/response `execute`), both sharing the same session/request
//! identifiers and terminal-event shape.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Project identifier assigned to a client connection; unique for the
/// process lifetime.
pub type SessionId = Uuid;
/// Identifier for one execution request within a session.
pub type RequestId = Uuid;

/// One file in a submitted project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub path: String,
    pub content: String,
    #[serde(rename = "toBeExec", default)]
    pub to_be_exec: bool,
}

/// Scheduling priority; higher dispatches first, FIFO within a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Background = 0,
    OneShot = 1,
    Interactive = 2,
}

/// Messages a client may send over the streaming transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Run {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "requestId")]
        request_id: RequestId,
        language: String,
        #[serde(rename = "entryPath")]
        entry_path: String,
        files: Vec<SourceFile>,
    },
    Input {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "requestId")]
        request_id: RequestId,
        data: String,
    },
    Stop {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "requestId")]
        request_id: RequestId,
    },
}

/// Which stream an `output` frame's bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
    System,
}

/// Messages the server sends back over the streaming transport.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Output {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "requestId")]
        request_id: RequestId,
        stream: OutputStream,
        data: String,
    },
    Exit {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "requestId")]
        request_id: RequestId,
        code: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(rename = "executionTimeMs")]
        execution_time_ms: u64,
    },
    Error {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        code: &'static str,
        message: String,
    },
}

/// Body of the request/response `POST /execute` call.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    pub language: String,
    #[serde(rename = "entryPath")]
    pub entry_path: String,
    pub files: Vec<SourceFile>,
}

/// Result of a request/response `execute` call; output is buffered in full
/// (still subject to the same per-request cap as the streaming transport).
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    #[serde(rename = "executionTimeMs")]
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}
