//! The execution task pipeline (C5.2): acquire → stage → invoke → stream →
//! exit/release. Runs entirely off the dispatch loop once spawned.

use crate::config::Config;
use crate::pool::ContainerPool;
use crate::protocol::{OutputStream, Priority, RequestId, ServerFrame, SessionId, SourceFile};
use crate::runtime::{ContainerBackend, ExecRecipe, Language};
use crate::utils::error::CoreError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

/// Overflow cap on buffered/streamed output events per request (spec.md
/// §4.5.2 default 2 000), beyond which events are discarded at the head
/// with a one-time `TRUNCATED` marker.
pub const OUTPUT_EVENT_CAP: usize = 2_000;

/// A terminal destination for `ServerFrame`s: either forwarded directly
/// over a WebSocket, or buffered in full for the request/response `execute`
/// handler. Both transports drive the same execution pipeline.
pub trait ResultSink: Send + Sync {
    fn emit(&self, frame: ServerFrame);
}

pub struct ChannelSink(pub mpsc::UnboundedSender<ServerFrame>);

impl ResultSink for ChannelSink {
    fn emit(&self, frame: ServerFrame) {
        let _ = self.0.send(frame);
    }
}

pub struct BufferSink(pub std::sync::Mutex<Vec<ServerFrame>>);

impl BufferSink {
    pub fn new() -> Self {
        Self(std::sync::Mutex::new(Vec::new()))
    }

    pub fn into_frames(self) -> Vec<ServerFrame> {
        self.0.into_inner().expect("buffer sink mutex poisoned")
    }

    pub fn frames(&self) -> Vec<ServerFrame> {
        self.0.lock().expect("buffer sink mutex poisoned").clone()
    }
}

impl ResultSink for BufferSink {
    fn emit(&self, frame: ServerFrame) {
        self.0.lock().expect("buffer sink mutex poisoned").push(frame);
    }
}

/// Everything needed to run one execution request.
pub struct ExecutionRequest {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub language: Language,
    pub entry_path: String,
    pub files: Vec<SourceFile>,
    pub priority: Priority,
    /// Interactive requests use `interactive_execution_timeout_ms`; one-shot
    /// and background requests use `execution_timeout_ms`.
    pub interactive: bool,
}

/// A live request's control surface, looked up by `sendInput`/`stop`.
pub struct ActiveHandle {
    stdin_slot: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    stop_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl ActiveHandle {
    fn new() -> (Self, oneshot::Receiver<()>, Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let stdin_slot = Arc::new(Mutex::new(None));
        (
            Self {
                stdin_slot: stdin_slot.clone(),
                stop_tx: std::sync::Mutex::new(Some(stop_tx)),
            },
            stop_rx,
            stdin_slot,
        )
    }

    /// Write bytes to the active process's stdin; silently dropped if no
    /// run is currently attached.
    pub async fn send_input(&self, bytes: Vec<u8>) {
        if let Some(sender) = self.stdin_slot.lock().await.as_ref() {
            let _ = sender.send(bytes).await;
        }
    }

    /// Request a stop; a no-op if already requested or the task has ended.
    pub fn request_stop(&self) {
        if let Some(tx) = self.stop_tx.lock().expect("stop_tx mutex poisoned").take() {
            let _ = tx.send(());
        }
    }
}

/// Releases the acquired container exactly once, on every exit path
/// (normal return, early return, or panic unwind), satisfying the
/// fire-and-forget dispatch loop's "never await inside the dispatch pass"
/// requirement — the release itself happens off the dispatch loop, in a
/// spawned task, so `Drop` never blocks.
struct ReleaseGuard {
    pool: Arc<ContainerPool>,
    entry: Option<crate::pool::ContainerEntry>,
    success: Arc<AtomicBool>,
}

impl ReleaseGuard {
    fn new(pool: Arc<ContainerPool>, entry: crate::pool::ContainerEntry) -> Self {
        Self {
            pool,
            entry: Some(entry),
            success: Arc::new(AtomicBool::new(true)),
        }
    }

    fn mark_failure(&self) {
        self.success.store(false, Ordering::SeqCst);
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            let pool = self.pool.clone();
            let success = self.success.load(Ordering::SeqCst);
            tokio::spawn(async move {
                pool.release(&entry, success).await;
            });
        }
    }
}

enum ExecOutcome {
    Exited(i64),
    Stopped,
    TimedOut,
}

/// Run one request end to end, emitting zero or more `output` frames plus
/// exactly one terminal `exit` or `error` frame to `sink`.
#[tracing::instrument(skip(request, pool, config, backend, sink, active_requests), fields(session_id = %request.session_id, request_id = %request.request_id))]
pub async fn run_execution(
    request: ExecutionRequest,
    pool: Arc<ContainerPool>,
    config: Arc<Config>,
    backend: Arc<dyn ContainerBackend>,
    sink: Arc<dyn ResultSink>,
    active_requests: Arc<dashmap::DashMap<RequestId, Arc<ActiveHandle>>>,
) {
    let start = std::time::Instant::now();
    let session_id = request.session_id;
    let request_id = request.request_id;

    let total_bytes: u64 = request.files.iter().map(|f| f.content.len() as u64).sum();
    if total_bytes > config.files_max_bytes || request.files.len() > config.files_max_count {
        sink.emit(ServerFrame::Error {
            session_id,
            request_id: Some(request_id),
            code: "INPUT_TOO_LARGE",
            message: "project exceeds the configured file size or count limit".to_string(),
        });
        return;
    }

    let Some(runtime_spec) = config.runtimes.get(request.language.as_str()) else {
        sink.emit(ServerFrame::Error {
            session_id,
            request_id: Some(request_id),
            code: "LANGUAGE_UNSUPPORTED",
            message: format!("no runtime configured for '{}'", request.language.as_str()),
        });
        return;
    };

    let recipe = match ExecRecipe::for_language(runtime_spec, &request.entry_path) {
        Ok(recipe) => recipe,
        Err(e) => {
            sink.emit(ServerFrame::Error {
                session_id,
                request_id: Some(request_id),
                code: e.code(),
                message: e.to_string(),
            });
            return;
        }
    };

    let session_id_str = session_id.to_string();
    let entry = match pool.acquire(&session_id_str, &request.language, &recipe.image).await {
        Ok(entry) => entry,
        Err(CoreError::Capacity) => {
            sink.emit(ServerFrame::Error {
                session_id,
                request_id: Some(request_id),
                code: "CAPACITY",
                message: "no container available for this session".to_string(),
            });
            return;
        }
        Err(e) => {
            sink.emit(ServerFrame::Error {
                session_id,
                request_id: Some(request_id),
                code: e.code(),
                message: e.to_string(),
            });
            return;
        }
    };

    let mut guard = ReleaseGuard::new(pool.clone(), entry.clone());

    if let Err(e) = backend
        .stage_files(&entry.container_id, "/workspace", &request.files)
        .await
    {
        guard.mark_failure();
        sink.emit(ServerFrame::Error {
            session_id,
            request_id: Some(request_id),
            code: e.code(),
            message: format!("failed to stage project: {e}"),
        });
        sink.emit(ServerFrame::Exit {
            session_id,
            request_id,
            code: -1,
            reason: Some("runtime-error".to_string()),
            execution_time_ms: start.elapsed().as_millis() as u64,
        });
        return;
    }

    let (handle, stop_rx, stdin_slot) = ActiveHandle::new();
    let handle = Arc::new(handle);
    active_requests.insert(request_id, handle.clone());

    let timeout_ms = if request.interactive {
        config.interactive_execution_timeout_ms
    } else {
        config.execution_timeout_ms
    };
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

    let outcome = run_steps(
        &recipe,
        &entry.container_id,
        "/workspace",
        &backend,
        &sink,
        session_id,
        request_id,
        deadline,
        stop_rx,
        stdin_slot,
    )
    .await;

    active_requests.remove(&request_id);

    let execution_time_ms = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(ExecOutcome::Exited(code)) => {
            sink.emit(ServerFrame::Exit {
                session_id,
                request_id,
                code: code as i32,
                reason: None,
                execution_time_ms,
            });
            // A normal-range exit code is a success for reuse purposes;
            // anything else suggests the process or container is unwell.
            if !(0..=255).contains(&code) {
                guard.mark_failure();
            }
        }
        Ok(ExecOutcome::Stopped) => {
            sink.emit(ServerFrame::Exit {
                session_id,
                request_id,
                code: -1,
                reason: Some("stopped".to_string()),
                execution_time_ms,
            });
        }
        Ok(ExecOutcome::TimedOut) => {
            sink.emit(ServerFrame::Exit {
                session_id,
                request_id,
                code: 124,
                reason: Some("timeout".to_string()),
                execution_time_ms,
            });
            guard.mark_failure();
        }
        Err(e) => {
            warn!(error = %e, "container died mid-exec");
            guard.mark_failure();
            sink.emit(ServerFrame::Exit {
                session_id,
                request_id,
                code: -1,
                reason: Some("runtime-error".to_string()),
                execution_time_ms,
            });
        }
    }

    info!(execution_time_ms, "execution finished");
}

#[allow(clippy::too_many_arguments)]
async fn run_steps(
    recipe: &ExecRecipe,
    container_id: &str,
    workdir: &str,
    backend: &Arc<dyn ContainerBackend>,
    sink: &Arc<dyn ResultSink>,
    session_id: SessionId,
    request_id: RequestId,
    deadline: tokio::time::Instant,
    mut stop_rx: oneshot::Receiver<()>,
    stdin_slot: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
) -> crate::utils::error::Result<ExecOutcome> {
    if let Some(compile_command) = &recipe.compile_command {
        let mut handle = backend.exec(container_id, compile_command.clone(), workdir).await?;
        *stdin_slot.lock().await = Some(handle.stdin.clone());
        let outcome = stream_one(&mut handle, sink, session_id, request_id, deadline, &mut stop_rx, backend, container_id).await?;
        match outcome {
            ExecOutcome::Exited(0) => {}
            other => return Ok(other),
        }
    }

    let mut handle = backend.exec(container_id, recipe.run_command.clone(), workdir).await?;
    *stdin_slot.lock().await = Some(handle.stdin.clone());
    stream_one(&mut handle, sink, session_id, request_id, deadline, &mut stop_rx, backend, container_id).await
}

#[allow(clippy::too_many_arguments)]
async fn stream_one(
    handle: &mut crate::runtime::ExecHandle,
    sink: &Arc<dyn ResultSink>,
    session_id: SessionId,
    request_id: RequestId,
    deadline: tokio::time::Instant,
    stop_rx: &mut oneshot::Receiver<()>,
    backend: &Arc<dyn ContainerBackend>,
    container_id: &str,
) -> crate::utils::error::Result<ExecOutcome> {
    let mut output_buffer = OutputBuffer::new();
    let mut stop_requested = false;
    let mut kill_deadline: Option<tokio::time::Instant> = None;

    loop {
        let kill_sleep = async {
            match kill_deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            code = &mut handle.exit => {
                let code = code.unwrap_or(-1);
                if stop_requested {
                    return Ok(ExecOutcome::Stopped);
                }
                return Ok(ExecOutcome::Exited(code));
            }
            chunk = handle.output.recv() => {
                match chunk {
                    Some(crate::runtime::OutputChunk::Stdout(bytes)) => {
                        emit_output(sink, session_id, request_id, OutputStream::Stdout, bytes, &mut output_buffer);
                    }
                    Some(crate::runtime::OutputChunk::Stderr(bytes)) => {
                        emit_output(sink, session_id, request_id, OutputStream::Stderr, bytes, &mut output_buffer);
                    }
                    None => {}
                }
            }
            _ = &mut *stop_rx, if !stop_requested => {
                stop_requested = true;
                if let Some(pid) = handle.pid {
                    let _ = backend.signal_process(container_id, pid, false).await;
                }
                kill_deadline = Some(tokio::time::Instant::now() + Duration::from_millis(500));
            }
            _ = kill_sleep, if kill_deadline.is_some() => {
                if let Some(pid) = handle.pid {
                    let _ = backend.signal_process(container_id, pid, true).await;
                }
                return Ok(ExecOutcome::Stopped);
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Ok(ExecOutcome::TimedOut);
            }
        }
    }
}

/// Bounded record of a request's output frames (spec.md §4.5.2): every
/// chunk is forwarded to the client transport immediately regardless of
/// size, while this buffer retains only the most recent `OUTPUT_EVENT_CAP`
/// of them, evicting the oldest first once full.
struct OutputBuffer {
    events: std::collections::VecDeque<ServerFrame>,
    truncated: bool,
}

impl OutputBuffer {
    fn new() -> Self {
        Self {
            events: std::collections::VecDeque::with_capacity(OUTPUT_EVENT_CAP),
            truncated: false,
        }
    }

    /// Records `frame`, evicting the oldest entry first if already at
    /// capacity. Returns `true` the first time eviction happens, so the
    /// caller can emit a one-time `TRUNCATED` marker.
    fn push(&mut self, frame: ServerFrame) -> bool {
        if self.events.len() >= OUTPUT_EVENT_CAP {
            self.events.pop_front();
            if !self.truncated {
                self.truncated = true;
                self.events.push_back(frame);
                return true;
            }
        }
        self.events.push_back(frame);
        false
    }
}

fn emit_output(
    sink: &Arc<dyn ResultSink>,
    session_id: SessionId,
    request_id: RequestId,
    stream: OutputStream,
    bytes: Vec<u8>,
    buffer: &mut OutputBuffer,
) {
    let frame = ServerFrame::Output {
        session_id,
        request_id,
        stream,
        data: String::from_utf8_lossy(&bytes).into_owned(),
    };
    sink.emit(frame.clone());
    if buffer.push(frame) {
        sink.emit(ServerFrame::Output {
            session_id,
            request_id,
            stream: OutputStream::System,
            data: "TRUNCATED".to_string(),
        });
    }
}
