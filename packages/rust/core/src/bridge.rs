//! Collaborator bridge over a helper subprocess.
//!
//! The helper owns every HTTP call, credential and pagination detail. Playbook
//! talks to it with newline-delimited JSON on stdin/stdout:
//!
//! - helper → `{"type":"ready"}` once on startup
//! - Playbook → `generate`, `list_tasks`, `update_description`, `shutdown`
//! - helper → `result` / `error`, each echoing the request `id`
//!
//! A background reader routes responses to waiting callers by id. A caller
//! that gives up (e.g. on timeout) deregisters its id, so a late response is
//! discarded instead of being handed to the next request.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use playbook_shared::{BridgeConfig, ExternalTask, PlaybookError, Result};

use crate::generation::{GeneratedText, GenerationRequest, TextGenerator};
use crate::tracker::TaskTracker;

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Request message sent to the helper.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestMessage<'a> {
    Generate {
        id: String,
        request: &'a GenerationRequest,
    },
    ListTasks {
        id: String,
        project_id: &'a str,
    },
    UpdateDescription {
        id: String,
        task_id: &'a str,
        description: &'a str,
    },
    Shutdown,
}

/// Response message received from the helper.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseMessage {
    Ready,
    Result {
        id: String,
        #[serde(default)]
        result: serde_json::Value,
    },
    Error {
        id: String,
        error: String,
    },
}

/// What a caller receives for its request.
enum Reply {
    Ok(serde_json::Value),
    /// The helper reported a failure for this request.
    Remote(String),
}

#[derive(Default)]
struct PendingState {
    waiters: HashMap<String, oneshot::Sender<Reply>>,
    /// Set once the helper's stdout is gone; no reply can arrive after that.
    closed: bool,
}

type Pending = Arc<Mutex<PendingState>>;

/// Removes a request's slot when its caller stops waiting.
struct PendingGuard {
    pending: Pending,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiters
            .remove(&self.id);
    }
}

fn bridge_err(msg: impl Into<String>) -> PlaybookError {
    PlaybookError::Bridge(msg.into())
}

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

/// Handle to the running helper process.
pub struct Bridge {
    outgoing: mpsc::UnboundedSender<String>,
    pending: Pending,
    request_counter: AtomicU64,
    child: tokio::sync::Mutex<Child>,
}

impl Bridge {
    /// Spawn `<command> run <script>` from the configured working directory.
    pub async fn spawn(config: &BridgeConfig) -> Result<Self> {
        Self::spawn_command(
            &config.command,
            &["run", config.script.as_str()],
            Path::new(&config.working_dir),
        )
        .await
    }

    /// Spawn an arbitrary helper program and wait for its ready message.
    #[instrument(skip_all, fields(program = program))]
    pub async fn spawn_command(program: &str, args: &[&str], working_dir: &Path) -> Result<Self> {
        info!(program, ?args, "spawning collaborator bridge");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Helper logs go to our stderr
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| bridge_err(format!("failed to spawn bridge: {e}. Is `{program}` installed?")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| bridge_err("failed to capture bridge stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| bridge_err("failed to capture bridge stdout"))?;

        let mut lines = BufReader::new(stdout).lines();
        wait_for_ready(&mut lines).await?;

        let pending: Pending = Arc::default();
        tokio::spawn(read_responses(lines, Arc::clone(&pending)));

        let (outgoing, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let written = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!(error = %e, "failed to write to bridge stdin");
                    break;
                }
            }
        });

        Ok(Self {
            outgoing,
            pending,
            request_counter: AtomicU64::new(0),
            child: tokio::sync::Mutex::new(child),
        })
    }

    fn next_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("req-{n}")
    }

    /// Send one request and wait for the response carrying its id.
    async fn call(&self, id: String, message: &RequestMessage<'_>) -> Result<Reply> {
        let json = serde_json::to_string(message)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return Err(bridge_err("bridge closed stdout unexpectedly"));
            }
            state.waiters.insert(id.clone(), tx);
        }
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id: id.clone(),
        };

        debug!(%id, "sending bridge request");
        self.outgoing
            .send(json)
            .map_err(|_| bridge_err("bridge is not running"))?;

        rx.await
            .map_err(|_| bridge_err("bridge closed stdout unexpectedly"))
    }

    /// Ask the helper to exit, killing it if it does not within a few seconds.
    pub async fn shutdown(&self) -> Result<()> {
        let json = serde_json::to_string(&RequestMessage::Shutdown)?;
        let _ = self.outgoing.send(json);

        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => info!(?status, "bridge exited"),
            Ok(Err(e)) => warn!("bridge wait error: {e}"),
            Err(_) => {
                warn!("bridge did not exit, killing it");
                child
                    .kill()
                    .await
                    .map_err(|e| bridge_err(format!("failed to kill bridge: {e}")))?;
            }
        }
        Ok(())
    }
}

/// Wait for the helper's "ready" line.
async fn wait_for_ready(lines: &mut tokio::io::Lines<BufReader<ChildStdout>>) -> Result<()> {
    let line = tokio::time::timeout(READY_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| bridge_err("timed out waiting for bridge ready message"))?
        .map_err(|e| bridge_err(format!("bridge read error: {e}")))?
        .ok_or_else(|| bridge_err("bridge exited before becoming ready"))?;

    match serde_json::from_str::<ResponseMessage>(line.trim()) {
        Ok(ResponseMessage::Ready) => {
            info!("bridge is ready");
            Ok(())
        }
        _ => Err(bridge_err(format!("expected ready message, got: {line}"))),
    }
}

/// Route responses to their waiting callers until the helper closes stdout.
async fn read_responses(mut lines: tokio::io::Lines<BufReader<ChildStdout>>, pending: Pending) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("bridge stdout closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "bridge read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let (id, reply) = match serde_json::from_str::<ResponseMessage>(line.trim()) {
            Ok(ResponseMessage::Result { id, result }) => (id, Reply::Ok(result)),
            Ok(ResponseMessage::Error { id, error }) => (id, Reply::Remote(error)),
            Ok(ResponseMessage::Ready) => {
                debug!("ignoring repeated ready message");
                continue;
            }
            Err(e) => {
                let preview: String = line.chars().take(200).collect();
                warn!(error = %e, line = %preview, "invalid bridge response");
                continue;
            }
        };

        let waiter = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiters
            .remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(%id, "discarding stale bridge response"),
        }
    }

    // Dropping the senders wakes every waiter with an error.
    let mut state = pending.lock().unwrap_or_else(PoisonError::into_inner);
    state.closed = true;
    state.waiters.clear();
}

// ---------------------------------------------------------------------------
// Capability adapters
// ---------------------------------------------------------------------------

/// [`TextGenerator`] backed by the bridge.
pub struct BridgeGenerator(pub Arc<Bridge>);

#[async_trait]
impl TextGenerator for BridgeGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedText> {
        let id = self.0.next_id();
        match self.0.call(id.clone(), &RequestMessage::Generate { id, request }).await? {
            Reply::Ok(value) => Ok(serde_json::from_value(value)?),
            Reply::Remote(error) => Err(PlaybookError::Generation(error)),
        }
    }
}

/// [`TaskTracker`] backed by the bridge.
pub struct BridgeTracker(pub Arc<Bridge>);

#[async_trait]
impl TaskTracker for BridgeTracker {
    async fn list_tasks(&self, project_id: &str) -> Result<Vec<ExternalTask>> {
        let id = self.0.next_id();
        match self
            .0
            .call(id.clone(), &RequestMessage::ListTasks { id, project_id })
            .await?
        {
            Reply::Ok(value) => Ok(serde_json::from_value(value)?),
            Reply::Remote(error) => Err(PlaybookError::Tracker(error)),
        }
    }

    async fn update_description(&self, task_id: &str, description: &str) -> Result<()> {
        let id = self.0.next_id();
        let message = RequestMessage::UpdateDescription {
            id: id.clone(),
            task_id,
            description,
        };
        match self.0.call(id, &message).await? {
            Reply::Ok(_) => Ok(()),
            Reply::Remote(error) => Err(PlaybookError::Tracker(error)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
