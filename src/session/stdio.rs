use async_trait::async_trait;
use rmcp::{ServiceExt, model::*, service::RunningService};
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock, oneshot, watch};
use tracing::{debug, info, warn};

use super::error::{CallError, ConnectError};
use super::{NativeTool, Session};
use crate::config::LaunchSpec;

/// `None` means the exit status could not be collected (reaped after a kill).
type ExitSignal = Option<std::process::ExitStatus>;

/// A stdio child-process MCP session using rmcp.
///
/// The child is spawned directly (its own process group, piped stdio) and the
/// pipes handed to rmcp as the transport; the rmcp service runs the per-session
/// reader loop and correlates responses to outstanding requests. The child
/// handle itself is owned by a supervisor task, which reaps the process on
/// exit and performs the SIGTERM → SIGKILL escalation on close.
pub struct StdioSession {
    backend: String,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
    alive: Arc<AtomicBool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<ExitSignal>>,
}

impl StdioSession {
    /// Spawn the backend process and perform the MCP initialization handshake.
    pub async fn connect(
        backend: &str,
        spec: &LaunchSpec,
        connect_timeout: Duration,
        kill_grace: Duration,
    ) -> Result<Arc<Self>, ConnectError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        // Each child in its own process group for clean kill-group cleanup
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ConnectError::Spawn {
            backend: backend.to_string(),
            source: e,
        })?;

        let pid = child.id();
        debug!(backend = %backend, pid = ?pid, "spawned child process");

        let stdout = child.stdout.take().ok_or_else(|| ConnectError::Protocol {
            backend: backend.to_string(),
            detail: "failed to capture stdout".to_string(),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| ConnectError::Protocol {
            backend: backend.to_string(),
            detail: "failed to capture stdin".to_string(),
        })?;

        // rmcp accepts (AsyncRead, AsyncWrite) tuples as IntoTransport
        let service = match tokio::time::timeout(connect_timeout, ().serve((stdout, stdin))).await
        {
            Ok(Ok(service)) => service,
            Ok(Err(e)) => {
                terminate(backend, &mut child, kill_grace).await;
                return Err(ConnectError::Protocol {
                    backend: backend.to_string(),
                    detail: e.to_string(),
                });
            }
            Err(_) => {
                terminate(backend, &mut child, kill_grace).await;
                return Err(ConnectError::HandshakeTimeout {
                    backend: backend.to_string(),
                    timeout: connect_timeout,
                });
            }
        };

        if let Some(peer) = service.peer_info() {
            info!(
                backend = %backend,
                pid = ?pid,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "MCP handshake complete"
            );
        } else {
            info!(backend = %backend, pid = ?pid, "MCP handshake complete (no peer info)");
        }

        let alive = Arc::new(AtomicBool::new(true));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(supervise(
            backend.to_string(),
            child,
            kill_rx,
            exit_tx,
            Arc::clone(&alive),
            kill_grace,
        ));

        Ok(Arc::new(Self {
            backend: backend.to_string(),
            service: RwLock::new(Some(service)),
            alive,
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_rx,
        }))
    }
}

#[async_trait]
impl Session for StdioSession {
    async fn list_tools(&self) -> Result<Vec<NativeTool>, CallError> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| CallError::SessionLost {
            tool: "tools/list".to_string(),
        })?;

        let tools = service.list_all_tools().await.map_err(|e| {
            if self.is_alive() {
                CallError::Backend(serde_json::json!({"message": e.to_string()}))
            } else {
                CallError::SessionLost {
                    tool: "tools/list".to_string(),
                }
            }
        })?;

        let native = map_native_tools(tools);
        info!(backend = %self.backend, tools = native.len(), "enumerated tools");
        Ok(native)
    }

    async fn call(
        &self,
        tool: &str,
        arguments: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, CallError> {
        let guard = self.service.read().await;
        let service = guard.as_ref().ok_or_else(|| CallError::SessionLost {
            tool: tool.to_string(),
        })?;

        let params = CallToolRequestParams {
            meta: None,
            name: tool.to_string().into(),
            arguments: arguments.and_then(|v| v.as_object().cloned()),
            task: None,
        };

        debug!(backend = %self.backend, tool = %tool, "forwarding tool call");

        match tokio::time::timeout(deadline, service.call_tool(params)).await {
            // Deadline elapsed. The rmcp layer retires the abandoned
            // correlator when (if) the response arrives; the session itself
            // stays usable.
            Err(_) => Err(CallError::Timeout {
                tool: tool.to_string(),
                deadline,
            }),
            Ok(Err(e)) => {
                if self.is_alive() {
                    Err(CallError::Backend(
                        serde_json::json!({"message": e.to_string()}),
                    ))
                } else {
                    Err(CallError::SessionLost {
                        tool: tool.to_string(),
                    })
                }
            }
            Ok(Ok(result)) => {
                let is_error = matches!(result.is_error, Some(true));
                let payload = map_call_tool_result(result);
                if is_error {
                    Err(CallError::Backend(payload))
                } else {
                    Ok(payload)
                }
            }
        }
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Release);

        // Cancel the rmcp service first (closes the transport gracefully)
        if let Some(service) = self.service.write().await.take()
            && let Err(e) = service.cancel().await
        {
            debug!(backend = %self.backend, error = %e, "error cancelling MCP service");
        }

        let kill_tx = self.kill_tx.lock().await.take();
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
            // Wait for the supervisor to reap the child.
            let mut rx = self.exit_rx.clone();
            let _ = rx.wait_for(|v| v.is_some()).await;
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn wait_exit(&self) -> Option<std::process::ExitStatus> {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(|v| v.is_some()).await {
            Ok(signal) => (*signal).flatten(),
            Err(_) => None,
        }
    }
}

/// Owns the child handle: reaps the process when it exits on its own, or
/// terminates it on request from `close()`.
async fn supervise(
    backend: String,
    mut child: tokio::process::Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitSignal>>,
    alive: Arc<AtomicBool>,
    kill_grace: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            alive.store(false, Ordering::Release);
            let _ = exit_tx.send(Some(status.ok()));
        }
        _ = kill_rx => {
            alive.store(false, Ordering::Release);
            terminate(&backend, &mut child, kill_grace).await;
            let _ = exit_tx.send(Some(None));
        }
    }
}

/// SIGTERM the child's process group, wait out the grace period, then SIGKILL.
async fn terminate(backend: &str, child: &mut tokio::process::Child, kill_grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Negative PID signals the entire process group.
        // Safety: libc::kill is safe to call with any PID value
        let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
        if ret == 0 {
            debug!(backend = %backend, pid, "sent SIGTERM to process group");
        } else {
            warn!(backend = %backend, pid, "failed to signal process group");
        }
    }

    match tokio::time::timeout(kill_grace, child.wait()).await {
        Ok(_) => {
            debug!(backend = %backend, "backend exited within grace period");
        }
        Err(_) => {
            warn!(backend = %backend, grace = ?kill_grace, "backend ignored SIGTERM, killing");
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                // Safety: see above
                unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
            }
            let _ = child.kill().await;
        }
    }
}

/// Collapse a CallToolResult's content into a JSON payload.
fn map_call_tool_result(result: CallToolResult) -> Value {
    let contents: Vec<Value> = result
        .content
        .into_iter()
        .map(|c| match c.raw {
            RawContent::Text(t) => Value::String(t.text),
            _ => Value::String("[non-text content]".to_string()),
        })
        .collect();

    if contents.len() == 1 {
        contents.into_iter().next().unwrap_or(Value::Null)
    } else {
        Value::Array(contents)
    }
}

/// Map rmcp tools into the pre-namespacing descriptor shape.
fn map_native_tools(tools: Vec<Tool>) -> Vec<NativeTool> {
    tools
        .into_iter()
        .map(|t| NativeTool {
            name: t.name.to_string(),
            description: t.description.unwrap_or_default().to_string(),
            input_schema: serde_json::to_value(&t.input_schema)
                .unwrap_or(Value::Object(Default::default())),
        })
        .collect()
}
