pub mod error;
pub mod stdio;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{Defaults, LaunchSpec};
pub use error::{CallError, ConnectError};

/// Lifecycle of a backend session:
/// `Pending → Connecting → Connected → {Closing → Closed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Connecting,
    Connected,
    Closing,
    Closed,
    Failed,
}

/// A tool as reported by a backend's `tools/list`, before namespacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A live bidirectional MCP channel to one backend.
///
/// The production implementation is [`stdio::StdioSession`]; tests substitute
/// their own. The request/response correlator lives behind this seam: each
/// concurrent `call` receives exactly the response matching its request.
#[async_trait]
pub trait Session: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<NativeTool>, CallError>;

    async fn call(
        &self,
        tool: &str,
        arguments: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, CallError>;

    /// Close the channel and release the backing process. Idempotent.
    async fn close(&self);

    fn is_alive(&self) -> bool;

    /// Resolves when the backing process exits, with its status when the exit
    /// was observed. Sessions without a child process never resolve with one.
    async fn wait_exit(&self) -> Option<std::process::ExitStatus> {
        None
    }
}

/// Timeouts governing session lifecycle and calls.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub call: Duration,
    pub kill_grace: Duration,
    pub shutdown: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            call: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
            shutdown: Duration::from_secs(10),
        }
    }
}

impl From<&Defaults> for SessionTimeouts {
    fn from(d: &Defaults) -> Self {
        Self {
            connect: d.connect_timeout,
            call: d.call_timeout,
            kill_grace: d.kill_grace,
            shutdown: d.shutdown_deadline,
        }
    }
}

/// What the manager knows about one backend, whether or not a session is
/// currently live. Kept after failures so a reconnect can allocate a fresh
/// session from the same spec.
#[derive(Debug, Clone)]
pub struct BackendRecord {
    pub spec: LaunchSpec,
    pub status: SessionStatus,
}

/// Owns every backend session and its lifecycle.
///
/// Sessions live in a `DashMap` for lock-free concurrent reads on the call
/// path; records (spec + status) live behind an async `RwLock` and survive
/// session failures.
pub struct SessionManager {
    sessions: DashMap<String, Arc<dyn Session>>,
    records: RwLock<HashMap<String, BackendRecord>>,
    timeouts: SessionTimeouts,
    shutting_down: AtomicBool,
}

impl SessionManager {
    pub fn new(timeouts: SessionTimeouts) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            records: RwLock::new(HashMap::new()),
            timeouts,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Create the backend's record ahead of connecting, so listings see
    /// configured-but-not-yet-connected backends.
    pub async fn register_pending(&self, name: &str, spec: LaunchSpec) {
        self.upsert_record(name, spec, SessionStatus::Pending).await;
    }

    /// Spawn and handshake a backend, retaining the session.
    ///
    /// Idempotent: a second connect on a healthy entry returns the existing
    /// session. A connect over a failed entry allocates a fresh session.
    pub async fn connect(
        self: &Arc<Self>,
        name: &str,
        spec: LaunchSpec,
    ) -> Result<Arc<dyn Session>, ConnectError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ConnectError::ShuttingDown);
        }

        if let Some(existing) = self.sessions.get(name).map(|r| Arc::clone(r.value()))
            && existing.is_alive()
        {
            return Ok(existing);
        }

        self.upsert_record(name, spec.clone(), SessionStatus::Connecting)
            .await;

        let session = match stdio::StdioSession::connect(
            name,
            &spec,
            self.timeouts.connect,
            self.timeouts.kill_grace,
        )
        .await
        {
            Ok(s) => s as Arc<dyn Session>,
            Err(e) => {
                self.set_status(name, SessionStatus::Failed).await;
                return Err(e);
            }
        };

        self.sessions.insert(name.to_string(), Arc::clone(&session));
        self.set_status(name, SessionStatus::Connected).await;

        // Watch for the child exiting out from under us. A deliberate close
        // moves the record out of Connected first, and the ptr_eq check keeps
        // a stale watcher from failing a session that already replaced this
        // one, so only unexpected exits of the current session flip the
        // backend to Failed.
        {
            let manager = Arc::clone(self);
            let session = Arc::clone(&session);
            let backend = name.to_string();
            tokio::spawn(async move {
                let Some(status) = session.wait_exit().await else {
                    return;
                };
                let still_current = manager
                    .sessions
                    .get(&backend)
                    .is_some_and(|r| Arc::ptr_eq(r.value(), &session));
                if still_current
                    && manager.status(&backend).await == Some(SessionStatus::Connected)
                {
                    warn!(
                        backend = %backend,
                        exit_code = ?status.code(),
                        "backend process exited unexpectedly"
                    );
                    manager.mark_failed(&backend).await;
                }
            });
        }

        Ok(session)
    }

    /// Enumerate a backend's native tools over its live session.
    pub async fn list_tools(&self, name: &str) -> Result<Vec<NativeTool>, CallError> {
        let session = self.live_session(name).await?;
        session.list_tools().await
    }

    /// Forward a tool call to a backend under the configured per-call deadline.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Option<Value>,
    ) -> Result<Value, CallError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(CallError::Cancelled);
        }

        let session = self.live_session(name).await?;
        let result = session.call(tool, arguments, self.timeouts.call).await;
        if matches!(result, Err(CallError::SessionLost { .. })) {
            self.mark_failed(name).await;
        }
        result
    }

    /// Close a backend's session. Idempotent; the record survives as `Closed`.
    pub async fn disconnect(&self, name: &str) {
        if let Some((_, session)) = self.sessions.remove(name) {
            self.set_status(name, SessionStatus::Closing).await;
            session.close().await;
            info!(backend = %name, "session closed");
        }
        self.set_status(name, SessionStatus::Closed).await;
    }

    /// Disconnect every session in parallel, bounded by the shutdown deadline.
    pub async fn shutdown_all(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let names: Vec<String> = self.sessions.iter().map(|r| r.key().clone()).collect();
        if names.is_empty() {
            return;
        }
        info!(sessions = names.len(), "shutting down all sessions");

        let disconnects = names.into_iter().map(|name| {
            let manager = Arc::clone(self);
            async move { manager.disconnect(&name).await }
        });

        if tokio::time::timeout(
            self.timeouts.shutdown,
            futures::future::join_all(disconnects),
        )
        .await
        .is_err()
        {
            warn!(
                deadline = ?self.timeouts.shutdown,
                "shutdown deadline elapsed with sessions still closing"
            );
        }
    }

    /// Drop a backend entirely: session gone, record gone.
    pub async fn forget(&self, name: &str) -> bool {
        self.sessions.remove(name);
        self.records.write().await.remove(name).is_some()
    }

    pub async fn status(&self, name: &str) -> Option<SessionStatus> {
        self.records.read().await.get(name).map(|r| r.status)
    }

    /// Every known backend with its status, sorted by name.
    pub async fn statuses(&self) -> Vec<(String, SessionStatus)> {
        let records = self.records.read().await;
        let mut out: Vec<(String, SessionStatus)> = records
            .iter()
            .map(|(name, r)| (name.clone(), r.status))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    async fn live_session(&self, name: &str) -> Result<Arc<dyn Session>, CallError> {
        let session = self.sessions.get(name).map(|r| Arc::clone(r.value()));
        match session {
            Some(s) if s.is_alive() => Ok(s),
            Some(_) => {
                self.mark_failed(name).await;
                Err(CallError::BackendUnavailable {
                    backend: name.to_string(),
                    status: Some(SessionStatus::Failed),
                })
            }
            None => Err(CallError::BackendUnavailable {
                backend: name.to_string(),
                status: self.status(name).await,
            }),
        }
    }

    async fn mark_failed(&self, name: &str) {
        self.sessions.remove(name);
        self.set_status(name, SessionStatus::Failed).await;
    }

    async fn upsert_record(&self, name: &str, spec: LaunchSpec, status: SessionStatus) {
        self.records
            .write()
            .await
            .insert(name.to_string(), BackendRecord { spec, status });
    }

    async fn set_status(&self, name: &str, status: SessionStatus) {
        if let Some(record) = self.records.write().await.get_mut(name) {
            record.status = status;
        }
    }

    /// Insert a pre-built session, bypassing spawn/handshake.
    #[cfg(test)]
    pub(crate) async fn insert_session(
        &self,
        name: &str,
        spec: LaunchSpec,
        session: Arc<dyn Session>,
    ) {
        self.sessions.insert(name.to_string(), session);
        self.upsert_record(name, spec, SessionStatus::Connected).await;
    }

    /// Record a backend that never got a session (spawn failed before
    /// connect), for tests exercising failure listings.
    #[cfg(test)]
    pub(crate) async fn insert_failed_record(&self, name: &str, spec: LaunchSpec) {
        self.upsert_record(name, spec, SessionStatus::Failed).await;
    }
}
