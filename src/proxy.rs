use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{ConfigError, LaunchSpec, validate_backend_name};
use crate::registry::{RegistryError, ToolRegistry, ToolSpec};
use crate::session::{CallError, ConnectError, NativeTool, SessionManager, SessionStatus};

/// How many backends connect + enumerate at once during startup.
const STARTUP_CONCURRENCY: usize = 8;

/// Build the flat tool id for a backend's native tool.
pub fn make_tool_id(backend: &str, native_name: &str) -> String {
    format!("{backend}_{native_name}")
}

/// Split a flat tool id at the reserved separator. Backend names cannot
/// contain `_`, so the first underscore is always the boundary.
#[allow(dead_code)]
pub fn split_tool_id(id: &str) -> Option<(&str, &str)> {
    let (backend, native) = id.split_once('_')?;
    if backend.is_empty() || native.is_empty() {
        return None;
    }
    Some((backend, native))
}

/// Failures of the transparent execute path.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("tool '{0}' is locally defined and has no backend to execute on")]
    NotRoutable(String),

    #[error(transparent)]
    Call(#[from] CallError),
}

/// Failures of runtime server registration.
#[derive(Debug, Error)]
pub enum AddServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Enumerate(#[from] CallError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A tool descriptor supplied by the AI-assisted registration path. Trusted
/// as-is; live enumeration is skipped.
#[derive(Debug, Clone, Deserialize)]
pub struct TrustedTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub estimated_tokens: Option<u32>,
}

/// One backend as reported by the server listing.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub status: SessionStatus,
    pub tool_count: usize,
}

/// Composes the session manager and the registry into one cross-backend
/// surface: connects and enumerates backends, ingests their tools under
/// namespaced ids, and resolves ids back to `(backend, native tool)` on
/// execute. Holds references only; neither collaborator references it back.
pub struct Proxy {
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionManager>,
}

impl Proxy {
    pub fn new(registry: Arc<ToolRegistry>, sessions: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self { registry, sessions })
    }

    /// Connect every configured backend in parallel (bounded) and index its
    /// tools. Per-backend failures are logged and isolated; the healthy set
    /// proceeds.
    pub async fn start_all(self: &Arc<Self>, servers: &HashMap<String, LaunchSpec>) {
        let semaphore = Arc::new(Semaphore::new(STARTUP_CONCURRENCY));
        let mut join_set = JoinSet::new();

        for (name, spec) in servers {
            self.sessions.register_pending(name, spec.clone()).await;
        }

        for (name, spec) in servers {
            let proxy = Arc::clone(self);
            let name = name.clone();
            let spec = spec.clone();
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                match proxy.connect_and_index(&name, spec).await {
                    Ok(count) => {
                        info!(backend = %name, tools = count, "backend started");
                    }
                    Err(e) => {
                        error!(backend = %name, error = %e, "failed to start backend");
                    }
                }
            });
        }

        while join_set.join_next().await.is_some() {}

        info!(
            tools = self.registry.len(),
            backends = servers.len(),
            "tool discovery complete"
        );
    }

    /// Register a backend at runtime. An existing backend of the same name is
    /// torn down first so re-registration cannot leak a child process.
    ///
    /// With `trusted_tools` supplied, those descriptors are indexed directly
    /// and live enumeration is skipped.
    pub async fn add_server(
        &self,
        name: &str,
        spec: LaunchSpec,
        trusted_tools: Option<Vec<TrustedTool>>,
    ) -> Result<usize, AddServerError> {
        validate_backend_name(name)?;

        if self.sessions.status(name).await.is_some() {
            warn!(backend = %name, "replacing existing backend registration");
            self.sessions.disconnect(name).await;
            self.registry.delete_by_backend(name);
        }

        self.sessions.connect(name, spec).await?;

        let count = match trusted_tools {
            Some(tools) => self.ingest_trusted(name, tools),
            None => {
                let native = self.sessions.list_tools(name).await?;
                self.ingest_native(name, native)
            }
        };

        info!(backend = %name, tools = count, "server registered");
        Ok(count)
    }

    /// Disconnect a backend and drop everything it owns. Returns false when
    /// the name was never known.
    pub async fn remove_server(&self, name: &str) -> bool {
        let known = self.sessions.status(name).await.is_some();
        if known {
            self.sessions.disconnect(name).await;
            self.sessions.forget(name).await;
            let removed = self.registry.delete_by_backend(name);
            info!(backend = %name, tools_removed = removed, "server removed");
        }
        known
    }

    /// Resolve a flat tool id and forward the call to the owning backend.
    ///
    /// An unknown id fails before any backend traffic; session-level errors
    /// are surfaced verbatim.
    pub async fn execute(
        &self,
        tool_id: &str,
        arguments: Option<Value>,
    ) -> Result<Value, ExecuteError> {
        let tool = self
            .registry
            .get(tool_id)
            .ok_or_else(|| ExecuteError::UnknownTool(tool_id.to_string()))?;

        let Some(backend) = &tool.backend else {
            return Err(ExecuteError::NotRoutable(tool_id.to_string()));
        };

        Ok(self.sessions.call_tool(backend, &tool.name, arguments).await?)
    }

    /// Every configured backend (healthy or not) with status and tool count.
    pub async fn list_servers(&self) -> Vec<ServerInfo> {
        self.sessions
            .statuses()
            .await
            .into_iter()
            .map(|(name, status)| ServerInfo {
                tool_count: self.registry.backend_tool_count(&name),
                name,
                status,
            })
            .collect()
    }

    async fn connect_and_index(&self, name: &str, spec: LaunchSpec) -> Result<usize, AddServerError> {
        self.sessions.connect(name, spec).await?;
        let native = self.sessions.list_tools(name).await?;
        Ok(self.ingest_native(name, native))
    }

    /// Index enumerated tools under namespaced ids. Duplicates are first-wins;
    /// a tool whose embedding cannot be computed is skipped, not fatal.
    pub(crate) fn ingest_native(&self, backend: &str, tools: Vec<NativeTool>) -> usize {
        let mut count = 0;
        for tool in tools {
            let id = make_tool_id(backend, &tool.name);
            let spec = ToolSpec {
                id: id.clone(),
                name: tool.name,
                description: tool.description,
                tags: Vec::new(),
                parameters: tool.input_schema,
                estimated_tokens: None,
                backend: Some(backend.to_string()),
                vector: None,
            };
            match self.registry.insert(spec) {
                Ok(()) => count += 1,
                Err(RegistryError::DuplicateId(_)) => {
                    warn!(tool = %id, "duplicate tool id, keeping first registration");
                }
                Err(e) => {
                    warn!(tool = %id, error = %e, "failed to index tool, skipping");
                }
            }
        }
        count
    }

    pub(crate) fn ingest_trusted(&self, backend: &str, tools: Vec<TrustedTool>) -> usize {
        let mut count = 0;
        for t in tools {
            let id = make_tool_id(backend, &t.name);
            let spec = ToolSpec {
                id: id.clone(),
                name: t.name,
                description: t.description,
                tags: t.tags,
                parameters: t
                    .parameters
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                estimated_tokens: t.estimated_tokens,
                backend: Some(backend.to_string()),
                vector: None,
            };
            match self.registry.insert(spec) {
                Ok(()) => count += 1,
                Err(RegistryError::DuplicateId(_)) => {
                    warn!(tool = %id, "duplicate tool id, keeping first registration");
                }
                Err(e) => {
                    warn!(tool = %id, error = %e, "failed to index tool, skipping");
                }
            }
        }
        count
    }
}
