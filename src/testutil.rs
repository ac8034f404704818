//! Test utilities for toolgate — a controllable mock session and a
//! deterministic embedder.
//!
//! Only compiled under `#[cfg(test)]`. The mock session implements the
//! `Session` trait directly, so `SessionManager`, the proxy, and the HTTP
//! surface are testable without child processes or a real embedding model.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::LaunchSpec;
use crate::embedding::{Embedder, EmbedderError, l2_normalize};
use crate::registry::ToolRegistry;
use crate::session::{CallError, NativeTool, Session};

/// A launch spec for sessions that are inserted directly and never spawned.
pub fn mock_spec() -> LaunchSpec {
    LaunchSpec {
        command: "mock".to_string(),
        args: Vec::new(),
        env: HashMap::new(),
    }
}

/// A registry over the deterministic test embedder.
pub fn test_registry() -> Arc<ToolRegistry> {
    ToolRegistry::new(Arc::new(TokenEmbedder::default()))
}

/// Deterministic bag-of-words embedder.
///
/// Each distinct token is assigned its own axis on first sight, so cosine
/// similarity between two texts depends only on their token overlap — no hash
/// collisions, fully reproducible within a process.
pub struct TokenEmbedder {
    dim: usize,
    axes: StdMutex<HashMap<String, usize>>,
}

impl Default for TokenEmbedder {
    fn default() -> Self {
        Self {
            dim: 256,
            axes: StdMutex::new(HashMap::new()),
        }
    }
}

impl Embedder for TokenEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut v = vec![0.0f32; self.dim];
        {
            let mut axes = self.axes.lock().expect("axes lock poisoned");
            for token in text
                .to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|s| !s.is_empty())
            {
                let next = axes.len();
                let axis = *axes.entry(token.to_string()).or_insert(next);
                assert!(axis < self.dim, "test embedder vocabulary exhausted");
                v[axis] += 1.0;
            }
        }
        l2_normalize(&mut v);
        Ok(v)
    }
}

/// RAII guard that decrements the concurrent-call counter on drop, keeping it
/// accurate even when a call future is cancelled by a deadline.
struct ConcurrencyGuard<'a>(&'a AtomicUsize);

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A controllable mock MCP session.
///
/// Supports per-call delay (adjustable at runtime), error injection, a call
/// log, and concurrency tracking. Every call echoes its arguments back as
/// `{"tool": ..., "args": ...}` so callers can verify they received the
/// response to their own request.
pub struct MockSession {
    tools: Vec<NativeTool>,
    delay_ms: AtomicU64,
    alive: AtomicBool,
    closed: AtomicBool,
    inject_error: AtomicBool,
    list_calls: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    call_log: Mutex<Vec<(String, Option<Value>)>>,
}

impl MockSession {
    pub fn new(tool_names: &[&str], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            tools: tool_names
                .iter()
                .map(|name| NativeTool {
                    name: name.to_string(),
                    description: format!("Mock tool {name}"),
                    input_schema: json!({"type": "object", "properties": {}}),
                })
                .collect(),
            delay_ms: AtomicU64::new(delay.as_millis() as u64),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            inject_error: AtomicBool::new(false),
            list_calls: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            call_log: Mutex::new(Vec::new()),
        })
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_inject_error(&self, inject: bool) {
        self.inject_error.store(inject, Ordering::SeqCst);
    }

    /// Simulate the backing process dying out from under the session.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn list_tools_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn max_seen_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub async fn call_log(&self) -> Vec<(String, Option<Value>)> {
        self.call_log.lock().await.clone()
    }
}

#[async_trait]
impl Session for MockSession {
    async fn list_tools(&self) -> Result<Vec<NativeTool>, CallError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_alive() {
            return Err(CallError::SessionLost {
                tool: "tools/list".to_string(),
            });
        }
        Ok(self.tools.clone())
    }

    async fn call(
        &self,
        tool: &str,
        arguments: Option<Value>,
        deadline: Duration,
    ) -> Result<Value, CallError> {
        if !self.is_alive() {
            return Err(CallError::SessionLost {
                tool: tool.to_string(),
            });
        }

        let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(current, Ordering::SeqCst);
        let _guard = ConcurrencyGuard(&self.concurrent);

        self.call_log
            .lock()
            .await
            .push((tool.to_string(), arguments.clone()));

        if self.inject_error.load(Ordering::SeqCst) {
            return Err(CallError::Backend(json!({"message": "injected error"})));
        }

        let delay = Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
        let work = async {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            json!({"tool": tool, "args": arguments.unwrap_or(Value::Null)})
        };

        match tokio::time::timeout(deadline, work).await {
            Ok(v) => Ok(v),
            Err(_) => Err(CallError::Timeout {
                tool: tool.to_string(),
                deadline,
            }),
        }
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_echoes_arguments() {
        let mock = MockSession::new(&["echo"], Duration::ZERO);
        let args = json!({"message": "hello", "count": 42});
        let result = mock
            .call("echo", Some(args.clone()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["args"], args);
        assert_eq!(result["tool"], "echo");
    }

    #[tokio::test]
    async fn test_mock_error_injection() {
        let mock = MockSession::new(&["echo"], Duration::ZERO);
        mock.set_inject_error(true);
        let err = mock.call("echo", None, Duration::from_secs(5)).await;
        assert!(matches!(err, Err(CallError::Backend(_))));
    }

    #[tokio::test]
    async fn test_mock_concurrent_tracking() {
        let mock = MockSession::new(&["slow"], Duration::from_millis(100));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let m = Arc::clone(&mock);
            handles.push(tokio::spawn(async move {
                m.call("slow", None, Duration::from_secs(5)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(mock.max_seen_concurrent(), 5);
        assert_eq!(mock.call_log().await.len(), 5);
    }

    #[test]
    fn test_token_embedder_overlap() {
        let emb = TokenEmbedder::default();
        let a = emb.embed("search the web").unwrap();
        let b = emb.embed("search the web").unwrap();
        let c = emb.embed("completely different words").unwrap();

        let sim_same = crate::embedding::dot(&a, &b);
        let sim_diff = crate::embedding::dot(&a, &c);
        assert!((sim_same - 1.0).abs() < 1e-6);
        assert!(sim_diff.abs() < 1e-6);
    }

    #[test]
    fn test_token_embedder_dim_and_norm() {
        let emb = TokenEmbedder::default();
        let v = emb.embed("alpha beta").unwrap();
        assert_eq!(v.len(), emb.dim());
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
