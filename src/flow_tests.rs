//! End-to-end flows through the whole core: discover → provision → execute,
//! with mock sessions standing in for backend processes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::embedding::Embedder;
use crate::gating::{self, DiscoverParams};
use crate::proxy::{ExecuteError, Proxy};
use crate::registry::ToolRegistry;
use crate::session::{CallError, NativeTool, Session, SessionManager, SessionStatus, SessionTimeouts};
use crate::testutil::{MockSession, TokenEmbedder, mock_spec};

struct Gateway {
    embedder: Arc<dyn Embedder>,
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionManager>,
    proxy: Arc<Proxy>,
}

fn gateway(timeouts: SessionTimeouts) -> Gateway {
    let embedder: Arc<dyn Embedder> = Arc::new(TokenEmbedder::default());
    let registry = ToolRegistry::new(Arc::clone(&embedder));
    let sessions = SessionManager::new(timeouts);
    let proxy = Proxy::new(Arc::clone(&registry), Arc::clone(&sessions));
    Gateway {
        embedder,
        registry,
        sessions,
        proxy,
    }
}

fn native(name: &str, desc: &str) -> NativeTool {
    NativeTool {
        name: name.to_string(),
        description: desc.to_string(),
        input_schema: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
    }
}

async fn attach(gw: &Gateway, backend: &str, tools: &[(&str, &str)]) -> Arc<MockSession> {
    let mock = MockSession::new(
        &tools.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
        Duration::ZERO,
    );
    gw.sessions
        .insert_session(backend, mock_spec(), mock.clone() as Arc<dyn Session>)
        .await;
    gw.proxy.ingest_native(
        backend,
        tools.iter().map(|(n, d)| native(n, d)).collect(),
    );
    mock
}

#[tokio::test]
async fn test_discover_provision_execute_flow() {
    let gw = gateway(SessionTimeouts::default());
    let exa = attach(&gw, "exa", &[("search", "search the web for pages")]).await;
    attach(&gw, "fs", &[("read", "read a file from disk")]).await;

    // Discover ranks the web tool first for a web query.
    let ranked = gating::discover(
        &gw.registry,
        gw.embedder.as_ref(),
        &DiscoverParams {
            query: "search the web".to_string(),
            tags: Vec::new(),
            limit: 10,
        },
    )
    .unwrap();
    assert_eq!(ranked[0].tool.id, "exa_search");

    // Provision the ranked set under a generous budget.
    let set = gating::provision_ranked(&ranked, 10, 2000);
    assert!(!set.tools.is_empty());
    assert!(!set.gating_applied);
    let top_id = set.tools[0].id.clone();

    // Execute the provisioned id; the call lands on the owning backend.
    let result = gw
        .proxy
        .execute(&top_id, Some(json!({"q": "rust"})))
        .await
        .unwrap();
    assert_eq!(result["args"]["q"], "rust");
    assert_eq!(exa.call_log().await.len(), 1);
}

#[tokio::test]
async fn test_backend_failure_leaves_others_executable() {
    // Property 5 end to end: a dead backend's tools vanish from results only
    // for that backend, and execution against the healthy one still works.
    let gw = gateway(SessionTimeouts::default());
    let exa = attach(&gw, "exa", &[("search", "search the web")]).await;
    let flaky = attach(&gw, "flaky", &[("probe", "probe something")]).await;

    flaky.kill();
    let err = gw.proxy.execute("flaky_probe", None).await.unwrap_err();
    assert!(matches!(
        err,
        ExecuteError::Call(CallError::BackendUnavailable { .. })
    ));
    assert_eq!(
        gw.sessions.status("flaky").await,
        Some(SessionStatus::Failed)
    );

    // The healthy backend is untouched.
    gw.proxy.execute("exa_search", None).await.unwrap();
    assert_eq!(exa.call_log().await.len(), 1);

    // Its registry entries are intact too.
    assert_eq!(gw.registry.backend_tool_count("exa"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_execute_timeout_surfaced_verbatim() {
    let gw = gateway(SessionTimeouts {
        call: Duration::from_millis(500),
        ..SessionTimeouts::default()
    });
    let slow = attach(&gw, "slow", &[("crawl", "crawl a site")]).await;
    slow.set_delay(Duration::from_secs(120));

    let err = gw.proxy.execute("slow_crawl", None).await.unwrap_err();
    assert!(matches!(err, ExecuteError::Call(CallError::Timeout { .. })));

    // The session survived; a fast follow-up call succeeds.
    slow.set_delay(Duration::ZERO);
    gw.proxy.execute("slow_crawl", None).await.unwrap();
}

#[tokio::test]
async fn test_remove_server_then_discover_excludes_it() {
    let gw = gateway(SessionTimeouts::default());
    attach(&gw, "exa", &[("search", "search the web")]).await;
    attach(&gw, "calc", &[("eval", "evaluate an expression")]).await;

    assert!(gw.proxy.remove_server("calc").await);

    let ranked = gating::discover(
        &gw.registry,
        gw.embedder.as_ref(),
        &DiscoverParams {
            query: "evaluate an expression".to_string(),
            tags: Vec::new(),
            limit: 10,
        },
    )
    .unwrap();
    assert!(ranked.iter().all(|r| r.tool.backend.as_deref() != Some("calc")));
    assert_eq!(gw.registry.backend_tool_count("calc"), 0);
}

#[tokio::test]
async fn test_concurrent_executes_across_backends() {
    // Cross-backend concurrency: every call reaches its own backend with its
    // own arguments.
    let gw = gateway(SessionTimeouts::default());
    let exa = attach(&gw, "exa", &[("search", "search the web")]).await;
    let calc = attach(&gw, "calc", &[("eval", "evaluate math")]).await;

    let mut handles = Vec::new();
    for i in 0..10u32 {
        let proxy = Arc::clone(&gw.proxy);
        let id = if i % 2 == 0 { "exa_search" } else { "calc_eval" };
        handles.push(tokio::spawn(async move {
            let result = proxy
                .execute(id, Some(json!({"i": i})))
                .await
                .unwrap();
            assert_eq!(result["args"]["i"], i);
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(exa.call_log().await.len(), 5);
    assert_eq!(calc.call_log().await.len(), 5);
    assert!(exa.call_log().await.iter().all(|(tool, _)| tool == "search"));
    assert!(calc.call_log().await.iter().all(|(tool, _)| tool == "eval"));
}
