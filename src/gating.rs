use std::sync::Arc;
use tracing::debug;

use crate::embedding::{Embedder, EmbedderError, dot, embed_with_retry};
use crate::registry::{RegistryError, ToolDescriptor, ToolRegistry};

/// Per-request provisioning caps.
pub const DEFAULT_MAX_TOKENS: u64 = 2000;
pub const DEFAULT_MAX_TOOLS: usize = 10;

/// Weight of one matching tag in the relevance score.
const TAG_BOOST: f32 = 0.2;

/// A discovery request: free text plus tag hints.
#[derive(Debug, Clone)]
pub struct DiscoverParams {
    pub query: String,
    pub tags: Vec<String>,
    pub limit: usize,
}

/// One discovery result.
#[derive(Debug, Clone)]
pub struct RankedTool {
    pub tool: Arc<ToolDescriptor>,
    pub score: f32,
    pub matched_tags: Vec<String>,
}

/// Outcome of budget-constrained selection.
#[derive(Debug, Clone)]
pub struct ProvisionedSet {
    pub tools: Vec<Arc<ToolDescriptor>>,
    pub total_tokens: u64,
    /// True iff at least one candidate was excluded by the count or token cap.
    pub gating_applied: bool,
}

/// Rank indexed tools against a query.
///
/// Score is `clamp(cosine + 0.2 × |matching tags|, 0, 1)`. With empty query
/// text the cosine term is zero and tags alone rank. Ties break by ascending
/// id so a fixed registry and query always produce the same ordering.
pub fn discover(
    registry: &ToolRegistry,
    embedder: &dyn Embedder,
    params: &DiscoverParams,
) -> Result<Vec<RankedTool>, EmbedderError> {
    if params.limit == 0 {
        return Ok(Vec::new());
    }

    let query_vec = if params.query.trim().is_empty() {
        None
    } else {
        Some(embed_with_retry(embedder, &params.query)?)
    };

    let query_tags: Vec<String> = params.tags.iter().map(|t| t.to_lowercase()).collect();

    // Score against a stable snapshot; no registry lock is held across the
    // similarity loop.
    let snapshot = registry.snapshot();
    let mut scored: Vec<RankedTool> = Vec::with_capacity(snapshot.len());
    for (i, id) in snapshot.ids.iter().enumerate() {
        // A tool deleted after the snapshot was taken is silently skipped.
        let Some(tool) = registry.get(id) else {
            continue;
        };

        let sim = match &query_vec {
            Some(q) => dot(q, snapshot.row(i)),
            None => 0.0,
        };

        let matched_tags: Vec<String> = tool
            .tags
            .iter()
            .filter(|t| query_tags.iter().any(|q| q == *t))
            .cloned()
            .collect();
        let boost = TAG_BOOST * matched_tags.len() as f32;

        scored.push(RankedTool {
            tool,
            score: (sim + boost).clamp(0.0, 1.0),
            matched_tags,
        });
    }

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.tool.id.cmp(&b.tool.id))
    });
    scored.truncate(params.limit);

    debug!(
        query = %params.query,
        results = scored.len(),
        "discovery ranked"
    );
    Ok(scored)
}

/// Greedily fit a ranked list into the budget, highest score first.
#[allow(dead_code)]
pub fn provision_ranked(
    ranked: &[RankedTool],
    max_tools: usize,
    max_tokens: u64,
) -> ProvisionedSet {
    fit(ranked.iter().map(|r| Arc::clone(&r.tool)), max_tools, max_tokens)
}

/// Greedily fit an explicit id list into the budget, input order.
///
/// Fails with `UnknownTool` on the first id not present in the registry.
pub fn provision_ids(
    registry: &ToolRegistry,
    ids: &[String],
    max_tools: usize,
    max_tokens: u64,
) -> Result<ProvisionedSet, RegistryError> {
    let mut tools = Vec::with_capacity(ids.len());
    for id in ids {
        tools.push(
            registry
                .get(id)
                .ok_or_else(|| RegistryError::UnknownTool(id.clone()))?,
        );
    }
    Ok(fit(tools.into_iter(), max_tools, max_tokens))
}

/// The gating step: scan candidates in order, include each iff both running
/// caps still hold, and keep scanning past a tool that does not fit.
fn fit(
    candidates: impl Iterator<Item = Arc<ToolDescriptor>>,
    max_tools: usize,
    max_tokens: u64,
) -> ProvisionedSet {
    let mut tools = Vec::new();
    let mut total_tokens: u64 = 0;
    let mut gating_applied = false;

    for tool in candidates {
        let cost = u64::from(tool.estimated_tokens);
        if tools.len() + 1 > max_tools || total_tokens + cost > max_tokens {
            gating_applied = true;
            continue;
        }
        total_tokens += cost;
        tools.push(tool);
    }

    ProvisionedSet {
        tools,
        total_tokens,
        gating_applied,
    }
}
