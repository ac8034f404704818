use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::embedding::{Embedder, EmbedderError, embed_with_retry, l2_normalize};

/// Registry-level failures, surfaced to the HTTP boundary as 409 / 404.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate tool id '{0}'")]
    DuplicateId(String),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("supplied vector has dimension {got}, expected {expected}")]
    VectorDimension { got: usize, expected: usize },

    #[error(transparent)]
    Embedder(#[from] EmbedderError),
}

/// A tool known to the gateway. Immutable once registered; replacement is
/// delete + insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Globally unique flat identifier, conventionally `<backend>_<native_name>`.
    pub id: String,
    /// Native tool name as reported by the backend.
    pub name: String,
    /// Human-readable description; primary input to the embedding.
    pub description: String,
    /// Lower-cased, deduplicated, sorted.
    pub tags: Vec<String>,
    /// Opaque JSON schema for the tool's arguments, passed through untouched.
    pub parameters: Value,
    /// Cost of including this tool in a prompt.
    pub estimated_tokens: u32,
    /// Owning backend; `None` for locally defined tools.
    pub backend: Option<String>,
    /// L2-normalized embedding of name + description + tags.
    #[serde(skip_serializing)]
    pub vector: Vec<f32>,
}

/// Insertion request. The registry fills in whatever is omitted: the token
/// estimate from the descriptor text, the vector from the embedder.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    #[serde(default)]
    pub estimated_tokens: Option<u32>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
}

fn default_parameters() -> Value {
    serde_json::json!({"type": "object"})
}

/// Dense view of every indexed vector, row `i` aligned with `ids[i]`.
///
/// Atomically replaced on every registry mutation, so a holder scores against
/// a consistent index without taking the registry lock.
pub struct VectorIndex {
    pub ids: Vec<String>,
    matrix: Vec<f32>,
    dim: usize,
}

impl VectorIndex {
    fn empty(dim: usize) -> Self {
        Self {
            ids: Vec::new(),
            matrix: Vec::new(),
            dim,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[allow(dead_code)]
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.matrix[i * self.dim..(i + 1) * self.dim]
    }
}

/// Filter for [`ToolRegistry::list`].
#[derive(Debug, Default, Clone)]
pub struct ListFilter {
    pub backend: Option<String>,
    pub tag: Option<String>,
}

struct RegistryInner {
    tools: HashMap<String, Arc<ToolDescriptor>>,
    by_tag: HashMap<String, HashSet<String>>,
    by_backend: HashMap<String, HashSet<String>>,
    snapshot: Arc<VectorIndex>,
}

/// Authoritative in-memory catalog of tool descriptors plus lookup indices.
///
/// Single writer / many readers: mutations hold the write lock while
/// rebuilding the vector snapshot, readers take a short shared lock to clone
/// out `Arc`s and never observe a torn index.
pub struct ToolRegistry {
    embedder: Arc<dyn Embedder>,
    inner: RwLock<RegistryInner>,
}

impl ToolRegistry {
    pub fn new(embedder: Arc<dyn Embedder>) -> Arc<Self> {
        let dim = embedder.dim();
        Arc::new(Self {
            embedder,
            inner: RwLock::new(RegistryInner {
                tools: HashMap::new(),
                by_tag: HashMap::new(),
                by_backend: HashMap::new(),
                snapshot: Arc::new(VectorIndex::empty(dim)),
            }),
        })
    }

    /// Insert a tool. Fails with `DuplicateId` if the id is already taken.
    ///
    /// The vector, when not supplied, is computed from
    /// `"{name} {description} {tags}"`; supplied vectors are re-normalized.
    pub fn insert(&self, spec: ToolSpec) -> Result<(), RegistryError> {
        let tags = normalize_tags(spec.tags);

        let vector = match spec.vector {
            Some(mut v) => {
                if v.len() != self.embedder.dim() {
                    return Err(RegistryError::VectorDimension {
                        got: v.len(),
                        expected: self.embedder.dim(),
                    });
                }
                l2_normalize(&mut v);
                v
            }
            None => {
                let text = embedding_text(&spec.name, &spec.description, &tags);
                embed_with_retry(self.embedder.as_ref(), &text)?
            }
        };

        let estimated_tokens = spec
            .estimated_tokens
            .unwrap_or_else(|| estimate_tokens(&spec.name, &spec.description, &spec.parameters));

        let tool = Arc::new(ToolDescriptor {
            id: spec.id,
            name: spec.name,
            description: spec.description,
            tags,
            parameters: spec.parameters,
            estimated_tokens,
            backend: spec.backend,
            vector,
        });

        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.tools.contains_key(&tool.id) {
            return Err(RegistryError::DuplicateId(tool.id.clone()));
        }

        for tag in &tool.tags {
            inner
                .by_tag
                .entry(tag.clone())
                .or_default()
                .insert(tool.id.clone());
        }
        if let Some(backend) = &tool.backend {
            inner
                .by_backend
                .entry(backend.clone())
                .or_default()
                .insert(tool.id.clone());
        }

        debug!(tool = %tool.id, backend = ?tool.backend, "tool registered");
        inner.tools.insert(tool.id.clone(), tool);
        inner.snapshot = Arc::new(rebuild_snapshot(&inner.tools, self.embedder.dim()));
        Ok(())
    }

    /// Remove a tool from the primary map and every secondary index. Idempotent.
    #[allow(dead_code)]
    pub fn delete(&self, id: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let Some(tool) = inner.tools.remove(id) else {
            return;
        };
        unindex(&mut inner, &tool);
        inner.snapshot = Arc::new(rebuild_snapshot(&inner.tools, self.embedder.dim()));
    }

    /// Remove every tool owned by a backend. Returns the number removed.
    pub fn delete_by_backend(&self, backend: &str) -> usize {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let Some(ids) = inner.by_backend.remove(backend) else {
            return 0;
        };
        let mut removed = 0;
        for id in ids {
            if let Some(tool) = inner.tools.remove(&id) {
                for tag in &tool.tags {
                    if let Some(set) = inner.by_tag.get_mut(tag) {
                        set.remove(&id);
                        if set.is_empty() {
                            inner.by_tag.remove(tag);
                        }
                    }
                }
                removed += 1;
            }
        }
        inner.snapshot = Arc::new(rebuild_snapshot(&inner.tools, self.embedder.dim()));
        removed
    }

    /// Empty the registry entirely.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.tools.clear();
        inner.by_tag.clear();
        inner.by_backend.clear();
        inner.snapshot = Arc::new(VectorIndex::empty(self.embedder.dim()));
    }

    pub fn get(&self, id: &str) -> Option<Arc<ToolDescriptor>> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .tools
            .get(id)
            .cloned()
    }

    /// List descriptors matching the filter, sorted by id.
    #[allow(dead_code)]
    pub fn list(&self, filter: &ListFilter) -> Vec<Arc<ToolDescriptor>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut out: Vec<Arc<ToolDescriptor>> = inner
            .tools
            .values()
            .filter(|t| match &filter.backend {
                Some(b) => t.backend.as_deref() == Some(b.as_str()),
                None => true,
            })
            .filter(|t| match &filter.tag {
                Some(tag) => t.tags.iter().any(|x| x == tag),
                None => true,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// The current vector snapshot (the `all_vectors` view). Scoring against
    /// it requires no registry lock.
    pub fn snapshot(&self) -> Arc<VectorIndex> {
        Arc::clone(&self.inner.read().expect("registry lock poisoned").snapshot)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").tools.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tools owned by a backend.
    pub fn backend_tool_count(&self, backend: &str) -> usize {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_backend
            .get(backend)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

fn unindex(inner: &mut RegistryInner, tool: &ToolDescriptor) {
    for tag in &tool.tags {
        if let Some(set) = inner.by_tag.get_mut(tag) {
            set.remove(&tool.id);
            if set.is_empty() {
                inner.by_tag.remove(tag);
            }
        }
    }
    if let Some(backend) = &tool.backend
        && let Some(set) = inner.by_backend.get_mut(backend)
    {
        set.remove(&tool.id);
        if set.is_empty() {
            inner.by_backend.remove(backend);
        }
    }
}

/// Rebuild the dense snapshot in stable (ascending id) order.
fn rebuild_snapshot(tools: &HashMap<String, Arc<ToolDescriptor>>, dim: usize) -> VectorIndex {
    let mut ids: Vec<String> = tools.keys().cloned().collect();
    ids.sort();

    let mut matrix = Vec::with_capacity(ids.len() * dim);
    for id in &ids {
        matrix.extend_from_slice(&tools[id].vector);
    }

    VectorIndex { ids, matrix, dim }
}

/// Lower-case, deduplicate, and sort tags.
fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut set: Vec<String> = tags
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    set.sort();
    set.dedup();
    set
}

/// The text a tool's vector is derived from.
pub fn embedding_text(name: &str, description: &str, tags: &[String]) -> String {
    if tags.is_empty() {
        format!("{name} {description}")
    } else {
        format!("{name} {description} {}", tags.join(" "))
    }
}

/// Rough prompt-cost estimate: one token per four characters of the
/// descriptor text a client would see.
fn estimate_tokens(name: &str, description: &str, parameters: &Value) -> u32 {
    let params_len = serde_json::to_string(parameters).map(|s| s.len()).unwrap_or(0);
    let chars = name.len() + description.len() + params_len;
    (chars as u32).div_ceil(4)
}
