//! Transformation graph
//!
//! A graph is declared as a list of `(node, accepts, emits)` entries and built
//! once per job. Building resolves every node name through a [`NodeRegistry`],
//! rejects cycles over the emitted-type edges and caches the ordered chain of
//! nodes for each record type. The result is immutable and shared by all
//! workers behind an `Arc`.
//!
//! # Routing
//!
//! A record enters the chain for its type. Outputs of a node that keep the
//! accepted type continue to the next node of the same chain; outputs of a
//! different type start over at the head of their own chain. A record that
//! runs off the end of its chain, or whose type has no chain, is terminal.
//!
//! ```no_run
//! use syncflow_engine::graph::{GraphConfig, NodeRegistry, TransformGraph};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = GraphConfig::from_json_str(
//!     r#"{"nodes": [{"node": "chunk_text", "accepts": "doc", "emits": ["doc", "doc_chunk"],
//!                    "params": {"child_type": "doc_chunk", "max_chars": 800}}]}"#,
//! )?;
//! let graph = TransformGraph::build(&config, &NodeRegistry::with_builtins())?;
//! assert_eq!(graph.route("doc").len(), 1);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use syncflow_common::types::Record;

use crate::convert::FileToTextNode;
use crate::error::{SyncError, SyncResult};

// ============================================================================
// Node contract
// ============================================================================

/// Pure transformation from one record to zero, one or many records
pub trait TransformNode: Send + Sync {
    fn apply(&self, record: Record) -> SyncResult<Vec<Record>>;
}

/// Builds a node instance from its declaration
pub type NodeFactory = Arc<dyn Fn(&NodeSpec) -> SyncResult<Arc<dyn TransformNode>> + Send + Sync>;

/// One node declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Registered node name
    pub node: String,
    /// Record type the node accepts
    pub accepts: String,
    /// Types the node may emit
    #[serde(default)]
    pub emits: Vec<String>,
    /// Node-specific parameters
    #[serde(default)]
    pub params: serde_json::Value,
}

impl NodeSpec {
    pub fn new(node: impl Into<String>, accepts: impl Into<String>, emits: &[&str]) -> Self {
        Self {
            node: node.into(),
            accepts: accepts.into(),
            emits: emits.iter().map(|s| s.to_string()).collect(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|v| v.as_str())
    }
}

/// Declarative graph definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    pub nodes: Vec<NodeSpec>,
}

impl GraphConfig {
    pub fn from_json_str(json: &str) -> SyncResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| SyncError::Configuration(format!("invalid graph definition: {e}")))
    }

    pub fn from_path(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Configuration(format!("cannot read graph {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Node implementations by name
#[derive(Clone, Default)]
pub struct NodeRegistry {
    factories: HashMap<String, NodeFactory>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("NodeRegistry").field("nodes", &names).finish()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `passthrough`, `chunk_text`, `expand_children` and `file_to_text`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("passthrough", |_| Ok(Arc::new(PassthroughNode)));
        registry.register("chunk_text", |spec| Ok(Arc::new(ChunkTextNode::from_spec(spec)?)));
        registry.register("expand_children", |spec| {
            Ok(Arc::new(ExpandChildrenNode::from_spec(spec)?))
        });
        registry.register("file_to_text", |spec| Ok(Arc::new(FileToTextNode::from_spec(spec)?)));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&NodeSpec) -> SyncResult<Arc<dyn TransformNode>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Register a single shared instance under `name`
    pub fn register_instance(&mut self, name: impl Into<String>, node: Arc<dyn TransformNode>) {
        self.register(name, move |_| Ok(node.clone()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    fn create(&self, spec: &NodeSpec) -> SyncResult<Arc<dyn TransformNode>> {
        let factory = self.factories.get(&spec.node).ok_or_else(|| {
            SyncError::Configuration(format!(
                "unknown transform node '{}' for type '{}'",
                spec.node, spec.accepts
            ))
        })?;
        factory(spec)
    }
}

// ============================================================================
// Resolved graph
// ============================================================================

/// A node instance together with its declared types
pub struct ResolvedNode {
    pub name: String,
    pub accepts: String,
    pub emits: HashSet<String>,
    node: Arc<dyn TransformNode>,
}

impl std::fmt::Debug for ResolvedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedNode")
            .field("name", &self.name)
            .field("accepts", &self.accepts)
            .field("emits", &self.emits)
            .finish()
    }
}

impl ResolvedNode {
    /// Apply the node and check every output against the declared types
    fn apply(&self, record: Record) -> SyncResult<Vec<Record>> {
        let outputs = self.node.apply(record)?;
        if let Some(stray) = outputs
            .iter()
            .find(|r| r.record_type != self.accepts && !self.emits.contains(&r.record_type))
        {
            return Err(SyncError::Validation(format!(
                "node '{}' emitted undeclared type '{}' (record {})",
                self.name, stray.record_type, stray.key
            )));
        }
        Ok(outputs)
    }
}

/// Immutable routing table for one job
#[derive(Debug, Default)]
pub struct TransformGraph {
    routes: HashMap<String, Vec<ResolvedNode>>,
}

impl TransformGraph {
    /// Graph with no nodes; every record is terminal
    pub fn empty() -> Self {
        Self::default()
    }

    /// Resolve, validate and cache the routing table
    pub fn build(config: &GraphConfig, registry: &NodeRegistry) -> SyncResult<Self> {
        let mut routes: HashMap<String, Vec<ResolvedNode>> = HashMap::new();

        for spec in &config.nodes {
            if spec.node.trim().is_empty() || spec.accepts.trim().is_empty() {
                return Err(SyncError::Configuration(
                    "node declarations need a name and an accepted type".to_string(),
                ));
            }
            let node = registry.create(spec)?;
            routes.entry(spec.accepts.clone()).or_default().push(ResolvedNode {
                name: spec.node.clone(),
                accepts: spec.accepts.clone(),
                emits: spec.emits.iter().cloned().collect(),
                node,
            });
        }

        if let Some(cycle) = detect_cycle(&config.nodes) {
            return Err(SyncError::Configuration(format!(
                "transform graph has a cycle: {}",
                cycle.join(" -> ")
            )));
        }

        tracing::debug!(
            types = routes.len(),
            nodes = config.nodes.len(),
            "Transform graph resolved"
        );
        Ok(Self { routes })
    }

    /// Ordered node chain for a record type
    pub fn route(&self, record_type: &str) -> &[ResolvedNode] {
        self.routes.get(record_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Record types with at least one node
    pub fn routed_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Run a record through the graph and return its terminal records
    ///
    /// An empty result means the graph dropped the record.
    pub fn execute(&self, record: Record) -> SyncResult<Vec<Record>> {
        let mut terminal = Vec::new();
        let mut pending: Vec<(Record, usize)> = vec![(record, 0)];

        while let Some((record, position)) = pending.pop() {
            let chain = self.route(&record.record_type);
            let Some(node) = chain.get(position) else {
                terminal.push(record);
                continue;
            };

            let outputs = node.apply(record)?;
            // Reversed so the stack yields outputs in emission order
            for output in outputs.into_iter().rev() {
                let next = if output.record_type == node.accepts {
                    position + 1
                } else {
                    0
                };
                pending.push((output, next));
            }
        }

        Ok(terminal)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

/// Find a cycle over `accepts -> emits` edges, ignoring same-type emission
fn detect_cycle(nodes: &[NodeSpec]) -> Option<Vec<String>> {
    let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for spec in nodes {
        let targets = adjacency.entry(spec.accepts.as_str()).or_default();
        for emitted in &spec.emits {
            if emitted != &spec.accepts {
                targets.push(emitted.as_str());
            }
        }
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    for start in adjacency.keys() {
        if marks.contains_key(start) {
            continue;
        }
        if let Some(cycle) = dfs_cycle(start, &adjacency, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn dfs_cycle<'a>(
    record_type: &'a str,
    adjacency: &BTreeMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(record_type, Mark::Visiting);
    stack.push(record_type);

    for &next in adjacency.get(record_type).map(Vec::as_slice).unwrap_or(&[]) {
        match marks.get(next) {
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|t| *t == next).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|t| t.to_string()).collect();
                cycle.push(next.to_string());
                return Some(cycle);
            },
            Some(Mark::Visited) => continue,
            None => {
                if let Some(cycle) = dfs_cycle(next, adjacency, marks, stack) {
                    return Some(cycle);
                }
            },
        }
    }

    stack.pop();
    marks.insert(record_type, Mark::Visited);
    None
}

// ============================================================================
// Built-in nodes
// ============================================================================

/// Emits its input unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughNode;

impl TransformNode for PassthroughNode {
    fn apply(&self, record: Record) -> SyncResult<Vec<Record>> {
        Ok(vec![record])
    }
}

/// Splits a text field into bounded chunks emitted as child records
///
/// Params: `field` (default `content`), `child_type` (default `chunk`),
/// `max_chars` (default 1000), `keep_parent` (default `true`).
#[derive(Debug, Clone)]
pub struct ChunkTextNode {
    pub field: String,
    pub child_type: String,
    pub max_chars: usize,
    pub keep_parent: bool,
}

impl ChunkTextNode {
    pub const DEFAULT_MAX_CHARS: usize = 1_000;

    pub fn from_spec(spec: &NodeSpec) -> SyncResult<Self> {
        let max_chars = match spec.params.get("max_chars") {
            None => Self::DEFAULT_MAX_CHARS,
            Some(v) => v
                .as_u64()
                .filter(|n| *n > 0)
                .map(|n| n as usize)
                .ok_or_else(|| {
                    SyncError::Configuration("chunk_text max_chars must be a positive integer".into())
                })?,
        };
        let child_type = spec.param_str("child_type").unwrap_or("chunk").to_string();
        if child_type == spec.accepts {
            return Err(SyncError::Configuration(
                "chunk_text child_type must differ from the accepted type".into(),
            ));
        }

        Ok(Self {
            field: spec.param_str("field").unwrap_or("content").to_string(),
            child_type,
            max_chars,
            keep_parent: spec
                .params
                .get("keep_parent")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
        })
    }

    /// Split on whitespace into pieces of at most `max_chars` characters
    pub fn split(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_len = 0;

        for word in text.split_whitespace() {
            let word_len = word.chars().count();

            if word_len > self.max_chars {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                let chars: Vec<char> = word.chars().collect();
                for piece in chars.chunks(self.max_chars) {
                    chunks.push(piece.iter().collect());
                }
                continue;
            }

            let needed = if current.is_empty() { word_len } else { word_len + 1 };
            if current_len + needed > self.max_chars {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if !current.is_empty() {
                current.push(' ');
                current_len += 1;
            }
            current.push_str(word);
            current_len += word_len;
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

impl TransformNode for ChunkTextNode {
    fn apply(&self, record: Record) -> SyncResult<Vec<Record>> {
        let text = record
            .payload
            .get(&self.field)
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let mut outputs: Vec<Record> = self
            .split(text)
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                record.child(
                    format!("{}#chunk-{index}", record.key),
                    self.child_type.clone(),
                    serde_json::json!({ "text": chunk, "chunk_index": index }),
                )
            })
            .collect();

        if self.keep_parent {
            outputs.insert(0, record);
        }
        Ok(outputs)
    }
}

/// Turns each element of an array field into a child record
///
/// Params: `field` (required), `child_type` (required), `id_field`
/// (default `id`). The array is removed from the parent payload.
#[derive(Debug, Clone)]
pub struct ExpandChildrenNode {
    pub field: String,
    pub child_type: String,
    pub id_field: String,
}

impl ExpandChildrenNode {
    pub fn from_spec(spec: &NodeSpec) -> SyncResult<Self> {
        let required = |name: &str| {
            spec.param_str(name).map(str::to_string).ok_or_else(|| {
                SyncError::Configuration(format!("expand_children requires the '{name}' param"))
            })
        };
        Ok(Self {
            field: required("field")?,
            child_type: required("child_type")?,
            id_field: spec.param_str("id_field").unwrap_or("id").to_string(),
        })
    }
}

impl TransformNode for ExpandChildrenNode {
    fn apply(&self, mut record: Record) -> SyncResult<Vec<Record>> {
        let items = match record.payload.as_object_mut().and_then(|p| p.remove(&self.field)) {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(serde_json::Value::Array(items)) => items,
            Some(_) => {
                return Err(SyncError::Validation(format!(
                    "record {} field '{}' is not an array",
                    record.key, self.field
                )))
            },
        };

        let mut outputs = Vec::with_capacity(items.len() + 1);
        for (index, item) in items.into_iter().enumerate() {
            let id = match item.get(&self.id_field) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => index.to_string(),
            };
            let key = format!("{}/{}/{id}", record.key, self.child_type);
            outputs.push(record.child(key, self.child_type.clone(), item));
        }
        outputs.insert(0, record);
        Ok(outputs)
    }
}
