//! Typed ComfyUI API-format workflow graph.
//!
//! A graph maps node ids to `{class_type, inputs}`. Files exported with a
//! `{"prompt": {...}}` wrapper are unwrapped on load. Cloning a graph is
//! the deep copy taken before every submission.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use outpaint_core::error::OutpaintError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Node classes
// ---------------------------------------------------------------------------

pub const LOAD_IMAGE: &str = "LoadImage";
pub const PAD_FOR_OUTPAINT: &str = "ImagePadForOutpaint";
pub const KSAMPLER: &str = "KSampler";
pub const VAE_ENCODE: &str = "VAEEncode";
pub const VAE_DECODE: &str = "VAEDecode";
pub const SAVE_IMAGE: &str = "SaveImage";
pub const EMPTY_LATENT: &str = "EmptyLatentImage";

/// Minimum node contract a submitted graph must satisfy.
pub const REQUIRED_NODE_CLASSES: &[&str] = &[
    LOAD_IMAGE,
    PAD_FOR_OUTPAINT,
    KSAMPLER,
    VAE_ENCODE,
    VAE_DECODE,
    SAVE_IMAGE,
];

/// Classes that can carry the zoom-out rescale factor.
pub const SCALE_NODE_CLASSES: &[&str] = &["ImageScaleBy", "ImageScale", "ImageResize"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Cannot read workflow {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Workflow is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unsupported workflow format: {0}")]
    Format(String),

    #[error("Workflow missing required node(s): {}", .0.join(", "))]
    MissingNodes(Vec<String>),

    /// A loader node has no installed model to select.
    #[error("{0}")]
    MissingAsset(String),
}

impl From<WorkflowError> for OutpaintError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::MissingAsset(msg) => OutpaintError::BackendUnavailable(msg),
            other => OutpaintError::Validation(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub class_type: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Anything else on the node (`_meta`, ...) round-trips untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WorkflowNode {
    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    pub fn input_str(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).and_then(Value::as_str)
    }

    pub fn set_input(&mut self, name: &str, value: impl Into<Value>) {
        self.inputs.insert(name.to_string(), value.into());
    }

    /// Insert only when the input is absent.
    pub fn set_default_input(&mut self, name: &str, value: impl Into<Value>) {
        self.inputs
            .entry(name.to_string())
            .or_insert_with(|| value.into());
    }

    /// Resolve a `[node_id, output_index]` link to its node id.
    pub fn linked_node(&self, name: &str) -> Option<String> {
        match self.inputs.get(name)? {
            Value::Array(link) => match link.first()? {
                Value::String(id) => Some(id.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph {
    nodes: BTreeMap<String, WorkflowNode>,
}

impl WorkflowGraph {
    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let text = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, WorkflowError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Accepts a bare graph or one wrapped as `{"prompt": {...}}`.
    /// Entries that are not nodes are dropped.
    pub fn from_value(value: Value) -> Result<Self, WorkflowError> {
        let Value::Object(mut root) = value else {
            return Err(WorkflowError::Format("expected a JSON object".into()));
        };
        if matches!(root.get("prompt"), Some(Value::Object(_))) {
            if let Some(Value::Object(inner)) = root.remove("prompt") {
                root = inner;
            }
        }

        let mut nodes = BTreeMap::new();
        for (id, raw) in root {
            if !raw.get("class_type").is_some_and(Value::is_string) {
                continue;
            }
            let node: WorkflowNode = serde_json::from_value(raw)?;
            nodes.insert(id, node);
        }
        if nodes.is_empty() {
            return Err(WorkflowError::Format("no nodes with class_type found".into()));
        }
        Ok(Self { nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut WorkflowNode> {
        self.nodes.get_mut(id)
    }

    pub fn class_types(&self) -> BTreeSet<&str> {
        self.nodes.values().map(|n| n.class_type.as_str()).collect()
    }

    pub fn contains_class(&self, class_type: &str) -> bool {
        self.nodes.values().any(|n| n.class_type == class_type)
    }

    /// Node ids in numeric order where ids are numeric (`"2"` before `"10"`).
    pub fn ordered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.keys().cloned().collect();
        ids.sort_by(|a, b| compare_node_ids(a, b));
        ids
    }

    /// Id of the first node (in id order) whose class is in `classes`.
    pub fn find_first(&self, classes: &[&str]) -> Option<String> {
        self.ordered_ids().into_iter().find(|id| {
            self.nodes
                .get(id)
                .is_some_and(|n| classes.contains(&n.class_type.as_str()))
        })
    }

    pub fn missing_required(&self) -> Vec<String> {
        let present = self.class_types();
        REQUIRED_NODE_CLASSES
            .iter()
            .filter(|c| !present.contains(*c))
            .map(|c| c.to_string())
            .collect()
    }

    pub fn validate_required(&self) -> Result<(), WorkflowError> {
        let mut missing = self.missing_required();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        Err(WorkflowError::MissingNodes(missing))
    }
}

fn compare_node_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
