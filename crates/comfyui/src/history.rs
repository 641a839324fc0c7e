//! Parsing of `/history/{prompt_id}` entries.
//!
//! ComfyUI reports status messages either as `[kind, payload]` pairs or as
//! tagged objects depending on version; both shapes are accepted.

use serde::Deserialize;
use serde_json::Value;

use crate::workflow::WorkflowGraph;

/// Reference to one produced image, fetched via `/view`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Payload of an `execution_error` style message. Every field is optional
/// because older servers use different key names, sometimes several at once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorData {
    pub node_id: Option<Value>,
    pub exception_message: Option<String>,
    pub exception_type: Option<String>,
}

impl ErrorData {
    /// Read the first non-null key of each group. Unknown shapes give an
    /// empty payload.
    pub fn from_payload(payload: &Value) -> Self {
        let first = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| payload.get(*k).filter(|v| !v.is_null()))
                .cloned()
        };
        let first_str = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| payload.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };
        Self {
            node_id: first(&["node_id", "node", "nodeId"]),
            exception_message: first_str(&["exception_message", "message", "details"]),
            exception_type: first_str(&["exception_type", "exception", "error"]),
        }
    }
}

/// One prompt's history record.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    raw: Value,
}

impl HistoryEntry {
    /// Pick the entry for `prompt_id` out of a `/history` response body.
    /// `None` while the prompt has not started.
    pub fn from_response(body: &Value, prompt_id: &str) -> Option<Self> {
        body.get(prompt_id).map(|raw| Self { raw: raw.clone() })
    }

    fn status_str(&self) -> String {
        self.raw
            .get("status")
            .and_then(|s| s.get("status_str"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase()
    }

    fn messages(&self) -> Vec<Value> {
        let from_status = self
            .raw
            .get("status")
            .and_then(|s| s.get("messages"))
            .and_then(Value::as_array);
        let top_level = self.raw.get("messages").and_then(Value::as_array);
        from_status.or(top_level).cloned().unwrap_or_default()
    }

    /// Best-effort execution error message, naming the failing node's
    /// class when the graph knows it.
    pub fn execution_error(&self, graph: &WorkflowGraph) -> Option<String> {
        let messages = self.messages();
        if self.status_str() == "error" && messages.is_empty() {
            return Some(
                "ComfyUI execution failed (status=error). Check the ComfyUI console/log for details."
                    .to_string(),
            );
        }

        for message in &messages {
            let (kind, payload) = match message {
                Value::Array(pair) if pair.len() == 2 => (
                    pair[0].as_str().unwrap_or_default().to_string(),
                    pair[1].clone(),
                ),
                Value::Object(obj) => (
                    obj.get("type")
                        .or_else(|| obj.get("message_type"))
                        .and_then(Value::as_str)
                        .unwrap_or("message")
                        .to_string(),
                    message.clone(),
                ),
                _ => continue,
            };

            if !is_error_kind(&kind) {
                continue;
            }

            return Some(describe_error(&ErrorData::from_payload(&payload), graph));
        }
        None
    }

    /// Images listed across every output node.
    pub fn images(&self) -> Vec<ImageRef> {
        let Some(outputs) = self.raw.get("outputs").and_then(Value::as_object) else {
            return Vec::new();
        };
        outputs
            .values()
            .filter_map(|out| out.get("images").and_then(Value::as_array))
            .flatten()
            .filter_map(|im| serde_json::from_value::<ImageRef>(im.clone()).ok())
            .filter(|im| !im.filename.is_empty())
            .collect()
    }
}

fn is_error_kind(kind: &str) -> bool {
    kind.to_ascii_lowercase().contains("error") || kind == "execution_interrupted"
}

fn describe_error(data: &ErrorData, graph: &WorkflowGraph) -> String {
    let node_id = data.node_id.as_ref().map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    let node_desc = match node_id {
        Some(id) => match graph.node(&id) {
            Some(node) => format!(" (node {id}: {})", node.class_type),
            None => format!(" (node {id})"),
        },
        None => String::new(),
    };

    let mut parts = vec![format!("ComfyUI execution error{node_desc}")];
    parts.extend(data.exception_type.iter().cloned());
    parts.extend(data.exception_message.iter().cloned());
    parts.join(": ")
}
