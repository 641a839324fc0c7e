//! Capability catalog built from `/object_info`.
//!
//! Answers "which values may `(class, input)` take" for combo inputs.
//! Built fresh for every check or submission and never cached.

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CapabilityCatalog {
    info: Value,
}

impl CapabilityCatalog {
    pub fn new(info: Value) -> Self {
        Self { info }
    }

    pub fn has_class(&self, class_type: &str) -> bool {
        self.info.get(class_type).is_some()
    }

    /// Valid choices for a required combo input, empty when unknown.
    ///
    /// Supports both the classic `[[choices...], {...}]` spec and the
    /// newer `["COMBO", {"options": [...]}]` form.
    pub fn choices(&self, class_type: &str, input: &str) -> Vec<String> {
        let Some(spec) = self
            .info
            .get(class_type)
            .and_then(|n| n.get("input"))
            .and_then(|i| i.get("required"))
            .and_then(|r| r.get(input))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };

        let list = match spec.first() {
            Some(Value::Array(list)) => Some(list),
            Some(Value::String(kind)) if kind == "COMBO" => spec
                .get(1)
                .and_then(|opts| opts.get("options"))
                .and_then(Value::as_array),
            _ => None,
        };

        list.map(|items| items.iter().map(choice_to_string).collect())
            .unwrap_or_default()
    }
}

fn choice_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
