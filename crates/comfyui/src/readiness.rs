//! Pure readiness checks over `/system_stats` and `/object_info` data.

use serde_json::Value;

use crate::catalog::CapabilityCatalog;
use crate::inject::LOADER_FIELDS;
use crate::workflow::WorkflowGraph;

/// Smallest GPU memory pool FLUX fill runs in.
pub const MIN_VRAM_GIB: f64 = 12.0;

/// Node classes the server itself must provide.
pub const REQUIRED_SERVER_NODES: &[&str] = &["KSampler", "LoadImage", "VAEDecode", "VAEEncode"];

const VRAM_KEYS: &[&str] = &["vram_total", "vram_total_bytes", "vramTotal", "total_vram"];

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Normalise a reported memory figure to GiB.
///
/// Servers report bytes, MiB or GiB depending on version, so the unit is
/// inferred from magnitude.
pub fn to_gib(raw: f64) -> f64 {
    if raw > GIB {
        raw / GIB
    } else if raw > 1024.0 * 16.0 {
        raw / 1024.0
    } else {
        raw
    }
}

/// Largest memory pool across reported devices, if any device reports one.
pub fn max_vram_gib(stats: &Value) -> Option<f64> {
    stats
        .get("devices")?
        .as_array()?
        .iter()
        .filter_map(|device| {
            VRAM_KEYS
                .iter()
                .find_map(|key| device.get(*key).and_then(number_like))
        })
        .map(to_gib)
        .reduce(f64::max)
}

fn number_like(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn check_vram(stats: &Value) -> Result<(), String> {
    match max_vram_gib(stats) {
        Some(gib) if gib < MIN_VRAM_GIB => Err(format!(
            "GPU VRAM too low for FLUX: {gib:.1}GB detected (need >= {MIN_VRAM_GIB:.0}GB)"
        )),
        _ => Ok(()),
    }
}

pub fn check_server_nodes(catalog: &CapabilityCatalog) -> Result<(), String> {
    let missing: Vec<&str> = REQUIRED_SERVER_NODES
        .iter()
        .copied()
        .filter(|c| !catalog.has_class(c))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("Required nodes missing: {}", missing.join(", ")))
    }
}

/// Every loader the template uses must have installed models; a UNET
/// loader additionally needs a fill model. Returns all problems found.
pub fn loader_issues(graph: &WorkflowGraph, catalog: &CapabilityCatalog) -> Vec<String> {
    let classes = graph.class_types();
    let mut issues = Vec::new();

    for field in LOADER_FIELDS {
        if !classes.contains(field.class_type) {
            continue;
        }
        let choices = catalog.choices(field.class_type, field.input);
        if choices.is_empty() {
            let mut message = field.missing.to_string();
            if field.class_type == "UNETLoader"
                && !catalog.choices("CheckpointLoaderSimple", "ckpt_name").is_empty()
            {
                message.push_str(
                    " Hint: models exist under CheckpointLoaderSimple (models/checkpoints) but FLUX UNET \
                     files must be in ComfyUI/models/unet to appear in UNETLoader.",
                );
            }
            issues.push(message);
            continue;
        }
        if field.class_type == "UNETLoader"
            && !choices.iter().any(|c| c.to_lowercase().contains("fill"))
        {
            let sample: Vec<&str> = choices.iter().take(10).map(String::as_str).collect();
            issues.push(format!(
                "FLUX Fill UNET not found in UNETLoader list. Install a FLUX Fill model \
                 (flux1-fill-*.safetensors) into models/unet and restart ComfyUI. Found UNETs: {}",
                sample.join(", ")
            ));
        }
    }
    issues
}
