//! Parameter injection into a deep-copied workflow graph.
//!
//! Every loader node also receives a validated model selection from the
//! capability catalog so a template written on one machine still runs on
//! another with differently named model files.

use outpaint_core::params::{zoom_scale, ExpandPixels};

use crate::catalog::CapabilityCatalog;
use crate::workflow::{
    WorkflowError, WorkflowGraph, EMPTY_LATENT, KSAMPLER, LOAD_IMAGE, PAD_FOR_OUTPAINT,
    SCALE_NODE_CLASSES,
};

/// Feathering applied when the template leaves it unset.
pub const DEFAULT_FEATHERING: u32 = 20;

// ---------------------------------------------------------------------------
// Pad aliases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
    Top,
    Bottom,
}

impl Side {
    fn amount(&self, expand: &ExpandPixels) -> u32 {
        match self {
            Self::Left => expand.left,
            Self::Right => expand.right,
            Self::Top => expand.top,
            Self::Bottom => expand.bottom,
        }
    }
}

/// Every input name a pad node may use for each side.
pub const PAD_ALIASES: [(Side, [&str; 3]); 4] = [
    (Side::Left, ["left", "expand_left", "pad_left"]),
    (Side::Right, ["right", "expand_right", "pad_right"]),
    (Side::Top, ["top", "expand_top", "pad_top"]),
    (Side::Bottom, ["bottom", "expand_bottom", "pad_bottom"]),
];

// ---------------------------------------------------------------------------
// Loader selection table
// ---------------------------------------------------------------------------

/// Predicate over a lowercased model name.
pub type Matcher = fn(&str) -> bool;

/// One `(class, input)` model selector and how to pick a replacement.
pub struct LoaderField {
    pub class_type: &'static str,
    pub input: &'static str,
    /// Preference tiers, tried in order. The first choice wins if none match.
    pub preferences: &'static [Matcher],
    /// Actionable message when no model is installed.
    pub missing: &'static str,
}

fn flux_fill(s: &str) -> bool {
    s.contains("flux") && s.contains("fill")
}
fn fill(s: &str) -> bool {
    s.contains("fill")
}
fn flux(s: &str) -> bool {
    s.contains("flux")
}
fn clip_l(s: &str) -> bool {
    s.contains("clip_l")
}
fn t5_fp8(s: &str) -> bool {
    s.contains("t5") && s.contains("fp8")
}
fn t5(s: &str) -> bool {
    s.contains("t5")
}
fn flux_vae(s: &str) -> bool {
    s != "pixel_space" && (s == "ae.safetensors" || s.starts_with("ae") || s.contains("flux"))
}
fn real_vae(s: &str) -> bool {
    s != "pixel_space"
}

pub const LOADER_FIELDS: &[LoaderField] = &[
    LoaderField {
        class_type: "UNETLoader",
        input: "unet_name",
        preferences: &[flux_fill, flux],
        missing: "Workflow uses UNETLoader but no UNET models are installed (UNETLoader.unet_name list is empty). \
                  Install a FLUX Fill UNET (e.g. flux1-fill-*.safetensors) into ComfyUI/models/unet and restart ComfyUI.",
    },
    LoaderField {
        class_type: "CheckpointLoaderSimple",
        input: "ckpt_name",
        preferences: &[fill, flux],
        missing: "Workflow uses CheckpointLoaderSimple but no checkpoints are available \
                  (CheckpointLoaderSimple.ckpt_name list is empty).",
    },
    LoaderField {
        class_type: "DualCLIPLoader",
        input: "clip_name1",
        preferences: &[clip_l],
        missing: "Workflow uses DualCLIPLoader but clip_name1 list is empty (install FLUX clip_l). \
                  Ensure clip_l.safetensors is in ComfyUI/models/clip, then restart ComfyUI.",
    },
    LoaderField {
        class_type: "DualCLIPLoader",
        input: "clip_name2",
        preferences: &[t5_fp8, t5],
        missing: "Workflow uses DualCLIPLoader but clip_name2 list is empty (install FLUX t5xxl). \
                  Ensure t5xxl*.safetensors is in ComfyUI/models/clip, then restart ComfyUI.",
    },
    LoaderField {
        class_type: "CLIPLoader",
        input: "clip_name",
        preferences: &[t5],
        missing: "Workflow uses CLIPLoader but no CLIP models are available (CLIPLoader.clip_name list is empty).",
    },
    LoaderField {
        class_type: "VAELoader",
        input: "vae_name",
        preferences: &[flux_vae, real_vae],
        missing: "Workflow uses VAELoader but no VAE models are available (VAELoader.vae_name list is empty). \
                  Install ae.safetensors into ComfyUI/models/vae and restart ComfyUI.",
    },
];

/// Inputs filled in when absent: `(class, input, preferred value)`.
const DEFAULTED_INPUTS: &[(&str, &str, &str)] = &[
    ("UNETLoader", "weight_dtype", "default"),
    ("DualCLIPLoader", "type", "flux"),
];

/// Keep `current` if still offered, else the first choice matching a
/// preference tier, else the first choice. `None` when `choices` is empty.
pub fn select_choice(current: Option<&str>, choices: &[String], preferences: &[Matcher]) -> Option<String> {
    if let Some(cur) = current {
        if choices.iter().any(|c| c == cur) {
            return Some(cur.to_string());
        }
    }
    preferences
        .iter()
        .find_map(|matches| choices.iter().find(|c| matches(&c.to_lowercase())))
        .or_else(|| choices.first())
        .cloned()
}

// ---------------------------------------------------------------------------
// Injection
// ---------------------------------------------------------------------------

/// Per-submission values written into the graph.
#[derive(Debug, Clone)]
pub struct Injection<'a> {
    pub image_name: &'a str,
    pub expand: ExpandPixels,
    pub zoom_out_percentage: u32,
    pub num_images: u32,
    pub prompt: &'a str,
}

/// Write `injection` into `graph`, then fix up loader selections when a
/// catalog is supplied.
pub fn inject(
    graph: &mut WorkflowGraph,
    injection: &Injection<'_>,
    catalog: Option<&CapabilityCatalog>,
) -> Result<(), WorkflowError> {
    if let Some(id) = graph.find_first(&[LOAD_IMAGE]) {
        if let Some(node) = graph.node_mut(&id) {
            node.set_input("image", injection.image_name);
        }
    }

    if let Some(id) = graph.find_first(&[PAD_FOR_OUTPAINT]) {
        if let Some(node) = graph.node_mut(&id) {
            for (side, names) in PAD_ALIASES {
                let amount = side.amount(&injection.expand);
                for name in names {
                    node.set_input(name, amount);
                }
            }
            node.set_default_input("feathering", DEFAULT_FEATHERING);
        }
    }

    inject_sampler(graph, injection);

    if injection.zoom_out_percentage > 0 {
        let scale = zoom_scale(injection.zoom_out_percentage);
        if let Some(id) = graph.find_first(SCALE_NODE_CLASSES) {
            if let Some(node) = graph.node_mut(&id) {
                if node.has_input("scale_by") {
                    node.set_input("scale_by", scale);
                } else if node.has_input("scale") {
                    node.set_input("scale", scale);
                }
            }
        }
    }

    if let Some(catalog) = catalog {
        apply_loader_selections(graph, catalog)?;
    }
    Ok(())
}

fn inject_sampler(graph: &mut WorkflowGraph, injection: &Injection<'_>) {
    let Some(sampler_id) = graph.find_first(&[KSAMPLER]) else {
        return;
    };

    // Prompt goes to whichever node the sampler's positive input links to.
    let positive = graph
        .node(&sampler_id)
        .and_then(|n| n.linked_node("positive"));
    if let Some(pos_id) = positive {
        if let Some(node) = graph.node_mut(&pos_id) {
            if node.has_input("text") {
                node.set_input("text", injection.prompt);
            }
        }
    }

    let mut batch_on_sampler = false;
    if let Some(node) = graph.node_mut(&sampler_id) {
        if node.has_input("batch_size") {
            node.set_input("batch_size", injection.num_images);
            batch_on_sampler = true;
        }
        node.set_default_input("denoise", 1.0);
    }

    if !batch_on_sampler {
        if let Some(latent_id) = graph.find_first(&[EMPTY_LATENT]) {
            if let Some(node) = graph.node_mut(&latent_id) {
                if node.has_input("batch_size") {
                    node.set_input("batch_size", injection.num_images);
                }
            }
        }
    }
}

fn apply_loader_selections(
    graph: &mut WorkflowGraph,
    catalog: &CapabilityCatalog,
) -> Result<(), WorkflowError> {
    for id in graph.ordered_ids() {
        let Some(node) = graph.node_mut(&id) else {
            continue;
        };

        for &(class_type, input, preferred) in DEFAULTED_INPUTS {
            if node.class_type == class_type && !node.has_input(input) {
                let options = catalog.choices(class_type, input);
                let value = if options.iter().any(|o| o == preferred) || options.is_empty() {
                    preferred.to_string()
                } else {
                    options[0].clone()
                };
                node.set_input(input, value);
            }
        }

        let node_class_type = node.class_type.clone();
        for field in LOADER_FIELDS.iter().filter(|f| f.class_type == node_class_type) {
            let choices = catalog.choices(field.class_type, field.input);
            let selected = select_choice(node.input_str(field.input), &choices, field.preferences)
                .ok_or_else(|| WorkflowError::MissingAsset(field.missing.to_string()))?;
            if node.input_str(field.input) != Some(selected.as_str()) {
                tracing::debug!(
                    node_id = %id,
                    class_type = field.class_type,
                    input = field.input,
                    selected = %selected,
                    "Replacing unavailable model selection",
                );
            }
            node.set_input(field.input, selected);
        }
    }
    Ok(())
}
