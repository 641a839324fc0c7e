//! ComfyUI node-graph backend.
//!
//! Provides the REST client, a typed workflow graph, the capability
//! catalog read from `/object_info`, parameter injection, history
//! parsing and the [`adapter::NodeGraphAdapter`] that ties them together.

pub mod adapter;
pub mod api;
pub mod catalog;
pub mod history;
pub mod inject;
pub mod readiness;
pub mod workflow;
