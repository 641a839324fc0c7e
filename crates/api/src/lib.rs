//! HTTP surface for single-image outpainting.
//!
//! Exposes modules so integration tests can build the same router the
//! binary serves.

pub mod config;
pub mod error;
pub mod router;
pub mod routes;
pub mod state;
