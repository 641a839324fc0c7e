//! Domain types and pure logic shared by every outpaint crate.
//!
//! Holds the generation parameters, configuration, job records, error
//! taxonomy, output naming rules and the [`backend::BackendAdapter`]
//! contract.  Network code lives in the adapter crates; this crate has
//! no HTTP dependencies.

pub mod backend;
pub mod cancel;
pub mod config;
pub mod error;
pub mod imaging;
pub mod job;
pub mod naming;
pub mod params;
pub mod sink;
pub mod types;
pub mod validation;
