//! Shared building blocks for the Haven hosting runtime.
//!
//! This crate carries the pieces every other crate leans on:
//!
//! - **Errors**: the [`HttpError`] sum type middleware returns, and its
//!   canonical JSON envelope
//! - **Scribe**: the process-wide log verbosity mask
//! - **Registry**: concurrent counters for statistics, analytics and
//!   blacklists
//! - **Merge**: the deep-merge rule used by store updates and config overlays

pub mod error;
pub mod merge;
pub mod registry;
pub mod scribe;

pub use error::HttpError;
pub use merge::{deep_merge, merge_layers};
pub use registry::{Registry, REGISTRY};
pub use scribe::{init_tracing, Scribe, SCRIBE};
