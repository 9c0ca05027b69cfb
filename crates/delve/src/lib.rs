//! Public facade crate for `delve`.
//!
//! This crate intentionally contains no IO or backend-specific logic.
//! It re-exports the backend-agnostic types/traits from `delve-core`.

pub use delve_core::*;
