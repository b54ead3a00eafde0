//! Internal implementation modules for `dexopt-core`.
//!
//! Callers go through the re-exports at the crate root.

pub mod batch;
pub mod cancel;
pub mod config;
pub mod dex_use;
pub mod effects;
pub mod error;
pub mod pre_reboot;
pub(crate) mod tooling;
