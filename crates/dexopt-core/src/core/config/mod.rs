//! Environment-derived configuration for the store, the batch policy, and the pre-reboot job.

pub mod settings;

pub use settings::*;
