//! Diagnostic codes and timing instrumentation.

pub(crate) mod diagnostics;
pub(crate) mod timings;
