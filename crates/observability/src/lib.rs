//! Shared logging setup for pharmaflow processes.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use tracing::{init, init_for_tests};
