//! Process-wide logging setup shared by the hopline binaries.

/// Tracing subscriber configuration (format, filters).
pub mod tracing;

pub use crate::tracing::{LogFormat, ObservabilityConfig};

/// Initialize logging from the environment (`RUST_LOG`, `LOG_FORMAT`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(ObservabilityConfig::from_env());
}
