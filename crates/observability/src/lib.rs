//! Process-wide tracing setup for engine hosts and tests.

pub mod tracing;

pub use self::tracing::{LogFormat, LogSettings};

/// Initialize tracing from `RUST_LOG` / `EVENTLANE_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init(&LogSettings::from_env());
}

/// Compact, test-writer logging for `#[test]` functions.
pub fn init_for_tests() {
    self::tracing::init(&LogSettings::default().with_format(LogFormat::Compact).for_tests());
}
