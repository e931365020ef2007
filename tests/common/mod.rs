//! Shared helpers for integration tests.

use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Initialize trace-level test logging. Safe to call from every test;
/// only the first call installs the subscriber.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}
