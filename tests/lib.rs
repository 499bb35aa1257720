//! Shared test infrastructure for the OpenVASP integration suite.

use std::sync::Once;

pub mod fixtures;

static TRACING: Once = Once::new();

/// Install a fmt subscriber honoring `RUST_LOG` (once per process)
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
