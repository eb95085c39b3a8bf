//! Fixtures shared by the integration tests.
#![allow(dead_code)]

pub mod h2_frames;
pub mod mock_server;
pub mod scripted;

use tracing_subscriber::EnvFilter;

/// Route `tracing` output to the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
