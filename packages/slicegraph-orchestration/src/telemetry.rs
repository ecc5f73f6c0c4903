//! Tracing subscriber setup
//!
//! The engines only emit `tracing` events; binaries and tests opt in to
//! output by calling `init_tracing`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "slicegraph_orchestration=info,slicegraph_storage=info";

/// Install a formatted subscriber honouring `RUST_LOG`
///
/// Returns false when a global subscriber is already set, so repeated
/// calls (one per test) are harmless.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
