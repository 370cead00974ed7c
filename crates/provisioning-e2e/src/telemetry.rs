//! Tracing setup for the runner binary and for tests.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "warn,provisioning_e2e=info";
pub const VERBOSE_FILTER: &str = "info,provisioning_e2e=debug,kube_runtime=debug";

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(json: bool, verbose: bool) {
    let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_current_span(true)).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

/// Route logs through the test harness' captured output; safe to call repeatedly
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("provisioning_e2e=debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}
