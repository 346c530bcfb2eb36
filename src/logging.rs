//! Tracing setup shared by every process entry point.

use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_FILTER: &str = "info";

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `filter`. Calling this more than once is
/// harmless; later calls keep the first subscriber.
pub fn init(filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(DEFAULT_FILTER)));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
