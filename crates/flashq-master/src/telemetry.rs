use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default directive when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Install the master's log pipeline.
///
/// `RUST_LOG` wins over `default_filter`. Records emitted through the `log`
/// facade are forwarded to `tracing`, and rebalance shard threads are labelled
/// by thread name so interleaved shard output stays readable.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_with_filter(default_filter: &str) {
    let _ = LogTracer::init();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

pub fn init() {
    init_with_filter(DEFAULT_FILTER);
}
