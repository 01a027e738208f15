pub mod backoff;
pub mod config;
pub mod hub;
pub mod link;
pub mod mavlink;
pub mod metrics;
pub mod proxy;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod tcp;
pub mod telemetry;
pub mod uplink;
pub mod ws;

/// Initialize tracing from the configured level; `RUST_LOG` overrides.
pub fn init_tracing(log_level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_filter = std::env::var("RUST_LOG")
        .ok()
        .unwrap_or_else(|| log_level.to_string());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
