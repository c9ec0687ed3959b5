//! Observability infrastructure: tracing and metrics.
//!
//! The crate only emits through the `tracing` and `metrics` facades. Hosts that
//! embed the model install their own subscriber and recorder; `init()` is a
//! convenience for standalone use and tests.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize a global tracing subscriber.
///
/// `default_level` is used when `RUST_LOG` is not set (e.g. `"info"` from
/// [`EduConfig::log_level`](crate::config::EduConfig)). Fails instead of
/// panicking when a subscriber is already installed.
pub fn init(default_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()?;

    metrics::register_core_metrics();
    tracing::info!("Observability initialized");

    Ok(())
}
