//! Tracing subscriber setup
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the embedding process. [`init`] is a convenience for processes that do
//! not install their own.

use crate::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install a global fmt subscriber
///
/// `RUST_LOG` takes precedence over [`LoggingConfig::filter`]. Returns
/// `false` if a global subscriber was already set, in which case nothing
/// changes.
pub fn init(config: &LoggingConfig) -> bool {
    if tracing::dispatcher::has_been_set() {
        tracing::debug!("tracing subscriber already initialized, skipping");
        return false;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer().json().with_target(true).boxed()
    } else {
        tracing_subscriber::fmt::layer().compact().with_target(true).boxed()
    };

    // try_init: another thread may have won the race since the check above
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
}
