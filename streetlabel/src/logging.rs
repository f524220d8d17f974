use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
/// `RUST_LOG` wins over the default filter; `verbose` lowers the default to debug.
pub fn init_tracing(verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        "streetlabel=debug"
    } else {
        "streetlabel=info"
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("Failed to initialize tracing subscriber")
}
