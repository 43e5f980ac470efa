// Observability infrastructure using tracing crate
// Structured logs to stdout, JSON for collectors or compact text for terminals

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter applied when RUST_LOG is unset
pub const DEFAULT_FILTER: &str = "txn_server=info";

/// Install the global subscriber
///
/// Example: RUST_LOG=txn_server=debug
pub fn init(json: bool) -> Result<()> {
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .context("Failed to create tracing filter")?;

    let registry = tracing_subscriber::registry().with(filter_layer);

    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_thread_ids(true),
            )
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        registry
            .with(fmt::layer().compact().with_target(false))
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        // Whichever call runs first wins the global slot
        let _ = init(false);
        assert!(init(true).is_err());
    }
}
