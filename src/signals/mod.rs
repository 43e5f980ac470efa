// Unix signal handling for graceful shutdown
// Captures SIGTERM and SIGINT so the engine can drain before exit

use anyhow::Result;
use futures::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tracing::{debug, info};

/// Future that resolves on the first SIGTERM or SIGINT
pub fn create_shutdown_listener() -> Result<impl std::future::Future<Output = ()>> {
    let signals = Signals::new([SIGTERM, SIGINT])?;

    Ok(async move {
        let mut signals = signals;

        while let Some(signal) = signals.next().await {
            match signal {
                SIGTERM => {
                    info!("Received SIGTERM - draining engine");
                    break;
                }
                SIGINT => {
                    info!("Received SIGINT (Ctrl+C) - draining engine");
                    break;
                }
                _ => debug!(signal = signal, "Ignoring unexpected signal"),
            }
        }
    })
}
