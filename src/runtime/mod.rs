// Process runtime environment
// Descriptor limits and worker sizing checked before the engine allocates anything

pub mod limits;

use crate::config::EngineConfig;
use anyhow::Result;
use tracing::info;

/// Descriptors kept free for the listener, log sinks and the runtime itself
pub const FD_HEADROOM: u64 = 64;

/// Default environment check run by `ServerEngine::pre_initialize`
///
/// Every admitted client and every in-flight provider call holds one socket,
/// so the soft descriptor limit must cover both admission ceilings.
pub fn verify_environment(config: &EngineConfig) -> Result<()> {
    let required = config
        .limits
        .socket_demand()
        .and_then(|sockets| u64::try_from(sockets).ok())
        .and_then(|sockets| sockets.checked_add(FD_HEADROOM))
        .ok_or_else(|| anyhow::anyhow!("descriptor demand for the configured limits overflows"))?;

    let granted = limits::raise_file_descriptor_limit(required)?;
    if granted < required {
        anyhow::bail!(
            "file descriptor limit {} is below the {} needed for {} clients and {} provider calls",
            granted,
            required,
            config.limits.max_connections,
            config.limits.max_provider_calls
        );
    }

    info!(granted = granted, required = required, "File descriptor limit verified");
    Ok(())
}

/// Worker threads for the Tokio runtime
pub fn worker_thread_count() -> usize {
    num_cpus::get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_limits_pass() {
        let mut config = EngineConfig::default();
        config.limits.max_connections = 8;
        config.limits.max_provider_calls = 8;
        assert!(verify_environment(&config).is_ok());
    }

    #[test]
    fn test_impossible_limits_fail() {
        let mut config = EngineConfig::default();
        config.limits.max_connections = usize::MAX / 4;
        config.limits.max_provider_calls = usize::MAX / 4;
        let err = verify_environment(&config).unwrap_err();
        assert!(err.to_string().contains("file descriptor limit"));
    }

    #[test]
    fn test_overflowing_limits_fail() {
        let mut config = EngineConfig::default();
        config.limits.max_connections = usize::MAX;
        config.limits.max_provider_calls = 1;
        let err = verify_environment(&config).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_worker_threads_positive() {
        assert!(worker_thread_count() >= 1);
    }
}
