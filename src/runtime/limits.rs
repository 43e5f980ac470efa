// Linux resource limit management
// Raises RLIMIT_NOFILE toward what the admission ceilings need

use anyhow::Result;
use tracing::{info, warn};

#[cfg(unix)]
use libc::{getrlimit, rlimit, setrlimit, RLIMIT_NOFILE};

/// Raise the soft descriptor limit to `wanted`, capped by the hard limit
///
/// Returns the soft limit in force afterwards.
#[cfg(unix)]
pub fn raise_file_descriptor_limit(wanted: u64) -> Result<u64> {
    let mut limit = rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    // SAFETY: `limit` is a valid, writable rlimit for the duration of the call
    if unsafe { getrlimit(RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(anyhow::anyhow!(
            "Failed to get file descriptor limit: {}",
            std::io::Error::last_os_error()
        ));
    }

    let current = limit.rlim_cur as u64;
    let hard = limit.rlim_max as u64;
    if current >= wanted {
        return Ok(current);
    }

    let target = wanted.min(hard);
    limit.rlim_cur = target as libc::rlim_t;

    // SAFETY: `limit` is a valid rlimit with rlim_cur <= rlim_max
    if unsafe { setrlimit(RLIMIT_NOFILE, &limit) } == 0 {
        info!(
            previous = current,
            new_limit = target,
            hard_limit = hard,
            "Raised file descriptor limit"
        );
        Ok(target)
    } else {
        warn!(
            requested = target,
            error = %std::io::Error::last_os_error(),
            "Failed to raise file descriptor limit"
        );
        Ok(current)
    }
}

#[cfg(not(unix))]
pub fn raise_file_descriptor_limit(wanted: u64) -> Result<u64> {
    warn!("File descriptor limit configuration only supported on Unix systems");
    Ok(wanted)
}

/// Log CPU and descriptor limits for diagnostics
pub fn log_system_info() {
    info!(
        logical_cpus = num_cpus::get(),
        physical_cpus = num_cpus::get_physical(),
        "System CPU information"
    );

    #[cfg(unix)]
    {
        let mut limit = rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };

        // SAFETY: `limit` is a valid, writable rlimit for the duration of the call
        if unsafe { getrlimit(RLIMIT_NOFILE, &mut limit) } == 0 {
            info!(
                soft_limit = limit.rlim_cur as u64,
                hard_limit = limit.rlim_max as u64,
                "File descriptor limits"
            );
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_modest_request_is_granted() {
        let granted = raise_file_descriptor_limit(128).unwrap();
        assert!(granted >= 128);
    }
}
