// Provider endpoint selection
// Round-robin over the configured provider ports

use crate::error::{EngineError, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Rotating set of provider endpoints sharing one IP
#[derive(Debug)]
pub struct ProviderEndpoints {
    ip: IpAddr,
    ports: Vec<u16>,
    counter: AtomicUsize,
}

impl ProviderEndpoints {
    /// Validate the provider IP and port list
    pub fn new(ip: Option<&str>, ports: &[u16]) -> Result<Self> {
        let ip = ip
            .ok_or_else(|| EngineError::Configuration("router mode requires a provider IP".into()))?;
        let ip: IpAddr = ip.parse().map_err(|_| {
            EngineError::Configuration(format!("provider IP '{ip}' is not a valid address"))
        })?;

        if ports.is_empty() {
            return Err(EngineError::Configuration(
                "router mode requires at least one provider port".into(),
            ));
        }

        Ok(Self {
            ip,
            ports: ports.to_vec(),
            counter: AtomicUsize::new(0),
        })
    }

    /// Next endpoint in rotation
    pub fn next(&self) -> SocketAddr {
        let len = self.ports.len();
        let index = self
            .counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| Some((i + 1) % len))
            .unwrap_or(0);

        let endpoint = SocketAddr::new(self.ip, self.ports[index]);
        debug!(index = index, endpoint = %endpoint, "Round-robin provider selection");
        endpoint
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_wraps() {
        let endpoints = ProviderEndpoints::new(Some("10.1.2.3"), &[7001, 7002, 7003]).unwrap();
        let ports: Vec<u16> = (0..7).map(|_| endpoints.next().port()).collect();
        assert_eq!(ports, vec![7001, 7002, 7003, 7001, 7002, 7003, 7001]);
        assert_eq!(endpoints.next().ip().to_string(), "10.1.2.3");
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(
            ProviderEndpoints::new(None, &[7001]),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(
            ProviderEndpoints::new(Some("provider.local"), &[7001]),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(
            ProviderEndpoints::new(Some("::1"), &[]),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_concurrent_selection_is_balanced() {
        let endpoints = std::sync::Arc::new(ProviderEndpoints::new(Some("127.0.0.1"), &[1, 2]).unwrap());
        let counts = std::sync::Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let endpoints = endpoints.clone();
                let counts = counts.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let port = endpoints.next().port();
                        counts[(port - 1) as usize].fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counts[0].load(Ordering::Relaxed), 2000);
        assert_eq!(counts[1].load(Ordering::Relaxed), 2000);
    }
}
