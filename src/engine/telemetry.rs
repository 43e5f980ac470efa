// Engine telemetry
// Read-only counters exposed to the host

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte counter wraps back to zero here instead of overflowing
pub const TRAFFIC_WRAP_THRESHOLD: u64 = 1_000_000_000_000_000;

/// Cumulative bytes moved through client and provider sockets
#[derive(Debug, Default)]
pub struct TrafficCounter {
    bytes: AtomicU64,
}

impl TrafficCounter {
    pub fn record(&self, bytes: usize) {
        let _ = self
            .bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((current + bytes as u64) % TRAFFIC_WRAP_THRESHOLD)
            });
    }

    pub fn total(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Point-in-time engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub connected_clients: usize,
    pub available_client_slots: usize,
    pub available_provider_slots: usize,
    pub pooled_client_states: usize,
    pub pooled_provider_states: usize,
    pub free_buffer_slices: usize,
    pub bytes_transferred: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accumulates() {
        let counter = TrafficCounter::default();
        counter.record(10);
        counter.record(32);
        assert_eq!(counter.total(), 42);
    }

    #[test]
    fn test_counter_wraps_at_threshold() {
        let counter = TrafficCounter::default();
        counter.bytes.store(TRAFFIC_WRAP_THRESHOLD - 5, Ordering::Relaxed);
        counter.record(8);
        assert_eq!(counter.total(), 3);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = EngineStats {
            running: true,
            connected_clients: 2,
            available_client_slots: 6,
            available_provider_slots: 4,
            pooled_client_states: 6,
            pooled_provider_states: 4,
            free_buffer_slices: 14,
            bytes_transferred: 512,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["connected_clients"], 2);
        assert_eq!(json["bytes_transferred"], 512);
    }
}
