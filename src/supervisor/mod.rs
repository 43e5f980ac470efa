// Provider call supervisor
// Periodic check that gives up on a provider call once its client's budget is spent

use crate::handler::{Protocol, ResponseCode};
use crate::state::{ClientConnectionState, ProviderConnectionState};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Period between checks of one provider call
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Bounded wait for the provider call lock; a miss is retried next tick
pub const STATE_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Result of one supervisor tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Still within budget, or the lock was busy
    Pending,
    /// The client already has its response; nothing left to supervise
    Done,
    /// Budget spent; the call was flagged and must be closed
    Expired,
}

/// Start supervising one provider call
///
/// The returned handle is stored on the provider state and aborted when the
/// call completes, so a call that finishes early never sees a tick.
pub(crate) fn spawn<P: Protocol>(
    provider: Arc<ProviderConnectionState<P>>,
    client: Arc<ClientConnectionState<P>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match inspect(&provider, &client) {
                Verdict::Pending => continue,
                Verdict::Done => {
                    debug!(call_id = %provider.call_id(), "Provider call settled");
                    break;
                }
                Verdict::Expired => {
                    provider.request_close();
                    break;
                }
            }
        }
    })
}

/// Check one call against its client's budget
pub(crate) fn inspect<P: Protocol>(
    provider: &ProviderConnectionState<P>,
    client: &ClientConnectionState<P>,
) -> Verdict {
    let Some(mut call) = provider.try_lock_call(STATE_LOCK_TIMEOUT) else {
        debug!(call_id = %provider.call_id(), "Provider state busy, retrying next tick");
        return Verdict::Pending;
    };

    if client.is_response_in_flight() {
        return Verdict::Done;
    }

    match client.elapsed_since_activity() {
        Some(elapsed) if elapsed > client.timeout_budget() => {
            call.outcome.response_code = ResponseCode::NoResponseProvider;
            client.set_response_code(ResponseCode::NoResponseProvider);
            provider.mark_timed_out();

            warn!(
                call_id = %provider.call_id(),
                client_id = %client.id(),
                endpoint = ?call.endpoint(),
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = client.timeout_budget().as_millis() as u64,
                "Provider call timed out"
            );
            Verdict::Expired
        }
        _ => Verdict::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::echo::EchoProtocol;

    fn pair(budget: Duration) -> (
        Arc<ProviderConnectionState<EchoProtocol>>,
        Arc<ClientConnectionState<EchoProtocol>>,
    ) {
        let provider = Arc::new(ProviderConnectionState::new());
        let client = Arc::new(ClientConnectionState::new(budget));
        provider.link_client(client.clone());
        (provider, client)
    }

    #[test]
    fn test_within_budget_is_pending() {
        let (provider, client) = pair(Duration::from_secs(30));
        client.touch();
        assert_eq!(inspect(&provider, &client), Verdict::Pending);
        assert!(!provider.is_timed_out());
    }

    #[test]
    fn test_response_in_flight_ends_supervision() {
        let (provider, client) = pair(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        client.mark_response_in_flight();
        assert_eq!(inspect(&provider, &client), Verdict::Done);
        assert_eq!(client.response_code(), ResponseCode::Success);
    }

    #[test]
    fn test_expired_budget_flags_both_sides() {
        let (provider, client) = pair(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(inspect(&provider, &client), Verdict::Expired);
        assert!(provider.is_timed_out());
        assert_eq!(provider.response_code(), ResponseCode::NoResponseProvider);
        assert_eq!(client.response_code(), ResponseCode::NoResponseProvider);
    }

    #[test]
    fn test_busy_lock_is_retried() {
        let (provider, client) = pair(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));

        let _held = provider.try_lock_call(Duration::ZERO).unwrap();
        let verdict = std::thread::scope(|s| s.spawn(|| inspect(&provider, &client)).join().unwrap());
        assert_eq!(verdict, Verdict::Pending);
        assert!(!provider.is_timed_out());
    }

    #[tokio::test]
    async fn test_spawned_supervisor_cancels_call() {
        let (provider, client) = pair(Duration::from_millis(100));
        client.touch();
        let token = provider.cancel_token();

        let handle = spawn(provider.clone(), client.clone());
        tokio::time::timeout(TICK_INTERVAL * 3, token.cancelled())
            .await
            .expect("supervisor should cancel the call");

        assert!(provider.is_timed_out());
        tokio_test::assert_ok!(handle.await);
    }
}
