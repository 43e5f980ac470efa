// Provider call state
// One outbound call linked back to the client that spawned it

use super::ClientConnectionState;
use crate::handler::{Outcome, Protocol, ResponseCode};
use crate::pool::Reinitialize;
use parking_lot::{Mutex, MutexGuard};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Provider session, outcome and the back-reference to the client
pub struct ProviderCall<P: Protocol> {
    pub session: P::Provider,
    pub outcome: Outcome,
    client: Option<Arc<ClientConnectionState<P>>>,
    endpoint: Option<SocketAddr>,
}

impl<P: Protocol> ProviderCall<P> {
    pub fn client(&self) -> Option<&Arc<ClientConnectionState<P>>> {
        self.client.as_ref()
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }
}

/// Mutable record for one outbound provider call
pub struct ProviderConnectionState<P: Protocol> {
    call_id: Mutex<Uuid>,
    call: Mutex<ProviderCall<P>>,

    /// Set by the timeout supervisor once it has given up on the call
    timed_out: AtomicBool,

    /// Supervisor task; disposed exactly once
    timer: Mutex<Option<JoinHandle<()>>>,

    /// Cancels in-flight provider I/O
    cancel: Mutex<CancellationToken>,
}

impl<P: Protocol> ProviderConnectionState<P> {
    pub fn new() -> Self {
        Self {
            call_id: Mutex::new(Uuid::new_v4()),
            call: Mutex::new(ProviderCall {
                session: P::Provider::default(),
                outcome: Outcome::default(),
                client: None,
                endpoint: None,
            }),
            timed_out: AtomicBool::new(false),
            timer: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn call_id(&self) -> Uuid {
        *self.call_id.lock()
    }

    /// Link to the originating client
    pub fn link_client(&self, client: Arc<ClientConnectionState<P>>) {
        self.call.lock().client = Some(client);
    }

    pub fn client(&self) -> Option<Arc<ClientConnectionState<P>>> {
        self.call.lock().client.clone()
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.call.lock().endpoint
    }

    pub(crate) fn set_endpoint(&self, endpoint: SocketAddr) {
        self.call.lock().endpoint = Some(endpoint);
    }

    /// Flag the call as timed out; `false` if it already was
    pub fn mark_timed_out(&self) -> bool {
        self.timed_out
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear_timed_out(&self) -> bool {
        self.timed_out
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Run `f` against the provider session and outcome
    pub fn with_session<R>(&self, f: impl FnOnce(&mut P::Provider, &mut Outcome) -> R) -> R {
        let mut call = self.call.lock();
        let ProviderCall { session, outcome, .. } = &mut *call;
        f(session, outcome)
    }

    /// Bounded-wait access to the whole call record
    pub fn try_lock_call(&self, timeout: Duration) -> Option<MutexGuard<'_, ProviderCall<P>>> {
        self.call.try_lock_for(timeout)
    }

    pub fn outcome(&self) -> Outcome {
        self.call.lock().outcome.clone()
    }

    pub fn response_code(&self) -> ResponseCode {
        self.call.lock().outcome.response_code
    }

    pub fn set_response_code(&self, code: ResponseCode) {
        self.call.lock().outcome.response_code = code;
    }

    pub(crate) fn arm_timer(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop and drop the supervisor; `true` only for the call that disposed it
    pub(crate) fn dispose_timer(&self) -> bool {
        match self.timer.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Abort any provider I/O in flight for this call
    pub(crate) fn request_close(&self) {
        self.cancel.lock().cancel();
    }
}

impl<P: Protocol> Default for ProviderConnectionState<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Protocol> Reinitialize for ProviderConnectionState<P> {
    fn reinitialize(&self) {
        self.dispose_timer();
        *self.call_id.lock() = Uuid::new_v4();
        self.timed_out.store(false, Ordering::Release);
        *self.cancel.lock() = CancellationToken::new();

        let mut call = self.call.lock();
        call.session = P::Provider::default();
        call.outcome = Outcome::default();
        call.client = None;
        call.endpoint = None;
    }
}
