// Connection state records
// Pooled per-client and per-provider-call state shared between tasks

pub mod provider;

pub use provider::ProviderConnectionState;

use crate::handler::{Outcome, Protocol, ResponseCode};
use crate::pool::Reinitialize;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// Bounded wait for the last-activity timestamp lock
pub const ACTIVITY_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Handler session plus the codes the engine reads back
struct ClientTransaction<S> {
    session: S,
    outcome: Outcome,
}

/// Mutable record for one connected client
///
/// Instances are created once per pool slot and reinitialized on every
/// checkout. The identity changes with each checkout, so a stale handle to a
/// recycled instance can be told apart from the current connection.
pub struct ClientConnectionState<P: Protocol> {
    /// Identity of the current checkout
    id: RwLock<Uuid>,

    /// Remote address of the accepted socket
    peer: RwLock<Option<SocketAddr>>,

    /// Set while a response for the current receive cycle is being sent
    response_in_flight: AtomicBool,

    /// When the last frame arrived
    last_activity: Mutex<Instant>,

    /// Budget for a full request/response cycle
    timeout_budget: Duration,

    /// Fires when the connection must be torn down
    shutdown: Mutex<CancellationToken>,

    transaction: Mutex<ClientTransaction<P::Client>>,
}

impl<P: Protocol> ClientConnectionState<P> {
    pub fn new(timeout_budget: Duration) -> Self {
        Self {
            id: RwLock::new(Uuid::new_v4()),
            peer: RwLock::new(None),
            response_in_flight: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            timeout_budget,
            shutdown: Mutex::new(CancellationToken::new()),
            transaction: Mutex::new(ClientTransaction {
                session: P::Client::default(),
                outcome: Outcome::default(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        *self.id.read()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.read()
    }

    pub(crate) fn set_peer_addr(&self, peer: SocketAddr) {
        *self.peer.write() = Some(peer);
    }

    pub fn timeout_budget(&self) -> Duration {
        self.timeout_budget
    }

    /// Claim the response slot; `false` if a response is already in flight
    pub fn mark_response_in_flight(&self) -> bool {
        self.response_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Open the response slot for the next receive cycle
    pub fn clear_response_in_flight(&self) -> bool {
        self.response_in_flight
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_response_in_flight(&self) -> bool {
        self.response_in_flight.load(Ordering::Acquire)
    }

    /// Record activity now; best-effort under a bounded lock
    pub fn touch(&self) -> bool {
        match self.last_activity.try_lock_for(ACTIVITY_LOCK_TIMEOUT) {
            Some(mut last) => {
                *last = Instant::now();
                true
            }
            None => {
                warn!(client_id = %self.id(), "Timed out updating last-activity timestamp");
                false
            }
        }
    }

    /// Time since the last frame, if the timestamp lock could be taken
    pub fn elapsed_since_activity(&self) -> Option<Duration> {
        self.last_activity
            .try_lock_for(ACTIVITY_LOCK_TIMEOUT)
            .map(|last| last.elapsed())
    }

    /// Whether the current cycle has outlived the timeout budget
    pub fn budget_exceeded(&self) -> bool {
        self.elapsed_since_activity()
            .map(|elapsed| elapsed > self.timeout_budget)
            .unwrap_or(false)
    }

    /// Run `f` against the handler session and outcome
    pub fn with_session<R>(&self, f: impl FnOnce(&mut P::Client, &mut Outcome) -> R) -> R {
        let mut txn = self.transaction.lock();
        let ClientTransaction { session, outcome } = &mut *txn;
        f(session, outcome)
    }

    pub fn outcome(&self) -> Outcome {
        self.transaction.lock().outcome.clone()
    }

    pub fn response_code(&self) -> ResponseCode {
        self.transaction.lock().outcome.response_code
    }

    pub fn set_response_code(&self, code: ResponseCode) {
        self.transaction.lock().outcome.response_code = code;
    }

    /// Copy response and authorization codes from a provider call
    pub fn adopt_outcome(&self, outcome: &Outcome) {
        self.transaction.lock().outcome.adopt(outcome);
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().clone()
    }

    /// Ask the owning connection task to tear down
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.lock().cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.lock().is_cancelled()
    }
}

impl<P: Protocol> Reinitialize for ClientConnectionState<P> {
    fn reinitialize(&self) {
        *self.id.write() = Uuid::new_v4();
        *self.peer.write() = None;
        self.response_in_flight.store(false, Ordering::Release);
        *self.last_activity.lock() = Instant::now();
        *self.shutdown.lock() = CancellationToken::new();

        let mut txn = self.transaction.lock();
        txn.session = P::Client::default();
        txn.outcome = Outcome::default();
    }
}
