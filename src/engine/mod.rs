// Server engine
// Owns the listener, pools, admission gates and registry, and drives every connection

pub mod admission;
pub mod endpoints;
pub mod registry;
pub mod telemetry;

mod client;
mod listener;
mod provider;

pub use admission::AdmissionSemaphores;
pub use endpoints::ProviderEndpoints;
pub use registry::{ConnectionRegistry, RegistryError};
pub use telemetry::{EngineStats, TrafficCounter};

use crate::buffer::{BufferSlice, SegmentedBufferPool, PREALLOCATED_OPS_PER_CONNECTION};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::handler::Protocol;
use crate::pool::ObjectStatePool;
use crate::state::{ClientConnectionState, ProviderConnectionState};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Upper bound on waiting for connection tasks during `stop_server`
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters for `start`
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub listen_port: u16,
    pub test_mode: bool,
    pub router_mode: bool,
    pub provider_ip: Option<String>,
    pub provider_ports: Vec<u16>,
}

impl StartOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            listen_port: config.server.listen_port,
            test_mode: config.server.test_mode,
            router_mode: config.server.router_mode,
            provider_ip: config.provider.ip.clone(),
            provider_ports: config.provider.ports.clone(),
        }
    }
}

/// Settings fixed for one run of the engine
#[derive(Debug, Default)]
pub(crate) struct RunSettings {
    pub(crate) test_mode: bool,
    pub(crate) router_mode: bool,
    pub(crate) endpoints: Option<ProviderEndpoints>,
}

struct ListenerHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Transactional TCP server engine
pub struct ServerEngine<P: Protocol> {
    config: EngineConfig,
    protocol: P,
    buffers: SegmentedBufferPool,
    clients: ObjectStatePool<ClientConnectionState<P>>,
    providers: ObjectStatePool<ProviderConnectionState<P>>,
    admission: AdmissionSemaphores,
    registry: ConnectionRegistry<P>,
    settings: RwLock<Arc<RunSettings>>,
    running: AtomicBool,
    draining: AtomicBool,
    listener: Mutex<Option<ListenerHandle>>,
    local_addr: RwLock<Option<SocketAddr>>,
    tasks: TaskTracker,
    traffic: TrafficCounter,
}

impl<P: Protocol> ServerEngine<P> {
    /// Validate the environment and pre-allocate arena, pools and admission gates
    #[instrument(skip(config, protocol))]
    pub fn pre_initialize(config: EngineConfig, protocol: P) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| EngineError::Configuration(format!("{e:#}")))?;

        protocol
            .verify_environment(&config)
            .map_err(|e| EngineError::Environment(format!("{e:#}")))?;

        let limits = config.limits.clone();

        let buffers = SegmentedBufferPool::new(
            limits.slice_size,
            limits.max_connections,
            PREALLOCATED_OPS_PER_CONNECTION,
        )?;
        buffers.initialize();
        let demand = limits.socket_demand().ok_or_else(|| {
            EngineError::Configuration("max_connections + max_provider_calls overflows".into())
        })?;
        buffers.ensure_available(demand)?;

        let timeout = config.client_timeout();
        let clients = ObjectStatePool::with_capacity("client", limits.max_connections, || {
            ClientConnectionState::new(timeout)
        });
        let providers = ObjectStatePool::with_capacity(
            "provider",
            limits.max_provider_calls,
            ProviderConnectionState::new,
        );
        let admission = AdmissionSemaphores::new(limits.max_connections, limits.max_provider_calls);

        // A permit always has a pooled state waiting for it
        if clients.capacity() != admission.max_clients()
            || providers.capacity() != admission.max_providers()
        {
            return Err(EngineError::Configuration(
                "state pool capacity must equal admission permits".into(),
            ));
        }

        info!(
            max_connections = limits.max_connections,
            max_provider_calls = limits.max_provider_calls,
            slice_size = limits.slice_size,
            client_timeout_secs = limits.client_timeout_secs,
            "Engine pre-initialized"
        );

        Ok(Arc::new(Self {
            config,
            protocol,
            buffers,
            clients,
            providers,
            admission,
            registry: ConnectionRegistry::new(),
            settings: RwLock::new(Arc::new(RunSettings::default())),
            running: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            listener: Mutex::new(None),
            local_addr: RwLock::new(None),
            tasks: TaskTracker::new(),
            traffic: TrafficCounter::default(),
        }))
    }

    /// Bind the listener and start accepting clients
    #[instrument(skip(self, options), fields(port = options.listen_port))]
    pub async fn start(self: &Arc<Self>, options: StartOptions) -> Result<SocketAddr> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::AlreadyRunning);
        }

        match self.bind_and_spawn(&options) {
            Ok(addr) => {
                self.protocol.on_start();
                info!(
                    addr = %addr,
                    test_mode = options.test_mode,
                    router_mode = options.router_mode,
                    "Engine started"
                );
                Ok(addr)
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn bind_and_spawn(self: &Arc<Self>, options: &StartOptions) -> Result<SocketAddr> {
        let endpoints = if options.router_mode {
            Some(ProviderEndpoints::new(
                options.provider_ip.as_deref(),
                &options.provider_ports,
            )?)
        } else {
            None
        };

        let ip = self
            .config
            .bind_socket_addr()
            .map_err(|e| EngineError::Configuration(format!("{e:#}")))?
            .ip();
        let listener = listener::bind(SocketAddr::new(ip, options.listen_port), self.config.server.backlog)
            .map_err(|e| match e.downcast::<std::io::Error>() {
                Ok(io) => EngineError::Io(io),
                Err(other) => EngineError::Configuration(format!("{other:#}")),
            })?;
        let addr = listener.local_addr()?;

        *self.settings.write() = Arc::new(RunSettings {
            test_mode: options.test_mode,
            router_mode: options.router_mode,
            endpoints,
        });
        *self.local_addr.write() = Some(addr);
        self.draining.store(false, Ordering::Release);

        let stop = CancellationToken::new();
        let task = tokio::spawn(self.clone().accept_loop(listener, stop.clone()));
        *self.listener.lock() = Some(ListenerHandle { stop, task });

        Ok(addr)
    }

    /// Close the listener, close every client and wait for their tasks
    #[instrument(skip(self))]
    pub async fn stop_server(&self) {
        if !self.running.load(Ordering::Acquire) {
            debug!("Engine already stopped");
            return;
        }

        self.draining.store(true, Ordering::Release);
        info!("Draining engine");

        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            handle.stop.cancel();
            if let Err(e) = handle.task.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }
        }

        let snapshot = self.registry.snapshot();
        let total = snapshot.len();
        for state in snapshot {
            self.close_socket_client(&state);
        }
        self.registry.clear();

        self.tasks.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, self.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Connection tasks still running after drain timeout"
            );
        }
        self.tasks.reopen();

        *self.local_addr.write() = None;
        self.running.store(false, Ordering::Release);
        self.draining.store(false, Ordering::Release);
        info!(closed_clients = total, "Engine stopped");
    }

    /// Close a client; `false` if it was already closed elsewhere
    pub fn close_socket_client(&self, state: &ClientConnectionState<P>) -> bool {
        let id = state.id();
        match self.registry.remove(id) {
            Ok(_) => {
                state.request_shutdown();
                debug!(client_id = %id, "Client close requested");
                true
            }
            Err(RegistryError::NotFound(_)) => {
                debug!(client_id = %id, "Client already closed");
                false
            }
            Err(e) => {
                // The connection task evicts the entry during teardown
                warn!(client_id = %id, error = %e, "Registry unavailable while closing client");
                state.request_shutdown();
                true
            }
        }
    }

    /// Abort a provider call; its client receives a no-response code
    pub fn close_socket_provider(&self, state: &ProviderConnectionState<P>) {
        debug!(call_id = %state.call_id(), "Provider close requested");
        state.request_close();
    }

    /// Return a provider call's resources
    pub(crate) fn release_provider(
        &self,
        state: Arc<ProviderConnectionState<P>>,
        buffer: Option<BufferSlice>,
        permit: OwnedSemaphorePermit,
    ) {
        state.dispose_timer();
        if let Some(buffer) = buffer {
            self.buffers.release(buffer);
        }
        self.providers.release(state);
        drop(permit);
    }

    pub(crate) fn settings(&self) -> Arc<RunSettings> {
        self.settings.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    /// States of the clients registered right now
    pub fn connected_client_states(&self) -> Vec<Arc<ClientConnectionState<P>>> {
        self.registry.snapshot()
    }

    pub fn connected_clients(&self) -> usize {
        self.registry.len()
    }

    pub fn available_client_slots(&self) -> usize {
        self.admission.available_clients()
    }

    pub fn available_provider_slots(&self) -> usize {
        self.admission.available_providers()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.traffic.total()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            running: self.is_running(),
            connected_clients: self.connected_clients(),
            available_client_slots: self.available_client_slots(),
            available_provider_slots: self.available_provider_slots(),
            pooled_client_states: self.clients.available(),
            pooled_provider_states: self.providers.available(),
            free_buffer_slices: self.buffers.available(),
            bytes_transferred: self.bytes_transferred(),
        }
    }

    pub(crate) fn log_pool_failure(&self, kind: &'static str, error: &EngineError) {
        error!(kind = kind, error = %error, "Pool could not serve an admitted connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::echo::EchoProtocol;

    fn small_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.server.bind_addr = "127.0.0.1".to_string();
        config.limits.max_connections = 4;
        config.limits.max_provider_calls = 2;
        config.limits.slice_size = 256;
        config
    }

    struct FailingEnvCheck;

    impl Protocol for FailingEnvCheck {
        type Client = crate::handler::echo::EchoClient;
        type Provider = crate::handler::echo::EchoProvider;

        fn verify_environment(&self, _config: &EngineConfig) -> anyhow::Result<()> {
            anyhow::bail!("licence expired")
        }
    }

    #[test]
    fn test_pre_initialize_sizes_pools() {
        let engine = ServerEngine::pre_initialize(small_config(), EchoProtocol).unwrap();
        let stats = engine.stats();
        assert!(!stats.running);
        assert_eq!(stats.available_client_slots, 4);
        assert_eq!(stats.available_provider_slots, 2);
        assert_eq!(stats.pooled_client_states, 4);
        assert_eq!(stats.pooled_provider_states, 2);
        assert_eq!(stats.free_buffer_slices, 8);
    }

    #[test]
    fn test_pre_initialize_rejects_arena_overflow() {
        let mut config = small_config();
        config.limits.max_provider_calls = 5;
        let err = ServerEngine::pre_initialize(config, EchoProtocol).err().unwrap();
        assert!(matches!(err, EngineError::BufferExhausted { requested: 9, capacity: 8 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_pre_initialize_fails_environment_check() {
        let err = ServerEngine::pre_initialize(small_config(), FailingEnvCheck).err().unwrap();
        assert!(matches!(err, EngineError::Environment(ref msg) if msg.contains("licence")));
    }

    #[test]
    fn test_pre_initialize_rejects_overflowing_limits() {
        let mut config = small_config();
        config.limits.max_connections = usize::MAX;
        config.limits.max_provider_calls = 1;
        let err = ServerEngine::pre_initialize(config, EchoProtocol).err().unwrap();
        assert!(matches!(err, EngineError::Configuration(ref msg) if msg.contains("usize")));
    }

    #[tokio::test]
    async fn test_start_validates_router_options() {
        let engine = ServerEngine::pre_initialize(small_config(), EchoProtocol).unwrap();
        let options = StartOptions {
            router_mode: true,
            provider_ip: Some("not-an-ip".to_string()),
            provider_ports: vec![9000],
            ..Default::default()
        };
        assert!(matches!(
            engine.start(options).await,
            Err(EngineError::Configuration(_))
        ));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_idempotent() {
        let engine = ServerEngine::pre_initialize(small_config(), EchoProtocol).unwrap();
        let addr = engine.start(StartOptions::default()).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(engine.local_addr(), Some(addr));

        assert!(matches!(
            engine.start(StartOptions::default()).await,
            Err(EngineError::AlreadyRunning)
        ));

        engine.stop_server().await;
        assert!(!engine.is_running());
        assert!(engine.local_addr().is_none());
        engine.stop_server().await;
        assert!(!engine.is_running());
    }
}
