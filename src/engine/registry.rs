// Connection registry
// Identity -> client state map used for duplicate detection and shutdown enumeration

use crate::handler::Protocol;
use crate::state::ClientConnectionState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Bounded wait for the registry lock
pub const REGISTRY_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("client {0} is already registered")]
    Duplicate(Uuid),

    #[error("client {0} is not registered")]
    NotFound(Uuid),
}

/// Non-owning lookup of connected clients
///
/// Removing an entry does not release the state; the connection task does
/// that once its socket is gone.
pub struct ConnectionRegistry<P: Protocol> {
    entries: Mutex<HashMap<Uuid, Arc<ClientConnectionState<P>>>>,
}

impl<P: Protocol> ConnectionRegistry<P> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, state: &Arc<ClientConnectionState<P>>) -> Result<(), RegistryError> {
        let mut entries = self
            .entries
            .try_lock_for(REGISTRY_LOCK_TIMEOUT)
            .ok_or(RegistryError::LockTimeout(REGISTRY_LOCK_TIMEOUT))?;

        let id = state.id();
        if entries.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        entries.insert(id, state.clone());
        Ok(())
    }

    /// Remove an identity; `NotFound` means it was already closed elsewhere
    pub fn remove(&self, id: Uuid) -> Result<Arc<ClientConnectionState<P>>, RegistryError> {
        let mut entries = self
            .entries
            .try_lock_for(REGISTRY_LOCK_TIMEOUT)
            .ok_or(RegistryError::LockTimeout(REGISTRY_LOCK_TIMEOUT))?;
        entries.remove(&id).ok_or(RegistryError::NotFound(id))
    }

    /// Remove an identity, waiting as long as the lock takes
    ///
    /// Used by connection teardown: the state goes back to the pool right
    /// after, so its entry must not outlive the connection.
    pub fn evict(&self, id: Uuid) -> Option<Arc<ClientConnectionState<P>>> {
        self.entries.lock().remove(&id)
    }

    /// Copy of all registered states, taken under the lock
    pub fn snapshot(&self) -> Vec<Arc<ClientConnectionState<P>>> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: Protocol> Default for ConnectionRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
