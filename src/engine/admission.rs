// Admission control
// Counting semaphores bounding concurrent clients and concurrent provider calls

use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Client and provider admission gates
///
/// Permits are owned by the connection or call that acquired them and go back
/// to the semaphore when dropped, so a slot can never be returned twice.
pub struct AdmissionSemaphores {
    clients: Arc<Semaphore>,
    providers: Arc<Semaphore>,
    max_clients: usize,
    max_providers: usize,
}

impl AdmissionSemaphores {
    pub fn new(max_clients: usize, max_providers: usize) -> Self {
        Self {
            clients: Arc::new(Semaphore::new(max_clients)),
            providers: Arc::new(Semaphore::new(max_providers)),
            max_clients,
            max_providers,
        }
    }

    /// Wait for a client slot
    pub async fn acquire_client(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        if self.clients.available_permits() == 0 {
            debug!(max_clients = self.max_clients, "Client admission saturated, waiting");
        }
        self.clients.clone().acquire_owned().await
    }

    /// Wait for a provider call slot
    pub async fn acquire_provider(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        if self.providers.available_permits() == 0 {
            debug!(max_providers = self.max_providers, "Provider admission saturated, waiting");
        }
        self.providers.clone().acquire_owned().await
    }

    pub fn available_clients(&self) -> usize {
        self.clients.available_permits()
    }

    pub fn available_providers(&self) -> usize {
        self.providers.available_permits()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn max_providers(&self) -> usize {
        self.max_providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_permits_round_trip() {
        let admission = AdmissionSemaphores::new(2, 1);
        let a = admission.acquire_client().await.unwrap();
        let _b = admission.acquire_client().await.unwrap();
        assert_eq!(admission.available_clients(), 0);

        drop(a);
        assert_eq!(admission.available_clients(), 1);
        assert_eq!(admission.available_providers(), 1);
    }

    #[tokio::test]
    async fn test_saturation_blocks_until_release() {
        let admission = Arc::new(AdmissionSemaphores::new(1, 1));
        let held = admission.acquire_provider().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire_provider().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(admission.available_providers(), 1);
    }
}
