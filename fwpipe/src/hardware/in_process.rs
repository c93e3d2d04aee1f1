//! Hardware locks shared between runs inside one process.

use super::{HardwareLease, HardwareLock};
use crate::cancellation::CancellationToken;
use crate::errors::HardwareAcquisitionError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Named mutexes keyed by resource.
///
/// Clone the registry (or share it behind an `Arc`) to let concurrent runs
/// contend for the same rigs.
#[derive(Debug, Clone, Default)]
pub struct InProcessLocks {
    resources: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl InProcessLocks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, resource: &str) -> Arc<Mutex<()>> {
        self.resources
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns true if `resource` is currently leased.
    #[must_use]
    pub fn is_held(&self, resource: &str) -> bool {
        self.resources
            .get(resource)
            .is_some_and(|m| m.try_lock().is_err())
    }
}

#[async_trait]
impl HardwareLock for InProcessLocks {
    async fn acquire(
        &self,
        resource: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HardwareLease, HardwareAcquisitionError> {
        let mutex = self.mutex_for(resource);

        tokio::select! {
            guard = mutex.lock_owned() => {
                debug!(resource, "Hardware lock acquired");
                Ok(HardwareLease::new(resource, guard))
            }
            () = tokio::time::sleep(timeout) => {
                Err(HardwareAcquisitionError::timeout(resource, timeout))
            }
            () = cancel.cancelled() => {
                Err(HardwareAcquisitionError::Cancelled { resource: resource.to_string() })
            }
        }
    }
}
