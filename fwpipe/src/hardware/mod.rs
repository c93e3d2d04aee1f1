//! Exclusive access to physical test hardware.
//!
//! A HIL rig can only serve one pipeline run at a time. Callers acquire a
//! [`HardwareLease`] for a named resource and the resource is released when
//! the lease is dropped, whichever way the holding stage ends.

mod in_process;
mod lock_file;

pub use in_process::InProcessLocks;
pub use lock_file::LockFileLocks;

use crate::cancellation::CancellationToken;
use crate::errors::HardwareAcquisitionError;
use crate::utils::duration_ms;
use async_trait::async_trait;
use regex::Regex;
use std::any::Any;
use std::fmt;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::debug;

static RESOURCE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// Returns true if `name` can be used as a hardware resource name.
///
/// Names map one-to-one onto lock file names, so path separators,
/// whitespace and leading dots are rejected.
#[must_use]
pub fn is_valid_resource_name(name: &str) -> bool {
    RESOURCE_NAME.is_match(name)
}

/// A backend granting exclusive, named hardware leases.
#[async_trait]
pub trait HardwareLock: Send + Sync + fmt::Debug {
    /// Acquires `resource`, waiting at most `timeout` while it is busy.
    ///
    /// # Errors
    ///
    /// Returns [`HardwareAcquisitionError::Timeout`] if the resource stays
    /// busy, [`HardwareAcquisitionError::Cancelled`] if `cancel` fires
    /// first, or [`HardwareAcquisitionError::Backend`] on backend failure.
    async fn acquire(
        &self,
        resource: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<HardwareLease, HardwareAcquisitionError>;
}

/// Scoped ownership of a hardware resource.
///
/// Dropping the lease releases the resource.
pub struct HardwareLease {
    resource: String,
    acquired_at: Instant,
    _guard: Box<dyn Any + Send + Sync>,
}

impl HardwareLease {
    /// Wraps a backend guard whose drop releases the resource.
    #[must_use]
    pub fn new<G>(resource: impl Into<String>, guard: G) -> Self
    where
        G: Any + Send + Sync,
    {
        Self {
            resource: resource.into(),
            acquired_at: Instant::now(),
            _guard: Box::new(guard),
        }
    }

    /// Returns the resource name.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Returns how long the lease has been held.
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Releases the resource, returning how long it was held.
    pub fn release(self) -> Duration {
        let held = self.held_for();
        debug!(resource = %self.resource, held_ms = duration_ms(held), "Releasing hardware");
        held
    }
}

impl fmt::Debug for HardwareLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareLease")
            .field("resource", &self.resource)
            .field("held_for", &self.held_for())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_names() {
        assert!(is_valid_resource_name("hil"));
        assert!(is_valid_resource_name("nrf52840dk-rig.2"));
        assert!(is_valid_resource_name("rig_a"));
        assert!(!is_valid_resource_name("rig/a"));
        assert!(!is_valid_resource_name("rig a"));
        assert!(!is_valid_resource_name(".."));
        assert!(!is_valid_resource_name(""));
    }

    #[test]
    fn test_release_reports_hold_time() {
        let lease = HardwareLease::new("hil", ());
        std::thread::sleep(Duration::from_millis(5));
        assert!(lease.release() >= Duration::from_millis(5));
    }
}
