//! Readiness prober: bounded polling of VM state.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::api::{LifecycleApi, VmId, VmState, VmSummary};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Errors raised while waiting for a VM to boot.
#[derive(Debug, Error)]
pub enum ProbeError<ApiError>
where
    ApiError: std::error::Error + 'static,
{
    /// The VM did not report `running` before the deadline.
    #[error("{vm_id} did not reach running within {after:?} (last state: {last_state})")]
    BootTimeout {
        /// VM that was polled.
        vm_id: VmId,
        /// Bound that elapsed.
        after: Duration,
        /// Last observed state, or `missing` when the VM was never listed.
        last_state: String,
    },
    /// The VM was deleted while being polled.
    #[error("{vm_id} was deleted while waiting for it to boot")]
    Deleted {
        /// VM that was polled.
        vm_id: VmId,
    },
    /// A state query failed.
    #[error("state query for {vm_id} failed: {source}")]
    Api {
        /// VM that was polled.
        vm_id: VmId,
        /// Lifecycle API error.
        #[source]
        source: ApiError,
    },
}

/// Fixed-interval poller that waits for `running`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadinessProber {
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for ReadinessProber {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT)
    }
}

impl ReadinessProber {
    /// Creates a prober.
    #[must_use]
    pub const fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    /// Overrides the deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configured deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Polls until the VM reports `running`.
    ///
    /// A VM absent from the listing is treated as not yet visible and polling
    /// continues.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::BootTimeout`] once the deadline elapses,
    /// [`ProbeError::Deleted`] if the VM reports `deleted`, or
    /// [`ProbeError::Api`] when a state query fails.
    pub async fn wait_running<A: LifecycleApi>(
        &self,
        api: &A,
        vm_id: &VmId,
    ) -> Result<VmSummary, ProbeError<A::Error>> {
        let deadline = Instant::now() + self.timeout;
        let mut last_state = String::from("missing");

        loop {
            let observed = api
                .get_vm(vm_id)
                .await
                .map_err(|source| ProbeError::Api {
                    vm_id: vm_id.clone(),
                    source,
                })?;
            match observed {
                Some(vm) if vm.state == VmState::Running => return Ok(vm),
                Some(vm) if vm.state == VmState::Deleted => {
                    return Err(ProbeError::Deleted {
                        vm_id: vm_id.clone(),
                    });
                }
                Some(vm) => last_state = vm.state.to_string(),
                None => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProbeError::BootTimeout {
                    vm_id: vm_id.clone(),
                    after: self.timeout,
                    last_state,
                });
            }
            debug!(vm_id = %vm_id, state = %last_state, "waiting for vm to boot");
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
