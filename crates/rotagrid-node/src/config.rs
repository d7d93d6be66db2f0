//! Node timing configuration.

use std::time::Duration;

/// Default bound for remote calls, barrier waits and snapshot transfer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeouts applied by a `Node`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Bound on each `StopAll` / `StartItem` / `Confirm` / refresh call.
    pub call_timeout: Duration,
    /// Bound on the stop-confirmation barrier of one run.
    pub confirm_timeout: Duration,
    /// Bound on the join-time snapshot transfer.
    pub snapshot_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_REQUEST_TIMEOUT,
            confirm_timeout: DEFAULT_REQUEST_TIMEOUT,
            snapshot_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl NodeConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }
}
