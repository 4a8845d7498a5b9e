//! Process-lifetime request counters.

/// Counters a [`ScriptHost`](crate::ScriptHost) keeps across requests.
///
/// Only attempted executions count as served. A request that never reaches
/// the script (bad path, missing file, compile error) bumps
/// `resolution_failures` instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCounters {
    /// Executions attempted, successful or not.
    pub total_served: u64,

    /// Requests that failed before a script ran.
    pub resolution_failures: u64,

    /// Executions that raised.
    pub runtime_failures: u64,
}

impl ServerCounters {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all counters to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Total requests seen, whether or not a script ran.
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total_served + self.resolution_failures
    }
}
