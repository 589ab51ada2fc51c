//! Driver configuration.

use skiff_core::Trace;

/// Default number of readiness events fetched per wait.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default upper bound on a single socket read.
pub const DEFAULT_MAX_READ_SIZE: usize = 64 * 1024;

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Readiness events fetched per wait; more pending events are picked up
    /// on the next wait
    pub event_capacity: usize,
    /// Largest single read from a socket, regardless of engine capacity
    pub max_read_size: usize,
    /// Trace level given to new listeners and connectors
    pub trace: Trace,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            trace: Trace::OFF,
        }
    }
}
