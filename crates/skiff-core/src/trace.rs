//! Trace levels.
//!
//! Trace flags only change what gets logged; they never change behavior.

use bitflags::bitflags;

bitflags! {
    /// What to log for an endpoint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Trace: u8 {
        /// Raw bytes read from and written to the socket
        const RAW = 0b001;
        /// Driver events: readiness, state transitions, ticks
        const DRIVER = 0b010;
    }
}

impl Trace {
    /// Nothing is traced.
    pub const OFF: Self = Self::empty();

    /// Raw byte tracing enabled.
    pub fn raw(self) -> bool {
        self.contains(Self::RAW)
    }

    /// Driver event tracing enabled.
    pub fn driver(self) -> bool {
        self.contains(Self::DRIVER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_traces_nothing() {
        assert!(!Trace::OFF.raw());
        assert!(!Trace::OFF.driver());
        assert_eq!(Trace::default(), Trace::OFF);
    }

    #[test]
    fn flags_combine() {
        let trace = Trace::RAW | Trace::DRIVER;
        assert!(trace.raw());
        assert!(trace.driver());
        assert_eq!(trace.bits(), 0b011);
        assert!(!Trace::DRIVER.raw());
    }
}
