//! Connector state machine.
//!
//! Each direction of a connection moves independently:
//!
//! ```text
//!                 zero-length read / close
//!            ┌──────────────────────────────> HalfClosed
//!   Open ────┤
//!            └──────────────────────────────> Errored     (both sides)
//!                 I/O, TLS or engine error
//! ```
//!
//! The connection is closed once neither side is open. Closure is reported
//! exactly once through [`ConnectorState::take_closed_event`], which is how
//! the driver puts a closed connector in front of its owner a single time.

use std::fmt;

use crate::error::StateError;

/// State of one direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Bytes may still flow in this direction
    Open,
    /// Direction finished cleanly (peer EOF, local shutdown)
    HalfClosed,
    /// Direction aborted by an error
    Errored,
}

impl Side {
    /// True while bytes may flow in this direction.
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

/// Why a connector stopped (or started to stop) being serviced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer shut down its sending side
    PeerClosed,
    /// Engine or application asked for the close
    Local,
    /// Outbound connect never completed
    ConnectFailed(String),
    /// Socket-level failure
    Io(String),
    /// Security negotiation or record-layer failure
    Security(String),
    /// Engine rejected input
    Engine(String),
}

impl CloseReason {
    /// True for reasons caused by a failure rather than an orderly shutdown.
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::PeerClosed | Self::Local)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Local => write!(f, "closed locally"),
            Self::ConnectFailed(msg) => write!(f, "connect failed: {msg}"),
            Self::Io(msg) => write!(f, "i/o error: {msg}"),
            Self::Security(msg) => write!(f, "security failure: {msg}"),
            Self::Engine(msg) => write!(f, "engine failure: {msg}"),
        }
    }
}

/// Two-axis connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorState {
    read: Side,
    write: Side,
    /// First reason recorded; later reasons are dropped
    reason: Option<CloseReason>,
    /// Closure already handed out by `take_closed_event`
    closed_reported: bool,
}

impl Default for ConnectorState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorState {
    /// Both sides open.
    pub fn new() -> Self {
        Self { read: Side::Open, write: Side::Open, reason: None, closed_reported: false }
    }

    /// Read side state.
    pub fn read(&self) -> Side {
        self.read
    }

    /// Write side state.
    pub fn write(&self) -> Side {
        self.write
    }

    /// Neither side is open.
    pub fn is_closed(&self) -> bool {
        !self.read.is_open() && !self.write.is_open()
    }

    /// First recorded close reason. `None` while both sides are open.
    pub fn reason(&self) -> Option<&CloseReason> {
        self.reason.as_ref()
    }

    /// Fails unless the read side is open.
    pub fn require_read_open(&self) -> Result<(), StateError> {
        if self.read.is_open() { Ok(()) } else { Err(StateError::ReadNotOpen(self.read)) }
    }

    /// Fails unless the write side is open.
    pub fn require_write_open(&self) -> Result<(), StateError> {
        if self.write.is_open() { Ok(()) } else { Err(StateError::WriteNotOpen(self.write)) }
    }

    /// `Open → HalfClosed` on the read side. Returns whether anything changed.
    pub fn close_read(&mut self, reason: CloseReason) -> bool {
        if !self.read.is_open() {
            return false;
        }
        self.read = Side::HalfClosed;
        self.record(reason);
        true
    }

    /// `Open → HalfClosed` on the write side. Returns whether anything
    /// changed.
    pub fn close_write(&mut self, reason: CloseReason) -> bool {
        if !self.write.is_open() {
            return false;
        }
        self.write = Side::HalfClosed;
        self.record(reason);
        true
    }

    /// Both open sides become `HalfClosed`. Returns whether anything changed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        let read = self.close_read(reason.clone());
        let write = self.close_write(reason);
        read || write
    }

    /// Both open sides become `Errored`. Returns whether anything changed.
    ///
    /// Sides that already finished keep their state.
    pub fn fail(&mut self, reason: CloseReason) -> bool {
        let mut changed = false;
        if self.read.is_open() {
            self.read = Side::Errored;
            changed = true;
        }
        if self.write.is_open() {
            self.write = Side::Errored;
            changed = true;
        }
        if changed {
            self.record(reason);
        }
        changed
    }

    /// True exactly once, the first time it is called after the connection
    /// became closed.
    pub fn take_closed_event(&mut self) -> bool {
        if self.is_closed() && !self.closed_reported {
            self.closed_reported = true;
            return true;
        }
        false
    }

    /// Closure has already been handed out.
    pub fn closed_reported(&self) -> bool {
        self.closed_reported
    }

    fn record(&mut self, reason: CloseReason) {
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_is_fully_open() {
        let state = ConnectorState::new();
        assert_eq!(state.read(), Side::Open);
        assert_eq!(state.write(), Side::Open);
        assert!(!state.is_closed());
        assert!(state.reason().is_none());
    }

    #[test]
    fn half_close_keeps_other_side_open() {
        let mut state = ConnectorState::new();
        assert!(state.close_read(CloseReason::PeerClosed));

        assert_eq!(state.read(), Side::HalfClosed);
        assert_eq!(state.write(), Side::Open);
        assert!(!state.is_closed());
        assert!(state.require_write_open().is_ok());
        assert_eq!(state.require_read_open(), Err(StateError::ReadNotOpen(Side::HalfClosed)));
    }

    #[test]
    fn closing_both_sides_closes_connection() {
        let mut state = ConnectorState::new();
        state.close_read(CloseReason::PeerClosed);
        state.close_write(CloseReason::Local);

        assert!(state.is_closed());
        assert_eq!(state.reason(), Some(&CloseReason::PeerClosed));
    }

    #[test]
    fn fail_errors_only_open_sides() {
        let mut state = ConnectorState::new();
        state.close_read(CloseReason::PeerClosed);
        assert!(state.fail(CloseReason::Io("reset".to_string())));

        assert_eq!(state.read(), Side::HalfClosed);
        assert_eq!(state.write(), Side::Errored);
        assert!(state.is_closed());
    }

    #[test]
    fn transitions_are_idempotent() {
        let mut state = ConnectorState::new();
        assert!(state.close_write(CloseReason::Local));
        assert!(!state.close_write(CloseReason::Local));
        assert!(state.fail(CloseReason::Io("x".to_string())));
        assert!(!state.fail(CloseReason::Io("y".to_string())));
        assert!(!state.close(CloseReason::Local));
    }

    #[test]
    fn closed_event_fires_once() {
        let mut state = ConnectorState::new();
        assert!(!state.take_closed_event());

        state.close(CloseReason::Local);
        assert!(state.take_closed_event());
        assert!(!state.take_closed_event());
        assert!(state.closed_reported());
    }

    #[test]
    fn error_reasons_are_flagged() {
        assert!(!CloseReason::PeerClosed.is_error());
        assert!(!CloseReason::Local.is_error());
        assert!(CloseReason::Security("bad cert".to_string()).is_error());
        assert_eq!(CloseReason::Engine("bad frame".to_string()).to_string(), "engine failure: bad frame");
    }
}
