//! Sans-IO core of the skiff connection driver.
//!
//! Everything in this crate is free of sockets and clocks. The driver crate
//! feeds bytes and timestamps in; this crate decides what those mean for a
//! single connection.
//!
//! # Components
//!
//! - [`Engine`]: the boundary a protocol engine implements so the driver can
//!   hand it input, pull its output, and run its timers.
//! - [`ConnectorState`]: two-axis (read/write) state machine for one
//!   connection, with a derived closed predicate.
//! - [`CloseReason`]: why a connection stopped being serviced.
//! - [`Trace`]: per-endpoint verbosity flags.
//!
//! # Ordering Contract
//!
//! For a single connection the driver guarantees that [`Engine::input`],
//! [`Engine::tick`] and [`Engine::pending_output`] are called sequentially,
//! never concurrently, and that bytes are delivered and written in the order
//! they were received or produced.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod error;
pub mod state;
pub mod trace;

pub use engine::{DEFAULT_INPUT_CAPACITY, Engine};
pub use error::{EngineError, StateError};
pub use state::{CloseReason, ConnectorState, Side};
pub use trace::Trace;
