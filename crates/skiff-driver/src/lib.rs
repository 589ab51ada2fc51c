//! Skiff connection driver.
//!
//! Readiness-driven runtime that moves bytes between non-blocking TCP
//! sockets and protocol engines implementing [`skiff_core::Engine`], with an
//! optional TLS sublayer in between.
//!
//! # Architecture
//!
//! The driver is single-threaded and cooperative. The application owns a
//! [`Driver`] and runs the loop itself:
//!
//! ```text
//! loop {
//!     driver.wait(None)?;
//!     while let Some(l) = driver.next_pending_listener() { driver.accept(l); }
//!     while let Some(c) = driver.next_pending_connector() {
//!         if driver.connector(c).is_some_and(Connector::is_closed) {
//!             driver.free_connector(c);
//!         } else {
//!             driver.process(c)?;
//!         }
//!     }
//! }
//! ```
//!
//! All blocking happens inside [`Driver::wait`]. Everything else performs at
//! most one non-blocking I/O attempt per call. [`DriverWaker`] is the only
//! handle that may be used from another thread.
//!
//! # Components
//!
//! - [`Driver`]: owns endpoints and the poll, builds the pending queues
//! - [`Listener`]: listening socket plus the server security it hands out
//! - [`Connector`]: one connection's socket, sublayer, engine and state
//! - [`SecurityLayer`]: TLS (or sniffed plaintext) between socket and engine
//! - [`socket`]: non-blocking socket primitives

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connector;
mod driver;
mod error;
mod listener;
pub mod security;
pub mod socket;
mod tls_config;

pub use config::{DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_READ_SIZE, DriverConfig};
pub use connector::{Connector, ConnectorId};
pub use driver::{Driver, DriverWaker};
pub use error::{DriverError, ErrorCode, SecurityError};
pub use listener::{Listener, ListenerId};
pub use security::{Prelude, SecurityLayer};
pub use skiff_core::{CloseReason, ConnectorState, Engine, EngineError, Side, Trace};
pub use tls_config::{ClientSecurity, ClientSecurityConfig, ServerSecurity, ServerSecurityConfig};
