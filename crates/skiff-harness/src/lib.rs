//! Test support for the skiff connection driver.
//!
//! Real sockets on loopback, a scriptable engine, and a throwaway PKI. Tests
//! build a [`skiff_driver::Driver`] over [`RecordingEngine`], drive it with
//! [`pump_until`], and inspect what each engine saw.
//!
//! # Components
//!
//! - [`RecordingEngine`]: records input and ticks, sends scripted output
//! - [`pump_until`] / [`run_cycle`]: one or more wait/accept/process cycles
//! - [`socket_pair`]: connected loopback streams without a driver
//! - [`TestPki`]: CA, server and client certificates written to a tempdir

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod net;
pub mod pki;

pub use engine::RecordingEngine;
pub use net::{Cycle, pump_until, run_cycle, socket_pair};
pub use pki::TestPki;
