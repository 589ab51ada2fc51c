//! Protocol engine boundary.
//!
//! The driver knows nothing about frames and the engine knows nothing about
//! sockets. This trait is the whole conversation between them: the driver
//! offers received bytes, asks for bytes to send, reports how many were
//! written, and fires timers when the engine's deadline passes.

use std::time::Instant;

use crate::error::EngineError;

/// Input capacity assumed for engines that do not override
/// [`Engine::capacity`].
pub const DEFAULT_INPUT_CAPACITY: usize = 16 * 1024;

/// Bottom half of a protocol engine, as seen by the driver.
///
/// # Invariants
///
/// - `input` never reports more bytes consumed than it was given.
/// - `pending_output` returns the same leading bytes until
///   `output_consumed` is called for them; new output is only appended.
/// - `output_consumed(n)` is only called with `n <= pending_output().len()`.
pub trait Engine {
    /// Offer bytes received from the peer.
    ///
    /// Returns how many leading bytes were consumed. Unconsumed bytes are kept
    /// by the driver and offered again, prefixed to any later input.
    ///
    /// # Errors
    ///
    /// An error is fatal to the connection: the driver closes both sides.
    fn input(&mut self, bytes: &[u8]) -> Result<usize, EngineError>;

    /// How many more input bytes the engine is willing to buffer right now.
    ///
    /// The driver never reads more than this from the socket in one go.
    fn capacity(&self) -> usize {
        DEFAULT_INPUT_CAPACITY
    }

    /// The peer will send nothing more.
    ///
    /// Called once, after every received byte has been offered to
    /// [`Engine::input`].
    fn input_closed(&mut self) {}

    /// Bytes waiting to be sent to the peer.
    fn pending_output(&mut self) -> &[u8];

    /// The first `count` bytes of [`Engine::pending_output`] were written.
    fn output_consumed(&mut self, count: usize);

    /// When the engine next needs [`Engine::tick`] called. `None` if it has
    /// no timer armed.
    fn next_tick(&self) -> Option<Instant>;

    /// Run timer-driven work (heartbeats, idle timeouts).
    fn tick(&mut self, now: Instant);

    /// The engine is done sending; once its output is flushed the driver
    /// shuts down the write side.
    fn wants_close(&self) -> bool;
}
