//! Scriptable engine for driver tests.

use std::time::Instant;

use skiff_core::{DEFAULT_INPUT_CAPACITY, Engine, EngineError};

/// Engine that records everything the driver hands it.
///
/// Output is whatever the test queued with [`RecordingEngine::send`]. The
/// engine asks to close after [`RecordingEngine::close`], or on its own once
/// input ends if built with [`RecordingEngine::closing_on_eof`].
#[derive(Debug, Clone)]
pub struct RecordingEngine {
    received: Vec<u8>,
    outbound: Vec<u8>,
    written: usize,
    capacity: usize,
    /// Largest chunk accepted per `input` call
    chunk: Option<usize>,
    deadline: Option<Instant>,
    ticks: Vec<Instant>,
    close: bool,
    close_on_eof: bool,
    input_closed: usize,
    fail_on_input: Option<EngineError>,
    echo: bool,
}

impl Default for RecordingEngine {
    fn default() -> Self {
        Self {
            received: Vec::new(),
            outbound: Vec::new(),
            written: 0,
            capacity: DEFAULT_INPUT_CAPACITY,
            chunk: None,
            deadline: None,
            ticks: Vec::new(),
            close: false,
            close_on_eof: false,
            input_closed: 0,
            fail_on_input: None,
            echo: false,
        }
    }
}

impl RecordingEngine {
    /// Engine with default capacity and nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that writes every received byte back.
    pub fn echo() -> Self {
        Self { echo: true, close_on_eof: true, ..Self::default() }
    }

    /// Ask to close as soon as the peer stops sending.
    #[must_use]
    pub fn closing_on_eof(mut self) -> Self {
        self.close_on_eof = true;
        self
    }

    /// Report this input capacity to the driver.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Accept at most `chunk` bytes per delivery.
    #[must_use]
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = Some(chunk);
        self
    }

    /// Reject the next input with `error`.
    #[must_use]
    pub fn failing_with(mut self, error: EngineError) -> Self {
        self.fail_on_input = Some(error);
        self
    }

    /// Queue bytes for the peer.
    pub fn send(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    /// Ask the driver to shut down the write side after flushing.
    pub fn close(&mut self) {
        self.close = true;
    }

    /// Arm the timer.
    pub fn schedule_tick(&mut self, at: Instant) {
        self.deadline = Some(at);
    }

    /// Everything delivered so far, in order.
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    /// Total bytes the driver reported as written.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Queued output not yet written.
    pub fn unsent(&self) -> usize {
        self.outbound.len()
    }

    /// Times `tick` ran.
    pub fn ticks(&self) -> &[Instant] {
        &self.ticks
    }

    /// Times `input_closed` was called.
    pub fn input_closed_count(&self) -> usize {
        self.input_closed
    }
}

impl Engine for RecordingEngine {
    fn input(&mut self, bytes: &[u8]) -> Result<usize, EngineError> {
        if let Some(error) = self.fail_on_input.take() {
            return Err(error);
        }
        let take = self.chunk.map_or(bytes.len(), |chunk| bytes.len().min(chunk));
        self.received.extend_from_slice(&bytes[..take]);
        if self.echo {
            self.outbound.extend_from_slice(&bytes[..take]);
        }
        Ok(take)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn input_closed(&mut self) {
        self.input_closed += 1;
        if self.close_on_eof {
            self.close = true;
        }
    }

    fn pending_output(&mut self) -> &[u8] {
        &self.outbound
    }

    fn output_consumed(&mut self, count: usize) {
        self.outbound.drain(..count);
        self.written += count;
    }

    fn next_tick(&self) -> Option<Instant> {
        self.deadline
    }

    fn tick(&mut self, now: Instant) {
        self.ticks.push(now);
        self.deadline = None;
    }

    fn wants_close(&self) -> bool {
        self.close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_input_consumes_partially() {
        let mut engine = RecordingEngine::new().with_chunk(3);
        assert_eq!(engine.input(b"hello").unwrap(), 3);
        assert_eq!(engine.received(), b"hel");
    }

    #[test]
    fn echo_queues_input_as_output() {
        let mut engine = RecordingEngine::echo();
        engine.input(b"ping").unwrap();
        assert_eq!(engine.pending_output(), b"ping");
        engine.output_consumed(2);
        assert_eq!(engine.pending_output(), b"ng");
        assert_eq!(engine.written(), 2);
    }

    #[test]
    fn failure_is_one_shot() {
        let mut engine =
            RecordingEngine::new().failing_with(EngineError::Protocol("bad".to_string()));
        assert!(engine.input(b"x").is_err());
        assert_eq!(engine.input(b"x").unwrap(), 1);
    }

    #[test]
    fn tick_disarms_timer() {
        let mut engine = RecordingEngine::new();
        let now = Instant::now();
        engine.schedule_tick(now);
        engine.tick(now);
        assert_eq!(engine.ticks().len(), 1);
        assert!(engine.next_tick().is_none());
    }
}
