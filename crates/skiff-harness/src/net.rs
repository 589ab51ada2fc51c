//! Loopback sockets and driver pumping.

use std::{
    io,
    net::{TcpListener, TcpStream},
    time::{Duration, Instant},
};

use skiff_core::Engine;
use skiff_driver::{ConnectorId, Driver, DriverError};

/// Longest single wait inside [`pump_until`].
const SLICE: Duration = Duration::from_millis(10);

/// Connected pair of blocking loopback streams.
pub fn socket_pair() -> io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let client = TcpStream::connect(listener.local_addr()?)?;
    let (server, _) = listener.accept()?;
    Ok((client, server))
}

/// What happened during one or more driver cycles.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// Connectors created by accepts, in order
    pub accepted: Vec<ConnectorId>,
    /// Connectors processed, in queue order (repeats across cycles)
    pub processed: Vec<ConnectorId>,
    /// Connectors whose closure was reported
    pub closed: Vec<ConnectorId>,
}

impl Cycle {
    fn extend(&mut self, other: Cycle) {
        self.accepted.extend(other.accepted);
        self.processed.extend(other.processed);
        self.closed.extend(other.closed);
    }
}

/// One wait followed by draining both pending queues.
///
/// Every accepted connector gets an engine from `make_engine`. Closed
/// connectors are reported in [`Cycle::closed`] and left for the caller to
/// free.
pub fn run_cycle<E: Engine, C>(
    driver: &mut Driver<E, C>,
    timeout: Duration,
    make_engine: &mut impl FnMut() -> E,
) -> Result<Cycle, DriverError> {
    driver.wait(Some(timeout))?;
    let mut cycle = Cycle::default();

    while let Some(listener) = driver.next_pending_listener() {
        while let Some(id) = driver.accept(listener) {
            if let Some(connector) = driver.connector_mut(id) {
                connector.set_connection(make_engine());
            }
            cycle.accepted.push(id);
        }
    }

    while let Some(id) = driver.next_pending_connector() {
        let closed = driver.connector(id).is_some_and(|connector| connector.is_closed());
        if closed {
            cycle.closed.push(id);
        } else {
            driver.process(id)?;
            cycle.processed.push(id);
        }
    }

    Ok(cycle)
}

/// Cycle until `done` holds or `limit` passes.
///
/// Returns everything that happened, or `None` if `limit` ran out first.
pub fn pump_until<E: Engine, C>(
    driver: &mut Driver<E, C>,
    limit: Duration,
    mut make_engine: impl FnMut() -> E,
    mut done: impl FnMut(&Driver<E, C>, &Cycle) -> bool,
) -> Result<Option<Cycle>, DriverError> {
    let deadline = Instant::now() + limit;
    let mut history = Cycle::default();

    loop {
        if done(driver, &history) {
            return Ok(Some(history));
        }
        let now = Instant::now();
        if now >= deadline {
            tracing::debug!(?history, "Pump limit reached");
            return Ok(None);
        }
        let slice = SLICE.min(deadline - now);
        let cycle = run_cycle(driver, slice, &mut make_engine)?;
        history.extend(cycle);
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn socket_pair_is_connected() {
        let (mut a, mut b) = socket_pair().unwrap();
        a.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }
}
