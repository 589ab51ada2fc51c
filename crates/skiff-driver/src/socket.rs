//! Non-blocking socket primitives.
//!
//! Thin layer over `mio` sockets that folds the `io::ErrorKind` zoo into the
//! three outcomes the connector cares about: bytes moved, try again later,
//! or the direction is finished. Anything else is a real error.

use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, ToSocketAddrs},
};

use mio::net::{TcpListener, TcpStream};

use crate::error::DriverError;

/// Well-known AMQP service ports, accepted in place of a numeric port.
const SERVICE_PORTS: &[(&str, u16)] = &[("amqp", 5672), ("amqps", 5671)];

/// Outcome of a single non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// This many bytes were read
    Data(usize),
    /// Nothing available right now
    WouldBlock,
    /// Peer shut down its sending side
    Closed,
}

/// Outcome of a single non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sent {
    /// This many bytes were written
    Bytes(usize),
    /// Socket buffer is full
    WouldBlock,
    /// Peer no longer accepts data
    Closed,
}

/// Resolve a host and a numeric or named port.
pub fn resolve(host: &str, port: &str) -> Result<SocketAddr, DriverError> {
    let invalid = |reason: String| DriverError::InvalidAddress {
        addr: format!("{host}:{port}"),
        reason,
    };

    let port = match port.parse::<u16>() {
        Ok(port) => port,
        Err(_) => SERVICE_PORTS
            .iter()
            .find(|(name, _)| *name == port)
            .map(|(_, number)| *number)
            .ok_or_else(|| invalid(format!("unknown port {port:?}")))?,
    };

    let host = if host.is_empty() { "0.0.0.0" } else { host };

    (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("no addresses".to_string()))
}

/// Bind a listening socket.
pub fn bind(addr: SocketAddr) -> Result<TcpListener, DriverError> {
    TcpListener::bind(addr).map_err(|source| DriverError::Bind { addr, source })
}

/// Start a non-blocking connect. Completion is signalled by writability.
pub fn connect(addr: SocketAddr) -> Result<TcpStream, DriverError> {
    let stream = TcpStream::connect(addr).map_err(|source| DriverError::Connect { addr, source })?;
    stream.set_nodelay(true).map_err(|source| DriverError::Connect { addr, source })?;
    Ok(stream)
}

/// Accept one pending connection. `None` if nothing is pending.
pub fn accept(listener: &TcpListener) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nodelay(true)?;
                return Ok(Some((stream, peer)));
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
}

/// Read once into `buf`.
pub fn recv(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<Received> {
    debug_assert!(!buf.is_empty());
    match stream.read(buf) {
        Ok(0) => Ok(Received::Closed),
        Ok(n) => Ok(Received::Data(n)),
        Err(e) if is_transient(&e) => Ok(Received::WouldBlock),
        Err(e) => Err(e),
    }
}

/// Write once from `buf`.
pub fn send(stream: &mut TcpStream, buf: &[u8]) -> io::Result<Sent> {
    debug_assert!(!buf.is_empty());
    match stream.write(buf) {
        Ok(0) => Ok(Sent::Closed),
        Ok(n) => Ok(Sent::Bytes(n)),
        Err(e) if is_transient(&e) => Ok(Sent::WouldBlock),
        Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(Sent::Closed),
        Err(e) => Err(e),
    }
}

/// Shut down one or both directions. Failure is logged, not returned: the
/// peer may already be gone.
pub fn shutdown(stream: &TcpStream, how: Shutdown) {
    if let Err(err) = stream.shutdown(how)
        && err.kind() != ErrorKind::NotConnected
    {
        tracing::debug!(?how, %err, "Socket shutdown failed");
    }
}

/// `WouldBlock` and `Interrupted` both mean "nothing happened, try again".
/// `NotConnected` shows up while an outbound connect is still in flight.
fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::NotConnected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_numeric_port() {
        let addr = resolve("127.0.0.1", "5672").unwrap();
        assert_eq!(addr, "127.0.0.1:5672".parse().unwrap());
    }

    #[test]
    fn resolve_service_name() {
        assert_eq!(resolve("127.0.0.1", "amqp").unwrap().port(), 5672);
        assert_eq!(resolve("127.0.0.1", "amqps").unwrap().port(), 5671);
    }

    #[test]
    fn resolve_empty_host_means_any() {
        let addr = resolve("", "0").unwrap();
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn resolve_rejects_unknown_port() {
        let err = resolve("127.0.0.1", "nope").unwrap_err();
        assert!(matches!(err, DriverError::InvalidAddress { .. }));
    }

    #[test]
    fn accept_without_pending_returns_none() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(accept(&listener).unwrap().is_none());
    }

    #[test]
    fn recv_on_idle_socket_would_block() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        let mut client = TcpStream::from_std(client);

        let mut buf = [0u8; 16];
        assert_eq!(recv(&mut client, &mut buf).unwrap(), Received::WouldBlock);
    }

    #[test]
    fn recv_reports_peer_shutdown() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.shutdown(Shutdown::Write).unwrap();

        let mut client = TcpStream::from_std(client);
        let mut buf = [0u8; 16];
        assert_eq!(recv(&mut client, &mut buf).unwrap(), Received::Closed);
    }
}
