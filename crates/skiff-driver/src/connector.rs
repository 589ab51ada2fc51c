//! Per-connection I/O pump.
//!
//! A [`Connector`] owns one socket and moves bytes between it, the optional
//! security sublayer and the protocol engine. Each call to
//! [`Connector::process`] runs one pass:
//!
//! 1. finish an outbound connect if one is in flight
//! 2. one socket read, then hand buffered input to the engine
//! 3. fire the engine's timer if it is due
//! 4. one socket write, then shut down the write side if the engine is done
//!
//! Every pass does at most one non-blocking read and one non-blocking write,
//! so a slow peer never holds up the driver.

use std::{
    fmt, io,
    net::{Shutdown, SocketAddr},
    path::Path,
    sync::Arc,
    time::Instant,
};

use bytes::{Buf, BytesMut};
use mio::{Interest, Registry, Token, net::TcpStream};
use skiff_core::{CloseReason, ConnectorState, Engine, Side, StateError, Trace};

use crate::{
    error::SecurityError,
    listener::ListenerId,
    security::SecurityLayer,
    socket::{self, Received, Sent},
    tls_config::{ClientSecurity, ClientSecurityConfig, ServerSecurity},
};

/// Handle for a connector owned by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectorId(usize);

impl ConnectorId {
    pub(crate) fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw numeric value, unique among all endpoints of one driver.
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connector-{}", self.0)
    }
}

/// Where a new connector comes from.
pub(crate) struct Origin {
    pub host: String,
    pub peer_addr: Option<SocketAddr>,
    pub listener: Option<ListenerId>,
    /// Outbound connect still in flight
    pub connecting: bool,
}

/// One connection: socket, optional security sublayer, engine and state.
pub struct Connector<E, C> {
    id: ConnectorId,
    socket: Option<TcpStream>,
    peer_addr: Option<SocketAddr>,
    host: String,
    listener: Option<ListenerId>,
    connection: Option<E>,
    context: Option<C>,
    security: Option<SecurityLayer>,
    /// Listener material, kept so client auth can be required later
    server_security: Option<Arc<ServerSecurity>>,
    state: ConnectorState,
    trace: Trace,
    connecting: bool,
    /// Readiness reported and not yet used up by a would-block
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    /// Received plaintext not yet taken by the engine (unsecured only)
    input: BytesMut,
    scratch: Vec<u8>,
    /// Last delivery moved bytes and more are buffered
    input_progress: bool,
    input_closed_sent: bool,
    close_requested: bool,
    /// A byte has crossed the socket; security can no longer be changed
    io_started: bool,
    max_read_size: usize,
}

impl<E, C> fmt::Debug for Connector<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("listener", &self.listener)
            .field("state", &self.state)
            .field("security", &self.security)
            .field("connecting", &self.connecting)
            .finish_non_exhaustive()
    }
}

impl<E: Engine, C> Connector<E, C> {
    pub(crate) fn new(
        id: ConnectorId,
        socket: TcpStream,
        origin: Origin,
        context: Option<C>,
        trace: Trace,
        max_read_size: usize,
    ) -> Self {
        Self {
            id,
            socket: Some(socket),
            peer_addr: origin.peer_addr,
            host: origin.host,
            listener: origin.listener,
            connection: None,
            context,
            security: None,
            server_security: None,
            state: ConnectorState::new(),
            trace,
            connecting: origin.connecting,
            readable: false,
            writable: false,
            input: BytesMut::new(),
            scratch: Vec::new(),
            input_progress: false,
            input_closed_sent: false,
            close_requested: false,
            io_started: false,
            max_read_size,
        }
    }

    pub(crate) fn with_server_security(
        mut self,
        security: Arc<ServerSecurity>,
        allow_unsecured: bool,
    ) -> Result<Self, SecurityError> {
        self.security = Some(SecurityLayer::server(&security, allow_unsecured)?);
        self.server_security = Some(security);
        Ok(self)
    }

    /// Handle of this connector.
    pub fn id(&self) -> ConnectorId {
        self.id
    }

    /// Attached engine connection.
    pub fn connection(&self) -> Option<&E> {
        self.connection.as_ref()
    }

    /// Mutable engine connection.
    pub fn connection_mut(&mut self) -> Option<&mut E> {
        self.connection.as_mut()
    }

    /// Attach an engine connection, returning the previous one.
    pub fn set_connection(&mut self, connection: E) -> Option<E> {
        self.connection.replace(connection)
    }

    /// Detach the engine connection.
    pub fn take_connection(&mut self) -> Option<E> {
        self.connection.take()
    }

    /// Application context.
    pub fn context(&self) -> Option<&C> {
        self.context.as_ref()
    }

    /// Mutable application context.
    pub fn context_mut(&mut self) -> Option<&mut C> {
        self.context.as_mut()
    }

    /// Replace the application context, returning the old one.
    pub fn set_context(&mut self, context: C) -> Option<C> {
        self.context.replace(context)
    }

    /// Listener this connector was accepted from; `None` for outbound.
    pub fn listener(&self) -> Option<ListenerId> {
        self.listener
    }

    /// Security sublayer, if the connection is secured or being sniffed.
    pub fn security(&self) -> Option<&SecurityLayer> {
        self.security.as_ref()
    }

    /// Read/write state.
    pub fn state(&self) -> &ConnectorState {
        &self.state
    }

    /// Neither side is open. A closed connector is never serviced again.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// First reason recorded for closing either side.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.state.reason()
    }

    /// Remote address, once known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Trace flags.
    pub fn trace(&self) -> Trace {
        self.trace
    }

    /// Change the trace flags.
    pub fn set_trace(&mut self, trace: Trace) {
        self.trace = trace;
    }

    /// Shut down the write side once all output is flushed.
    ///
    /// # Errors
    ///
    /// `WriteNotOpen` if the write side already finished.
    pub fn request_close(&mut self) -> Result<(), StateError> {
        self.state.require_write_open()?;
        self.close_requested = true;
        Ok(())
    }

    /// Secure an outbound connection. Must be called before any byte has
    /// crossed the socket.
    ///
    /// # Errors
    ///
    /// Unloadable security material, an invalid server name, or I/O that
    /// already started.
    pub fn configure_client_security(
        &mut self,
        config: &ClientSecurityConfig,
    ) -> Result<(), SecurityError> {
        let security = ClientSecurity::load(config)?;
        self.set_client_security(&security)
    }

    /// Secure an outbound connection with already loaded material.
    ///
    /// # Errors
    ///
    /// See [`Self::configure_client_security`].
    pub fn set_client_security(&mut self, security: &ClientSecurity) -> Result<(), SecurityError> {
        if self.listener.is_some() {
            return Err(SecurityError::WrongRole("client"));
        }
        if self.io_started || self.security.is_some() {
            return Err(SecurityError::AlreadyStarted);
        }
        self.security = Some(SecurityLayer::client(security, &self.host)?);
        if self.trace.driver() {
            tracing::debug!(connector = %self.id, host = %self.host, "Client security configured");
        }
        Ok(())
    }

    /// Require a trusted client certificate on an accepted connection.
    ///
    /// # Errors
    ///
    /// - `WrongRole` for outbound or unsecured connectors
    /// - `AlreadyStarted` once negotiation has seen any byte
    /// - load failures for `trusted_cas_file`
    pub fn require_client_auth(&mut self, trusted_cas_file: &Path) -> Result<(), SecurityError> {
        let (Some(server), Some(layer)) = (&self.server_security, &mut self.security) else {
            return Err(SecurityError::WrongRole("server"));
        };
        let config = server.with_client_auth(trusted_cas_file)?;
        layer.require_client_auth(config)
    }

    /// Run one I/O pass.
    ///
    /// # Panics
    ///
    /// If the connector is already closed.
    pub(crate) fn process(&mut self, now: Instant) {
        assert!(!self.state.is_closed(), "process called on closed {}", self.id);

        if !self.connecting || self.finish_connect() {
            self.pump_input();
            self.pump_tick(now);
            self.pump_output();
        }

        if self.state.is_closed() {
            tracing::info!(
                connector = %self.id,
                reason = %self.close_reason().map_or_else(String::new, ToString::to_string),
                "Connector closed"
            );
        }
    }

    /// Something for [`Self::process`] to do, or a closure to report.
    pub(crate) fn is_actionable(&mut self, now: Instant) -> bool {
        if self.state.is_closed() {
            return !self.state.closed_reported();
        }
        if self.connecting {
            return self.readable || self.writable;
        }

        let wants_read = self.readable && self.state.read().is_open() && self.read_size() > 0;
        let tick_due = self
            .connection
            .as_ref()
            .and_then(Engine::next_tick)
            .is_some_and(|deadline| deadline <= now);

        let write = self.state.write().is_open();
        let flush = write && self.writable && self.has_output();
        let shutdown = write && self.wants_close() && self.output_drained();

        wants_read || self.input_progress || tick_due || flush || shutdown
    }

    /// Earliest engine deadline, if any.
    pub(crate) fn next_tick(&self) -> Option<Instant> {
        if self.state.is_closed() {
            return None;
        }
        self.connection.as_ref().and_then(Engine::next_tick)
    }

    /// Consume the one-shot closure report.
    pub(crate) fn take_closed_event(&mut self) -> bool {
        self.state.take_closed_event()
    }

    /// Close both sides at once, discarding unwritten output.
    pub(crate) fn close(&mut self) -> bool {
        let changed = self.state.close(CloseReason::Local);
        if let Some(socket) = &self.socket {
            socket::shutdown(socket, Shutdown::Both);
        }
        changed
    }

    /// Deregister and drop the socket of a closed connector.
    pub(crate) fn release_socket(&mut self, registry: &Registry) {
        debug_assert!(self.state.is_closed());
        if let Some(mut socket) = self.socket.take()
            && let Err(err) = registry.deregister(&mut socket)
        {
            tracing::debug!(connector = %self.id, %err, "Deregister failed");
        }
        self.readable = false;
        self.writable = false;
    }

    /// Register the socket for both directions, edge-triggered.
    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        match self.socket.as_mut() {
            Some(socket) => registry.register(socket, token, Interest::READABLE | Interest::WRITABLE),
            None => Ok(()),
        }
    }

    fn finish_connect(&mut self) -> bool {
        let Some(stream) = &self.socket else {
            return false;
        };

        match stream.take_error() {
            Ok(None) => {},
            Ok(Some(err)) | Err(err) => {
                self.fail(CloseReason::ConnectFailed(err.to_string()));
                return false;
            },
        }

        match stream.peer_addr() {
            Ok(addr) => {
                self.connecting = false;
                self.peer_addr = Some(addr);
                tracing::info!(connector = %self.id, peer = %addr, "Connected");
                true
            },
            Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                self.readable = false;
                self.writable = false;
                false
            },
            Err(err) => {
                self.fail(CloseReason::ConnectFailed(err.to_string()));
                false
            },
        }
    }

    /// Bytes to ask the socket for on the next read.
    fn read_size(&self) -> usize {
        let Some(engine) = &self.connection else {
            return 0;
        };
        let capacity = engine.capacity();
        match &self.security {
            Some(layer) if layer.application_input().len() < capacity => self.max_read_size,
            Some(_) => 0,
            None => capacity.saturating_sub(self.input.len()).min(self.max_read_size),
        }
    }

    fn pump_input(&mut self) {
        if self.readable && self.state.read().is_open() {
            let size = self.read_size();
            if size > 0 {
                self.read_socket(size);
            }
        }

        self.deliver_input();

        let drained = match &self.security {
            Some(layer) => layer.application_input().is_empty(),
            None => self.input.is_empty(),
        };
        if self.state.read() == Side::HalfClosed
            && drained
            && !self.input_closed_sent
            && let Some(engine) = self.connection.as_mut()
        {
            engine.input_closed();
            self.input_closed_sent = true;
        }
    }

    fn read_socket(&mut self, size: usize) {
        let Some(stream) = self.socket.as_mut() else {
            return;
        };
        if self.scratch.len() < size {
            self.scratch.resize(size, 0);
        }

        match socket::recv(stream, &mut self.scratch[..size]) {
            Ok(Received::Data(n)) => {
                self.io_started = true;
                trace_bytes(self.trace, self.id, "recv", &self.scratch[..n]);
                match &mut self.security {
                    Some(layer) => {
                        if let Err(err) = layer.feed_input(&self.scratch[..n]) {
                            self.flush_alert();
                            self.fail(CloseReason::Security(err.to_string()));
                        } else if layer.peer_closed() {
                            self.close_read(CloseReason::PeerClosed);
                        }
                    },
                    None => self.input.extend_from_slice(&self.scratch[..n]),
                }
            },
            Ok(Received::WouldBlock) => self.readable = false,
            Ok(Received::Closed) => {
                self.readable = false;
                let finished = self.security.as_mut().map_or(Ok(()), SecurityLayer::finish_input);
                match finished {
                    Ok(()) => self.close_read(CloseReason::PeerClosed),
                    Err(err) => self.fail(CloseReason::Security(err.to_string())),
                }
            },
            Err(err) => self.fail(CloseReason::Io(err.to_string())),
        }
    }

    /// Best-effort send of the alert rustls queues after a failed
    /// negotiation, so the peer learns why it is being dropped.
    fn flush_alert(&mut self) {
        let (Some(stream), Some(layer)) = (self.socket.as_mut(), self.security.as_mut()) else {
            return;
        };
        let alert = layer.pending_output();
        if alert.is_empty() {
            return;
        }
        if let Err(err) = socket::send(stream, alert) {
            tracing::debug!(connector = %self.id, %err, "Alert not sent");
        }
    }

    fn deliver_input(&mut self) {
        self.input_progress = false;
        let Some(engine) = self.connection.as_mut() else {
            return;
        };
        if self.state.read() == Side::Errored {
            return;
        }

        let pending: &[u8] = match &self.security {
            Some(layer) => layer.application_input(),
            None => &self.input,
        };
        if pending.is_empty() {
            return;
        }
        let offered = pending.len();

        match engine.input(pending) {
            Ok(consumed) => {
                let consumed = consumed.min(offered);
                match &mut self.security {
                    Some(layer) => layer.consume_application_input(consumed),
                    None => self.input.advance(consumed),
                }
                self.input_progress = consumed > 0 && consumed < offered;
            },
            Err(err) => self.fail(CloseReason::Engine(err.to_string())),
        }
    }

    fn pump_tick(&mut self, now: Instant) {
        if self.state.is_closed() {
            return;
        }
        let Some(engine) = self.connection.as_mut() else {
            return;
        };
        if engine.next_tick().is_some_and(|deadline| deadline <= now) {
            if self.trace.driver() {
                tracing::debug!(connector = %self.id, "Tick");
            }
            engine.tick(now);
        }
    }

    fn pump_output(&mut self) {
        if !self.state.write().is_open() {
            return;
        }

        if let (Some(layer), Some(engine)) = (&mut self.security, &mut self.connection) {
            let out = engine.pending_output();
            if !out.is_empty() {
                match layer.application_output(out) {
                    Ok(taken) => engine.output_consumed(taken),
                    Err(err) => {
                        self.fail(CloseReason::Security(err.to_string()));
                        return;
                    },
                }
            }
        }

        if self.writable {
            self.write_socket();
        }

        if self.state.write().is_open() && self.wants_close() {
            self.shutdown_output();
        }
    }

    fn write_socket(&mut self) {
        let Some(stream) = self.socket.as_mut() else {
            return;
        };

        let result = match (&mut self.security, &mut self.connection) {
            (Some(layer), _) => send_from(stream, self.trace, self.id, layer.pending_output()),
            (None, Some(engine)) => send_from(stream, self.trace, self.id, engine.pending_output()),
            (None, None) => return,
        };

        match result {
            None => {},
            Some(Ok(Sent::Bytes(n))) => {
                self.io_started = true;
                match (&mut self.security, &mut self.connection) {
                    (Some(layer), _) => layer.output_written(n),
                    (None, Some(engine)) => engine.output_consumed(n),
                    (None, None) => {},
                }
            },
            Some(Ok(Sent::WouldBlock)) => self.writable = false,
            Some(Ok(Sent::Closed)) => {
                self.writable = false;
                self.close_write(CloseReason::PeerClosed);
            },
            Some(Err(err)) => self.fail(CloseReason::Io(err.to_string())),
        }
    }

    /// Engine output drained: send close_notify when secured, then shut down
    /// the write half once nothing is left to flush.
    fn shutdown_output(&mut self) {
        if !self.connection.as_mut().is_none_or(|engine| engine.pending_output().is_empty()) {
            return;
        }

        if let Some(layer) = &mut self.security {
            if !layer.close_sent() {
                layer.close_output();
            }
            if layer.wants_output() {
                return;
            }
        }

        if let Some(stream) = &self.socket {
            socket::shutdown(stream, Shutdown::Write);
        }
        self.close_write(CloseReason::Local);
    }

    fn wants_close(&self) -> bool {
        self.close_requested || self.connection.as_ref().is_some_and(Engine::wants_close)
    }

    /// Anything that one more write could move.
    fn has_output(&mut self) -> bool {
        let engine_output = self
            .connection
            .as_mut()
            .is_some_and(|engine| !engine.pending_output().is_empty());
        match &self.security {
            Some(layer) => {
                layer.wants_output()
                    || (engine_output && layer.handshake_complete() && !layer.close_sent())
            },
            None => engine_output,
        }
    }

    /// Neither the engine nor the sublayer holds bytes for the socket.
    fn output_drained(&mut self) -> bool {
        let engine_drained =
            self.connection.as_mut().is_none_or(|engine| engine.pending_output().is_empty());
        engine_drained && self.security.as_ref().is_none_or(|layer| !layer.wants_output())
    }

    fn close_read(&mut self, reason: CloseReason) {
        if self.state.close_read(reason) && self.trace.driver() {
            tracing::debug!(connector = %self.id, "Read side closed");
        }
    }

    fn close_write(&mut self, reason: CloseReason) {
        if self.state.close_write(reason) && self.trace.driver() {
            tracing::debug!(connector = %self.id, "Write side closed");
        }
    }

    fn fail(&mut self, reason: CloseReason) {
        tracing::warn!(connector = %self.id, peer = ?self.peer_addr, %reason, "Connector failed");
        self.state.fail(reason);
        self.readable = false;
        self.writable = false;
    }
}

/// One socket write from `buf`; `None` when there is nothing to send.
fn send_from(
    stream: &mut TcpStream,
    trace: Trace,
    id: ConnectorId,
    buf: &[u8],
) -> Option<io::Result<Sent>> {
    if buf.is_empty() {
        return None;
    }
    let result = socket::send(stream, buf);
    if let Ok(Sent::Bytes(n)) = result {
        trace_bytes(trace, id, "send", &buf[..n]);
    }
    Some(result)
}

fn trace_bytes(trace: Trace, id: ConnectorId, direction: &'static str, bytes: &[u8]) {
    if trace.raw() {
        tracing::trace!(connector = %id, direction, len = bytes.len(), bytes = ?bytes, "Raw bytes");
    }
}
