//! Readiness loop.
//!
//! The [`Driver`] owns every listener and connector, registers their sockets
//! with one `mio::Poll`, and after each [`Driver::wait`] sorts them into two
//! queues of endpoints that have work to do. The application drains those
//! queues with [`Driver::next_pending_listener`] and
//! [`Driver::next_pending_connector`], calling [`Driver::accept`] and
//! [`Driver::process`] on what it gets back.
//!
//! # Readiness
//!
//! Sockets are registered once, readable and writable, edge-triggered. Each
//! endpoint keeps its own readiness flags which are only cleared when an I/O
//! attempt would block, so readiness is never lost between waits. Interest
//! is applied when partitioning: a connector with a closed read side or an
//! engine with no input capacity is not woken by readability, and
//! writability only matters while there is output to flush.
//!
//! # Waking
//!
//! [`DriverWaker`] is the only part of the driver that may cross threads. A
//! wake is sticky: if no wait is in progress, the next one returns at once.

use std::{
    collections::{BTreeMap, VecDeque},
    io::{self, ErrorKind},
    net::SocketAddr,
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, Waker, net::TcpStream};
use skiff_core::{Engine, Trace};

use crate::{
    config::DriverConfig,
    connector::{Connector, ConnectorId, Origin},
    error::{DriverError, ErrorCode},
    listener::{Listener, ListenerId},
    socket,
};

/// Token reserved for the wake channel. Endpoint ids start above it.
const WAKE_TOKEN: Token = Token(0);

/// Cross-thread handle that interrupts [`Driver::wait`].
#[derive(Debug, Clone)]
pub struct DriverWaker {
    inner: Arc<WakerInner>,
}

#[derive(Debug)]
struct WakerInner {
    waker: Waker,
    pending: AtomicBool,
}

impl DriverWaker {
    fn new(poll: &Poll) -> io::Result<Self> {
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self { inner: Arc::new(WakerInner { waker, pending: AtomicBool::new(false) }) })
    }

    /// Make the current or next wait return immediately. Repeated wakes
    /// before that wait collapse into one.
    ///
    /// # Errors
    ///
    /// The underlying wake channel failed.
    pub fn wake(&self) -> io::Result<()> {
        if self.inner.pending.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.waker.wake()
    }

    fn take(&self) -> bool {
        self.inner.pending.swap(false, Ordering::AcqRel)
    }
}

/// Owner of all endpoints and the readiness poll.
///
/// `E` is the engine type attached to connectors, `C` the application
/// context carried by listeners and connectors.
pub struct Driver<E: Engine, C = ()> {
    config: DriverConfig,
    poll: Poll,
    events: Events,
    waker: DriverWaker,
    listeners: BTreeMap<ListenerId, Listener<C>>,
    connectors: BTreeMap<ConnectorId, Connector<E, C>>,
    pending_listeners: VecDeque<ListenerId>,
    pending_connectors: VecDeque<ConnectorId>,
    next_id: usize,
    trace: Trace,
    last_error: Option<(ErrorCode, String)>,
}

impl<E: Engine, C> std::fmt::Debug for Driver<E, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("listeners", &self.listeners.len())
            .field("connectors", &self.connectors.len())
            .field("pending_listeners", &self.pending_listeners)
            .field("pending_connectors", &self.pending_connectors)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl<E: Engine, C> Driver<E, C> {
    /// Create a driver with its poll and wake channel.
    ///
    /// # Errors
    ///
    /// `Poll` if the OS poller or wake channel cannot be created.
    pub fn new(config: DriverConfig) -> Result<Self, DriverError> {
        let poll = Poll::new().map_err(DriverError::Poll)?;
        let waker = DriverWaker::new(&poll).map_err(DriverError::Poll)?;
        let events = Events::with_capacity(config.event_capacity.max(1));
        let trace = config.trace;

        Ok(Self {
            config,
            poll,
            events,
            waker,
            listeners: BTreeMap::new(),
            connectors: BTreeMap::new(),
            pending_listeners: VecDeque::new(),
            pending_connectors: VecDeque::new(),
            next_id: WAKE_TOKEN.0 + 1,
            trace,
            last_error: None,
        })
    }

    /// Bind a listener on `host:port`. `port` may be numeric or a service
    /// name (`amqp`, `amqps`).
    ///
    /// # Errors
    ///
    /// Resolution, bind or registration failure. Also recorded as the last
    /// error.
    pub fn listen(&mut self, host: &str, port: &str, context: C) -> Result<ListenerId, DriverError> {
        let result = socket::resolve(host, port)
            .and_then(socket::bind)
            .and_then(|listener| self.add_listener(listener, context));
        self.record(result)
    }

    /// Adopt an already bound listening socket.
    ///
    /// # Errors
    ///
    /// The socket cannot be made non-blocking or registered.
    pub fn listen_std(
        &mut self,
        listener: std::net::TcpListener,
        context: C,
    ) -> Result<ListenerId, DriverError> {
        let result = listener
            .set_nonblocking(true)
            .map_err(DriverError::Register)
            .and_then(|()| self.add_listener(mio::net::TcpListener::from_std(listener), context));
        self.record(result)
    }

    fn add_listener(
        &mut self,
        mut listener: mio::net::TcpListener,
        context: C,
    ) -> Result<ListenerId, DriverError> {
        let local_addr = listener.local_addr().map_err(DriverError::Register)?;
        let id = ListenerId::from_raw(self.allocate_id());
        self.poll
            .registry()
            .register(&mut listener, Token(id.as_usize()), Interest::READABLE)
            .map_err(DriverError::Register)?;

        tracing::info!(listener = %id, addr = %local_addr, "Listening");
        self.listeners.insert(id, Listener::new(id, listener, local_addr, context, self.trace));
        Ok(id)
    }

    /// Start an outbound connection. Completion is reported through the
    /// pending-connector queue like any other readiness.
    ///
    /// # Errors
    ///
    /// Resolution failure or an immediate connect/registration error. Also
    /// recorded as the last error.
    pub fn connect(
        &mut self,
        host: &str,
        port: &str,
        context: C,
    ) -> Result<ConnectorId, DriverError> {
        let result = socket::resolve(host, port).and_then(socket::connect).and_then(|stream| {
            let origin =
                Origin { host: host.to_string(), peer_addr: None, listener: None, connecting: true };
            self.add_connector(stream, origin, Some(context))
        });
        self.record(result)
    }

    /// Adopt an already connected stream.
    ///
    /// # Errors
    ///
    /// The socket cannot be made non-blocking or registered.
    pub fn connect_std(
        &mut self,
        stream: std::net::TcpStream,
        context: C,
    ) -> Result<ConnectorId, DriverError> {
        let peer_addr = stream.peer_addr().ok();
        let result = stream.set_nonblocking(true).map_err(DriverError::Register).and_then(|()| {
            let origin = Origin {
                host: peer_addr.map(|addr| addr.ip().to_string()).unwrap_or_default(),
                peer_addr,
                listener: None,
                connecting: false,
            };
            self.add_connector(TcpStream::from_std(stream), origin, Some(context))
        });
        self.record(result)
    }

    fn add_connector(
        &mut self,
        stream: TcpStream,
        origin: Origin,
        context: Option<C>,
    ) -> Result<ConnectorId, DriverError> {
        let id = ConnectorId::from_raw(self.allocate_id());
        let connector =
            Connector::new(id, stream, origin, context, self.trace, self.config.max_read_size);
        self.register_connector(connector)
    }

    fn register_connector(
        &mut self,
        mut connector: Connector<E, C>,
    ) -> Result<ConnectorId, DriverError> {
        let id = connector.id();
        connector.register(self.poll.registry(), Token(id.as_usize())).map_err(DriverError::Register)?;
        tracing::info!(
            connector = %id,
            peer = ?connector.peer_addr(),
            listener = ?connector.listener(),
            "Connector opened"
        );
        self.connectors.insert(id, connector);
        Ok(id)
    }

    /// Accept one pending connection on `listener`.
    ///
    /// The new connector inherits the listener's trace flags and server
    /// security. Returns `None` when nothing was pending or accepting failed;
    /// failures are recorded as the last error.
    pub fn accept(&mut self, listener: ListenerId) -> Option<ConnectorId> {
        let result = self.accept_one(listener);
        self.record(result).ok().flatten()
    }

    fn accept_one(&mut self, id: ListenerId) -> Result<Option<ConnectorId>, DriverError> {
        let listener = self.listeners.get_mut(&id).ok_or(DriverError::UnknownListener(id))?;
        let Some((stream, peer)) =
            listener.accept_stream().map_err(|source| DriverError::Accept { listener: id, source })?
        else {
            return Ok(None);
        };

        let security = listener.security().cloned();
        let allow_unsecured = listener.allows_unsecured_clients();
        let trace = listener.trace();

        let connector_id = ConnectorId::from_raw(self.allocate_id());
        let origin = Origin {
            host: peer.ip().to_string(),
            peer_addr: Some(peer),
            listener: Some(id),
            connecting: false,
        };
        let mut connector =
            Connector::new(connector_id, stream, origin, None, trace, self.config.max_read_size);
        if let Some(security) = security {
            connector = connector.with_server_security(security, allow_unsecured)?;
        }

        self.register_connector(connector).map(Some)
    }

    /// Run one I/O pass on a connector.
    ///
    /// # Errors
    ///
    /// `UnknownConnector` for a stale handle.
    ///
    /// # Panics
    ///
    /// If the connector is already closed.
    pub fn process(&mut self, id: ConnectorId) -> Result<(), DriverError> {
        let connector = self.connectors.get_mut(&id).ok_or(DriverError::UnknownConnector(id))?;
        connector.process(Instant::now());
        if connector.is_closed() {
            connector.release_socket(self.poll.registry());
        }
        Ok(())
    }

    /// Block until an endpoint has work, a wake arrives, the nearest engine
    /// deadline passes, or `timeout` elapses (`None` waits indefinitely),
    /// then rebuild the pending queues.
    ///
    /// # Errors
    ///
    /// `Poll` if the OS poller fails. Per-socket errors never end up here.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<(), DriverError> {
        let woken = self.waker.take();
        let now = Instant::now();

        let mut timeout = timeout;
        if let Some(deadline) = self.next_deadline() {
            let until = deadline.saturating_duration_since(now);
            timeout = Some(timeout.map_or(until, |t| t.min(until)));
        }
        if woken || self.any_actionable(now) {
            timeout = Some(Duration::ZERO);
        }

        if self.trace.driver() {
            tracing::debug!(?timeout, woken, "Waiting");
        }

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {},
            Err(err) if err.kind() == ErrorKind::Interrupted => {},
            Err(err) => return Err(DriverError::Poll(err)),
        }

        for event in &self.events {
            let token = event.token();
            if token == WAKE_TOKEN {
                self.waker.take();
                continue;
            }

            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed() || event.is_error();

            if let Some(listener) = self.listeners.get_mut(&ListenerId::from_raw(token.0)) {
                listener.readable |= readable;
            } else if let Some(connector) = self.connectors.get_mut(&ConnectorId::from_raw(token.0))
            {
                connector.readable |= readable;
                connector.writable |= writable;
            }
        }

        self.partition(Instant::now());
        Ok(())
    }

    /// Interrupt a wait from this thread. See [`DriverWaker::wake`].
    ///
    /// # Errors
    ///
    /// The wake channel failed.
    pub fn wakeup(&self) -> Result<(), DriverError> {
        self.waker.wake().map_err(DriverError::Poll)
    }

    /// Handle for waking this driver from another thread.
    pub fn waker(&self) -> DriverWaker {
        self.waker.clone()
    }

    /// Next listener with a pending connection, in insertion order.
    pub fn next_pending_listener(&mut self) -> Option<ListenerId> {
        while let Some(id) = self.pending_listeners.pop_front() {
            if self.listeners.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Next connector with work to do or a closure to report, in insertion
    /// order.
    ///
    /// A closed connector is reported once and must not be passed to
    /// [`Driver::process`]: check [`Connector::is_closed`] and release it
    /// with [`Driver::free_connector`] instead.
    pub fn next_pending_connector(&mut self) -> Option<ConnectorId> {
        while let Some(id) = self.pending_connectors.pop_front() {
            if self.connectors.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn partition(&mut self, now: Instant) {
        self.pending_listeners.clear();
        self.pending_connectors.clear();

        for (id, listener) in &self.listeners {
            if listener.is_pending() {
                self.pending_listeners.push_back(*id);
            }
        }

        for (id, connector) in &mut self.connectors {
            let pending = if connector.is_closed() {
                connector.take_closed_event()
            } else {
                connector.is_actionable(now)
            };
            if pending {
                self.pending_connectors.push_back(*id);
            }
        }

        if self.trace.driver() {
            tracing::debug!(
                listeners = self.pending_listeners.len(),
                connectors = self.pending_connectors.len(),
                "Pending work"
            );
        }
    }

    fn any_actionable(&mut self, now: Instant) -> bool {
        self.listeners.values().any(Listener::is_pending)
            || self.connectors.values_mut().any(|connector| connector.is_actionable(now))
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.connectors.values().filter_map(Connector::next_tick).min()
    }

    /// Close a listener's socket. The listener stays until freed.
    pub fn close_listener(&mut self, id: ListenerId) -> Result<(), DriverError> {
        let listener = self.listeners.get_mut(&id).ok_or(DriverError::UnknownListener(id))?;
        if listener.close(self.poll.registry()) {
            tracing::info!(listener = %id, "Listener closed");
        }
        Ok(())
    }

    /// Remove a closed listener, handing back its context.
    ///
    /// # Panics
    ///
    /// If the listener is still open.
    pub fn free_listener(&mut self, id: ListenerId) -> Option<C> {
        let listener = self.listeners.get(&id)?;
        assert!(listener.is_closed(), "free of open {id}");
        self.listeners.remove(&id).map(Listener::into_context)
    }

    /// Close both sides of a connector now, discarding unwritten output.
    /// An explicit close is not reported through the pending queue.
    pub fn close_connector(&mut self, id: ConnectorId) -> Result<(), DriverError> {
        let connector = self.connectors.get_mut(&id).ok_or(DriverError::UnknownConnector(id))?;
        if connector.close() {
            tracing::info!(connector = %id, "Connector closed");
        }
        connector.take_closed_event();
        connector.release_socket(self.poll.registry());
        Ok(())
    }

    /// Remove a closed connector, handing it back with its engine and
    /// context.
    ///
    /// # Panics
    ///
    /// If the connector is still open.
    pub fn free_connector(&mut self, id: ConnectorId) -> Option<Connector<E, C>> {
        let connector = self.connectors.get(&id)?;
        assert!(connector.is_closed(), "free of open {id}");
        self.connectors.remove(&id)
    }

    /// Default trace flags for endpoints created from now on.
    pub fn set_trace(&mut self, trace: Trace) {
        self.trace = trace;
    }

    /// Trace flags given to new endpoints.
    pub fn trace(&self) -> Trace {
        self.trace
    }

    /// Classification of the last construction error.
    pub fn error_code(&self) -> ErrorCode {
        self.last_error.as_ref().map_or(ErrorCode::Ok, |(code, _)| *code)
    }

    /// Message of the last construction error; empty if none.
    pub fn error_text(&self) -> &str {
        self.last_error.as_ref().map_or("", |(_, text)| text.as_str())
    }

    /// Bound address of a listener.
    pub fn local_addr(&self, id: ListenerId) -> Option<SocketAddr> {
        self.listeners.get(&id).map(Listener::local_addr)
    }

    /// Listener by handle.
    pub fn listener(&self, id: ListenerId) -> Option<&Listener<C>> {
        self.listeners.get(&id)
    }

    /// Mutable listener by handle.
    pub fn listener_mut(&mut self, id: ListenerId) -> Option<&mut Listener<C>> {
        self.listeners.get_mut(&id)
    }

    /// Connector by handle.
    pub fn connector(&self, id: ConnectorId) -> Option<&Connector<E, C>> {
        self.connectors.get(&id)
    }

    /// Mutable connector by handle.
    pub fn connector_mut(&mut self, id: ConnectorId) -> Option<&mut Connector<E, C>> {
        self.connectors.get_mut(&id)
    }

    /// All listeners in insertion order.
    pub fn listeners(&self) -> impl Iterator<Item = (ListenerId, &Listener<C>)> {
        self.listeners.iter().map(|(id, listener)| (*id, listener))
    }

    /// All connectors in insertion order.
    pub fn connectors(&self) -> impl Iterator<Item = (ConnectorId, &Connector<E, C>)> {
        self.connectors.iter().map(|(id, connector)| (*id, connector))
    }

    /// First listener.
    pub fn listener_head(&self) -> Option<ListenerId> {
        self.listeners.keys().next().copied()
    }

    /// Listener after `id`. Works even if `id` has since been freed.
    pub fn listener_next(&self, id: ListenerId) -> Option<ListenerId> {
        self.listeners.range((Bound::Excluded(id), Bound::Unbounded)).next().map(|(id, _)| *id)
    }

    /// First connector.
    pub fn connector_head(&self) -> Option<ConnectorId> {
        self.connectors.keys().next().copied()
    }

    /// Connector after `id`. Works even if `id` has since been freed.
    pub fn connector_next(&self, id: ConnectorId) -> Option<ConnectorId> {
        self.connectors.range((Bound::Excluded(id), Bound::Unbounded)).next().map(|(id, _)| *id)
    }

    fn allocate_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record<T>(&mut self, result: Result<T, DriverError>) -> Result<T, DriverError> {
        if let Err(err) = &result {
            tracing::warn!(error = %err, "Driver operation failed");
            self.last_error = Some((err.code(), err.to_string()));
        }
        result
    }
}
