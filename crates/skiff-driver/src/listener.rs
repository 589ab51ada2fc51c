//! Listening endpoints.

use std::{fmt, io, net::SocketAddr, sync::Arc};

use mio::{
    Registry,
    net::{TcpListener, TcpStream},
};
use skiff_core::Trace;

use crate::{
    error::SecurityError,
    socket,
    tls_config::{ServerSecurity, ServerSecurityConfig},
};

/// Handle for a listener owned by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(usize);

impl ListenerId {
    pub(crate) fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw numeric value, unique among all endpoints of one driver.
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A listening socket and the settings handed to every connection it
/// accepts.
pub struct Listener<C> {
    id: ListenerId,
    socket: Option<TcpListener>,
    local_addr: SocketAddr,
    context: C,
    trace: Trace,
    security: Option<Arc<ServerSecurity>>,
    allow_unsecured: bool,
    /// Readiness reported and not yet drained by an accept
    pub(crate) readable: bool,
}

impl<C> fmt::Debug for Listener<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .field("secured", &self.security.is_some())
            .field("allow_unsecured", &self.allow_unsecured)
            .finish_non_exhaustive()
    }
}

impl<C> Listener<C> {
    pub(crate) fn new(
        id: ListenerId,
        socket: TcpListener,
        local_addr: SocketAddr,
        context: C,
        trace: Trace,
    ) -> Self {
        Self {
            id,
            socket: Some(socket),
            local_addr,
            context,
            trace,
            security: None,
            allow_unsecured: false,
            readable: false,
        }
    }

    /// Handle of this listener.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Application context.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Mutable application context.
    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Replace the application context, returning the old one.
    pub fn set_context(&mut self, context: C) -> C {
        std::mem::replace(&mut self.context, context)
    }

    /// Trace flags, inherited by accepted connectors.
    pub fn trace(&self) -> Trace {
        self.trace
    }

    /// Change the trace flags for connectors accepted from now on.
    pub fn set_trace(&mut self, trace: Trace) {
        self.trace = trace;
    }

    /// Socket has been closed; the listener only waits to be freed.
    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Load server security material; every connection accepted afterwards
    /// negotiates TLS.
    ///
    /// # Errors
    ///
    /// Certificate, key or trusted-CA files that cannot be loaded.
    pub fn configure_security(&mut self, config: &ServerSecurityConfig) -> Result<(), SecurityError> {
        let security = ServerSecurity::load(config)?;
        self.security = Some(Arc::new(security));
        self.allow_unsecured = config.allow_unsecured_clients;
        if self.trace.driver() {
            tracing::debug!(
                listener = %self.id,
                allow_unsecured = self.allow_unsecured,
                "Server security configured"
            );
        }
        Ok(())
    }

    /// Use already loaded security material.
    pub fn set_security(&mut self, security: Arc<ServerSecurity>) {
        self.security = Some(security);
    }

    /// Server security applied to accepted connections, if any.
    pub fn security(&self) -> Option<&Arc<ServerSecurity>> {
        self.security.as_ref()
    }

    /// Let clients that do not start a TLS handshake through in plaintext.
    /// Without security configured every client is plaintext anyway.
    pub fn allow_unsecured_clients(&mut self) {
        self.allow_unsecured = true;
    }

    /// Whether unsecured clients are let through.
    pub fn allows_unsecured_clients(&self) -> bool {
        self.allow_unsecured
    }

    pub(crate) fn into_context(self) -> C {
        self.context
    }

    /// A connection may be waiting to be accepted.
    pub(crate) fn is_pending(&self) -> bool {
        self.readable && self.socket.is_some()
    }

    /// Accept one pending connection. Clears readiness once the backlog is
    /// drained.
    pub(crate) fn accept_stream(&mut self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        let Some(listener) = &self.socket else {
            return Ok(None);
        };
        let accepted = socket::accept(listener);
        if !matches!(accepted, Ok(Some(_))) {
            self.readable = false;
        }
        accepted
    }

    /// Deregister and drop the socket. Returns false if already closed.
    pub(crate) fn close(&mut self, registry: &Registry) -> bool {
        let Some(mut listener) = self.socket.take() else {
            return false;
        };
        if let Err(err) = registry.deregister(&mut listener) {
            tracing::debug!(listener = %self.id, %err, "Deregister failed");
        }
        self.readable = false;
        true
    }
}
