//! Per-connection security sublayer.
//!
//! Sits between the socket and the engine. Ciphertext from the socket goes
//! in through [`SecurityLayer::feed_input`], plaintext for the engine comes
//! out of [`SecurityLayer::application_input`]; in the other direction the
//! engine's bytes go in through [`SecurityLayer::application_output`] and
//! ciphertext for the socket comes out of [`SecurityLayer::pending_output`].
//!
//! A server that accepts unsecured clients starts in a detecting state and
//! decides from the first bytes on the wire whether the peer speaks TLS. No
//! byte reaches the engine before that decision is made.

use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use bytes::{Buf, BytesMut};
use rustls::{
    ClientConnection, IoState, ServerConfig, ServerConnection, pki_types::ServerName,
};

use crate::{
    error::SecurityError,
    tls_config::{ClientSecurity, ServerSecurity},
};

/// Upper bound on ciphertext buffered for the socket before the engine's
/// output is left in the engine.
const OUTPUT_HIGH_WATER: usize = 64 * 1024;

/// TLS record content type for handshake messages.
const TLS_HANDSHAKE: u8 = 0x16;

/// Major version byte shared by SSL 3.0 and every TLS version.
const TLS_MAJOR_VERSION: u8 = 0x03;

/// What the first bytes of an inbound connection look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prelude {
    /// A TLS handshake record
    Tls,
    /// Anything else
    Plain,
}

impl Prelude {
    /// Bytes needed before a decision is made.
    pub const LEN: usize = 2;

    /// Classify the start of a stream. `None` means more bytes are needed;
    /// once `eof` is set a decision is always returned.
    pub fn detect(bytes: &[u8], eof: bool) -> Option<Self> {
        match bytes {
            [TLS_HANDSHAKE, TLS_MAJOR_VERSION, ..] => Some(Self::Tls),
            [_, _, ..] => Some(Self::Plain),
            [TLS_HANDSHAKE] if eof => Some(Self::Tls),
            _ if eof => Some(Self::Plain),
            _ => None,
        }
    }
}

/// Either side of a rustls connection.
enum TlsConnection {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsConnection {
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            Self::Server(conn) => conn.read_tls(rd),
            Self::Client(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            Self::Server(conn) => conn.write_tls(wr),
            Self::Client(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<IoState, rustls::Error> {
        match self {
            Self::Server(conn) => conn.process_new_packets(),
            Self::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Server(conn) => conn.wants_write(),
            Self::Client(conn) => conn.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Self::Server(conn) => conn.is_handshaking(),
            Self::Client(conn) => conn.is_handshaking(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Self::Server(conn) => conn.writer(),
            Self::Client(conn) => conn.writer(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Self::Server(conn) => conn.reader(),
            Self::Client(conn) => conn.reader(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Self::Server(conn) => conn.send_close_notify(),
            Self::Client(conn) => conn.send_close_notify(),
        }
    }

    fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        match self {
            Self::Server(conn) => conn.protocol_version(),
            Self::Client(conn) => conn.protocol_version(),
        }
    }

    fn cipher_suite(&self) -> Option<rustls::SupportedCipherSuite> {
        match self {
            Self::Server(conn) => conn.negotiated_cipher_suite(),
            Self::Client(conn) => conn.negotiated_cipher_suite(),
        }
    }

    fn has_peer_certificate(&self) -> bool {
        let certs = match self {
            Self::Server(conn) => conn.peer_certificates(),
            Self::Client(conn) => conn.peer_certificates(),
        };
        certs.is_some_and(|certs| !certs.is_empty())
    }
}

enum Mode {
    /// Server waiting for enough bytes to tell TLS from plaintext
    Detecting { config: Arc<ServerConfig>, prelude: Vec<u8> },
    /// Negotiating or negotiated TLS
    Tls(Box<TlsConnection>),
    /// Unsecured client let through by the sniffer
    Plain,
}

/// Security filter for one connection.
pub struct SecurityLayer {
    mode: Mode,
    /// Decrypted (or sniffed plaintext) bytes not yet taken by the engine
    app_in: BytesMut,
    /// Bytes waiting for the socket
    out: Vec<u8>,
    /// Any input seen; negotiation parameters are frozen after this
    started: bool,
    /// Peer finished sending (close_notify or end of stream)
    peer_closed: bool,
    /// Local close requested; no further application output is taken
    close_sent: bool,
}

impl std::fmt::Debug for SecurityLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.mode {
            Mode::Detecting { .. } => "detecting",
            Mode::Tls(_) => "tls",
            Mode::Plain => "plain",
        };
        f.debug_struct("SecurityLayer")
            .field("mode", &mode)
            .field("buffered_input", &self.app_in.len())
            .field("buffered_output", &self.out.len())
            .field("peer_closed", &self.peer_closed)
            .field("close_sent", &self.close_sent)
            .finish()
    }
}

impl SecurityLayer {
    /// Server side of an accepted connection. With `allow_unsecured` the
    /// layer sniffs the first bytes before committing to TLS.
    pub fn server(security: &ServerSecurity, allow_unsecured: bool) -> Result<Self, SecurityError> {
        let config = security.tls_config();
        let mode = if allow_unsecured {
            Mode::Detecting { config, prelude: Vec::with_capacity(Prelude::LEN) }
        } else {
            let conn = ServerConnection::new(config).map_err(SecurityError::Tls)?;
            Mode::Tls(Box::new(TlsConnection::Server(conn)))
        };
        Ok(Self::with_mode(mode))
    }

    /// Client side of an outbound connection to `host`.
    ///
    /// The certificate is checked against the configured server name, or
    /// `host` when none is set.
    pub fn client(security: &ClientSecurity, host: &str) -> Result<Self, SecurityError> {
        let name = security.server_name().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| SecurityError::InvalidServerName(name))?;
        let conn =
            ClientConnection::new(security.tls_config(), server_name).map_err(SecurityError::Tls)?;
        Ok(Self::with_mode(Mode::Tls(Box::new(TlsConnection::Client(conn)))))
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            app_in: BytesMut::new(),
            out: Vec::new(),
            started: false,
            peer_closed: false,
            close_sent: false,
        }
    }

    /// Swap in a server configuration that requires client certificates.
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted` once any byte has been fed in
    /// - `WrongRole` on a client layer
    pub fn require_client_auth(&mut self, config: Arc<ServerConfig>) -> Result<(), SecurityError> {
        if self.started {
            return Err(SecurityError::AlreadyStarted);
        }
        match &mut self.mode {
            Mode::Detecting { config: current, .. } => {
                *current = config;
                Ok(())
            },
            Mode::Tls(conn) => {
                if matches!(conn.as_ref(), TlsConnection::Client(_)) {
                    return Err(SecurityError::WrongRole("server"));
                }
                let fresh = ServerConnection::new(config).map_err(SecurityError::Tls)?;
                **conn = TlsConnection::Server(fresh);
                Ok(())
            },
            Mode::Plain => Err(SecurityError::AlreadyStarted),
        }
    }

    /// Take bytes read from the socket. All of `data` is consumed.
    ///
    /// # Errors
    ///
    /// Handshake or record failures. The connection is unusable afterwards.
    pub fn feed_input(&mut self, data: &[u8]) -> Result<(), SecurityError> {
        self.started = true;
        match &mut self.mode {
            Mode::Detecting { prelude, .. } => {
                prelude.extend_from_slice(data);
                match Prelude::detect(prelude, false) {
                    Some(kind) => self.leave_detecting(kind),
                    None => Ok(()),
                }
            },
            Mode::Tls(conn) => feed_tls(conn, &mut self.app_in, &mut self.peer_closed, data),
            Mode::Plain => {
                self.app_in.extend_from_slice(data);
                Ok(())
            },
        }
    }

    /// The socket reached end of stream.
    ///
    /// # Errors
    ///
    /// The stream ended before the handshake finished.
    pub fn finish_input(&mut self) -> Result<(), SecurityError> {
        self.started = true;
        if let Mode::Detecting { prelude, .. } = &self.mode {
            let kind = Prelude::detect(prelude, true).unwrap_or(Prelude::Plain);
            self.leave_detecting(kind)?;
        }
        self.peer_closed = true;

        match &self.mode {
            Mode::Tls(conn) if conn.is_handshaking() => Err(SecurityError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed during handshake",
            ))),
            _ => Ok(()),
        }
    }

    fn leave_detecting(&mut self, kind: Prelude) -> Result<(), SecurityError> {
        let (config, prelude) = match std::mem::replace(&mut self.mode, Mode::Plain) {
            Mode::Detecting { config, prelude } => (config, prelude),
            other => {
                self.mode = other;
                return Ok(());
            },
        };

        tracing::debug!(?kind, "Security mode detected");
        match kind {
            Prelude::Tls => {
                let conn = ServerConnection::new(config).map_err(SecurityError::Tls)?;
                self.mode = Mode::Tls(Box::new(TlsConnection::Server(conn)));
                self.feed_input(&prelude)
            },
            Prelude::Plain => {
                self.app_in.extend_from_slice(&prelude);
                Ok(())
            },
        }
    }

    /// Plaintext ready for the engine.
    pub fn application_input(&self) -> &[u8] {
        &self.app_in
    }

    /// The engine took `count` bytes of [`Self::application_input`].
    pub fn consume_application_input(&mut self, count: usize) {
        self.app_in.advance(count.min(self.app_in.len()));
    }

    /// Offer engine output. Returns how many bytes were taken; zero while
    /// negotiation is still running or the outbound buffer is full.
    ///
    /// # Errors
    ///
    /// The TLS layer refused the plaintext.
    pub fn application_output(&mut self, bytes: &[u8]) -> Result<usize, SecurityError> {
        if self.close_sent || bytes.is_empty() {
            return Ok(0);
        }
        let room = OUTPUT_HIGH_WATER.saturating_sub(self.out.len());
        let take = bytes.len().min(room);
        if take == 0 {
            return Ok(0);
        }

        match &mut self.mode {
            Mode::Detecting { .. } => Ok(0),
            Mode::Tls(conn) if conn.is_handshaking() => Ok(0),
            Mode::Tls(conn) => conn.writer().write(&bytes[..take]).map_err(SecurityError::Io),
            Mode::Plain => {
                self.out.extend_from_slice(&bytes[..take]);
                Ok(take)
            },
        }
    }

    /// Bytes waiting for the socket, including handshake records.
    pub fn pending_output(&mut self) -> &[u8] {
        if let Mode::Tls(conn) = &mut self.mode {
            while conn.wants_write() {
                match conn.write_tls(&mut self.out) {
                    Ok(0) => break,
                    Ok(_) => {},
                    Err(err) => {
                        tracing::warn!(%err, "TLS output stalled");
                        break;
                    },
                }
            }
        }
        &self.out
    }

    /// `count` bytes of [`Self::pending_output`] reached the socket.
    pub fn output_written(&mut self, count: usize) {
        self.out.drain(..count.min(self.out.len()));
    }

    /// True if anything is waiting for the socket.
    pub fn wants_output(&self) -> bool {
        if !self.out.is_empty() {
            return true;
        }
        matches!(&self.mode, Mode::Tls(conn) if conn.wants_write())
    }

    /// Stop taking application output and queue a close_notify when secured.
    pub fn close_output(&mut self) {
        if self.close_sent {
            return;
        }
        self.close_sent = true;
        if let Mode::Tls(conn) = &mut self.mode {
            conn.send_close_notify();
        }
    }

    /// [`Self::close_output`] has been called.
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Peer finished sending, by close_notify or end of stream.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Negotiation finished (trivially true for a plaintext peer).
    pub fn handshake_complete(&self) -> bool {
        match &self.mode {
            Mode::Detecting { .. } => false,
            Mode::Tls(conn) => !conn.is_handshaking(),
            Mode::Plain => true,
        }
    }

    /// Traffic on this connection is encrypted.
    pub fn is_encrypted(&self) -> bool {
        matches!(self.mode, Mode::Tls(_))
    }

    /// Negotiated protocol version, e.g. `TLSv1_3`.
    pub fn protocol_version(&self) -> Option<String> {
        match &self.mode {
            Mode::Tls(conn) => conn.protocol_version().map(|v| format!("{v:?}")),
            _ => None,
        }
    }

    /// Negotiated cipher suite name.
    pub fn cipher_suite(&self) -> Option<String> {
        match &self.mode {
            Mode::Tls(conn) => conn.cipher_suite().map(|s| format!("{:?}", s.suite())),
            _ => None,
        }
    }

    /// Peer presented a certificate.
    pub fn has_peer_certificate(&self) -> bool {
        matches!(&self.mode, Mode::Tls(conn) if conn.has_peer_certificate())
    }
}

fn feed_tls(
    conn: &mut TlsConnection,
    app_in: &mut BytesMut,
    peer_closed: &mut bool,
    mut data: &[u8],
) -> Result<(), SecurityError> {
    while !data.is_empty() {
        let read = conn.read_tls(&mut data).map_err(SecurityError::Io)?;
        if read == 0 {
            break;
        }

        let state = conn.process_new_packets().map_err(SecurityError::Tls)?;
        let available = state.plaintext_bytes_to_read();
        if available > 0 {
            let start = app_in.len();
            app_in.resize(start + available, 0);
            conn.reader().read_exact(&mut app_in[start..]).map_err(SecurityError::Io)?;
        }
        if state.peer_has_closed() {
            *peer_closed = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SecurityLayer, SecurityLayer) {
        let server = ServerSecurity::self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = server.certificate_der().unwrap().clone();
        let client = ClientSecurity::trusting(&[cert]).unwrap();
        (
            SecurityLayer::client(&client, "localhost").unwrap(),
            SecurityLayer::server(&server, false).unwrap(),
        )
    }

    fn shuttle(from: &mut SecurityLayer, to: &mut SecurityLayer) -> Result<bool, SecurityError> {
        let bytes = from.pending_output().to_vec();
        if bytes.is_empty() {
            return Ok(false);
        }
        from.output_written(bytes.len());
        to.feed_input(&bytes)?;
        Ok(true)
    }

    fn handshake(client: &mut SecurityLayer, server: &mut SecurityLayer) {
        for _ in 0..8 {
            shuttle(client, server).unwrap();
            shuttle(server, client).unwrap();
        }
        assert!(client.handshake_complete());
        assert!(server.handshake_complete());
    }

    #[test]
    fn detect_needs_two_bytes() {
        assert_eq!(Prelude::detect(&[], false), None);
        assert_eq!(Prelude::detect(&[0x16], false), None);
        assert_eq!(Prelude::detect(&[0x16, 0x03], false), Some(Prelude::Tls));
        assert_eq!(Prelude::detect(&[0x16, 0x03, 0x01], false), Some(Prelude::Tls));
        assert_eq!(Prelude::detect(b"AM", false), Some(Prelude::Plain));
        assert_eq!(Prelude::detect(&[0x16, 0x00], false), Some(Prelude::Plain));
    }

    #[test]
    fn detect_decides_at_eof() {
        assert_eq!(Prelude::detect(&[0x16], true), Some(Prelude::Tls));
        assert_eq!(Prelude::detect(b"A", true), Some(Prelude::Plain));
        assert_eq!(Prelude::detect(&[], true), Some(Prelude::Plain));
    }

    #[test]
    fn handshake_then_data() {
        let (mut client, mut server) = pair();
        assert_eq!(client.application_output(b"early").unwrap(), 0);

        handshake(&mut client, &mut server);
        assert!(client.is_encrypted());
        assert!(client.cipher_suite().is_some());
        assert_eq!(client.protocol_version().as_deref(), Some("TLSv1_3"));
        assert!(client.has_peer_certificate());
        assert!(!server.has_peer_certificate());

        assert_eq!(client.application_output(b"PING").unwrap(), 4);
        shuttle(&mut client, &mut server).unwrap();
        assert_eq!(server.application_input(), b"PING");
        server.consume_application_input(4);
        assert!(server.application_input().is_empty());
    }

    #[test]
    fn close_notify_reaches_peer() {
        let (mut client, mut server) = pair();
        handshake(&mut client, &mut server);

        client.close_output();
        assert!(client.close_sent());
        assert_eq!(client.application_output(b"late").unwrap(), 0);
        shuttle(&mut client, &mut server).unwrap();
        assert!(server.peer_closed());
    }

    #[test]
    fn plaintext_rejected_when_tls_required() {
        let (_, mut server) = pair();
        assert!(server.feed_input(b"AMQP\x00\x01\x00\x00").is_err());
    }

    #[test]
    fn sniffer_passes_plaintext_through() {
        let security = ServerSecurity::self_signed(vec!["localhost".to_string()]).unwrap();
        let mut server = SecurityLayer::server(&security, true).unwrap();

        server.feed_input(b"A").unwrap();
        assert!(server.application_input().is_empty());
        assert!(!server.handshake_complete());

        server.feed_input(b"MQP").unwrap();
        assert!(!server.is_encrypted());
        assert_eq!(server.application_input(), b"AMQP");
        assert_eq!(server.application_output(b"reply").unwrap(), 5);
        assert_eq!(server.pending_output(), b"reply");
    }

    #[test]
    fn sniffer_still_accepts_tls() {
        let security = ServerSecurity::self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = security.certificate_der().unwrap().clone();
        let mut server = SecurityLayer::server(&security, true).unwrap();
        let mut client =
            SecurityLayer::client(&ClientSecurity::trusting(&[cert]).unwrap(), "localhost").unwrap();

        handshake(&mut client, &mut server);
        assert!(server.is_encrypted());
    }

    #[test]
    fn eof_during_handshake_is_an_error() {
        let (mut client, mut server) = pair();
        shuttle(&mut client, &mut server).unwrap();
        assert!(server.finish_input().is_err());
        assert!(server.peer_closed());
    }

    #[test]
    fn client_auth_only_before_input() {
        let security = ServerSecurity::self_signed(vec!["localhost".to_string()]).unwrap();
        let mut server = SecurityLayer::server(&security, false).unwrap();
        server.feed_input(&[0x16]).unwrap();
        let err = server.require_client_auth(security.tls_config()).unwrap_err();
        assert!(matches!(err, SecurityError::AlreadyStarted));
    }

    #[test]
    fn client_auth_rejected_for_client_role() {
        let (mut client, _) = pair();
        let security = ServerSecurity::self_signed(vec!["localhost".to_string()]).unwrap();
        let err = client.require_client_auth(security.tls_config()).unwrap_err();
        assert!(matches!(err, SecurityError::WrongRole("server")));
    }
}
