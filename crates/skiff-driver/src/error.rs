//! Driver error types.
//!
//! Construction failures (bad address, bind/connect/accept errors, security
//! material that will not load) come back as [`DriverError`] and are also
//! remembered as the driver's last error. Failures on an established
//! connection never surface here: they close the connector and are recorded
//! as its [`skiff_core::CloseReason`].

use std::{io, net::SocketAddr, path::PathBuf};

use thiserror::Error;

use crate::{connector::ConnectorId, listener::ListenerId};

/// Errors from driver construction and endpoint registration.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Host/port pair did not resolve to a socket address
    #[error("invalid address {addr}: {reason}")]
    InvalidAddress {
        /// Address as given by the caller
        addr: String,
        /// Why resolution failed
        reason: String,
    },

    /// Poller or wake channel could not be created
    #[error("readiness poll failed: {0}")]
    Poll(#[source] io::Error),

    /// Listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested local address
        addr: SocketAddr,
        /// Underlying failure
        source: io::Error,
    },

    /// Outbound connect could not be started
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Remote address
        addr: SocketAddr,
        /// Underlying failure
        source: io::Error,
    },

    /// Accepting a pending connection failed
    #[error("accept failed on {listener}: {source}")]
    Accept {
        /// Listener the connection was pending on
        listener: ListenerId,
        /// Underlying failure
        source: io::Error,
    },

    /// Socket could not be registered with the poller or made non-blocking
    #[error("failed to register socket: {0}")]
    Register(#[source] io::Error),

    /// No listener with this id
    #[error("unknown listener {0}")]
    UnknownListener(ListenerId),

    /// No connector with this id
    #[error("unknown connector {0}")]
    UnknownConnector(ConnectorId),

    /// Security configuration failed
    #[error(transparent)]
    Security(#[from] SecurityError),
}

/// Coarse error classification for the driver's last-error accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No error recorded
    Ok,
    /// Address resolution failed
    InvalidAddress,
    /// Operating system I/O failure
    Io,
    /// Unknown listener/connector handle
    UnknownHandle,
    /// Security configuration failure
    Security,
}

impl DriverError {
    /// Classification of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidAddress { .. } => ErrorCode::InvalidAddress,
            Self::Poll(_)
            | Self::Bind { .. }
            | Self::Connect { .. }
            | Self::Accept { .. }
            | Self::Register(_) => ErrorCode::Io,
            Self::UnknownListener(_) | Self::UnknownConnector(_) => ErrorCode::UnknownHandle,
            Self::Security(_) => ErrorCode::Security,
        }
    }
}

/// Errors from loading security material and running the TLS sublayer.
#[derive(Error, Debug)]
pub enum SecurityError {
    /// Certificate, key or trust store file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// File that failed
        path: PathBuf,
        /// Underlying failure
        source: io::Error,
    },

    /// File contained no PEM certificates
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// File contained no usable private key
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// Private key is password protected and no password was given
    #[error("private key in {0} is encrypted and no password was given")]
    EncryptedKey(PathBuf),

    /// Encrypted private key could not be decrypted (wrong password or
    /// unsupported scheme)
    #[error("failed to decrypt private key in {0}")]
    Decrypt(PathBuf),

    /// Only one of client certificate and private key was configured
    #[error("client certificate and private key must be configured together")]
    IncompleteIdentity,

    /// Client auth requested without any trusted CA source
    #[error("client authentication requires a trusted CA file")]
    MissingTrustedCas,

    /// Server name for certificate validation is not a valid DNS name or IP
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    /// Self-signed certificate generation failed
    #[error("certificate generation failed: {0}")]
    Generate(String),

    /// TLS configuration rejected by rustls
    #[error("tls configuration rejected: {0}")]
    Config(#[source] rustls::Error),

    /// Client certificate verifier could not be built
    #[error("client verifier: {0}")]
    Verifier(String),

    /// Negotiation or record-layer failure on a live connection
    #[error("tls failure: {0}")]
    Tls(#[source] rustls::Error),

    /// TLS layer could not take or produce bytes
    #[error("tls i/o: {0}")]
    Io(#[source] io::Error),

    /// Operation only allowed before the first byte was negotiated
    #[error("security negotiation already started")]
    AlreadyStarted,

    /// Operation only valid for the other role
    #[error("operation requires the {0} role")]
    WrongRole(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_classify_errors() {
        let err = DriverError::InvalidAddress { addr: "x:y".to_string(), reason: "bad".to_string() };
        assert_eq!(err.code(), ErrorCode::InvalidAddress);

        let err = DriverError::Register(io::Error::other("boom"));
        assert_eq!(err.code(), ErrorCode::Io);

        let err = DriverError::from(SecurityError::MissingTrustedCas);
        assert_eq!(err.code(), ErrorCode::Security);
        assert_eq!(err.to_string(), "client authentication requires a trusted CA file");
    }

    #[test]
    fn unknown_handles_name_the_id() {
        let err = DriverError::UnknownConnector(ConnectorId::from_raw(7));
        assert_eq!(err.code(), ErrorCode::UnknownHandle);
        assert_eq!(err.to_string(), "unknown connector connector-7");
    }
}
