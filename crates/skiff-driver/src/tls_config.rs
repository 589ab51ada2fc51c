//! TLS configuration and certificate loading.
//!
//! Turns the file-path based [`ServerSecurityConfig`] and
//! [`ClientSecurityConfig`] into ready-to-use `rustls` configurations. All
//! file access happens here, once, when a listener or connector is
//! configured; the per-connection sublayer only ever sees loaded material.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    server::WebPkiClientVerifier,
};

use pkcs8::{EncryptedPrivateKeyInfo, der::pem};

use crate::error::SecurityError;

/// PEM label of a password-protected PKCS#8 key.
const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

/// Server-side security options for a listener.
#[derive(Debug, Clone, Default)]
pub struct ServerSecurityConfig {
    /// PEM file with the server certificate chain
    pub certificate_file: PathBuf,
    /// PEM file with the server private key
    pub private_key_file: PathBuf,
    /// Password decrypting an `ENCRYPTED PRIVATE KEY`
    pub key_password: Option<String>,
    /// PEM file of trusted CAs; fallback source for client authentication
    pub trust_store: Option<PathBuf>,
    /// Sniff each connection and let plaintext clients through
    pub allow_unsecured_clients: bool,
    /// Reject clients that do not present a trusted certificate
    pub require_client_auth: bool,
    /// CAs advertised to and trusted for clients; defaults to `trust_store`
    pub trusted_cas_file: Option<PathBuf>,
}

/// Client-side security options for an outbound connector.
#[derive(Debug, Clone, Default)]
pub struct ClientSecurityConfig {
    /// PEM file of CAs trusted to sign the server certificate
    pub trust_store: PathBuf,
    /// PEM certificate presented when the server asks for client auth
    pub certificate_file: Option<PathBuf>,
    /// Private key matching `certificate_file`
    pub private_key_file: Option<PathBuf>,
    /// Password decrypting an `ENCRYPTED PRIVATE KEY`
    pub key_password: Option<String>,
    /// Name checked against the server certificate; defaults to the host
    /// used to connect
    pub server_name: Option<String>,
}

/// Certificate chain and key identifying one side of a connection.
struct Identity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

/// Loaded server security material, shared by every connector a listener
/// spawns.
pub struct ServerSecurity {
    identity: Identity,
    tls: Arc<ServerConfig>,
    client_auth: bool,
}

impl std::fmt::Debug for ServerSecurity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSecurity")
            .field("chain_len", &self.identity.certs.len())
            .field("client_auth", &self.requires_client_auth())
            .finish_non_exhaustive()
    }
}

impl ServerSecurity {
    /// Load certificate, key and optional client-auth roots from disk.
    pub fn load(config: &ServerSecurityConfig) -> Result<Self, SecurityError> {
        let certs = load_certs(&config.certificate_file)?;
        let key = load_private_key(&config.private_key_file, config.key_password.as_deref())?;

        let client_roots = if config.require_client_auth {
            let path = config
                .trusted_cas_file
                .as_ref()
                .or(config.trust_store.as_ref())
                .ok_or(SecurityError::MissingTrustedCas)?;
            Some(load_roots(path)?)
        } else {
            None
        };

        Self::from_identity(Identity { certs, key }, client_roots)
    }

    /// Generate a throwaway self-signed identity for the given names.
    ///
    /// Only suitable for local testing: clients must trust this exact
    /// certificate, see [`ServerSecurity::certificate_der`].
    pub fn self_signed(subject_alt_names: Vec<String>) -> Result<Self, SecurityError> {
        let generated = rcgen::generate_simple_self_signed(subject_alt_names)
            .map_err(|e| SecurityError::Generate(e.to_string()))?;

        let certs = vec![generated.cert.der().clone()];
        let key = PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der()).into();

        tracing::warn!("Using self-signed certificate, not for production use");

        Self::from_identity(Identity { certs, key }, None)
    }

    /// Leaf certificate in DER form, for handing to a client trust store.
    pub fn certificate_der(&self) -> Option<&CertificateDer<'static>> {
        self.identity.certs.first()
    }

    /// True when connecting clients must present a trusted certificate.
    pub fn requires_client_auth(&self) -> bool {
        self.client_auth
    }

    /// `rustls` configuration used for new server connections.
    pub(crate) fn tls_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.tls)
    }

    /// Same identity, but requiring clients signed by a CA in `trusted_cas`.
    pub(crate) fn with_client_auth(
        &self,
        trusted_cas: &Path,
    ) -> Result<Arc<ServerConfig>, SecurityError> {
        let roots = load_roots(trusted_cas)?;
        server_config(&self.identity, Some(roots))
    }

    fn from_identity(
        identity: Identity,
        client_roots: Option<RootCertStore>,
    ) -> Result<Self, SecurityError> {
        let client_auth = client_roots.is_some();
        let tls = server_config(&identity, client_roots)?;
        Ok(Self { identity, tls, client_auth })
    }
}

/// Loaded client security material.
#[derive(Debug, Clone)]
pub struct ClientSecurity {
    tls: Arc<ClientConfig>,
    server_name: Option<String>,
}

impl ClientSecurity {
    /// Load the trust store and optional client identity from disk.
    pub fn load(config: &ClientSecurityConfig) -> Result<Self, SecurityError> {
        let roots = load_roots(&config.trust_store)?;
        let builder = ClientConfig::builder().with_root_certificates(roots);

        let tls = match (&config.certificate_file, &config.private_key_file) {
            (Some(cert), Some(key)) => {
                let certs = load_certs(cert)?;
                let key = load_private_key(key, config.key_password.as_deref())?;
                builder.with_client_auth_cert(certs, key).map_err(SecurityError::Config)?
            },
            (None, None) => builder.with_no_client_auth(),
            _ => return Err(SecurityError::IncompleteIdentity),
        };

        Ok(Self { tls: Arc::new(tls), server_name: config.server_name.clone() })
    }

    /// Trust exactly the given certificates, without client identity.
    pub fn trusting(certs: &[CertificateDer<'static>]) -> Result<Self, SecurityError> {
        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots.add(cert.clone()).map_err(SecurityError::Config)?;
        }
        let tls = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        Ok(Self { tls: Arc::new(tls), server_name: None })
    }

    /// Override the name checked against the server certificate.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Name override, if any.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub(crate) fn tls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.tls)
    }
}

fn server_config(
    identity: &Identity,
    client_roots: Option<RootCertStore>,
) -> Result<Arc<ServerConfig>, SecurityError> {
    let builder = ServerConfig::builder();
    let builder = match client_roots {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| SecurityError::Verifier(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        },
        None => builder.with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(identity.certs.clone(), identity.key.clone_key())
        .map_err(SecurityError::Config)?;

    Ok(Arc::new(config))
}

fn read_file(path: &Path) -> Result<Vec<u8>, SecurityError> {
    fs::read(path).map_err(|source| SecurityError::Read { path: path.to_path_buf(), source })
}

/// Load every PEM certificate in `path`.
pub(crate) fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SecurityError> {
    let pem = read_file(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| SecurityError::Read { path: path.to_path_buf(), source })?;

    if certs.is_empty() {
        return Err(SecurityError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Load the first private key in `path`.
///
/// An `ENCRYPTED PRIVATE KEY` (PKCS#8) is decrypted with `password`; without
/// a password it is rejected. A password supplied for an unencrypted key is
/// ignored.
pub(crate) fn load_private_key(
    path: &Path,
    password: Option<&str>,
) -> Result<PrivateKeyDer<'static>, SecurityError> {
    let pem = read_file(path)?;
    match rustls_pemfile::private_key(&mut pem.as_slice()) {
        Ok(Some(key)) => {
            if password.is_some() {
                tracing::debug!(path = %path.display(), "Key is not encrypted, password ignored");
            }
            Ok(key)
        },
        Ok(None) => match (encrypted_key_block(&pem), password) {
            (Some(block), Some(password)) => decrypt_private_key(path, block, password),
            (Some(_), None) => Err(SecurityError::EncryptedKey(path.to_path_buf())),
            (None, _) => Err(SecurityError::NoPrivateKey(path.to_path_buf())),
        },
        Err(source) => Err(SecurityError::Read { path: path.to_path_buf(), source }),
    }
}

/// The `ENCRYPTED PRIVATE KEY` PEM block in `pem`, armor included.
fn encrypted_key_block(pem: &[u8]) -> Option<&[u8]> {
    let begin = format!("-----BEGIN {ENCRYPTED_KEY_LABEL}-----");
    let end = format!("-----END {ENCRYPTED_KEY_LABEL}-----");
    let start = find(pem, begin.as_bytes())?;
    let stop = start + find(&pem[start..], end.as_bytes())? + end.len();
    Some(&pem[start..stop])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn decrypt_private_key(
    path: &Path,
    block: &[u8],
    password: &str,
) -> Result<PrivateKeyDer<'static>, SecurityError> {
    let decrypted = pem::decode_vec(block).ok().and_then(|(_, der)| {
        let info = EncryptedPrivateKeyInfo::try_from(der.as_slice()).ok()?;
        info.decrypt(password).ok()
    });
    let document = decrypted.ok_or_else(|| SecurityError::Decrypt(path.to_path_buf()))?;
    Ok(PrivatePkcs8KeyDer::from(document.as_bytes().to_vec()).into())
}

/// Load a PEM trust store.
pub(crate) fn load_roots(path: &Path) -> Result<RootCertStore, SecurityError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(SecurityError::Config)?;
    }
    Ok(roots)
}
