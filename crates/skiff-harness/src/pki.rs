//! Throwaway PKI for TLS tests.
//!
//! One CA signs a `localhost` server certificate and a client certificate.
//! A second, unrelated CA signs a client certificate that the server must
//! not trust. Everything is written as PEM into a temporary directory that
//! lives as long as the [`TestPki`].

use std::{
    error::Error,
    fs,
    path::PathBuf,
};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use skiff_driver::{ClientSecurityConfig, ServerSecurityConfig};
use tempfile::TempDir;

/// Certificates and keys on disk.
#[derive(Debug)]
pub struct TestPki {
    dir: TempDir,
}

struct Authority {
    cert: Certificate,
    key: KeyPair,
}

impl Authority {
    fn new(name: &str) -> Result<Self, rcgen::Error> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    fn issue(
        &self,
        names: &[&str],
        usage: ExtendedKeyUsagePurpose,
    ) -> Result<(Certificate, KeyPair), rcgen::Error> {
        let names: Vec<String> = names.iter().map(ToString::to_string).collect();
        let mut params = CertificateParams::new(names)?;
        params.extended_key_usages = vec![usage];
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        Ok((cert, key))
    }
}

impl TestPki {
    /// Generate all material into a fresh temporary directory.
    pub fn generate() -> Result<Self, Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let write = |name: &str, pem: String| fs::write(dir.path().join(name), pem);

        let ca = Authority::new("skiff test ca")?;
        write("ca.pem", ca.cert.pem())?;

        let (server, server_key) = ca.issue(&["localhost"], ExtendedKeyUsagePurpose::ServerAuth)?;
        write("server.pem", server.pem())?;
        write("server.key", server_key.serialize_pem())?;

        let (client, client_key) = ca.issue(&["client"], ExtendedKeyUsagePurpose::ClientAuth)?;
        write("client.pem", client.pem())?;
        write("client.key", client_key.serialize_pem())?;

        let rogue = Authority::new("skiff rogue ca")?;
        let (stranger, stranger_key) =
            rogue.issue(&["stranger"], ExtendedKeyUsagePurpose::ClientAuth)?;
        write("stranger.pem", stranger.pem())?;
        write("stranger.key", stranger_key.serialize_pem())?;

        Ok(Self { dir })
    }

    /// Path of one generated file.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Server settings: `localhost` certificate, TLS required.
    pub fn server_config(&self) -> ServerSecurityConfig {
        ServerSecurityConfig {
            certificate_file: self.path("server.pem"),
            private_key_file: self.path("server.key"),
            ..Default::default()
        }
    }

    /// Server settings that also require a client certificate from the CA.
    pub fn server_config_with_client_auth(&self) -> ServerSecurityConfig {
        ServerSecurityConfig {
            require_client_auth: true,
            trusted_cas_file: Some(self.path("ca.pem")),
            ..self.server_config()
        }
    }

    /// Client settings trusting the CA, without a client certificate.
    pub fn client_config(&self) -> ClientSecurityConfig {
        ClientSecurityConfig {
            trust_store: self.path("ca.pem"),
            server_name: Some("localhost".to_string()),
            ..Default::default()
        }
    }

    /// Client settings presenting the CA-signed client certificate.
    pub fn client_config_with_identity(&self) -> ClientSecurityConfig {
        ClientSecurityConfig {
            certificate_file: Some(self.path("client.pem")),
            private_key_file: Some(self.path("client.key")),
            ..self.client_config()
        }
    }

    /// Client settings presenting a certificate from an unrelated CA.
    pub fn client_config_with_stranger_identity(&self) -> ClientSecurityConfig {
        ClientSecurityConfig {
            certificate_file: Some(self.path("stranger.pem")),
            private_key_file: Some(self.path("stranger.key")),
            ..self.client_config()
        }
    }
}
