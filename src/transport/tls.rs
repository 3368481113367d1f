//! TLS byte link over rustls
//!
//! The secure transport wraps the connected TCP stream in a rustls client
//! session and completes the handshake before any protocol bytes flow.
//! Configuration comes in two flavors:
//!
//! - [`TlsOptions::Settings`]: flat, file-based settings (CA bundle, client
//!   certificate and key) from which a `ClientConfig` is built
//! - [`TlsOptions::Context`]: a prebuilt `ClientConfig` supplied by the
//!   caller, with optional per-connection overrides

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Link, TransportError};

/// TLS configuration for the secure transport variant
#[derive(Debug, Clone)]
pub enum TlsOptions {
    /// Build a client configuration from flat settings
    Settings(TlsSettings),
    /// Use a prebuilt rustls configuration
    Context {
        /// The prebuilt configuration
        config: Arc<ClientConfig>,
        /// Override the name used for SNI and certificate verification
        server_name: Option<String>,
        /// Replace the configuration's certificate verifier with one that
        /// accepts anything (testing only)
        insecure_skip_verify: bool,
    },
}

impl Default for TlsOptions {
    fn default() -> Self {
        TlsOptions::Settings(TlsSettings::default())
    }
}

/// Flat TLS settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Path to a PEM file with CA certificates for verifying the broker.
    /// If not set, the bundled webpki roots are used.
    pub ca_file: Option<PathBuf>,

    /// Path to a PEM client certificate chain for mutual TLS.
    /// Requires `key_file`.
    pub cert_file: Option<PathBuf>,

    /// Path to the PEM private key matching `cert_file`
    pub key_file: Option<PathBuf>,

    /// Override the name used for SNI and certificate verification.
    /// Defaults to the endpoint host.
    pub server_name: Option<String>,

    /// Whether to skip server certificate verification (testing only)
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl TlsOptions {
    fn server_name(&self) -> Option<&str> {
        match self {
            TlsOptions::Settings(settings) => settings.server_name.as_deref(),
            TlsOptions::Context { server_name, .. } => server_name.as_deref(),
        }
    }

    fn client_config(&self) -> Result<Arc<ClientConfig>, TransportError> {
        match self {
            TlsOptions::Settings(settings) => Ok(Arc::new(build_client_config(settings)?)),
            TlsOptions::Context {
                config,
                insecure_skip_verify,
                ..
            } => {
                if *insecure_skip_verify {
                    // The override replaces whatever verifier the prebuilt
                    // configuration carried.
                    let mut config = (**config).clone();
                    config
                        .dangerous()
                        .set_certificate_verifier(Arc::new(InsecureVerifier));
                    Ok(Arc::new(config))
                } else {
                    Ok(config.clone())
                }
            }
        }
    }
}

/// Encrypted link over a rustls client session
pub(crate) struct TlsLink {
    stream: StreamOwned<ClientConnection, TcpStream>,
}

impl TlsLink {
    /// Wrap a connected stream and run the handshake to completion.
    ///
    /// Handshake reads honor whatever read timeout is already configured on
    /// the socket, so a stalled broker surfaces as a timeout rather than a
    /// hang.
    pub(crate) fn setup(
        sock: TcpStream,
        options: &TlsOptions,
        default_name: &str,
    ) -> Result<Self, TransportError> {
        let config = options.client_config()?;
        let name = options.server_name().unwrap_or(default_name).to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| TransportError::Tls(format!("invalid server name: {name}")))?;

        let mut conn = ClientConnection::new(config, server_name)
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let mut sock = sock;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock).map_err(handshake_error)?;
        }
        debug!("TLS handshake completed with {}", name);

        Ok(Self {
            stream: StreamOwned::new(conn, sock),
        })
    }
}

fn handshake_error(err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout,
        _ => TransportError::Tls(err.to_string()),
    }
}

impl Link for TlsLink {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        // write() on the rustls stream defers transport errors to the next
        // call; flushing surfaces them on this one.
        self.stream.write_all(data)?;
        self.stream.flush()
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Yields at most one decrypted record per call.
        self.stream.read(buf)
    }

    fn read_timeout(&self) -> io::Result<Option<Duration>> {
        self.stream.sock.read_timeout()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.sock.set_read_timeout(timeout)
    }

    fn shutdown(self: Box<Self>) {
        // Tell the peer the session is over, then close the plain socket.
        let stream = self.stream;
        let mut conn = stream.conn;
        let mut sock = stream.sock;
        conn.send_close_notify();
        let _ = conn.complete_io(&mut sock);
        let _ = sock.shutdown(Shutdown::Both);
    }
}

/// Install the ring crypto provider if not already installed.
fn ensure_crypto_provider() {
    // Ignore the error if another provider won the race.
    let _ = CryptoProvider::install_default(default_provider());
}

/// Build a rustls `ClientConfig` from flat settings.
fn build_client_config(settings: &TlsSettings) -> Result<ClientConfig, TransportError> {
    ensure_crypto_provider();

    let builder = if settings.insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
    } else {
        ClientConfig::builder()
            .with_root_certificates(build_root_store(settings.ca_file.as_deref())?)
    };

    match (&settings.cert_file, &settings.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = load_certificates(cert_file)?;
            let key = load_private_key(key_file)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TransportError::Tls(format!("failed to configure client auth: {e}")))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(TransportError::Tls(
            "cert_file and key_file must be provided together".into(),
        )),
    }
}

/// Build the root certificate store.
fn build_root_store(ca_file: Option<&Path>) -> Result<RootCertStore, TransportError> {
    let mut root_store = RootCertStore::empty();

    match ca_file {
        Some(path) => {
            let certs = load_certificates(path)?;
            let (added, _ignored) = root_store.add_parsable_certificates(certs);
            if added == 0 {
                return Err(TransportError::Tls(format!(
                    "no usable CA certificates in {}",
                    path.display()
                )));
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    Ok(root_store)
}

/// Load certificates from a PEM file.
fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("cannot read {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| {
            TransportError::Tls(format!("invalid certificate in {}: {e}", path.display()))
        })?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a private key (PKCS#1, PKCS#8 or SEC1) from a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = File::open(path)
        .map_err(|e| TransportError::Tls(format!("cannot read {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("invalid private key in {}: {e}", path.display())))?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {}", path.display())))
}

/// Certificate verifier that accepts any server certificate.
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
