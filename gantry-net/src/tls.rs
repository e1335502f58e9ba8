//! TLS sessions on top of non-blocking stream sockets.
//!
//! A session is created when a queued StartTLS reaches the head of both
//! direction queues. From then on every byte the stream engine moves passes
//! through it: reads pull ciphertext from the descriptor and hand back
//! plaintext, writes buffer plaintext and flush ciphertext.
//!
//! The session never blocks. Every call returns `Io::Blocked` once the
//! descriptor reports `WouldBlock`, and the engine retries on the next
//! readiness event.

use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use gantry_core::buffer::ByteBuffer;
use gantry_core::error::{GantryError, Result};

/// Default limit on how long a handshake may take.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Parse every certificate in a PEM document.
pub fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| GantryError::config(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(GantryError::config("no certificate found in PEM"));
    }
    Ok(certs)
}

/// Parse the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM document.
pub fn key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| GantryError::config(format!("invalid key PEM: {e}")))?
        .ok_or_else(|| GantryError::config("no private key found in PEM"))
}

/// Build a root store from every certificate in a PEM document.
pub fn roots_from_pem(pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in certs_from_pem(pem)? {
        roots
            .add(cert)
            .map_err(|e| GantryError::config(format!("bad root certificate: {e}")))?;
    }
    Ok(roots)
}

/// Client certificate policy of a TLS server.
#[derive(Debug, Clone, Default)]
pub enum ClientAuth {
    /// Do not ask for a client certificate.
    #[default]
    None,
    /// Ask, verify against these roots if one is sent, accept none.
    Optional(RootCertStore),
    /// Require a certificate that chains to these roots.
    Required(RootCertStore),
}

/// Which side of the handshake a socket plays, with its configuration.
#[derive(Clone)]
pub enum TlsRole {
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
    Server {
        config: Arc<ServerConfig>,
    },
}

/// Everything a StartTLS needs.
#[derive(Clone)]
pub struct TlsSettings {
    pub role: TlsRole,
    /// `None` lets the handshake run until the peer gives up.
    pub handshake_timeout: Option<Duration>,
}

impl TlsSettings {
    /// Client settings from a ready-made rustls config.
    pub fn from_client_config(config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| GantryError::config(format!("invalid server name {server_name:?}: {e}")))?;
        Ok(Self {
            role: TlsRole::Client { config, server_name },
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        })
    }

    /// Server settings from a ready-made rustls config.
    #[must_use]
    pub fn from_server_config(config: Arc<ServerConfig>) -> Self {
        Self {
            role: TlsRole::Server { config },
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }

    /// Start building client settings for `server_name`.
    pub fn client(server_name: impl Into<String>) -> ClientTlsBuilder {
        ClientTlsBuilder {
            server_name: server_name.into(),
            roots: RootCertStore::empty(),
            identity: None,
            alpn: Vec::new(),
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }

    /// Start building server settings with a certificate chain and key.
    pub fn server(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> ServerTlsBuilder {
        ServerTlsBuilder {
            chain,
            key,
            client_auth: ClientAuth::None,
            alpn: Vec::new(),
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn is_server(&self) -> bool {
        matches!(self.role, TlsRole::Server { .. })
    }
}

/// Builder for client-side [`TlsSettings`].
pub struct ClientTlsBuilder {
    server_name: String,
    roots: RootCertStore,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    alpn: Vec<Vec<u8>>,
    handshake_timeout: Option<Duration>,
}

impl ClientTlsBuilder {
    /// Trust one more root certificate.
    pub fn add_root(mut self, cert: CertificateDer<'static>) -> Result<Self> {
        self.roots
            .add(cert)
            .map_err(|e| GantryError::config(format!("bad root certificate: {e}")))?;
        Ok(self)
    }

    /// Trust every certificate in a PEM document.
    pub fn add_roots_pem(self, pem: &[u8]) -> Result<Self> {
        certs_from_pem(pem)?
            .into_iter()
            .try_fold(self, |builder, cert| builder.add_root(cert))
    }

    /// Present a client certificate when the server asks.
    #[must_use]
    pub fn with_identity(mut self, chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        self.identity = Some((chain, key));
        self
    }

    /// Offer these ALPN protocols, most preferred first.
    #[must_use]
    pub fn with_alpn(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn = protocols;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TlsSettings> {
        if self.roots.is_empty() {
            debug!("[TLS] Client settings built without trust anchors");
        }
        let builder = ClientConfig::builder_with_provider(Arc::new(default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| GantryError::config(e.to_string()))?
            .with_root_certificates(self.roots);
        let mut config = match self.identity {
            Some((chain, key)) => builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| GantryError::config(e.to_string()))?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = self.alpn;
        TlsSettings::from_client_config(Arc::new(config), &self.server_name)
            .map(|s| s.with_handshake_timeout(self.handshake_timeout))
    }
}

/// Builder for server-side [`TlsSettings`].
pub struct ServerTlsBuilder {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_auth: ClientAuth,
    alpn: Vec<Vec<u8>>,
    handshake_timeout: Option<Duration>,
}

impl ServerTlsBuilder {
    #[must_use]
    pub fn with_client_auth(mut self, auth: ClientAuth) -> Self {
        self.client_auth = auth;
        self
    }

    /// Accept these ALPN protocols, most preferred first.
    #[must_use]
    pub fn with_alpn(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn = protocols;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TlsSettings> {
        let provider = Arc::new(default_provider());
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| GantryError::config(e.to_string()))?;
        let builder = match self.client_auth {
            ClientAuth::None => builder.with_no_client_auth(),
            ClientAuth::Optional(roots) => {
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                    .allow_unauthenticated()
                    .build()
                    .map_err(|e| GantryError::config(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
            ClientAuth::Required(roots) => {
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                    .build()
                    .map_err(|e| GantryError::config(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
        };
        let mut config = builder
            .with_single_cert(self.chain, self.key)
            .map_err(|e| GantryError::config(e.to_string()))?;
        config.alpn_protocols = self.alpn;
        Ok(TlsSettings::from_server_config(Arc::new(config)).with_handshake_timeout(self.handshake_timeout))
    }
}

/// What was negotiated, reported once the handshake completes.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
    pub alpn: Option<Vec<u8>>,
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

/// Handshake progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    NotStarted,
    Handshaking,
    Established,
    Failed,
}

/// Result of one non-blocking transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Io {
    /// Moved this many bytes.
    Done(usize),
    /// The descriptor would block.
    Blocked,
    /// The peer finished sending.
    Eof,
}

enum TlsConn {
    Client(ClientConnection),
    Server(ServerConnection),
}

// Forward to whichever side is active.
macro_rules! with_conn {
    ($self:expr, $conn:ident => $body:expr) => {
        match $self {
            TlsConn::Client($conn) => $body,
            TlsConn::Server($conn) => $body,
        }
    };
}

/// A TLS session bound to one stream socket.
pub struct TlsSession {
    conn: TlsConn,
    phase: HandshakePhase,
}

impl TlsSession {
    pub fn new(settings: &TlsSettings) -> Result<Self> {
        let conn = match &settings.role {
            TlsRole::Client { config, server_name } => {
                let conn = ClientConnection::new(Arc::clone(config), server_name.clone())
                    .map_err(|e| GantryError::security(e.to_string()))?;
                TlsConn::Client(conn)
            }
            TlsRole::Server { config } => {
                let conn =
                    ServerConnection::new(Arc::clone(config)).map_err(|e| GantryError::security(e.to_string()))?;
                TlsConn::Server(conn)
            }
        };
        Ok(Self {
            conn,
            phase: HandshakePhase::NotStarted,
        })
    }

    #[must_use]
    pub const fn phase(&self) -> HandshakePhase {
        self.phase
    }

    #[must_use]
    pub fn is_established(&self) -> bool {
        self.phase == HandshakePhase::Established
    }

    /// Hand the session ciphertext that was read before it existed.
    pub(crate) fn feed(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = with_conn!(&mut self.conn, c => c.read_tls(&mut data))?;
            if n == 0 {
                break;
            }
            self.process()?;
        }
        Ok(())
    }

    /// Drive the handshake as far as the descriptor allows.
    ///
    /// Returns the phase reached: `Handshaking` means blocked on I/O.
    pub(crate) fn handshake<S: Read + Write>(&mut self, sock: &mut S) -> Result<HandshakePhase> {
        if self.phase == HandshakePhase::NotStarted {
            self.phase = HandshakePhase::Handshaking;
        }
        loop {
            if !self.flush(sock)? {
                return Ok(self.phase);
            }
            let (handshaking, wants_read) =
                with_conn!(&self.conn, c => (c.is_handshaking(), c.wants_read()));
            if !handshaking {
                self.phase = HandshakePhase::Established;
                trace!("[TLS] Handshake established");
                return Ok(self.phase);
            }
            if !wants_read {
                return Ok(self.phase);
            }
            match with_conn!(&mut self.conn, c => c.read_tls(sock)) {
                Ok(0) => {
                    self.phase = HandshakePhase::Failed;
                    return Err(GantryError::security("peer closed during handshake"));
                }
                Ok(_) => self.process()?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(self.phase),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.phase = HandshakePhase::Failed;
                    return Err(e.into());
                }
            }
        }
    }

    /// Append up to `max` decrypted bytes to `buf`.
    pub(crate) fn read_into<S: Read + Write>(&mut self, sock: &mut S, buf: &mut ByteBuffer, max: usize) -> Result<Io> {
        loop {
            match buf.fill_with(max, |dst| with_conn!(&mut self.conn, c => c.reader().read(dst))) {
                Ok(0) => return Ok(Io::Eof),
                Ok(n) => return Ok(Io::Done(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Io::Eof),
                Err(e) => return Err(e.into()),
            }
            match with_conn!(&mut self.conn, c => c.read_tls(sock)) {
                Ok(0) => return Ok(Io::Eof),
                Ok(_) => {
                    self.process()?;
                    // alerts and key updates
                    self.flush(sock)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Io::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Encrypt as much of `data` as the session buffers accept and push
    /// ciphertext to the descriptor.
    pub(crate) fn write<S: Read + Write>(&mut self, sock: &mut S, data: &[u8]) -> Result<Io> {
        self.flush(sock)?;
        let n = with_conn!(&mut self.conn, c => c.writer().write(data))?;
        self.flush(sock)?;
        if n == 0 && !data.is_empty() {
            return Ok(Io::Blocked);
        }
        Ok(Io::Done(n))
    }

    /// Push pending ciphertext. Returns `true` once nothing is left.
    pub(crate) fn flush<S: Write>(&mut self, sock: &mut S) -> Result<bool> {
        while with_conn!(&self.conn, c => c.wants_write()) {
            match with_conn!(&mut self.conn, c => c.write_tls(sock)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Queue a close_notify alert. Sent on the next flush.
    pub(crate) fn send_close_notify(&mut self) {
        with_conn!(&mut self.conn, c => c.send_close_notify());
    }

    /// What the handshake negotiated.
    #[must_use]
    pub fn info(&self) -> TlsInfo {
        with_conn!(&self.conn, c => TlsInfo {
            protocol_version: c.protocol_version().map(|v| format!("{v:?}")),
            cipher_suite: c.negotiated_cipher_suite().map(|s| format!("{:?}", s.suite())),
            alpn: c.alpn_protocol().map(<[u8]>::to_vec),
            peer_certificates: c.peer_certificates().map(<[_]>::to_vec).unwrap_or_default(),
        })
    }

    fn process(&mut self) -> Result<()> {
        if let Err(e) = with_conn!(&mut self.conn, c => c.process_new_packets()) {
            self.phase = HandshakePhase::Failed;
            return Err(GantryError::security(e.to_string()));
        }
        Ok(())
    }
}
