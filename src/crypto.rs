//! TLS upgrade for the connection transport.
//!
//! On a successful `STARTTLS` the plain transport is moved into a
//! [`TlsTransport`], which implements the same [`Transport`] interface. The
//! state machine keeps reading and writing frames; rustls sits between the
//! frames and the socket. Before the TLS handshake completes, operations
//! report a direction-dependent `WouldBlock` that tells the driver which way
//! to poll.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use nix::errno::Errno;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore};

use crate::errors::{set_error, Error};
use crate::transport::{AioDirection, Transport, TransportError, TransportResult};

/// TLS negotiation policy for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Never upgrade to TLS.
    #[default]
    Disable,
    /// Attempt `STARTTLS` and continue in plaintext if the server refuses.
    Allow,
    /// Attempt `STARTTLS` and fail the connection if the server refuses.
    Require,
}

/// TLS credentials and verification settings, owned by the handle.
#[derive(Debug, Clone, Default)]
pub(crate) struct TlsSettings {
    pub certificates: Option<PathBuf>,
    pub verify_peer: bool,
    pub username: Option<String>,
    pub psk_file: Option<PathBuf>,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| {
        set_error(
            Errno::from_raw(e.raw_os_error().unwrap_or(0)),
            format!("cannot open {}", path.display()),
        )
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| set_error(Errno::EINVAL, format!("invalid PEM in {}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| {
        set_error(
            Errno::from_raw(e.raw_os_error().unwrap_or(0)),
            format!("cannot open {}", path.display()),
        )
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|_| set_error(Errno::EINVAL, format!("invalid PEM in {}", path.display())))?
        .ok_or_else(|| {
            set_error(
                Errno::EINVAL,
                format!("no private key found in {}", path.display()),
            )
        })
}

/// Accept any server certificate. Installed when `tls_verify_peer` is off.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
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

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn build_config(settings: &TlsSettings) -> Result<ClientConfig, Error> {
    if settings.psk_file.is_some() {
        // rustls has no TLS-PSK ciphersuites; the setting is accepted for
        // configuration parity but cannot be honored here.
        return Err(set_error(
            Errno::ENOTSUP,
            "TLS-PSK authentication is not supported by this client",
        ));
    }

    let mut roots = RootCertStore::empty();
    let mut client_cert = None;
    match &settings.certificates {
        Some(dir) => {
            let ca = dir.join("ca-cert.pem");
            for cert in load_certs(&ca)? {
                roots.add(cert).map_err(|_| {
                    set_error(Errno::EINVAL, format!("bad CA certificate in {}", ca.display()))
                })?;
            }
            let cert_path = dir.join("client-cert.pem");
            let key_path = dir.join("client-key.pem");
            if cert_path.exists() && key_path.exists() {
                client_cert = Some((load_certs(&cert_path)?, load_key(&key_path)?));
            }
        }
        None => {
            roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let builder = if settings.verify_peer {
        ClientConfig::builder().with_root_certificates(roots)
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
    };

    let config = match client_cert {
        Some((certs, key)) => builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| set_error(Errno::EINVAL, format!("bad client certificate: {e}")))?,
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// Create a TLS session over `inner`, adopting it. The connection stays in
/// the handshaking phase until [`TlsTransport::handshake`] reports done.
pub(crate) fn create_session(
    settings: &TlsSettings,
    server_name: &str,
    inner: Box<dyn Transport>,
) -> Result<TlsTransport, Error> {
    let config = build_config(settings)?;
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| set_error(Errno::EINVAL, format!("invalid TLS server name {server_name}")))?;
    let conn = ClientConnection::new(Arc::new(config), name)
        .map_err(|e| set_error(None, format!("cannot create TLS session: {e}")))?;
    debug!(target: "nbd", "TLS session created for {server_name}");
    Ok(TlsTransport {
        inner,
        conn,
        plaintext_avail: 0,
        close_notify_sent: false,
    })
}

/// Adapters mapping transport semantics onto the `io` traits rustls expects.
struct WireRead<'a>(&'a mut dyn Transport);

impl Read for WireRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.recv(buf) {
            Ok(n) => Ok(n),
            Err(TransportError::WouldBlock(_)) => Err(io::ErrorKind::WouldBlock.into()),
            Err(TransportError::Io(errno)) => Err(io::Error::from_raw_os_error(errno as i32)),
            Err(TransportError::Tls(msg)) => Err(io::Error::new(io::ErrorKind::Other, msg)),
        }
    }
}

struct WireWrite<'a>(&'a mut dyn Transport);

impl Write for WireWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.send(buf, false) {
            Ok(n) => Ok(n),
            Err(TransportError::WouldBlock(_)) => Err(io::ErrorKind::WouldBlock.into()),
            Err(TransportError::Io(errno)) => Err(io::Error::from_raw_os_error(errno as i32)),
            Err(TransportError::Tls(msg)) => Err(io::Error::new(io::ErrorKind::Other, msg)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// TLS transport: rustls session over an adopted plain transport.
pub(crate) struct TlsTransport {
    inner: Box<dyn Transport>,
    conn: ClientConnection,
    /// Decrypted bytes buffered in the session, not yet handed to a reader.
    plaintext_avail: usize,
    close_notify_sent: bool,
}

impl TlsTransport {
    /// Push any pending TLS records to the wire. On return either nothing is
    /// queued or the socket is full (`WouldBlock(WRITE)`).
    fn flush_wire(&mut self) -> TransportResult<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut WireWrite(self.inner.as_mut())) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(TransportError::WouldBlock(AioDirection::WRITE));
                }
                Err(e) => return Err(io_error(e)),
            }
        }
        Ok(())
    }

    /// Pull wire data into the session and decrypt. `Ok(true)` means the
    /// peer closed the socket.
    fn fill_wire(&mut self) -> TransportResult<bool> {
        match self.conn.read_tls(&mut WireRead(self.inner.as_mut())) {
            Ok(0) => Ok(true),
            Ok(_) => {
                let state = self
                    .conn
                    .process_new_packets()
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                self.plaintext_avail = state.plaintext_bytes_to_read();
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(TransportError::WouldBlock(AioDirection::READ))
            }
            Err(e) => Err(io_error(e)),
        }
    }

    /// Drive the TLS handshake one bounded step. `Ok(true)` when the
    /// handshake has completed; `WouldBlock` tells the caller which
    /// direction to wait on.
    pub fn handshake(&mut self) -> TransportResult<bool> {
        loop {
            self.flush_wire()?;
            if !self.conn.is_handshaking() {
                return Ok(true);
            }
            if self.conn.wants_read() {
                if self.fill_wire()? {
                    return Err(TransportError::Tls(
                        "server closed connection during TLS handshake".into(),
                    ));
                }
            }
        }
    }

    /// Direction the handshake is currently waiting on; used by the state
    /// machine to pick the initial poll direction after `STARTTLS`.
    pub fn handshake_direction(&self) -> AioDirection {
        if self.conn.wants_write() {
            AioDirection::WRITE
        } else {
            AioDirection::READ
        }
    }
}

impl Transport for TlsTransport {
    fn recv(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        if self.conn.is_handshaking() {
            self.handshake()?;
        }
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => {
                    self.plaintext_avail = self.plaintext_avail.saturating_sub(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No decrypted data; try to make progress on the wire.
                    if self.fill_wire()? {
                        // Peer went away without close-notify. Surface as an
                        // ordinary EOF; the state machine decides whether the
                        // moment was orderly.
                        return Ok(0);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(io_error(e)),
            }
        }
    }

    fn send(&mut self, buf: &[u8], _more: bool) -> TransportResult<usize> {
        if self.conn.is_handshaking() {
            self.handshake()?;
        }
        // Do not take more plaintext while encrypted records are stuck
        // behind a full socket, or the session buffer grows without bound.
        self.flush_wire()?;
        let n = self
            .conn
            .writer()
            .write(buf)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        match self.flush_wire() {
            Ok(()) | Err(TransportError::WouldBlock(_)) => Ok(n),
            Err(e) => Err(e),
        }
    }

    fn pending(&self) -> bool {
        self.plaintext_avail > 0
    }

    fn poll_fd(&self) -> RawFd {
        self.inner.poll_fd()
    }

    fn shutdown_writes(&mut self) -> TransportResult<bool> {
        if !self.close_notify_sent {
            self.conn.send_close_notify();
            self.close_notify_sent = true;
        }
        match self.flush_wire() {
            Ok(()) => self.inner.shutdown_writes(),
            Err(TransportError::WouldBlock(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn close(mut self: Box<Self>) {
        // Best effort: queue a close-notify and push whatever fits before
        // the socket goes away. A peer that already vanished just fails
        // the flush.
        if !self.close_notify_sent {
            self.conn.send_close_notify();
            self.close_notify_sent = true;
        }
        let _ = self.flush_wire();
        self.inner.close();
    }

    fn tls_handshake(&mut self) -> TransportResult<bool> {
        TlsTransport::handshake(self)
    }
}

fn io_error(e: io::Error) -> TransportError {
    match e.raw_os_error() {
        Some(errno) => TransportError::Io(Errno::from_raw(errno)),
        None => TransportError::Tls(e.to_string()),
    }
}
