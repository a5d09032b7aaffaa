//! Nonblocking connection facade used by every prober.
//!
//! Wraps a plaintext or TLS byte stream behind a small set of flag bits and
//! two owned buffers (`bi` ingress, `bo` egress), the way HAProxy's
//! `struct connection` does, but as an `async fn`-driven capability object
//! instead of raw `recv`/`send`/`wake` callbacks invoked by a poller.

use std::net::SocketAddr;
use std::time::Duration;

use bitflags::bitflags;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Default capacity of the ingress/egress buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

bitflags! {
    /// Connection flag bits, mirroring HAProxy's `CO_FL_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnFlags: u16 {
        /// The transport-level connect has completed.
        const CONNECTED          = 0b0000_0001;
        /// An unrecoverable transport error has occurred.
        const ERROR              = 0b0000_0010;
        /// The read half has been shut down.
        const READ_SHUT          = 0b0000_0100;
        /// The write half has been shut down.
        const WRITE_SHUT         = 0b0000_1000;
        /// A TLS handshake is still in progress.
        const HANDSHAKE_PENDING  = 0b0001_0000;
        /// A PROXY protocol header still needs to be sent.
        const SEND_PROXY_PENDING = 0b0010_0000;
    }
}

/// Errors surfaced by the connection facade.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The TCP connect itself failed (refused, unreachable, etc).
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    /// The TLS handshake failed.
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
    /// A read or write on an established connection failed.
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
    /// A resource (fd, memory) could not be obtained to establish the connection.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    fn raw_tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(s) => s.get_ref().0,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf).await,
            Transport::Tls(s) => s.read(buf).await,
        }
    }

    async fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf).await,
            Transport::Tls(s) => s.write(buf).await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.shutdown().await,
            Transport::Tls(s) => s.shutdown().await,
        }
    }
}

/// A nonblocking byte connection used by one probe round.
pub struct CheckConnection {
    flags: ConnFlags,
    /// Ingress buffer ("bi" in HAProxy parlance).
    pub bi: BytesMut,
    /// Egress buffer ("bo" in HAProxy parlance).
    pub bo: BytesMut,
    transport: Option<Transport>,
    peer: SocketAddr,
}

/// Errno values shaped like local resource exhaustion (EMFILE, ENFILE,
/// ENOMEM on Linux) rather than an ordinary connect failure; these should
/// surface as [`ConnectionError::ResourceExhausted`] so they classify as
/// SOCKERR and get logged as an emergency (spec.md §7) instead of a routine
/// L4CON.
fn is_resource_exhausted(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(24) | Some(23) | Some(12))
}

impl CheckConnection {
    /// Connect (plaintext) to `peer`.
    pub async fn connect(peer: SocketAddr) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect(peer).await.map_err(|e| {
            if is_resource_exhausted(&e) {
                ConnectionError::ResourceExhausted(e.to_string())
            } else {
                ConnectionError::Connect(e)
            }
        })?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            flags: ConnFlags::CONNECTED,
            bi: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            bo: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            transport: Some(Transport::Plain(stream)),
            peer,
        })
    }

    /// The peer address this connection is talking to.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current flag bits.
    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    /// Set the error flag, e.g. after a classification has produced a FAILED
    /// verdict, so the eventual drop emits a RST instead of a half-close.
    pub fn set_error(&mut self) {
        self.flags.insert(ConnFlags::ERROR);
    }

    /// Whether a TLS handshake is still outstanding.
    pub fn handshake_pending(&self) -> bool {
        self.flags.contains(ConnFlags::HANDSHAKE_PENDING)
    }

    /// Perform a TLS client handshake over the already-connected transport.
    pub async fn upgrade_tls(
        &mut self,
        connector: &TlsConnector,
        server_name: pki_types::ServerName<'static>,
    ) -> Result<(), ConnectionError> {
        self.flags.insert(ConnFlags::HANDSHAKE_PENDING);
        let plain = match self.transport.take() {
            Some(Transport::Plain(s)) => s,
            other => {
                self.transport = other;
                return Err(ConnectionError::Handshake(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "upgrade_tls called without a plaintext transport",
                )));
            }
        };
        match connector.connect(server_name, plain).await {
            Ok(tls) => {
                self.transport = Some(Transport::Tls(Box::new(tls)));
                self.flags.remove(ConnFlags::HANDSHAKE_PENDING);
                Ok(())
            }
            Err(e) => {
                self.flags.insert(ConnFlags::ERROR);
                Err(ConnectionError::Handshake(e))
            }
        }
    }

    /// Read whatever is currently available into `bi`, NUL-terminating the
    /// tail as the probers expect. Returns the number of bytes read (0 means
    /// EOF / orderly close).
    pub async fn read_into_bi(&mut self) -> Result<usize, ConnectionError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no transport",
            )))?;
        let mut scratch = [0u8; 4096];
        let n = transport.read(&mut scratch).await.map_err(|e| {
            self.flags.insert(ConnFlags::ERROR);
            ConnectionError::Io(e)
        })?;
        if n == 0 {
            self.flags.insert(ConnFlags::READ_SHUT);
        } else {
            self.bi.extend_from_slice(&scratch[..n]);
        }
        Ok(n)
    }

    /// Whether `bi` is full (can't accept another read without growing).
    pub fn bi_full(&self) -> bool {
        self.bi.len() >= DEFAULT_BUFFER_SIZE
    }

    /// Send all bytes currently queued in `bo`.
    pub async fn flush_bo(&mut self) -> Result<usize, ConnectionError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no transport",
            )))?;
        let mut sent = 0;
        while !self.bo.is_empty() {
            let n = transport.write(&self.bo).await.map_err(|e| {
                self.flags.insert(ConnFlags::ERROR);
                ConnectionError::Io(e)
            })?;
            if n == 0 {
                break;
            }
            let _ = self.bo.split_to(n);
            sent += n;
        }
        Ok(sent)
    }

    /// Gracefully shut the write half (clean close after a known verdict).
    pub async fn shutdown_write(&mut self) {
        if let Some(t) = self.transport.as_mut() {
            let _ = t.shutdown().await;
        }
        self.flags.insert(ConnFlags::WRITE_SHUT);
    }

    /// Drain any remaining bytes and force-close, setting SO_LINGER(0) if the
    /// error flag is set so the kernel emits a RST instead of a FIN,
    /// avoiding TIME_WAIT buildup on a busy check fleet.
    pub fn force_close(mut self) {
        if let Some(t) = self.transport.take() {
            if self.flags.contains(ConnFlags::ERROR) {
                let _ = t.raw_tcp().set_linger(Some(Duration::ZERO));
            }
            drop(t);
        }
    }

    /// Await read-readiness, mirroring the edge-triggered `on_readable`
    /// interest flag: returns once there is something to read.
    pub async fn readable(&self) -> Result<(), ConnectionError> {
        match self.transport.as_ref() {
            Some(t) => t.raw_tcp().readable().await.map_err(ConnectionError::Io),
            None => Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no transport",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_connected_only() {
        let flags = ConnFlags::CONNECTED;
        assert!(flags.contains(ConnFlags::CONNECTED));
        assert!(!flags.contains(ConnFlags::ERROR));
    }

    #[test]
    fn emfile_is_classified_as_resource_exhausted() {
        let err = std::io::Error::from_raw_os_error(24);
        assert!(is_resource_exhausted(&err));
    }

    #[test]
    fn connection_refused_is_not_resource_exhausted() {
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(!is_resource_exhausted(&err));
    }
}
