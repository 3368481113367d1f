//! Blocking transport engine
//!
//! Owns the connection lifecycle and the frame-level I/O loop:
//! - address resolution and the candidate connect loop
//! - socket tuning and the protocol header exchange
//! - exact-size buffered reads tolerant of short receives
//! - plain TCP and TLS byte links behind one private interface

mod plain;
mod tls;

pub use tls::{TlsOptions, TlsSettings};

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::frame::{Frame, FrameHeader, FRAME_END, FRAME_HEADER_SIZE};
use crate::sockopt::{self, SocketSettings};
use crate::{DEFAULT_PORT, PROTOCOL_HEADER};

use plain::PlainLink;
use tls::TlsLink;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("received {found:#04x} while expecting 0xce")]
    UnexpectedFrameTrailer { found: u8 },

    #[error("malformed endpoint: {0}")]
    MalformedEndpoint(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl TransportError {
    /// Whether the connection is unusable after this error.
    ///
    /// Timeouts, interrupted system calls and framing mismatches leave the
    /// connection intact; everything else means the peer or the socket is
    /// gone.
    pub fn disconnects(&self) -> bool {
        match self {
            TransportError::Io(err) => err.kind() != io::ErrorKind::Interrupted,
            TransportError::ConnectionClosed | TransportError::Tls(_) => true,
            TransportError::Timeout
            | TransportError::UnexpectedFrameTrailer { .. }
            | TransportError::MalformedEndpoint(_) => false,
        }
    }
}

/// Map an I/O error into the transport taxonomy.
///
/// `WouldBlock` doubles as the expiry errno on sockets with a receive or
/// send timeout, so both timeout kinds collapse into
/// [`TransportError::Timeout`]. Zero-progress writes and TLS streams cut
/// without a close notice both mean the peer is gone.
fn classify_io(err: io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout,
        io::ErrorKind::WriteZero | io::ErrorKind::UnexpectedEof => TransportError::ConnectionClosed,
        _ => TransportError::Io(err),
    }
}

/// Byte-level capability both link flavors provide to the engine
pub(crate) trait Link: Send {
    /// Send all of `data`, blocking until every byte is accepted
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Receive at most `buf.len()` bytes, returning 0 at end of stream
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Current socket read timeout
    fn read_timeout(&self) -> io::Result<Option<Duration>>;

    /// Replace the socket read timeout
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Release the connection, announcing the shutdown to the peer when
    /// the protocol has a way to
    fn shutdown(self: Box<Self>);
}

/// Transport configuration
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Timeout for each connection attempt; unlimited when unset
    pub connect_timeout: Option<Duration>,

    /// Socket read timeout; reads block indefinitely when unset
    pub read_timeout: Option<Duration>,

    /// Socket write timeout; writes block indefinitely when unset
    pub write_timeout: Option<Duration>,

    /// Extra TCP options applied after connecting, merged over the
    /// socket's current values
    pub socket_settings: Option<SocketSettings>,

    /// Propagate an interrupted system call on the first read of a frame
    /// instead of retrying it, so callers blocked waiting for a frame can
    /// observe signals
    pub raise_on_initial_eintr: bool,

    /// TLS options, consulted when the transport is created with TLS
    pub tls: Option<TlsOptions>,
}

/// How the byte link is established
pub(crate) enum Security {
    Plain,
    Tls(TlsOptions),
}

/// A blocking AMQP 0-9-1 transport.
///
/// Drives one TCP or TLS connection: connects, tunes the socket, sends the
/// protocol header and then exchanges frames. Reads are buffered so short
/// receives and timeouts never lose bytes; a timed-out frame read can be
/// retried and will pick up the same frame from the start.
pub struct Transport {
    host: String,
    port: u16,
    connected: bool,
    link: Option<Box<dyn Link>>,
    read_buffer: BytesMut,
    security: Security,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    socket_settings: Option<SocketSettings>,
    raise_on_initial_eintr: bool,
}

impl Transport {
    fn new(
        host: &str,
        security: Security,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let endpoint = Endpoint::parse(host)?;
        Ok(Self {
            host: endpoint.host,
            port: endpoint.port.unwrap_or(DEFAULT_PORT),
            // Optimistic until an error or close() proves otherwise.
            connected: true,
            link: None,
            read_buffer: BytesMut::new(),
            security,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            socket_settings: config.socket_settings,
            raise_on_initial_eintr: config.raise_on_initial_eintr,
        })
    }

    /// Whether the transport considers the connection usable
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Endpoint host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Endpoint port, after applying the default
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connect the transport and perform the protocol greeting.
    ///
    /// Every resolved address is tried in order; the last failure is
    /// reported if none accepts. Once a socket is connected it is tuned,
    /// wrapped in TLS when configured, and the protocol header goes out.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        let stream = self.open_stream()?;
        match self.init_stream(stream) {
            Ok(()) => {
                debug!("connected to {}:{}", self.host, self.port);
                Ok(())
            }
            Err(err) => {
                if err.disconnects() {
                    self.connected = false;
                }
                Err(err)
            }
        }
    }

    /// Resolve the endpoint and connect the first address that accepts.
    fn open_stream(&self) -> Result<TcpStream, TransportError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(classify_io)?;

        let mut last_err: Option<io::Error> = None;
        for addr in addrs {
            match self.connect_addr(addr) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }

        Err(match last_err {
            Some(err) => classify_io(err),
            None => TransportError::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no addresses found for {}", self.host),
            )),
        })
    }

    fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        // Socket::new sets close-on-exec where the platform supports it.
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        match self.connect_timeout {
            Some(timeout) => socket.connect_timeout(&addr.into(), timeout)?,
            None => socket.connect(&addr.into())?,
        }
        Ok(socket.into())
    }

    /// Prepare a connected stream: tuning, link setup, protocol header.
    fn init_stream(&mut self, stream: TcpStream) -> Result<(), TransportError> {
        // The connect timeout no longer applies once connected.
        stream.set_nonblocking(false).map_err(classify_io)?;

        sockopt::configure(
            &stream,
            self.socket_settings.as_ref(),
            self.read_timeout,
            self.write_timeout,
        )
        .map_err(classify_io)?;

        let mut link: Box<dyn Link> = match &self.security {
            Security::Plain => Box::new(PlainLink::new(stream)),
            Security::Tls(options) => Box::new(TlsLink::setup(stream, options, &self.host)?),
        };

        link.send(&PROTOCOL_HEADER).map_err(classify_io)?;

        self.read_buffer.clear();
        self.link = Some(link);
        Ok(())
    }

    /// Read the next frame, blocking until it is complete.
    ///
    /// On a timeout the bytes consumed so far are put back, so the next
    /// call re-reads the same frame from its header; `connected` is not
    /// affected. Any disconnecting error marks the transport unusable
    /// before propagating.
    pub fn read_frame(&mut self) -> Result<Frame, TransportError> {
        let mut consumed = BytesMut::new();
        match self.read_frame_inner(&mut consumed) {
            Ok(frame) => Ok(frame),
            Err(TransportError::Timeout) => {
                // Put the partially read frame back so the next call
                // starts over from the frame header.
                consumed.extend_from_slice(&self.read_buffer);
                self.read_buffer = consumed;
                Err(TransportError::Timeout)
            }
            Err(err) => {
                if err.disconnects() {
                    self.connected = false;
                }
                Err(err)
            }
        }
    }

    fn read_frame_inner(&mut self, consumed: &mut BytesMut) -> Result<Frame, TransportError> {
        let header_bytes = self.read_exact_bytes(FRAME_HEADER_SIZE, true)?;
        consumed.extend_from_slice(&header_bytes);
        let header = FrameHeader::parse(&header_bytes);

        let payload = self.read_exact_bytes(header.size as usize, false)?;
        consumed.extend_from_slice(&payload);

        let trailer = self.read_exact_bytes(1, false)?;
        if trailer[0] != FRAME_END {
            return Err(TransportError::UnexpectedFrameTrailer { found: trailer[0] });
        }

        Ok(Frame::new(header.frame_type, header.channel, payload))
    }

    /// Read the next frame under a temporary read timeout.
    ///
    /// The previous timeout is restored on every exit path; if the read
    /// succeeded but the restore failed, the restore error becomes the
    /// call's result. Setting the same value the socket already has is
    /// skipped, saving the two syscalls in the common case of a fixed
    /// polling interval.
    pub fn read_frame_with_timeout(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Frame, TransportError> {
        let Some(timeout) = timeout else {
            return self.read_frame();
        };

        let previous = match self.link.as_ref() {
            Some(link) => {
                let previous = link.read_timeout().map_err(classify_io)?;
                if previous != Some(timeout) {
                    link.set_read_timeout(Some(timeout)).map_err(classify_io)?;
                }
                previous
            }
            // No link; let the plain read path report it.
            None => return self.read_frame(),
        };
        let overridden = previous != Some(timeout);

        let result = self.read_frame();

        if overridden {
            let restored = match self.link.as_ref() {
                Some(link) => link.set_read_timeout(previous),
                None => Ok(()),
            };
            // A read error takes precedence over a failed restore.
            if let Err(err) = restored {
                if result.is_ok() {
                    let err = classify_io(err);
                    if err.disconnects() {
                        self.connected = false;
                    }
                    return Err(err);
                }
            }
        }
        result
    }

    /// Accumulate exactly `n` bytes, reading from the link as needed.
    ///
    /// Interrupted reads are retried, except on the first read of a frame
    /// when the configuration asks for them to propagate. On timeout the
    /// bytes received so far stay buffered for the next attempt.
    fn read_exact_bytes(&mut self, n: usize, initial: bool) -> Result<Bytes, TransportError> {
        while self.read_buffer.len() < n {
            let Some(link) = self.link.as_mut() else {
                return Err(TransportError::ConnectionClosed);
            };

            let filled = self.read_buffer.len();
            self.read_buffer.resize(n, 0);
            let result = link.recv(&mut self.read_buffer[filled..]);
            match result {
                Ok(0) => {
                    self.read_buffer.truncate(filled);
                    return Err(TransportError::ConnectionClosed);
                }
                Ok(received) => self.read_buffer.truncate(filled + received),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    self.read_buffer.truncate(filled);
                    if initial && self.raise_on_initial_eintr {
                        return Err(TransportError::Io(err));
                    }
                }
                Err(err) => {
                    self.read_buffer.truncate(filled);
                    return Err(classify_io(err));
                }
            }
        }

        Ok(self.read_buffer.split_to(n).freeze())
    }

    /// Send raw bytes, blocking until all are accepted.
    pub fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::ConnectionClosed)?;
        match link.send(data) {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = classify_io(err);
                if err.disconnects() {
                    self.connected = false;
                }
                Err(err)
            }
        }
    }

    /// Encode and send one frame.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.write(&frame.encode())
    }

    /// Shut the connection down and release the socket.
    ///
    /// Never fails; closing an already closed transport is a no-op.
    pub fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown();
            debug!("connection to {}:{} closed", self.host, self.port);
        }
        self.connected = false;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create a transport for `host`, secured when `use_tls` is set.
///
/// The endpoint may carry an explicit port (`host:port` or bracketed
/// IPv6); otherwise [`DEFAULT_PORT`] applies. The returned transport is
/// not yet connected; call [`Transport::connect`] before any frame I/O.
pub fn create(
    host: &str,
    use_tls: bool,
    mut config: TransportConfig,
) -> Result<Transport, TransportError> {
    let security = if use_tls {
        Security::Tls(config.tls.take().unwrap_or_default())
    } else {
        Security::Plain
    };
    Transport::new(host, security, config)
}
