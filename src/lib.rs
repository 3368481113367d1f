//! # amqwire
//!
//! A blocking transport layer for AMQP 0-9-1 clients: connection
//! establishment, socket tuning and frame-level I/O over TCP or TLS.
//!
//! ## Features
//!
//! - **Frame codec** for the AMQP 0-9-1 wire format
//! - **Buffered exact-size reads** so timeouts never lose bytes
//! - **Resumable frame reads** that pick up a timed-out frame where it left off
//! - **TLS** via rustls, with CA/client-cert files or a prebuilt config
//! - **Socket tuning**: TCP options, keepalive and read/write timeouts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Connection/Channel Layer                │
//! │       (methods, content bodies; not this crate)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Frame Protocol                      │
//! │        (header + payload + trailer, heartbeats)      │
//! ├─────────────────────────────────────────────────────┤
//! │               Buffered Byte Engine                   │
//! │      (exact-size reads, timeout-safe buffering)      │
//! ├─────────────────────────────────────────────────────┤
//! │                   Byte Links                         │
//! │                 (plain TCP, TLS)                     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod endpoint;
pub mod frame;
pub mod sockopt;
pub mod transport;

pub use endpoint::Endpoint;
pub use frame::{Frame, FrameHeader, FRAME_END, FRAME_HEADER_SIZE};
pub use sockopt::{SocketSettings, TcpOption};
pub use transport::{
    create, TlsOptions, TlsSettings, Transport, TransportConfig, TransportError,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol header sent immediately after connecting ("AMQP" 0-9-1)
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x01\x01\x00\x09";

/// Default port for AMQP over TCP
pub const DEFAULT_PORT: u16 = 5672;

/// Result type alias
pub type Result<T> = std::result::Result<T, TransportError>;
