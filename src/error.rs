//! # Error Types
//!
//! Error handling for the bundle transport and the control panel protocol.
//!
//! This module defines all error variants that can occur while driving a
//! channel, from low-level socket failures to authentication rejections.
//!
//! ## Error Categories
//! - **Transport errors**: socket I/O, TLS engine failures, bundle framing
//!   violations — always fatal to the channel, never retried
//! - **Authentication errors**: bad challenge echo, unknown peer id — fatal,
//!   logged at `info` level
//! - **Timeout errors**: per-connection deadline exceeded — fatal to that
//!   connection only
//! - **Rejection**: an inbound connection failed the header check — logged at
//!   `trace` level, socket closed without further handshake
//!
//! Nothing in this crate retries on error; reconnect policy belongs to the
//! caller.

use std::io;
use thiserror::Error;

/// Primary error type for all transport and protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("bundle too large: {0} bytes")]
    OversizedBundle(usize),

    #[error("zero-length bundle header")]
    EmptyBundle,

    #[error("compression failed")]
    CompressionFailure,

    #[error("decompression failed")]
    DecompressionFailure,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("unknown peer id: {0}")]
    UnknownPeer(String),

    #[error("connection rejected: bad connection header")]
    Rejected,

    #[error("no handler for connection selector {0:#04x}")]
    UnknownSelector(u8),

    #[error("connection timed out")]
    Timeout,

    #[error("worker pool is not running")]
    NoWorkers,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ProtocolError {
    /// Whether this error ends the connection without anything having gone
    /// wrong from the application's point of view (peer hung up cleanly).
    pub fn is_graceful_close(&self) -> bool {
        matches!(self, ProtocolError::ConnectionClosed)
    }

    /// Whether this error came out of the authentication exchange.
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            ProtocolError::AuthenticationFailed(_) | ProtocolError::UnknownPeer(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
