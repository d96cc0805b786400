//! Error handling for the connectivity core
//!
//! A single error type covers every operation in this crate. Underlying
//! library errors convert automatically through `thiserror`.
//!
//! ## Error Categories
//!
//! ### Transport errors
//! Connection refused, reset or timed out. Channel services recover from
//! these locally; the device manager only ever sees a closed channel.
//!
//! ### Protocol errors
//! Malformed identity packets, certificate/id mismatches and unsupported
//! protocol versions. The offending handshake or channel is dropped.
//!
//! ### Storage errors
//! A corrupt or unreadable persisted record. The single record is skipped.
//!
//! ### Configuration errors
//! Unknown channel service names. Reported to the caller, nothing changes.
//!
//! ### Invariant violations
//! Attaching a channel to an already-connected device or pairing a device
//! twice. These assert in debug builds and are rejected in release builds.
//!
//! ```rust
//! use cosmic_ext_connect_protocol::ProtocolError;
//!
//! let error = ProtocolError::DeviceNotFound("unknown-device-id".to_string());
//! assert_eq!(error.to_string(), "Device not found: unknown-device-id");
//! ```

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Automatic Conversions
///
/// - `std::io::Error` → `ProtocolError::Io`
/// - `serde_json::Error` → `ProtocolError::Json`
/// - `openssl::ssl::Error` → `ProtocolError::Tls`
/// - `openssl::error::ErrorStack` → `ProtocolError::Certificate`
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS session error
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate generation or parsing error
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// The presented certificate does not match the claimed identity
    #[error("Certificate validation error: {0}")]
    CertificateValidation(String),

    /// Device not found in registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation requires a paired device
    #[error("Not paired")]
    NotPaired,

    /// Operation requires a connected device
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// A channel was attached to a device that already holds one
    #[error("Device already connected: {0}")]
    AlreadyConnected(String),

    /// A pairing was completed on a device that is already paired
    #[error("Device already paired: {0}")]
    AlreadyPaired(String),

    /// Invalid or malformed packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Transport level failure that is not an I/O error
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote end closed the channel
    #[error("Connection closed")]
    ConnectionClosed,

    /// Persisted data could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    /// Network connection error
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Connection timeout
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Connection refused
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Network unreachable
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Protocol version mismatch
    #[error("Protocol version mismatch: {0}")]
    ProtocolVersionMismatch(String),

    /// Configuration error
    ///
    /// Returned for unknown channel service names.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Packet size exceeded
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific network error
    ///
    /// ```rust
    /// use cosmic_ext_connect_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "connection timeout");
    /// let error = ProtocolError::from_io_error(io_error, "connecting to device");
    ///
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::NetworkUnreachable => {
                ProtocolError::NetworkUnreachable(format!("{}: {}", context, error))
            }
            ErrorKind::PermissionDenied => {
                ProtocolError::PermissionDenied(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::NetworkError(format!(
                    "{}: connection interrupted ({})",
                    context, error
                ))
            }
            ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(error),
        }
    }

    /// Get a user-friendly error message suitable for display in UI
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotPaired => {
                "Device not paired. Please pair the device first.".to_string()
            }
            ProtocolError::NotConnected(id) => {
                format!("Device '{}' is not connected.", id)
            }
            ProtocolError::DeviceNotFound(id) => {
                format!("Device '{}' not found. Check if the device is connected.", id)
            }
            ProtocolError::AlreadyConnected(id) => {
                format!("Device '{}' already has an active connection.", id)
            }
            ProtocolError::AlreadyPaired(id) => format!("Device '{}' is already paired.", id),
            ProtocolError::Timeout(msg) => {
                format!("Connection timeout: {}. Check network connection.", msg)
            }
            ProtocolError::ConnectionRefused(_) => {
                "Connection refused. Check if COSMIC Connect is running on the device."
                    .to_string()
            }
            ProtocolError::NetworkUnreachable(_) => {
                "Network unreachable. Check if both devices are on the same network.".to_string()
            }
            ProtocolError::NetworkError(msg) => {
                format!("Network error: {}. Connection may be unstable.", msg)
            }
            ProtocolError::ConnectionClosed => "The connection was closed.".to_string(),
            ProtocolError::Transport(msg) => format!("Transport error: {}.", msg),
            ProtocolError::PermissionDenied(msg) => {
                format!(
                    "Permission denied: {}. Check file and directory permissions.",
                    msg
                )
            }
            ProtocolError::Storage(msg) => format!("Could not access saved data: {}.", msg),
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            ProtocolError::ProtocolVersionMismatch(msg) => {
                format!(
                    "Incompatible protocol version: {}. Update both applications.",
                    msg
                )
            }
            ProtocolError::CertificateValidation(msg) => {
                format!(
                    "Certificate validation failed: {}. You may need to re-pair.",
                    msg
                )
            }
            ProtocolError::PacketSizeExceeded(size, max) => {
                format!("Packet too large ({} bytes, max {} bytes).", size, max)
            }
            ProtocolError::InvalidPacket(msg) => format!("Invalid data received: {}.", msg),
            ProtocolError::Cancelled(msg) => format!("Operation cancelled: {}.", msg),
            ProtocolError::Io(e) => format!("I/O error: {}.", e),
            ProtocolError::Json(e) => format!("Data format error: {}.", e),
            ProtocolError::Tls(e) => format!("Secure connection error: {}.", e),
            ProtocolError::Certificate(e) => {
                format!("Certificate error: {}. You may need to re-pair.", e)
            }
        }
    }
}
