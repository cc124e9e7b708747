use thiserror::Error;

use crate::types::Endpoint;

/// Reasons the watch gives (or implies) for refusing the authentication handshake
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// The watch decrypted our response with its own key and it did not match
    #[error("auth key rejected by the watch")]
    KeyRejected,

    /// The watch has not been paired with this host yet
    #[error("watch requires pairing - confirm the prompt on the watch")]
    PairingRequired,

    /// Any other non-success status
    #[error("handshake failed: opcode {opcode:02X}, status {status:02X}")]
    Status {
        /// Opcode the response refers to
        opcode: u8,
        /// Status byte returned by the watch
        status: u8,
    },

    /// The challenge frame did not carry a full 16-byte nonce
    #[error("malformed challenge frame")]
    MalformedChallenge,
}

impl AuthFailure {
    /// Map a `10 <opcode> <status>` rejection frame onto a failure cause
    #[must_use]
    pub const fn from_status(opcode: u8, status: u8) -> Self {
        match (opcode, status) {
            (0x03, 0x04) => Self::KeyRejected,
            (0x01, 0x04) => Self::PairingRequired,
            _ => Self::Status { opcode, status },
        }
    }
}

/// Errors that can occur when talking to an Amazfit watch
#[derive(Error, Debug)]
pub enum BipError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("Amazfit device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Invalid configuration detected before touching the transport
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A GATT endpoint required by the operation was not resolved
    #[error("Required endpoint {endpoint} is not available")]
    MissingEndpoint {
        /// The missing endpoint
        endpoint: Endpoint,
    },

    /// Auth key input is not 32 hexadecimal characters
    #[error("Invalid auth key: {0}")]
    InvalidCredential(String),

    /// A single write or subscription failed at the transport level
    #[error("Transport error: {0}")]
    Transport(String),

    /// A command write kept failing after every retry and write-mode fallback
    #[error("Write to {endpoint} failed after {attempts} attempts")]
    WriteFailed {
        /// Endpoint that was written
        endpoint: Endpoint,
        /// Number of attempts made
        attempts: u32,
    },

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(AuthFailure),

    /// Operation timeout
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation requires a completed handshake
    #[error("Device is not authenticated")]
    NotAuthenticated,

    /// Another fetch session is already running on this connection
    #[error("An activity fetch is already in progress")]
    FetchInProgress,

    /// The handshake object already reached a terminal state
    #[error("Handshake already finished - start a new one")]
    HandshakeFinished,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// XML serialization errors
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

/// Result type for bipfetch operations
pub type Result<T> = std::result::Result<T, BipError>;

impl BipError {
    /// Check if this error is a configuration problem that no retry will fix
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::MissingEndpoint { .. } | Self::InvalidCredential(_)
        )
    }

    /// Check if this error indicates a transport or connection issue
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::Transport(_)
                | Self::WriteFailed { .. }
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound
        )
    }

    /// Check if this error is a timeout
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if a fresh attempt on the same connection may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Transport(_)
                | Self::WriteFailed { .. }
                | Self::FetchInProgress
                | Self::AuthenticationFailed(AuthFailure::PairingRequired)
        )
    }
}
