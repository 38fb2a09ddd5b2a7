//! # Protocol Error Types
//!
//! Every layer reports through [`ProtocolError`]. Fatal variants end the
//! session; the key-exchange variants are recovered from inside the
//! crypto manager.

use thiserror::Error;

/// Main error type for protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Packet kind byte outside the known set
    #[error("Unknown packet kind: 0x{0:02x}")]
    UnknownPacketKind(u8),

    /// Packet or frame bytes do not parse
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Frame length prefix exceeds the configured limit
    #[error("Frame exceeds maximum size: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Symmetric cipher failure
    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    /// Diffie-Hellman request/response could not be processed
    #[error("Key exchange failed: {0}")]
    KeyExchangeError(String),

    /// Packet or message outside the protocol's state transitions
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// Envelope type id not present in the registry
    #[error("Unknown message type id: {0}")]
    UnknownMessageType(u8),

    /// Envelope type registration rejected
    #[error("Invalid type registry: {0}")]
    InvalidRegistry(String),

    /// Service name missing from the catalog
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// Two registrations under one numeric id
    #[error("Duplicate service id: {0}")]
    DuplicateService(u64),

    /// Session has already been stopped
    #[error("Connection closed")]
    ConnectionClosed,

    /// Timeout
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration could not be loaded or saved
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for ProtocolError {
    fn from(e: toml::de::Error) -> Self {
        ProtocolError::ConfigError(e.to_string())
    }
}

impl From<toml::ser::Error> for ProtocolError {
    fn from(e: toml::ser::Error) -> Self {
        ProtocolError::ConfigError(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::ConfigError(e.to_string())
    }
}

impl ProtocolError {
    /// Whether the error ends the session outright
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::KeyExchangeError(_) | ProtocolError::UnknownService(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::PolicyViolation("x".into()).is_fatal());
        assert!(ProtocolError::ConnectionClosed.is_fatal());
        assert!(!ProtocolError::KeyExchangeError("short".into()).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = ProtocolError::FrameTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "Frame exceeds maximum size: 10 > 4");
        assert_eq!(
            ProtocolError::UnknownPacketKind(0x7f).to_string(),
            "Unknown packet kind: 0x7f"
        );
    }
}
