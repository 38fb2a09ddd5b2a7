//! # Secure Service Multiplexer
//!
//! Two peers share one TCP connection, agree on a symmetric key with an
//! unauthenticated Diffie-Hellman exchange, rotate that key while traffic
//! is in flight, and multiplex any number of independent services over
//! the encrypted channel.
//!
//! ## Layering
//!
//! ```text
//!   Service ... Service          (read / write / available)
//!        \       /
//!     ServiceManager             control envelopes, service registry
//!           |
//!     EnvelopeCodec              type_id(1) | len(4) | payload
//!           |
//!     CryptoManager              key cycle 0 -> 1 -> 2, AES-256-CBC
//!           |
//!     TransportChannel           len(4) | packet, one TCP socket
//! ```
//!
//! A [`Supervisor`] accepts inbound connections and creates one
//! [`ServiceManager`] per session.
//!
//! ## Security Posture
//!
//! The key exchange is NOT authenticated and offers no protection against
//! an active man-in-the-middle. The Diffie-Hellman modulus and generator
//! are random integers (not validated safe primes) drawn from a
//! non-cryptographic RNG. The wire protocol is reproduced faithfully; it
//! must not be mistaken for a hardened secure channel.

pub mod cache;
pub mod config;
pub mod control;
pub mod crypto;
pub mod crypto_manager;
pub mod envelope;
pub mod error;
pub mod key_exchange;
pub mod packet;
pub mod service;
pub mod service_manager;
pub mod supervisor;
pub mod transport;

pub use cache::PrimaryCache;
pub use config::Config;
pub use crypto_manager::{CryptoCycle, CryptoStandard, Role, SecureChannel};
pub use envelope::{Envelope, EnvelopeCodec, TypeRegistry};
pub use error::{ProtocolError, ProtocolResult};
pub use key_exchange::DiffieHellman;
pub use packet::{Packet, PacketKind};
pub use service::{EchoService, Service, ServiceCatalog, ServiceHandle};
pub use service_manager::ServiceManager;
pub use supervisor::Supervisor;
pub use transport::TransportChannel;

#[doc(hidden)]
pub use bincode;

/// Protocol version string exchanged in the greeting
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Symmetric key size for AES-256
pub const KEY_SIZE: usize = 32;

/// AES block / IV size
pub const IV_SIZE: usize = 16;

/// Largest payload a service may hand over in one `write()` call (64 KiB)
pub const MAX_SERVICE_WRITE: usize = 64 * 1024;

/// Default TCP port for hosting
pub const STANDARD_PORT: u16 = 10030;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_constants() {
        assert_eq!(KEY_SIZE, 32);
        assert_eq!(IV_SIZE, 16);
        assert_eq!(MAX_SERVICE_WRITE, 65536);
        assert!(!PROTOCOL_VERSION.is_empty());
    }
}
