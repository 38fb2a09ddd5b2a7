//! Control messages exchanged between two service managers
//!
//! Variant order is the wire registry; both peers must agree on it.

use serde::{Deserialize, Serialize};

use crate::envelope_messages;

/// Announce a new service under the sender's id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddService {
    pub id: u64,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveService {
    pub id: u64,
}

/// Registries diverged; the session is unusable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMismatch;

/// Opaque bytes for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceData {
    pub id: u64,
    pub data: Vec<u8>,
}

/// First message from an initiator; `id` 0 means no prior entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greet {
    pub id: u64,
    pub version: String,
}

/// `auth` is the SHA-512 digest of the password
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub name: String,
    pub auth: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub name: String,
    pub auth: Vec<u8>,
}

/// The host will disconnect after its grace period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blacklisted {
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    RegistrationAccepted,
    RegistrationRejected,
    ConnectionAuthenticated,
    ConnectionInvalid,
    WrongVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetReply {
    pub retries: u16,
    pub state: ConnectionState,
    pub server_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginState {
    Authenticated,
    NotAuthenticated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginReply {
    pub name: String,
    pub retries: u16,
    /// Entity id to present in the next greeting
    pub next_greet_id: u64,
    pub state: LoginState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterFlag {
    Success,
    Existed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub name: String,
    pub title: String,
    pub flag: RegisterFlag,
}

envelope_messages! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ControlMessage {
        AddService(AddService),
        RemoveService(RemoveService),
        ServiceMismatch(ServiceMismatch),
        ServiceData(ServiceData),
        Greet(Greet),
        Login(Login),
        Register(Register),
        Blacklisted(Blacklisted),
        GreetReply(GreetReply),
        LoginReply(LoginReply),
        RegisterReply(RegisterReply),
    }
}

impl ControlMessage {
    /// Messages only an initiator may send
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            ControlMessage::Greet(_) | ControlMessage::Login(_) | ControlMessage::Register(_)
        )
    }

    /// Messages only the host may send
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            ControlMessage::Blacklisted(_)
                | ControlMessage::GreetReply(_)
                | ControlMessage::LoginReply(_)
                | ControlMessage::RegisterReply(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, EnvelopeCodec};

    #[test]
    fn test_registry_order() {
        assert_eq!(ControlMessage::TYPES.len(), 11);
        assert_eq!(ControlMessage::TYPES[0], "AddService");
        assert_eq!(ControlMessage::TYPES[3], "ServiceData");
        assert_eq!(ControlMessage::TYPES[10], "RegisterReply");
    }

    #[test]
    fn test_service_data_through_codec() {
        let mut codec = EnvelopeCodec::<ControlMessage>::new();
        let message = ControlMessage::ServiceData(ServiceData {
            id: 1 << 63,
            data: b"payload".to_vec(),
        });
        codec.enqueue(&message).unwrap();

        let wire = codec.write(usize::MAX);
        assert_eq!(wire[0], 3);

        codec.feed(&wire);
        assert_eq!(codec.try_dequeue().unwrap(), Some(message));
    }

    #[test]
    fn test_request_reply_classes() {
        let greet = ControlMessage::Greet(Greet {
            id: 0,
            version: "1.0".into(),
        });
        let blacklisted = ControlMessage::Blacklisted(Blacklisted {
            reason: String::new(),
        });
        assert!(greet.is_request() && !greet.is_reply());
        assert!(blacklisted.is_reply() && !blacklisted.is_request());
        assert!(!ControlMessage::ServiceMismatch(ServiceMismatch).is_request());
    }
}
