//! # Message Envelopes
//!
//! Typed messages multiplexed over one plaintext byte stream:
//!
//! ```text
//! +---------+-----------+-------------------+
//! | Type ID | Length    | Payload (bincode) |
//! | 1 byte  | 4 bytes LE| `Length` bytes    |
//! +---------+-----------+-------------------+
//! ```
//!
//! The type id is the message's index in an ordered [`TypeRegistry`]. Both
//! peers must build the registry from the same list; nothing is negotiated
//! on the wire.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::DEFAULT_MAX_FRAME_SIZE;

/// Envelope header size: type_id(1) + length(4)
pub const ENVELOPE_HEADER_SIZE: usize = 5;

/// A one-byte type id allows at most 256 registered types
pub const MAX_REGISTERED_TYPES: usize = 256;

/// Ordered type names; a name's index is its wire id
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    names: Vec<&'static str>,
}

impl TypeRegistry {
    pub fn new(names: &[&'static str]) -> ProtocolResult<Self> {
        if names.len() > MAX_REGISTERED_TYPES {
            return Err(ProtocolError::InvalidRegistry(format!(
                "{} types exceed the limit of {}",
                names.len(),
                MAX_REGISTERED_TYPES
            )));
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(ProtocolError::InvalidRegistry(format!(
                    "Type {} registered twice",
                    name
                )));
            }
        }
        Ok(Self {
            names: names.to_vec(),
        })
    }

    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.names.iter().position(|n| *n == name).map(|i| i as u8)
    }

    pub fn name_of(&self, id: u8) -> Option<&'static str> {
        self.names.get(id as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Registry for an [`Envelope`] type
    ///
    /// Names past the 256th cannot be addressed by a one-byte id and are
    /// left out; [`envelope_messages!`](crate::envelope_messages) rejects
    /// such enums at compile time.
    pub fn for_envelope<M: Envelope>() -> Self {
        debug_assert!(Self::new(M::TYPES).is_ok(), "invalid envelope type list");
        Self {
            names: M::TYPES.iter().take(MAX_REGISTERED_TYPES).copied().collect(),
        }
    }
}

/// A closed set of message types carried in envelopes
///
/// Usually implemented with [`envelope_messages!`](crate::envelope_messages).
pub trait Envelope: Sized {
    /// Registered names, in wire-id order
    const TYPES: &'static [&'static str];

    fn type_name(&self) -> &'static str;

    fn encode_payload(&self) -> ProtocolResult<Vec<u8>>;

    fn decode_payload(type_name: &str, payload: &[u8]) -> ProtocolResult<Self>;
}

/// Declare a message enum and its [`Envelope`] implementation
///
/// Each variant wraps one serde type. Declaration order fixes the wire ids,
/// so reordering variants is a protocol change.
#[macro_export]
macro_rules! envelope_messages {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident($ty:ty)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $($variant($ty)),+
        }

        const _: () = assert!(
            <$name as $crate::envelope::Envelope>::TYPES.len() <= $crate::envelope::MAX_REGISTERED_TYPES,
            "too many envelope message types"
        );

        impl $crate::envelope::Envelope for $name {
            const TYPES: &'static [&'static str] = &[$(stringify!($variant)),+];

            fn type_name(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => stringify!($variant)),+
                }
            }

            fn encode_payload(&self) -> $crate::error::ProtocolResult<Vec<u8>> {
                match self {
                    $(Self::$variant(inner) => Ok($crate::bincode::serialize(inner)?)),+
                }
            }

            fn decode_payload(
                type_name: &str,
                payload: &[u8],
            ) -> $crate::error::ProtocolResult<Self> {
                match type_name {
                    $(stringify!($variant) => Ok(Self::$variant($crate::bincode::deserialize(payload)?)),)+
                    other => Err($crate::error::ProtocolError::InvalidRegistry(format!(
                        "{} is not a {} message",
                        other,
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

/// Buffers envelopes in both directions for one logical channel
pub struct EnvelopeCodec<M> {
    registry: TypeRegistry,
    outbound: BytesMut,
    inbound: BytesMut,
    /// Header of the envelope being assembled: (type_id, length)
    pending: Option<(u8, usize)>,
    max_message_size: usize,
    _messages: PhantomData<fn() -> M>,
}

impl<M: Envelope> Default for EnvelopeCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Envelope> EnvelopeCodec<M> {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            registry: TypeRegistry::for_envelope::<M>(),
            outbound: BytesMut::new(),
            inbound: BytesMut::new(),
            pending: None,
            max_message_size,
            _messages: PhantomData,
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Serialize a message onto the outbound buffer
    pub fn enqueue(&mut self, message: &M) -> ProtocolResult<()> {
        let name = message.type_name();
        let type_id = self
            .registry
            .id_of(name)
            .ok_or_else(|| ProtocolError::InvalidRegistry(format!("{} is not registered", name)))?;
        let payload = message.encode_payload()?;

        self.outbound.reserve(ENVELOPE_HEADER_SIZE + payload.len());
        self.outbound.put_u8(type_id);
        self.outbound.put_u32_le(payload.len() as u32);
        self.outbound.put_slice(&payload);
        Ok(())
    }

    /// Take up to `max_size` outbound bytes; the rest stays buffered
    pub fn write(&mut self, max_size: usize) -> Bytes {
        let take = self.outbound.len().min(max_size);
        self.outbound.split_to(take).freeze()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Append raw inbound bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.inbound.extend_from_slice(data);
    }

    pub fn buffered_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Decode the next complete envelope, if one has fully arrived
    pub fn try_dequeue(&mut self) -> ProtocolResult<Option<M>> {
        let (type_id, len) = match self.pending {
            Some(header) => header,
            None => {
                if self.inbound.len() < ENVELOPE_HEADER_SIZE {
                    return Ok(None);
                }
                let type_id = self.inbound.get_u8();
                let len = self.inbound.get_u32_le() as usize;

                if self.registry.name_of(type_id).is_none() {
                    return Err(ProtocolError::UnknownMessageType(type_id));
                }
                if len > self.max_message_size {
                    return Err(ProtocolError::FrameTooLarge {
                        size: len,
                        max: self.max_message_size,
                    });
                }
                self.pending = Some((type_id, len));
                (type_id, len)
            }
        };

        if self.inbound.len() < len {
            return Ok(None);
        }

        self.pending = None;
        let payload = self.inbound.split_to(len);
        let name = self
            .registry
            .name_of(type_id)
            .ok_or(ProtocolError::UnknownMessageType(type_id))?;
        M::decode_payload(name, &payload).map(Some)
    }
}
