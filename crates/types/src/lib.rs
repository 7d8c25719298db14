//! Wire structures of the Bitmessage object-relay protocol.
//!
//! This crate is purely the data model and codec: variable-length
//! integers, network addresses, message framing and the proof-of-work
//! sealed [`Object`]. Connection handling lives in `minode-p2p`.

pub use addr::{NetAddr, NetAddrNoPrefix};
pub use error::DecodeError;
pub use message::{Header, Message, Version};
pub use object::Object;
pub use varint::VarInt;

pub mod addr;
pub mod error;
pub mod message;
pub mod object;
pub mod varint;

/// Network magic preceding every message header.
pub const MAGIC: [u8; 4] = [0xe9, 0xbe, 0xb4, 0xd9];

/// The only protocol version this node speaks.
pub const PROTOCOL_VERSION: u32 = 3;

/// The only stream this node participates in.
pub const STREAM: u64 = 1;

/// Serialized message header length in bytes.
pub const HEADER_LENGTH: usize = 24;

/// Object identifier: the first half of the double-SHA-512 digest of an
/// object's serialized form. Primary key of the object store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Vector(pub [u8; 32]);

impl Vector {
    /// Length of a serialized vector.
    pub const LENGTH: usize = 32;

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Vector {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for Vector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Vector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Vector({})", hex::encode(self.0))
    }
}
