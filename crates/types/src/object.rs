//! Gossip objects and their validity rules.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use thiserror::Error;

use crate::error::DecodeError;
use crate::varint::VarInt;
use crate::{Vector, STREAM};

/// Largest payload an object may carry.
pub const MAX_PAYLOAD_LENGTH: usize = 1 << 18;

/// Objects live at most 28 days, with a 3 hour allowance for clock skew.
pub const MAX_TTL: u64 = 28 * 24 * 3600 + EXPIRY_GRACE;

/// Objects are still relayed for this long past their end of life.
pub const EXPIRY_GRACE: u64 = 3 * 3600;

/// Proof-of-work difficulty parameters of the network.
pub const NONCE_TRIALS_PER_BYTE: u64 = 1000;
pub const PAYLOAD_LENGTH_EXTRA_BYTES: u64 = 1000;

/// Why an object failed validation. Invalid objects are dropped without
/// penalizing the connection they arrived on.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidObject {
    #[error("expired")]
    Expired,
    #[error("end of life too far in the future")]
    EndOfLifeTooFar,
    #[error("payload is too long")]
    PayloadTooLong,
    #[error("not in stream 1")]
    WrongStream,
    #[error("insufficient proof of work")]
    InsufficientPow,
}

/// The atomic unit of gossip: an opaque, proof-of-work sealed, time
/// bounded byte blob, identified by its [`Vector`]. Immutable once
/// constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    nonce: [u8; 8],
    expires_time: u64,
    object_type: u32,
    version: u64,
    stream_number: u64,
    payload: Vec<u8>,
    vector: Vector,
}

impl Object {
    pub fn new(
        nonce: [u8; 8],
        expires_time: u64,
        object_type: u32,
        version: u64,
        stream_number: u64,
        payload: Vec<u8>,
    ) -> Self {
        let mut obj = Self {
            nonce,
            expires_time,
            object_type,
            version,
            stream_number,
            payload,
            vector: Vector([0; 32]),
        };
        obj.vector = Self::compute_vector(&obj.to_bytes());
        obj
    }

    pub fn nonce(&self) -> [u8; 8] {
        self.nonce
    }

    pub fn expires_time(&self) -> u64 {
        self.expires_time
    }

    pub fn object_type(&self) -> u32 {
        self.object_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn stream_number(&self) -> u64 {
        self.stream_number
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn vector(&self) -> Vector {
        self.vector
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(22 + self.payload.len());
        b.extend_from_slice(&self.nonce);
        b.extend_from_slice(&self.expires_time.to_be_bytes());
        b.extend_from_slice(&self.object_type.to_be_bytes());
        b.extend_from_slice(&VarInt(self.version).to_bytes());
        b.extend_from_slice(&VarInt(self.stream_number).to_bytes());
        b.extend_from_slice(&self.payload);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, DecodeError> {
        if b.len() < 20 {
            return Err(DecodeError::Truncated("object"));
        }
        let nonce: [u8; 8] = b[..8].try_into().expect("slice length checked");
        let expires_time = u64::from_be_bytes(b[8..16].try_into().expect("slice length checked"));
        let object_type = u32::from_be_bytes(b[16..20].try_into().expect("slice length checked"));
        let rest = &b[20..];
        let (version, consumed) = VarInt::from_bytes(rest)?;
        let rest = &rest[consumed..];
        let (stream_number, consumed) = VarInt::from_bytes(rest)?;
        let payload = rest[consumed..].to_vec();
        Ok(Self::new(
            nonce,
            expires_time,
            object_type,
            version.0,
            stream_number.0,
            payload,
        ))
    }

    /// Whether the object's end of life, plus grace period, has passed.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_time.saturating_add(EXPIRY_GRACE) < now
    }

    pub fn is_valid(&self, now: u64) -> bool {
        self.validate(now).is_ok()
    }

    /// Check the object against the network's acceptance rules.
    pub fn validate(&self, now: u64) -> Result<(), InvalidObject> {
        if self.is_expired(now) {
            return Err(InvalidObject::Expired);
        }
        if self.expires_time > now + MAX_TTL {
            return Err(InvalidObject::EndOfLifeTooFar);
        }
        if self.payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(InvalidObject::PayloadTooLong);
        }
        if self.stream_number != STREAM {
            return Err(InvalidObject::WrongStream);
        }
        let trial = pow_trial_value(self.nonce, &self.pow_initial_hash());
        if trial > self.pow_target(now) {
            return Err(InvalidObject::InsufficientPow);
        }
        Ok(())
    }

    /// Proof-of-work target for this object at time `now`.
    ///
    /// `target = 2^64 / (trials · length · (1 + dt / 2^16))`, where
    /// `length` counts everything after the nonce plus the nonce itself
    /// and the per-message padding, and `dt` is the remaining lifetime.
    pub fn pow_target(&self, now: u64) -> u64 {
        let data_len = (self.to_bytes().len() - 8) as u128;
        let length = data_len + 8 + PAYLOAD_LENGTH_EXTRA_BYTES as u128;
        let dt = self.expires_time.saturating_sub(now) as u128;
        let denominator = NONCE_TRIALS_PER_BYTE as u128 * length * (65536 + dt);
        ((1u128 << 80) / denominator) as u64
    }

    /// SHA-512 over everything after the nonce; the starting point of the
    /// nonce search.
    pub fn pow_initial_hash(&self) -> [u8; 64] {
        Sha512::digest(&self.to_bytes()[8..]).into()
    }

    fn compute_vector(bytes: &[u8]) -> Vector {
        let digest = Sha512::digest(Sha512::digest(bytes));
        let mut vector = [0u8; 32];
        vector.copy_from_slice(&digest[..32]);
        Vector(vector)
    }
}

/// The trial value a nonce achieves against an initial hash: the first
/// eight bytes of `SHA512(SHA512(nonce || hash))`, big-endian.
pub fn pow_trial_value(nonce: [u8; 8], initial_hash: &[u8; 64]) -> u64 {
    let mut hasher = Sha512::new();
    hasher.update(nonce);
    hasher.update(initial_hash);
    let digest = Sha512::digest(hasher.finalize());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 64 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn unsealed(expires_time: u64, payload: Vec<u8>) -> Object {
        Object::new([0; 8], expires_time, 42, 1, 1, payload)
    }

    #[test]
    fn vector_is_stable_across_encode_decode() {
        let obj = unsealed(NOW + 100, b"payload".to_vec());
        let decoded = Object::from_bytes(&obj.to_bytes()).unwrap();
        assert_eq!(decoded, obj);
        assert_eq!(decoded.vector(), obj.vector());

        let digest = Sha512::digest(Sha512::digest(obj.to_bytes()));
        assert_eq!(obj.vector().as_bytes()[..], digest[..32]);
    }

    #[test]
    fn expiry_boundaries() {
        let obj = unsealed(NOW, vec![]);
        assert!(!obj.is_expired(NOW + EXPIRY_GRACE));
        assert!(obj.is_expired(NOW + EXPIRY_GRACE + 1));
    }

    #[test]
    fn end_of_life_boundaries() {
        let at_limit = unsealed(NOW + MAX_TTL, vec![]);
        assert_ne!(at_limit.validate(NOW), Err(InvalidObject::EndOfLifeTooFar));

        let past_limit = unsealed(NOW + MAX_TTL + 1, vec![]);
        assert_eq!(past_limit.validate(NOW), Err(InvalidObject::EndOfLifeTooFar));
    }

    #[test]
    fn payload_length_boundaries() {
        let at_limit = unsealed(NOW + 100, vec![0; MAX_PAYLOAD_LENGTH]);
        assert_ne!(at_limit.validate(NOW), Err(InvalidObject::PayloadTooLong));

        let past_limit = unsealed(NOW + 100, vec![0; MAX_PAYLOAD_LENGTH + 1]);
        assert_eq!(past_limit.validate(NOW), Err(InvalidObject::PayloadTooLong));
    }

    #[test]
    fn wrong_stream_is_rejected() {
        let obj = Object::new([0; 8], NOW + 100, 42, 1, 2, vec![]);
        assert_eq!(obj.validate(NOW), Err(InvalidObject::WrongStream));
    }

    #[test]
    fn unsealed_object_lacks_pow() {
        // A zero nonce all but certainly fails the trial.
        let obj = unsealed(NOW + 100, b"not sealed".to_vec());
        assert_eq!(obj.validate(NOW), Err(InvalidObject::InsufficientPow));
    }

    #[test]
    fn target_shrinks_with_lifetime_and_size() {
        let short = unsealed(NOW + 100, vec![0; 100]);
        let long = unsealed(NOW + 24 * 3600, vec![0; 100]);
        assert!(long.pow_target(NOW) < short.pow_target(NOW));

        let small = unsealed(NOW + 100, vec![0; 100]);
        let big = unsealed(NOW + 100, vec![0; 10_000]);
        assert!(big.pow_target(NOW) < small.pow_target(NOW));
    }
}
