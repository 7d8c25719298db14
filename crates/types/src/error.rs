//! Wire decoding errors.

use thiserror::Error;

/// An error decoding a wire structure.
///
/// Any of these terminates the connection the bytes arrived on; the peer
/// is considered misbehaving, not merely out of sync.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Magic bytes do not match the network magic.
    #[error("magic bytes do not match")]
    BadMagic,
    /// The payload does not hash to the checksum carried in the header.
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
    /// The payload length differs from the length claimed by the header.
    #[error("wrong payload length, expected {expected}, got {got}")]
    PayloadLength { expected: u32, got: usize },
    /// The header claims a payload larger than any legitimate message.
    #[error("payload length {0} exceeds the message size limit")]
    Oversized(u32),
    /// A field extends past the end of the available bytes.
    #[error("truncated {0}")]
    Truncated(&'static str),
    /// A counted sequence does not fill its payload exactly.
    #[error("trailing bytes after {0}")]
    TrailingBytes(&'static str),
    /// The stream list of a `version` message is not exactly `{1}`.
    #[error("version message does not carry stream 1 alone")]
    WrongStream,
}
