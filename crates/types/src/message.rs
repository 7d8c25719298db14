//! Wire messages and their codec.

use sha2::{Digest, Sha512};

use crate::addr::{NetAddr, NetAddrNoPrefix, NET_ADDR_LENGTH, NET_ADDR_NO_PREFIX_LENGTH};
use crate::error::DecodeError;
use crate::object::Object;
use crate::varint::VarInt;
use crate::{Vector, HEADER_LENGTH, MAGIC, STREAM};

/// Length of the NUL-padded command field.
pub const COMMAND_LENGTH: usize = 12;

/// Largest payload a header may claim. Bounds buffering on malicious or
/// corrupt length fields; every legitimate message fits well below it.
pub const MAX_MESSAGE_LENGTH: u32 = 4_000_000;

/// A 24-byte message header: magic, command, payload length, checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: [u8; COMMAND_LENGTH],
    pub payload_length: u32,
    pub checksum: [u8; 4],
}

impl Header {
    pub fn new(command: &[u8], payload: &[u8]) -> Self {
        let mut cmd = [0u8; COMMAND_LENGTH];
        cmd[..command.len()].copy_from_slice(command);
        Self {
            command: cmd,
            payload_length: payload.len() as u32,
            checksum: Self::checksum(payload),
        }
    }

    /// The first four bytes of the payload's SHA-512 digest.
    pub fn checksum(payload: &[u8]) -> [u8; 4] {
        let digest = Sha512::digest(payload);
        digest[..4].try_into().expect("digest is 64 bytes")
    }

    /// Command with trailing NUL padding removed.
    pub fn command_name(&self) -> &[u8] {
        let end = self
            .command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_LENGTH);
        &self.command[..end]
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut b = [0u8; HEADER_LENGTH];
        b[..4].copy_from_slice(&MAGIC);
        b[4..16].copy_from_slice(&self.command);
        b[16..20].copy_from_slice(&self.payload_length.to_be_bytes());
        b[20..].copy_from_slice(&self.checksum);
        b
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, DecodeError> {
        if b.len() < HEADER_LENGTH {
            return Err(DecodeError::Truncated("header"));
        }
        if b[..4] != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let command: [u8; COMMAND_LENGTH] = b[4..16].try_into().expect("slice length checked");
        let payload_length =
            u32::from_be_bytes(b[16..20].try_into().expect("slice length checked"));
        if payload_length > MAX_MESSAGE_LENGTH {
            return Err(DecodeError::Oversized(payload_length));
        }
        let checksum: [u8; 4] = b[20..24].try_into().expect("slice length checked");
        Ok(Self {
            command,
            payload_length,
            checksum,
        })
    }
}

/// The `version` handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub protocol_version: u32,
    pub services: u64,
    pub timestamp: u64,
    /// The remote end's address, as the sender sees it.
    pub receiver: NetAddrNoPrefix,
    /// The sender's own address. Unreliable; peers ignore it.
    pub sender: NetAddrNoPrefix,
    /// Random bytes identifying the sending node. Matching our own nonce
    /// means we connected to ourselves.
    pub nonce: [u8; 8],
    /// Opaque user-agent byte string, `MiNode-v<semver>` for this node.
    pub user_agent: Vec<u8>,
    pub streams: Vec<u64>,
}

impl Version {
    fn to_payload(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(84 + self.user_agent.len());
        b.extend_from_slice(&self.protocol_version.to_be_bytes());
        b.extend_from_slice(&self.services.to_be_bytes());
        b.extend_from_slice(&self.timestamp.to_be_bytes());
        b.extend_from_slice(&self.receiver.to_bytes());
        b.extend_from_slice(&self.sender.to_bytes());
        b.extend_from_slice(&self.nonce);
        b.extend_from_slice(&VarInt(self.user_agent.len() as u64).to_bytes());
        b.extend_from_slice(&self.user_agent);
        b.extend_from_slice(&VarInt(self.streams.len() as u64).to_bytes());
        for stream in &self.streams {
            b.extend_from_slice(&VarInt(*stream).to_bytes());
        }
        b
    }

    fn from_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() < 80 {
            return Err(DecodeError::Truncated("version"));
        }
        let protocol_version =
            u32::from_be_bytes(payload[..4].try_into().expect("slice length checked"));
        let services = u64::from_be_bytes(payload[4..12].try_into().expect("slice length checked"));
        let timestamp =
            u64::from_be_bytes(payload[12..20].try_into().expect("slice length checked"));
        let receiver = NetAddrNoPrefix::from_bytes(&payload[20..20 + NET_ADDR_NO_PREFIX_LENGTH])?;
        let sender = NetAddrNoPrefix::from_bytes(&payload[46..46 + NET_ADDR_NO_PREFIX_LENGTH])?;
        let nonce: [u8; 8] = payload[72..80].try_into().expect("slice length checked");

        let rest = &payload[80..];
        let (ua_len, consumed) = VarInt::from_bytes(rest)?;
        let rest = &rest[consumed..];
        if (rest.len() as u64) < ua_len.0 {
            return Err(DecodeError::Truncated("user agent"));
        }
        let user_agent = rest[..ua_len.0 as usize].to_vec();
        let rest = &rest[ua_len.0 as usize..];

        let (count, consumed) = VarInt::from_bytes(rest)?;
        let mut rest = &rest[consumed..];
        let mut streams = Vec::with_capacity(count.0.min(8) as usize);
        for _ in 0..count.0 {
            let (stream, consumed) = VarInt::from_bytes(rest)?;
            streams.push(stream.0);
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            return Err(DecodeError::TrailingBytes("version"));
        }
        // We only relay stream 1; anything else is a different network.
        if streams != [STREAM] {
            return Err(DecodeError::WrongStream);
        }

        Ok(Self {
            protocol_version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            streams,
        })
    }
}

/// A protocol message, ready to be framed with a [`Header`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(Version),
    Verack,
    /// Known peer addresses.
    Addr(Vec<NetAddr>),
    /// Inventory advertisement: vectors the sender can serve.
    Inv(Vec<Vector>),
    /// Request for the objects behind the given vectors.
    GetData(Vec<Vector>),
    Object(Object),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Error report from the peer; logged, never acted upon.
    Error(Vec<u8>),
    /// Any command we do not understand. Logged and ignored.
    Unknown {
        command: [u8; COMMAND_LENGTH],
        payload: Vec<u8>,
    },
}

impl Message {
    pub fn command(&self) -> [u8; COMMAND_LENGTH] {
        let name: &[u8] = match self {
            Message::Version(_) => b"version",
            Message::Verack => b"verack",
            Message::Addr(_) => b"addr",
            Message::Inv(_) => b"inv",
            Message::GetData(_) => b"getdata",
            Message::Object(_) => b"object",
            Message::Ping(_) => b"ping",
            Message::Pong(_) => b"pong",
            Message::Error(_) => b"error",
            Message::Unknown { command, .. } => return *command,
        };
        let mut cmd = [0u8; COMMAND_LENGTH];
        cmd[..name.len()].copy_from_slice(name);
        cmd
    }

    pub fn to_payload(&self) -> Vec<u8> {
        match self {
            Message::Version(version) => version.to_payload(),
            Message::Verack => Vec::new(),
            Message::Addr(addrs) => {
                let mut b = VarInt(addrs.len() as u64).to_bytes();
                for addr in addrs {
                    b.extend_from_slice(&addr.to_bytes());
                }
                b
            }
            Message::Inv(vectors) | Message::GetData(vectors) => {
                let mut b = VarInt(vectors.len() as u64).to_bytes();
                for vector in vectors {
                    b.extend_from_slice(vector.as_bytes());
                }
                b
            }
            Message::Object(obj) => obj.to_bytes(),
            Message::Ping(payload) | Message::Pong(payload) | Message::Error(payload) => {
                payload.clone()
            }
            Message::Unknown { payload, .. } => payload.clone(),
        }
    }

    /// Frame the message: header followed by payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = self.to_payload();
        let command = self.command();
        let end = command.iter().position(|&c| c == 0).unwrap_or(COMMAND_LENGTH);
        let mut b = Header::new(&command[..end], &payload).to_bytes().to_vec();
        b.extend_from_slice(&payload);
        b
    }

    /// Decode a message whose header has already been read and whose
    /// payload bytes are complete.
    pub fn from_parts(header: &Header, payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() != header.payload_length as usize {
            return Err(DecodeError::PayloadLength {
                expected: header.payload_length,
                got: payload.len(),
            });
        }
        if Header::checksum(payload) != header.checksum {
            return Err(DecodeError::ChecksumMismatch);
        }
        match header.command_name() {
            b"version" => Ok(Message::Version(Version::from_payload(payload)?)),
            b"verack" => Ok(Message::Verack),
            b"addr" => Ok(Message::Addr(decode_addrs(payload)?)),
            b"inv" => Ok(Message::Inv(decode_vectors(payload, "inv")?)),
            b"getdata" => Ok(Message::GetData(decode_vectors(payload, "getdata")?)),
            b"object" => Ok(Message::Object(Object::from_bytes(payload)?)),
            b"ping" => Ok(Message::Ping(payload.to_vec())),
            b"pong" => Ok(Message::Pong(payload.to_vec())),
            b"error" => Ok(Message::Error(payload.to_vec())),
            _ => Ok(Message::Unknown {
                command: header.command,
                payload: payload.to_vec(),
            }),
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Version(v) => write!(
                f,
                "version, protocol_version: {}, services: {}, user_agent: {}",
                v.protocol_version,
                v.services,
                String::from_utf8_lossy(&v.user_agent),
            ),
            Message::Verack => write!(f, "verack"),
            Message::Addr(addrs) => write!(f, "addr, count: {}", addrs.len()),
            Message::Inv(vectors) => write!(f, "inv, count: {}", vectors.len()),
            Message::GetData(vectors) => write!(f, "getdata, count: {}", vectors.len()),
            Message::Object(obj) => write!(f, "object, vector: {}", obj.vector()),
            Message::Ping(_) => write!(f, "ping"),
            Message::Pong(_) => write!(f, "pong"),
            Message::Error(payload) => {
                write!(f, "error: {}", String::from_utf8_lossy(payload))
            }
            Message::Unknown { command, .. } => {
                let end = command.iter().position(|&c| c == 0).unwrap_or(COMMAND_LENGTH);
                write!(f, "unknown command: {}", String::from_utf8_lossy(&command[..end]))
            }
        }
    }
}

fn decode_vectors(payload: &[u8], what: &'static str) -> Result<Vec<Vector>, DecodeError> {
    let (count, consumed) = VarInt::from_bytes(payload)?;
    let rest = &payload[consumed..];
    if count.0.checked_mul(Vector::LENGTH as u64) != Some(rest.len() as u64) {
        return if (rest.len() as u64) < count.0.saturating_mul(Vector::LENGTH as u64) {
            Err(DecodeError::Truncated(what))
        } else {
            Err(DecodeError::TrailingBytes(what))
        };
    }
    Ok(rest
        .chunks_exact(Vector::LENGTH)
        .map(|chunk| Vector(chunk.try_into().expect("chunk length is exact")))
        .collect())
}

fn decode_addrs(payload: &[u8]) -> Result<Vec<NetAddr>, DecodeError> {
    let (count, consumed) = VarInt::from_bytes(payload)?;
    let rest = &payload[consumed..];
    if count.0.checked_mul(NET_ADDR_LENGTH as u64) != Some(rest.len() as u64) {
        return if (rest.len() as u64) < count.0.saturating_mul(NET_ADDR_LENGTH as u64) {
            Err(DecodeError::Truncated("addr"))
        } else {
            Err(DecodeError::TrailingBytes("addr"))
        };
    }
    rest.chunks_exact(NET_ADDR_LENGTH)
        .map(NetAddr::from_bytes)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
        let header = Header::from_bytes(&bytes[..HEADER_LENGTH])?;
        Message::from_parts(&header, &bytes[HEADER_LENGTH..])
    }

    fn sample_version() -> Version {
        Version {
            protocol_version: 3,
            services: 3,
            timestamp: 1_700_000_000,
            receiver: NetAddrNoPrefix::new(3, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 8444),
            sender: NetAddrNoPrefix::new(3, IpAddr::V4(Ipv4Addr::LOCALHOST), 8444),
            nonce: [1, 2, 3, 4, 5, 6, 7, 8],
            user_agent: b"MiNode-v0.3.0".to_vec(),
            streams: vec![STREAM],
        }
    }

    fn vectors(n: u8) -> Vec<Vector> {
        (0..n).map(|i| Vector([i; 32])).collect()
    }

    #[test]
    fn every_variant_round_trips() {
        let messages = vec![
            Message::Version(sample_version()),
            Message::Verack,
            Message::Addr(vec![
                NetAddr::new(1, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 8444, 1),
                NetAddr::new(3, "2001:db8::2".parse().unwrap(), 8445, 2),
            ]),
            Message::Inv(vectors(5)),
            Message::GetData(vectors(3)),
            Message::Object(Object::new([7; 8], 1_700_000_500, 42, 1, 1, b"blob".to_vec())),
            Message::Ping(vec![]),
            Message::Pong(b"keepalive".to_vec()),
            Message::Error(b"oops".to_vec()),
        ];
        for message in messages {
            assert_eq!(decode(&message.to_bytes()).unwrap(), message);
        }
    }

    #[test]
    fn version_trailer_encodes_stream_one() {
        let bytes = Message::Version(sample_version()).to_bytes();
        assert_eq!(&bytes[bytes.len() - 2..], b"\x01\x01");
    }

    #[test]
    fn version_with_foreign_stream_is_rejected() {
        let mut version = sample_version();
        version.streams = vec![2];
        let bytes = Message::Version(version).to_bytes();
        assert_eq!(decode(&bytes), Err(DecodeError::WrongStream));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = Message::Verack.to_bytes();
        bytes[0] = 0x00;
        assert_eq!(decode(&bytes), Err(DecodeError::BadMagic));
    }

    #[test]
    fn corrupted_payload_fails_the_checksum() {
        let mut bytes = Message::Inv(vectors(2)).to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert_eq!(decode(&bytes), Err(DecodeError::ChecksumMismatch));
    }

    #[test]
    fn payload_length_mismatch_is_rejected() {
        let message = Message::Pong(b"data".to_vec());
        let header = Header::from_bytes(&message.to_bytes()[..HEADER_LENGTH]).unwrap();
        assert!(matches!(
            Message::from_parts(&header, b"dat"),
            Err(DecodeError::PayloadLength { .. })
        ));
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut header = Header::new(b"inv", &[]);
        header.payload_length = MAX_MESSAGE_LENGTH + 1;
        assert_eq!(
            Header::from_bytes(&header.to_bytes()),
            Err(DecodeError::Oversized(MAX_MESSAGE_LENGTH + 1))
        );
    }

    #[test]
    fn inv_count_must_match_payload() {
        let mut payload = VarInt(2).to_bytes();
        payload.extend_from_slice(&[0u8; 32]);
        let header = Header::new(b"inv", &payload);
        assert_eq!(
            Message::from_parts(&header, &payload),
            Err(DecodeError::Truncated("inv"))
        );
    }

    #[test]
    fn unknown_commands_are_preserved() {
        let mut command = [0u8; COMMAND_LENGTH];
        command[..5].copy_from_slice(b"weird");
        let message = Message::Unknown {
            command,
            payload: b"???".to_vec(),
        };
        assert_eq!(decode(&message.to_bytes()).unwrap(), message);
    }
}
