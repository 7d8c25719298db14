//! Peer-to-peer protocol errors.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use minode_types::DecodeError;

/// Why a connection is being torn down.
///
/// Every reason terminates the offending connection only; the process
/// and its other connections continue.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// The peer sent bytes that do not decode.
    Malformed(DecodeError),
    /// The peer speaks a protocol version we do not.
    ProtocolVersion(u32),
    /// The peer presented our own nonce: we connected to ourselves.
    SelfConnection,
    /// A liveness timer fired.
    Timeout(&'static str),
    /// The underlying socket failed.
    ConnectionError(Arc<io::Error>),
    /// The peer performed an orderly shutdown.
    PeerClosed,
    /// The TLS upgrade failed.
    Tls(String),
    /// The node is shutting down.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(err) => write!(f, "received malformed message: {}", err),
            Self::ProtocolVersion(version) => {
                write!(f, "peer protocol version mismatch: {}", version)
            }
            Self::SelfConnection => write!(f, "detected self-connection"),
            Self::Timeout(what) => write!(f, "peer timed out: {}", what),
            Self::ConnectionError(err) => write!(f, "{}", err),
            Self::PeerClosed => write!(f, "connection closed by peer"),
            Self::Tls(err) => write!(f, "tls handshake failed: {}", err),
            Self::Shutdown => write!(f, "shutting down"),
        }
    }
}

impl From<DecodeError> for DisconnectReason {
    fn from(err: DecodeError) -> Self {
        Self::Malformed(err)
    }
}

impl From<io::Error> for DisconnectReason {
    fn from(err: io::Error) -> Self {
        Self::ConnectionError(Arc::new(err))
    }
}

/// An error starting or running the node.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// A persistence error; non-fatal, the next snapshot retries.
    #[error("persistence error: {0}")]
    Persist(String),
    /// The SAM bridge replied with something other than `RESULT=OK`.
    #[error("sam bridge error: {0}")]
    Sam(String),
}
