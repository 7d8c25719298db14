//! Destination encodings and the SAM control socket.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use base64::alphabet::Alphabet;
use base64::engine::general_purpose::PAD;
use base64::engine::GeneralPurpose;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::Error;

/// I2P's base64: the standard alphabet with `+/` replaced by `-~`.
const I2P_ALPHABET: Alphabet = match Alphabet::new(
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~",
) {
    Ok(alphabet) => alphabet,
    Err(_) => panic!("hard-coded alphabet is valid"),
};

pub const I2P_BASE64: GeneralPurpose = GeneralPurpose::new(&I2P_ALPHABET, PAD);

/// Encode raw destination bytes into the textual form peers gossip.
pub fn encode_dest(raw: &[u8]) -> String {
    I2P_BASE64.encode(raw)
}

pub fn decode_dest(dest: &str) -> Result<Vec<u8>, Error> {
    I2P_BASE64
        .decode(dest)
        .map_err(|err| Error::Sam(format!("invalid destination: {}", err)))
}

/// Derive the public destination from a private key blob: 256 bytes of
/// public key, 128 of signing key, a 3-byte certificate header, then the
/// certificate body whose length sits at offset 385.
pub fn pub_from_priv(dest_priv: &str) -> Result<String, Error> {
    let raw = decode_dest(dest_priv)?;
    if raw.len() < 387 {
        return Err(Error::Sam("destination key too short".into()));
    }
    let cert_len = u16::from_be_bytes([raw[385], raw[386]]) as usize;
    let end = 387 + cert_len;
    if raw.len() < end {
        return Err(Error::Sam("destination certificate truncated".into()));
    }
    Ok(encode_dest(&raw[..end]))
}

/// The `.b32.i2p` short host form of a destination.
pub fn b32_from_pub(dest_pub: &str) -> Result<String, Error> {
    let raw = decode_dest(dest_pub)?;
    let digest = Sha256::digest(&raw);
    Ok(format!("{}.b32.i2p", base32_lower_nopad(&digest)))
}

fn base32_lower_nopad(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut value: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in data {
        value = (value << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((value >> bits) & 31) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((value << (5 - bits)) & 31) as usize] as char);
    }
    out
}

/// How long to wait for a reply to a control command.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between polls of the non-blocking control socket.
const POLL_DELAY: Duration = Duration::from_millis(100);

/// A line-oriented SAM control socket.
///
/// Non-blocking; reads poll with short sleeps so shutdown stays
/// responsive. Reads are byte-at-a-time: the byte after the final
/// control line already belongs to the peer stream.
pub struct SamSocket {
    stream: TcpStream,
}

impl SamSocket {
    pub fn connect(host: IpAddr, port: u16) -> io::Result<Self> {
        let addr = SocketAddr::new(host, port);
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
        socket.connect_timeout(&addr.into(), Duration::from_secs(10))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            stream: socket.into(),
        })
    }

    pub async fn send_line(&mut self, command: &str) -> io::Result<()> {
        let mut bytes = command.as_bytes().to_vec();
        bytes.push(b'\n');
        let mut written = 0;
        while written < bytes.len() {
            match self.stream.write(&bytes[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(POLL_DELAY).await;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Read one newline-terminated line. `Ok(None)` on timeout.
    pub async fn recv_line(&mut self, timeout: Option<Duration>) -> io::Result<Option<String>> {
        let started = Instant::now();
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(io::ErrorKind::ConnectionReset.into()),
                Ok(_) => {
                    if byte[0] == b'\n' {
                        return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                    }
                    line.push(byte[0]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if let Some(timeout) = timeout {
                        if started.elapsed() > timeout {
                            return Ok(None);
                        }
                    }
                    tokio::time::sleep(POLL_DELAY).await;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Hand the socket over, eg. to a connection once a stream is up.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// Greet the bridge. Returns the version reply line.
pub(crate) async fn hello(socket: &mut SamSocket) -> Result<String, Error> {
    socket.send_line("HELLO VERSION MIN=3.0 MAX=3.3").await?;
    let reply = recv_reply(socket, REPLY_TIMEOUT).await?;
    if !reply.contains("RESULT=OK") {
        return Err(Error::Sam(reply));
    }
    Ok(reply)
}

pub(crate) async fn recv_reply(
    socket: &mut SamSocket,
    timeout: Duration,
) -> Result<String, Error> {
    socket
        .recv_line(Some(timeout))
        .await?
        .ok_or_else(|| Error::Sam("bridge reply timed out".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_encoding_uses_the_i2p_alphabet() {
        let raw: Vec<u8> = (0..=255).collect();
        let encoded = encode_dest(&raw);
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert_eq!(decode_dest(&encoded).unwrap(), raw);
    }

    #[test]
    fn pub_from_priv_strips_the_signing_key() {
        // 387-byte public part with an empty certificate, followed by
        // private key material that must not survive.
        let mut raw = vec![7u8; 385];
        raw.extend_from_slice(&[0, 0]);
        let mut with_priv = raw.clone();
        with_priv.extend_from_slice(&[9u8; 64]);

        let derived = pub_from_priv(&encode_dest(&with_priv)).unwrap();
        assert_eq!(derived, encode_dest(&raw));
    }

    #[test]
    fn b32_is_lowercase_and_unpadded() {
        let dest = encode_dest(&[1u8; 387]);
        let b32 = b32_from_pub(&dest).unwrap();
        assert!(b32.ends_with(".b32.i2p"));
        let host = b32.trim_end_matches(".b32.i2p");
        assert!(!host.contains('='));
        assert_eq!(host, host.to_lowercase());
        // SHA-256 digest: 52 base32 digits.
        assert_eq!(host.len(), 52);
    }
}
