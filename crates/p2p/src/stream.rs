//! Message framing.
//!
//! Turns a byte stream into protocol messages. The decoder also reports
//! how many bytes it needs to complete the frame in flight, so the
//! connection can read exactly one message at a time during the
//! handshake.

use minode_types::{DecodeError, Header, Message, HEADER_LENGTH};

#[derive(Debug, Default)]
pub struct Decoder {
    unparsed: Vec<u8>,
    header: Option<Header>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn buffered(&self) -> usize {
        self.unparsed.len()
    }

    /// Whether no partial frame is pending.
    pub fn is_empty(&self) -> bool {
        self.unparsed.is_empty() && self.header.is_none()
    }

    /// Bytes still needed to complete the frame being assembled.
    pub fn wanted(&self) -> usize {
        match &self.header {
            None => HEADER_LENGTH.saturating_sub(self.unparsed.len()),
            Some(header) => {
                (header.payload_length as usize).saturating_sub(self.unparsed.len())
            }
        }
    }

    /// Decode and return the next complete message, or `None` if more
    /// bytes are needed.
    pub fn decode_next(&mut self) -> Result<Option<Message>, DecodeError> {
        if self.header.is_none() {
            if self.unparsed.len() < HEADER_LENGTH {
                return Ok(None);
            }
            let header = Header::from_bytes(&self.unparsed[..HEADER_LENGTH])?;
            self.unparsed.drain(..HEADER_LENGTH);
            self.header = Some(header);
        }

        let header = self.header.as_ref().expect("header was just set");
        let payload_length = header.payload_length as usize;
        if self.unparsed.len() < payload_length {
            return Ok(None);
        }
        let message = Message::from_parts(header, &self.unparsed[..payload_length])?;
        self.unparsed.drain(..payload_length);
        self.header = None;
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_messages_from_split_input() {
        let mut decoder = Decoder::new();
        let message = Message::Pong(b"keepalive".to_vec());
        let bytes = message.to_bytes();

        for chunk in bytes.chunks(7) {
            decoder.input(chunk);
        }
        assert_eq!(decoder.decode_next().unwrap(), Some(message));
        assert_eq!(decoder.decode_next().unwrap(), None);
        assert!(decoder.is_empty());
    }

    #[test]
    fn wanted_tracks_the_frame_in_flight() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.wanted(), HEADER_LENGTH);

        let message = Message::Pong(b"abcd".to_vec());
        let bytes = message.to_bytes();
        decoder.input(&bytes[..HEADER_LENGTH]);
        // Header complete but unconsumed; after the first decode attempt
        // the decoder asks for the payload.
        assert_eq!(decoder.decode_next().unwrap(), None);
        assert_eq!(decoder.wanted(), 4);

        decoder.input(&bytes[HEADER_LENGTH..]);
        assert_eq!(decoder.decode_next().unwrap(), Some(message));
    }

    #[test]
    fn propagates_header_errors() {
        let mut decoder = Decoder::new();
        decoder.input(&[0u8; HEADER_LENGTH]);
        assert!(decoder.decode_next().is_err());
    }

    #[test]
    fn decodes_back_to_back_messages() {
        let mut decoder = Decoder::new();
        let first = Message::Verack;
        let second = Message::Ping(vec![]);
        let mut bytes = first.to_bytes();
        bytes.extend_from_slice(&second.to_bytes());

        decoder.input(&bytes);
        assert_eq!(decoder.decode_next().unwrap(), Some(first));
        assert_eq!(decoder.decode_next().unwrap(), Some(second));
        assert_eq!(decoder.decode_next().unwrap(), None);
    }
}
