//! Length-prefixed framing.
//!
//! Wire layout per message: one opcode byte, four little-endian body-length
//! bytes, then the body. The decoder is a pull parser: bytes go in whenever
//! they arrive off the socket, and a message comes out only once its body is
//! complete. Partial phase state survives across pushes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Message, Opcode, ProtoError};

pub const OPCODE_LEN: usize = 1;
pub const BODY_LEN_LEN: usize = 4;
pub const MAX_BODY_LEN: usize = u32::MAX as usize;

/// Serialises one message. Fails only when the body cannot fit the 32-bit
/// length field.
pub fn encode(msg: &Message) -> Result<Bytes, ProtoError> {
    let mut out = BytesMut::with_capacity(OPCODE_LEN + BODY_LEN_LEN + msg.body.len());
    encode_into(msg, &mut out)?;
    Ok(out.freeze())
}

pub fn encode_into(msg: &Message, out: &mut BytesMut) -> Result<(), ProtoError> {
    if msg.body.len() > MAX_BODY_LEN {
        return Err(ProtoError::BodyTooLarge {
            len: msg.body.len(),
        });
    }
    out.put_u8(msg.opcode.as_byte());
    out.put_u32_le(msg.body.len() as u32);
    out.put_slice(&msg.body);
    Ok(())
}

enum Phase {
    Opcode,
    Length { opcode: Opcode },
    Body { opcode: Opcode, expected: usize },
}

/// Incremental message parser over an arriving byte stream.
pub struct Decoder {
    buf: BytesMut,
    phase: Phase,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            phase: Phase::Opcode,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed into a complete message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Advances as far as the buffered bytes allow. Returns `Ok(None)` when a
    /// complete message has not arrived yet.
    pub fn next(&mut self) -> Result<Option<Message>, ProtoError> {
        loop {
            match self.phase {
                Phase::Opcode => {
                    if self.buf.len() < OPCODE_LEN {
                        return Ok(None);
                    }
                    let opcode = Opcode::from_byte(self.buf.get_u8())?;
                    self.phase = Phase::Length { opcode };
                }
                Phase::Length { opcode } => {
                    if self.buf.len() < BODY_LEN_LEN {
                        return Ok(None);
                    }
                    let expected = self.buf.get_u32_le() as usize;
                    self.phase = Phase::Body { opcode, expected };
                }
                Phase::Body { opcode, expected } => {
                    if self.buf.len() < expected {
                        return Ok(None);
                    }
                    let body = self.buf.split_to(expected).freeze();
                    self.phase = Phase::Opcode;
                    return Ok(Some(Message::new(opcode, body)));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::LockRequest;

    #[test]
    fn encode_then_decode_round_trips() {
        let msg = LockRequest::new(5, "foo").into_message();
        let bytes = encode(&msg).unwrap();

        let mut decoder = Decoder::new();
        decoder.push(&bytes);
        assert_eq!(decoder.next().unwrap(), Some(msg));
        assert_eq!(decoder.next().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decodes_two_concatenated_messages_in_order() {
        let first = Message::ok();
        let second = LockRequest::new(9, "bar").into_message();
        let mut bytes = encode(&first).unwrap().to_vec();
        bytes.extend_from_slice(&encode(&second).unwrap());

        let mut decoder = Decoder::new();
        decoder.push(&bytes);
        assert_eq!(decoder.next().unwrap(), Some(first));
        assert_eq!(decoder.next().unwrap(), Some(second));
        assert_eq!(decoder.next().unwrap(), None);
    }

    #[test]
    fn partial_delivery_yields_only_on_completion() {
        let msg = LockRequest::new(5, "foo").into_message();
        let bytes = encode(&msg).unwrap();

        let mut decoder = Decoder::new();
        // Header, four body bytes, remainder.
        decoder.push(&bytes[..OPCODE_LEN + BODY_LEN_LEN]);
        assert_eq!(decoder.next().unwrap(), None);
        decoder.push(&bytes[OPCODE_LEN + BODY_LEN_LEN..OPCODE_LEN + BODY_LEN_LEN + 4]);
        assert_eq!(decoder.next().unwrap(), None);
        decoder.push(&bytes[OPCODE_LEN + BODY_LEN_LEN + 4..]);
        assert_eq!(decoder.next().unwrap(), Some(msg));
    }

    #[test]
    fn byte_at_a_time_delivery_works() {
        let msg = LockRequest::new(77, "x").into_message();
        let bytes = encode(&msg).unwrap();

        let mut decoder = Decoder::new();
        for (i, byte) in bytes.iter().enumerate() {
            decoder.push(std::slice::from_ref(byte));
            let decoded = decoder.next().unwrap();
            if i + 1 == bytes.len() {
                assert_eq!(decoded, Some(msg.clone()));
            } else {
                assert_eq!(decoded, None);
            }
        }
    }

    #[test]
    fn empty_bodies_are_valid() {
        for msg in [Message::ok(), Message::enquiry(), Message::finished()] {
            let bytes = encode(&msg).unwrap();
            assert_eq!(bytes.len(), OPCODE_LEN + BODY_LEN_LEN);
            let mut decoder = Decoder::new();
            decoder.push(&bytes);
            assert_eq!(decoder.next().unwrap(), Some(msg));
        }
    }

    #[test]
    fn unknown_opcode_is_a_framing_error() {
        let mut decoder = Decoder::new();
        decoder.push(&[0xfe, 0, 0, 0, 0]);
        assert!(matches!(
            decoder.next(),
            Err(ProtoError::UnknownOpcode(0xfe))
        ));
    }

    #[test]
    fn header_declares_maximum_body_length() {
        // A header may declare up to u32::MAX body bytes; the decoder just
        // waits for them. Encoding rejects anything larger.
        let mut decoder = Decoder::new();
        let mut header = vec![Opcode::Response.as_byte()];
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        decoder.push(&header);
        assert_eq!(decoder.next().unwrap(), None);
    }
}
