//! Message model for the binary wire protocol.
//!
//! Every message is an opcode plus an opaque body; the typed structs in this
//! module give the bodies their meaning. `Request` and `Reply` carry a 64-bit
//! little-endian logical timestamp so nodes of different word widths agree on
//! the layout.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use super::ProtoError;

/// Identity of a node in the cluster. Small, unique, and totally ordered;
/// the ordering breaks timestamp ties in the mutual-exclusion protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u8);

impl NodeId {
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u8>().map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Ok = 0,
    Error = 1,
    EstablishConnection = 2,
    Response = 3,
    FileTransfer = 4,
    TransmitData = 5,
    Finished = 6,
    Enquiry = 7,
    Read = 8,
    Write = 9,
    Request = 100,
    Reply = 101,
    Shutdown = 200,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Result<Self, ProtoError> {
        match byte {
            0 => Ok(Opcode::Ok),
            1 => Ok(Opcode::Error),
            2 => Ok(Opcode::EstablishConnection),
            3 => Ok(Opcode::Response),
            4 => Ok(Opcode::FileTransfer),
            5 => Ok(Opcode::TransmitData),
            6 => Ok(Opcode::Finished),
            7 => Ok(Opcode::Enquiry),
            8 => Ok(Opcode::Read),
            9 => Ok(Opcode::Write),
            100 => Ok(Opcode::Request),
            101 => Ok(Opcode::Reply),
            200 => Ok(Opcode::Shutdown),
            other => Err(ProtoError::UnknownOpcode(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether this opcode opens a compound transfer sequence.
    pub fn starts_compound(self) -> bool {
        matches!(self, Opcode::FileTransfer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: Opcode,
    pub body: Bytes,
}

impl Message {
    pub fn new(opcode: Opcode, body: Bytes) -> Self {
        Self { opcode, body }
    }

    pub fn empty(opcode: Opcode) -> Self {
        Self::new(opcode, Bytes::new())
    }

    pub fn ok() -> Self {
        Self::empty(Opcode::Ok)
    }

    pub fn enquiry() -> Self {
        Self::empty(Opcode::Enquiry)
    }

    pub fn finished() -> Self {
        Self::empty(Opcode::Finished)
    }

    pub fn shutdown() -> Self {
        Self::empty(Opcode::Shutdown)
    }

    fn expect_opcode(&self, expected: Opcode) -> Result<(), ProtoError> {
        if self.opcode == expected {
            Ok(())
        } else {
            Err(ProtoError::UnexpectedOpcode {
                expected,
                got: self.opcode,
            })
        }
    }

    fn body_text(self) -> Result<String, ProtoError> {
        String::from_utf8(self.body.to_vec()).map_err(|_| ProtoError::InvalidUtf8)
    }
}

/// `Error` body: human-readable description of a remote failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorText {
    pub message: String,
}

impl ErrorText {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn into_message(self) -> Message {
        Message::new(Opcode::Error, Bytes::from(self.message.into_bytes()))
    }

    pub fn from_message(msg: Message) -> Result<Self, ProtoError> {
        msg.expect_opcode(Opcode::Error)?;
        Ok(Self {
            message: msg.body_text()?,
        })
    }
}

/// `EstablishConnection` body: one identity byte then the shared password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishConnection {
    pub id: NodeId,
    pub password: String,
}

impl EstablishConnection {
    pub fn new(id: NodeId, password: impl Into<String>) -> Self {
        Self {
            id,
            password: password.into(),
        }
    }

    pub fn into_message(self) -> Message {
        let mut body = BytesMut::with_capacity(1 + self.password.len());
        body.put_u8(self.id.get());
        body.put_slice(self.password.as_bytes());
        Message::new(Opcode::EstablishConnection, body.freeze())
    }

    pub fn from_message(msg: Message) -> Result<Self, ProtoError> {
        msg.expect_opcode(Opcode::EstablishConnection)?;
        if msg.body.is_empty() {
            return Err(ProtoError::MalformedBody {
                opcode: Opcode::EstablishConnection,
                reason: "missing identity byte",
            });
        }
        let id = NodeId::new(msg.body[0]);
        let password = String::from_utf8(msg.body[1..].to_vec())
            .map_err(|_| ProtoError::InvalidUtf8)?;
        Ok(Self { id, password })
    }
}

/// `Response` body: UTF-8 text answering an earlier request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextResponse {
    pub text: String,
}

impl TextResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn into_message(self) -> Message {
        Message::new(Opcode::Response, Bytes::from(self.text.into_bytes()))
    }

    pub fn from_message(msg: Message) -> Result<Self, ProtoError> {
        msg.expect_opcode(Opcode::Response)?;
        Ok(Self {
            text: msg.body_text()?,
        })
    }
}

/// `FileTransfer` body: the name of the file whose data chunks follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub file_name: String,
}

impl FileTransfer {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn into_message(self) -> Message {
        Message::new(Opcode::FileTransfer, Bytes::from(self.file_name.into_bytes()))
    }

    pub fn from_message(msg: Message) -> Result<Self, ProtoError> {
        msg.expect_opcode(Opcode::FileTransfer)?;
        Ok(Self {
            file_name: msg.body_text()?,
        })
    }
}

/// `TransmitData` body: one raw chunk of an open compound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub data: Bytes,
}

impl DataChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn into_message(self) -> Message {
        Message::new(Opcode::TransmitData, self.data)
    }

    pub fn from_message(msg: Message) -> Result<Self, ProtoError> {
        msg.expect_opcode(Opcode::TransmitData)?;
        Ok(Self { data: msg.body })
    }
}

/// `Read` body: name of the file whose last line is wanted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFile {
    pub file_name: String,
}

impl ReadFile {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn into_message(self) -> Message {
        Message::new(Opcode::Read, Bytes::from(self.file_name.into_bytes()))
    }

    pub fn from_message(msg: Message) -> Result<Self, ProtoError> {
        msg.expect_opcode(Opcode::Read)?;
        Ok(Self {
            file_name: msg.body_text()?,
        })
    }
}

const WRITE_DELIMITER: &[u8] = b"\r\n";

/// `Write` body: file name, the CR LF delimiter, then the line to append.
/// File names containing CR LF are not representable on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendLine {
    pub file_name: String,
    pub line: String,
}

impl AppendLine {
    pub fn new(file_name: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            line: line.into(),
        }
    }

    pub fn into_message(self) -> Result<Message, ProtoError> {
        if self.file_name.as_bytes().windows(2).any(|w| w == WRITE_DELIMITER) {
            return Err(ProtoError::DelimiterInFileName);
        }
        let mut body =
            BytesMut::with_capacity(self.file_name.len() + WRITE_DELIMITER.len() + self.line.len());
        body.put_slice(self.file_name.as_bytes());
        body.put_slice(WRITE_DELIMITER);
        body.put_slice(self.line.as_bytes());
        Ok(Message::new(Opcode::Write, body.freeze()))
    }

    pub fn from_message(msg: Message) -> Result<Self, ProtoError> {
        msg.expect_opcode(Opcode::Write)?;
        let body = &msg.body;
        let split = body
            .windows(2)
            .position(|w| w == WRITE_DELIMITER)
            .ok_or(ProtoError::MalformedBody {
                opcode: Opcode::Write,
                reason: "missing CR LF delimiter",
            })?;
        let file_name = String::from_utf8(body[..split].to_vec())
            .map_err(|_| ProtoError::InvalidUtf8)?;
        let line = String::from_utf8(body[split + WRITE_DELIMITER.len()..].to_vec())
            .map_err(|_| ProtoError::InvalidUtf8)?;
        Ok(Self { file_name, line })
    }
}

const TIMESTAMP_LEN: usize = 8;

fn encode_stamped(opcode: Opcode, timestamp: u64, file_name: &str) -> Message {
    let mut body = BytesMut::with_capacity(TIMESTAMP_LEN + file_name.len());
    body.put_u64_le(timestamp);
    body.put_slice(file_name.as_bytes());
    Message::new(opcode, body.freeze())
}

fn decode_stamped(msg: &Message) -> Result<(u64, String), ProtoError> {
    if msg.body.len() < TIMESTAMP_LEN {
        return Err(ProtoError::MalformedBody {
            opcode: msg.opcode,
            reason: "body shorter than the timestamp",
        });
    }
    let mut stamp = [0u8; TIMESTAMP_LEN];
    stamp.copy_from_slice(&msg.body[..TIMESTAMP_LEN]);
    let timestamp = u64::from_le_bytes(stamp);
    let file_name = String::from_utf8(msg.body[TIMESTAMP_LEN..].to_vec())
        .map_err(|_| ProtoError::InvalidUtf8)?;
    Ok((timestamp, file_name))
}

/// `Request` body: a logical timestamp and the file the sender wants to lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub timestamp: u64,
    pub file_name: String,
}

impl LockRequest {
    pub fn new(timestamp: u64, file_name: impl Into<String>) -> Self {
        Self {
            timestamp,
            file_name: file_name.into(),
        }
    }

    pub fn into_message(self) -> Message {
        encode_stamped(Opcode::Request, self.timestamp, &self.file_name)
    }

    pub fn from_message(msg: Message) -> Result<Self, ProtoError> {
        msg.expect_opcode(Opcode::Request)?;
        let (timestamp, file_name) = decode_stamped(&msg)?;
        Ok(Self {
            timestamp,
            file_name,
        })
    }
}

/// `Reply` body: permission for the named file, stamped with the replier's
/// clock. Permission stands until the replier next requests the same file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockReply {
    pub timestamp: u64,
    pub file_name: String,
}

impl LockReply {
    pub fn new(timestamp: u64, file_name: impl Into<String>) -> Self {
        Self {
            timestamp,
            file_name: file_name.into(),
        }
    }

    pub fn into_message(self) -> Message {
        encode_stamped(Opcode::Reply, self.timestamp, &self.file_name)
    }

    pub fn from_message(msg: Message) -> Result<Self, ProtoError> {
        msg.expect_opcode(Opcode::Reply)?;
        let (timestamp, file_name) = decode_stamped(&msg)?;
        Ok(Self {
            timestamp,
            file_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_round_trip() {
        for byte in [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 100, 101, 200] {
            let opcode = Opcode::from_byte(byte).unwrap();
            assert_eq!(opcode.as_byte(), byte);
        }
        assert!(matches!(
            Opcode::from_byte(42),
            Err(ProtoError::UnknownOpcode(42))
        ));
    }

    #[test]
    fn establish_connection_round_trips() {
        let original = EstablishConnection::new(NodeId::new(7), "sesame");
        let msg = original.clone().into_message();
        assert_eq!(msg.body[0], 7);
        assert_eq!(EstablishConnection::from_message(msg).unwrap(), original);
    }

    #[test]
    fn establish_connection_requires_identity_byte() {
        let msg = Message::empty(Opcode::EstablishConnection);
        assert!(matches!(
            EstablishConnection::from_message(msg),
            Err(ProtoError::MalformedBody { .. })
        ));
    }

    #[test]
    fn lock_request_uses_eight_byte_le_timestamp() {
        let msg = LockRequest::new(0x0102030405060708, "data.txt").into_message();
        assert_eq!(&msg.body[..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        let decoded = LockRequest::from_message(msg).unwrap();
        assert_eq!(decoded.timestamp, 0x0102030405060708);
        assert_eq!(decoded.file_name, "data.txt");
    }

    #[test]
    fn lock_reply_rejects_short_body() {
        let msg = Message::new(Opcode::Reply, Bytes::from_static(&[1, 2, 3]));
        assert!(matches!(
            LockReply::from_message(msg),
            Err(ProtoError::MalformedBody { .. })
        ));
    }

    #[test]
    fn append_line_round_trips() {
        let original = AppendLine::new("log.txt", "hello world");
        let msg = original.clone().into_message().unwrap();
        assert_eq!(AppendLine::from_message(msg).unwrap(), original);
    }

    #[test]
    fn append_line_rejects_delimiter_in_name() {
        let err = AppendLine::new("bad\r\nname", "x").into_message().unwrap_err();
        assert!(matches!(err, ProtoError::DelimiterInFileName));
    }

    #[test]
    fn append_line_keeps_delimiter_bytes_in_line() {
        let msg = AppendLine::new("log.txt", "a\r\nb").into_message().unwrap();
        let decoded = AppendLine::from_message(msg).unwrap();
        assert_eq!(decoded.file_name, "log.txt");
        assert_eq!(decoded.line, "a\r\nb");
    }

    #[test]
    fn conversions_check_the_opcode() {
        let msg = Message::ok();
        assert!(matches!(
            TextResponse::from_message(msg),
            Err(ProtoError::UnexpectedOpcode {
                expected: Opcode::Response,
                got: Opcode::Ok
            })
        ));
    }
}
