//! Wire protocol: message types, codec, and the per-socket message service.

mod codec;
mod message;
mod service;

pub use codec::{encode, Decoder, BODY_LEN_LEN, MAX_BODY_LEN, OPCODE_LEN};
pub use message::{
    AppendLine, DataChunk, EstablishConnection, ErrorText, FileTransfer, LockReply, LockRequest,
    Message, NodeId, Opcode, ReadFile, TextResponse,
};
pub use service::{
    MessageReader, MessageWriter, ServiceError, CLIENT_TRANSFER_CHUNK, SERVER_TRANSFER_CHUNK,
};

use thiserror::Error;

/// Framing and message-shape errors. All of these are fatal to the connection
/// they occur on.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown opcode byte {0:#04x}")]
    UnknownOpcode(u8),
    #[error("expected {expected:?} message, got {got:?}")]
    UnexpectedOpcode { expected: Opcode, got: Opcode },
    #[error("message body of {len} bytes exceeds the 32-bit length field")]
    BodyTooLarge { len: usize },
    #[error("malformed {opcode:?} body: {reason}")]
    MalformedBody {
        opcode: Opcode,
        reason: &'static str,
    },
    #[error("message body is not valid UTF-8")]
    InvalidUtf8,
    #[error("file name contains the CR LF delimiter")]
    DelimiterInFileName,
    #[error("{got:?} is not valid inside an open compound transfer")]
    CompoundViolation { got: Opcode },
}
