//! This module provides an async [`MessageSocket`](socket::MessageSocket) Stream + Sink that handles [`Message`](message::Message)s.
//!
//! The wire format is a big endian, self-delimiting binary protocol.
//! Every frame starts with a 7 bytes header (version, tag, priority, body length),
//! followed by a body made of `(tag: u8, length: u32, payload)` fields.
//! A logical message may be split over several frames; only the last one ends with
//! the end-of-message marker field, and the reader reassembles them transparently.
//!
//! The framing layer does not interpret field tags, except for the end marker.

mod codec;
pub mod message;
pub mod record;
mod socket;
mod tag;
mod writer;

pub use codec::{MessageCodec, ReadStatus};
pub use message::{Field, Message};
pub use socket::MessageSocket;
pub use tag::{MessageTag, Priority};
pub use writer::{MessageSink, MessageWriter, SinkError, DEFAULT_FRAGMENT_SIZE};

use thiserror::Error;

/// Only protocol version understood by this implementation
pub const PROTOCOL_VERSION: u8 = 1;
/// Size of the frame header: version, tag, priority and a u32 body length
pub const HDR_LEN: usize = 7;
/// Size of a field header: tag and u32 payload length
pub const FIELD_HDR_LEN: usize = 5;
/// Reserved field tag closing a logical message, always with an empty payload
pub const END_OF_MESSAGE_TAG: u8 = 0xFE;
/// Anything bigger than this is discarded
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Invalid message length {0:#x}, limit is {1:#x}")]
    InvalidLength(usize, usize),
    #[error("Invalid protocol version {0}, expected {1}")]
    ProtocolVersion(u8, u8),
    #[error("Invalid message priority {0}")]
    InvalidPriority(u8),
    #[error("Field tag {0:#x} is reserved for the end-of-message marker")]
    ReservedTag(u8),
    #[error("Cannot add fields to a message after its end marker")]
    MessageEnded,
    #[error("Field payload has {0} bytes, expected {1}")]
    FieldSize(usize, usize),
    #[error("Field payload is not a NUL terminated UTF-8 string")]
    InvalidString,
    #[error("Framing IO error")]
    Io {
        #[from]
        source: std::io::Error,
    },
}
