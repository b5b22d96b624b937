use crate::framing::message::check_fields;
use crate::framing::{
    FramingError, Message, MessageTag, Priority, HDR_LEN, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use byteorder::{ByteOrder, BE};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::trace;

/// Outcome of a resumable read
#[derive(Debug)]
pub enum ReadStatus {
    /// A complete logical message was reassembled
    Finished(Message),
    /// More bytes are needed, everything received so far is kept
    Unfinished,
    /// The peer closed the stream cleanly, between two messages
    Eof,
}

struct Partial {
    tag: MessageTag,
    priority: Priority,
    body: BytesMut,
}

/// Splits a byte stream into frames and reassembles fragmented messages
///
/// Decoding yields `Ok(Some(Err(_)))` for a malformed message: its bytes are consumed
/// and the next message can still be read. Errors that lose the frame boundaries
/// (bad length, truncated stream) are returned as `Err` and end the stream.
pub struct MessageCodec {
    frames: LengthDelimitedCodec,
    partial: Option<Partial>,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        let frames = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_type::<u32>()
            .length_field_offset(3)
            // The length field counts the body only, frames are yielded with their header
            .length_adjustment(HDR_LEN as isize)
            .num_skip(0)
            .max_frame_length(MAX_MESSAGE_SIZE + HDR_LEN)
            .new_codec();
        Self {
            frames,
            partial: None,
        }
    }

    /// Feeds whatever is buffered in `src` to the decoder.
    /// Partial frames stay in `src` until more bytes arrive.
    pub fn read(&mut self, src: &mut BytesMut, at_eof: bool) -> Result<ReadStatus, FramingError> {
        let item = if at_eof {
            self.decode_eof(src)?
        } else {
            self.decode(src)?
        };
        match item {
            Some(msg) => Ok(ReadStatus::Finished(msg?)),
            None if at_eof => Ok(ReadStatus::Eof),
            None => Ok(ReadStatus::Unfinished),
        }
    }

    fn assemble(&mut self, frame: &[u8]) -> Result<Option<Message>, FramingError> {
        if frame.len() < HDR_LEN {
            return Err(FramingError::InvalidMessage(format!(
                "frame of {} bytes is shorter than its header",
                frame.len()
            )));
        }
        if frame[0] != PROTOCOL_VERSION {
            return Err(FramingError::ProtocolVersion(frame[0], PROTOCOL_VERSION));
        }
        let priority = Priority::from_repr(frame[2]).ok_or(FramingError::InvalidPriority(frame[2]))?;
        let body = &frame[HDR_LEN..];
        if body.is_empty() {
            return Err(FramingError::InvalidMessage("frame has an empty body".into()));
        }
        let ended = check_fields(body)?;

        // Tag and priority of a fragmented message come from its first frame
        let partial = self.partial.get_or_insert_with(|| Partial {
            tag: MessageTag::from(frame[1]),
            priority,
            body: BytesMut::new(),
        });
        let total = partial.body.len() + body.len();
        if total > MAX_MESSAGE_SIZE {
            return Err(FramingError::InvalidLength(total, MAX_MESSAGE_SIZE));
        }
        partial.body.extend_from_slice(body);
        if !ended {
            trace!(
                "Buffered fragment of 0x{:x} bytes, 0x{:x} so far",
                body.len(),
                total
            );
            return Ok(None);
        }

        match self.partial.take() {
            Some(p) => Message::from_body(p.tag, p.priority, p.body).map(Some),
            None => Ok(None),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Result<Message, FramingError>;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() >= HDR_LEN {
                let len = BE::read_u32(&src[3..HDR_LEN]) as usize;
                if len > MAX_MESSAGE_SIZE {
                    return Err(FramingError::InvalidLength(len, MAX_MESSAGE_SIZE));
                }
            }
            let frame = match self.frames.decode(src)? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            match self.assemble(&frame) {
                Ok(Some(msg)) => return Ok(Some(Ok(msg))),
                Ok(None) => continue,
                Err(e) => {
                    self.partial = None;
                    return Ok(Some(Err(e)));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if src.is_empty() && self.partial.is_none() {
            return Ok(None);
        }
        src.clear();
        self.partial = None;
        Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream closed in the middle of a message",
        )
        .into())
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = FramingError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if msg.body_len() > MAX_MESSAGE_SIZE {
            return Err(FramingError::InvalidLength(msg.body_len(), MAX_MESSAGE_SIZE));
        }
        dst.reserve(msg.wire_len());
        msg.write_to(dst);
        Ok(())
    }
}
