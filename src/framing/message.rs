use crate::framing::{
    FramingError, MessageTag, Priority, END_OF_MESSAGE_TAG, FIELD_HDR_LEN, HDR_LEN,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use byteorder::{ByteOrder, WriteBytesExt, BE};
use bytes::{BufMut, Bytes, BytesMut};

/// A logical message: a header tag and priority, and a body of tagged fields
///
/// Messages are built incrementally with [`encode_field`](Self::encode_field) and closed
/// with [`mark_end`](Self::mark_end). Received messages are consumed in encoding order
/// with [`get_field`](Self::get_field).
#[derive(Debug, Clone)]
pub struct Message {
    pub tag: MessageTag,
    pub priority: Priority,
    body: BytesMut,
    ended: bool,
    read_pos: usize,
}

/// One `(tag, payload)` pair of a message body
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Field {
    pub tag: u8,
    pub payload: Bytes,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
            && self.priority == other.priority
            && self.ended == other.ended
            && self.body == other.body
    }
}

impl Eq for Message {}

impl Message {
    pub fn new(tag: MessageTag, priority: Priority) -> Self {
        Self::with_capacity(tag, priority, 0)
    }

    pub fn with_capacity(tag: MessageTag, priority: Priority, capacity: usize) -> Self {
        Self {
            tag,
            priority,
            body: BytesMut::with_capacity(capacity),
            ended: false,
            read_pos: 0,
        }
    }

    /// Rebuilds a message from an assembled body. The body must be well formed.
    pub(crate) fn from_body(
        tag: MessageTag,
        priority: Priority,
        body: BytesMut,
    ) -> Result<Self, FramingError> {
        let ended = check_fields(&body)?;
        if !ended {
            return Err(FramingError::InvalidMessage(
                "last field is not the end-of-message marker".into(),
            ));
        }
        Ok(Self {
            tag,
            priority,
            body,
            ended,
            read_pos: 0,
        })
    }

    /// Parses a single complete frame: header followed by a terminated body
    pub(crate) fn from_frame(frame: &[u8]) -> Result<Self, FramingError> {
        if frame.len() < HDR_LEN {
            return Err(FramingError::InvalidMessage("truncated header".into()));
        }
        if frame[0] != PROTOCOL_VERSION {
            return Err(FramingError::ProtocolVersion(frame[0], PROTOCOL_VERSION));
        }
        let priority =
            Priority::from_repr(frame[2]).ok_or(FramingError::InvalidPriority(frame[2]))?;
        let len = BE::read_u32(&frame[3..HDR_LEN]) as usize;
        if len != frame.len() - HDR_LEN {
            return Err(FramingError::InvalidMessage(format!(
                "header announces 0x{:x} bytes, frame holds 0x{:x}",
                len,
                frame.len() - HDR_LEN
            )));
        }
        Self::from_body(
            MessageTag::from(frame[1]),
            priority,
            BytesMut::from(&frame[HDR_LEN..]),
        )
    }

    /// Appends a `(tag, length, payload)` field. Empty payloads are valid.
    pub fn encode_field(&mut self, tag: u8, payload: &[u8]) -> Result<(), FramingError> {
        if tag == END_OF_MESSAGE_TAG {
            return Err(FramingError::ReservedTag(tag));
        }
        if self.ended {
            return Err(FramingError::MessageEnded);
        }
        let new_len = self.body.len() + FIELD_HDR_LEN + payload.len();
        if payload.len() > u32::MAX as usize || new_len > MAX_MESSAGE_SIZE {
            return Err(FramingError::InvalidLength(new_len, MAX_MESSAGE_SIZE));
        }
        self.put_field(tag, payload);
        Ok(())
    }

    pub fn encode_u8(&mut self, tag: u8, value: u8) -> Result<(), FramingError> {
        self.encode_field(tag, &[value])
    }

    pub fn encode_u16(&mut self, tag: u8, value: u16) -> Result<(), FramingError> {
        self.encode_field(tag, &value.to_be_bytes())
    }

    pub fn encode_u32(&mut self, tag: u8, value: u32) -> Result<(), FramingError> {
        self.encode_field(tag, &value.to_be_bytes())
    }

    pub fn encode_u64(&mut self, tag: u8, value: u64) -> Result<(), FramingError> {
        self.encode_field(tag, &value.to_be_bytes())
    }

    /// Strings travel NUL terminated
    pub fn encode_str(&mut self, tag: u8, value: &str) -> Result<(), FramingError> {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.encode_field(tag, &payload)
    }

    /// Closes the message with the reserved end marker. Calling it twice is a no-op.
    pub fn mark_end(&mut self) {
        if !self.ended {
            self.put_field(END_OF_MESSAGE_TAG, &[]);
            self.ended = true;
        }
    }

    fn put_field(&mut self, tag: u8, payload: &[u8]) {
        self.body.reserve(FIELD_HDR_LEN + payload.len());
        self.body.put_u8(tag);
        self.body.put_u32(payload.len() as u32);
        self.body.put_slice(payload);
    }

    /// Returns the next field in encoding order, or `None` once the end marker is reached
    pub fn get_field(&mut self) -> Result<Option<Field>, FramingError> {
        if !self.ended {
            return Err(FramingError::InvalidMessage(
                "message has no end-of-message marker".into(),
            ));
        }
        let (field, next_pos) = match parse_field(&self.body, self.read_pos)? {
            Some(parsed) => parsed,
            None => {
                return Err(FramingError::InvalidMessage(
                    "fields end without an end-of-message marker".into(),
                ))
            }
        };
        if field.0 == END_OF_MESSAGE_TAG {
            return Ok(None);
        }
        self.read_pos = next_pos;
        let payload = Bytes::copy_from_slice(&self.body[field.1]);
        Ok(Some(Field {
            tag: field.0,
            payload,
        }))
    }

    /// Restarts field iteration from the first field
    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// True if no field (besides a possible end marker) was added
    pub fn is_empty(&self) -> bool {
        let marker_len = if self.ended { FIELD_HDR_LEN } else { 0 };
        self.body.len() == marker_len
    }

    /// Length of the encoded fields, as announced in the header
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Length of the whole frame on the wire
    pub fn wire_len(&self) -> usize {
        HDR_LEN + self.body.len()
    }

    pub(crate) fn body(&self) -> &[u8] {
        &self.body
    }

    /// Serializes the header followed by the fields, as a single frame
    pub fn to_buf(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        self.write_to(&mut buf);
        buf
    }

    pub(crate) fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.tag.into());
        buf.put_u8(self.priority.into());
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
    }
}

/// Walks every field of `body`. Returns whether the last field is the end marker,
/// and fails if a field overruns the body or the end marker isn't last.
pub(crate) fn check_fields(body: &[u8]) -> Result<bool, FramingError> {
    let mut pos = 0;
    let mut ended = false;
    while let Some(((tag, payload), next)) = parse_field(body, pos)? {
        if ended {
            return Err(FramingError::InvalidMessage(
                "field found after the end-of-message marker".into(),
            ));
        }
        if tag == END_OF_MESSAGE_TAG {
            if !payload.is_empty() {
                return Err(FramingError::InvalidMessage(
                    "end-of-message marker has a payload".into(),
                ));
            }
            ended = true;
        }
        pos = next;
    }
    Ok(ended)
}

type ParsedField = ((u8, std::ops::Range<usize>), usize);

fn parse_field(body: &[u8], pos: usize) -> Result<Option<ParsedField>, FramingError> {
    if pos == body.len() {
        return Ok(None);
    }
    if body.len() - pos < FIELD_HDR_LEN {
        return Err(FramingError::InvalidMessage(format!(
            "truncated field header at offset {:#x}",
            pos
        )));
    }
    let tag = body[pos];
    let len = BE::read_u32(&body[pos + 1..pos + FIELD_HDR_LEN]) as usize;
    let start = pos + FIELD_HDR_LEN;
    if len > body.len() - start {
        return Err(FramingError::InvalidMessage(format!(
            "field {:#x} announces {:#x} bytes, only {:#x} left",
            tag,
            len,
            body.len() - start
        )));
    }
    Ok(Some(((tag, start..start + len), start + len)))
}

pub fn extract_u8(payload: &[u8]) -> Result<u8, FramingError> {
    match payload {
        [v] => Ok(*v),
        _ => Err(FramingError::FieldSize(payload.len(), 1)),
    }
}

pub fn extract_u16(payload: &[u8]) -> Result<u16, FramingError> {
    check_size(payload, 2)?;
    Ok(BE::read_u16(payload))
}

pub fn extract_u32(payload: &[u8]) -> Result<u32, FramingError> {
    check_size(payload, 4)?;
    Ok(BE::read_u32(payload))
}

pub fn extract_u64(payload: &[u8]) -> Result<u64, FramingError> {
    check_size(payload, 8)?;
    Ok(BE::read_u64(payload))
}

pub fn extract_str(payload: &[u8]) -> Result<&str, FramingError> {
    match payload.split_last() {
        Some((0, text)) => std::str::from_utf8(text).map_err(|_| FramingError::InvalidString),
        _ => Err(FramingError::InvalidString),
    }
}

fn check_size(payload: &[u8], expected: usize) -> Result<(), FramingError> {
    if payload.len() != expected {
        return Err(FramingError::FieldSize(payload.len(), expected));
    }
    Ok(())
}

/// Big endian encoding of a scalar, for callers building payloads by hand
pub fn u64_to_payload(value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    // Writing to a Vec can't fail
    let _ = buf.write_u64::<BE>(value);
    buf
}
