use crate::connection::ConnectionError;
use crate::framing::{FramingError, Message, MessageTag, Priority, FIELD_HDR_LEN};
use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;

/// Default fragment size used by [`MessageWriter`]
pub const DEFAULT_FRAGMENT_SIZE: usize = 8192;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Message sink is closed")]
    Closed,
    #[error("Destination is unavailable")]
    Unavailable,
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Anything that accepts outgoing messages: a connection, the manager, a queue
#[async_trait]
pub trait MessageSink: Send {
    async fn send_message(&mut self, msg: Message) -> Result<(), SinkError>;
}

/// Streams a large message to a sink as a sequence of fragments
///
/// Fields accumulate in a buffer; whenever the next field doesn't fit, the buffer is
/// sent as a fragment without end marker and a fresh one takes its place.
/// [`finish`](Self::finish) adds the end marker and sends the last fragment.
pub struct MessageWriter<'a, S: MessageSink + ?Sized> {
    sink: &'a mut S,
    current: Message,
    fragment_size: usize,
    fragments: usize,
}

impl<'a, S: MessageSink + ?Sized> MessageWriter<'a, S> {
    pub fn new(sink: &'a mut S, tag: MessageTag, priority: Priority) -> Self {
        Self::with_fragment_size(sink, tag, priority, DEFAULT_FRAGMENT_SIZE)
    }

    pub fn with_fragment_size(
        sink: &'a mut S,
        tag: MessageTag,
        priority: Priority,
        fragment_size: usize,
    ) -> Self {
        Self {
            sink,
            current: Message::with_capacity(tag, priority, fragment_size),
            fragment_size,
            fragments: 0,
        }
    }

    /// Adds a field, flushing the current fragment first if the field doesn't fit
    pub async fn encode_field(&mut self, tag: u8, payload: &[u8]) -> Result<(), SinkError> {
        let needed = FIELD_HDR_LEN + payload.len();
        if !self.current.is_empty() && self.current.body_len() + needed > self.fragment_size {
            self.flush_fragment().await?;
        }
        self.current.encode_field(tag, payload)?;
        Ok(())
    }

    pub async fn encode_u32(&mut self, tag: u8, value: u32) -> Result<(), SinkError> {
        self.encode_field(tag, &value.to_be_bytes()).await
    }

    pub async fn encode_u64(&mut self, tag: u8, value: u64) -> Result<(), SinkError> {
        self.encode_field(tag, &value.to_be_bytes()).await
    }

    pub async fn encode_str(&mut self, tag: u8, value: &str) -> Result<(), SinkError> {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.encode_field(tag, &payload).await
    }

    async fn flush_fragment(&mut self) -> Result<(), SinkError> {
        let fresh = Message::with_capacity(
            self.current.tag,
            self.current.priority,
            self.fragment_size,
        );
        let fragment = std::mem::replace(&mut self.current, fresh);
        self.fragments += 1;
        trace!(
            "Flushing fragment {} with 0x{:x} bytes",
            self.fragments,
            fragment.body_len()
        );
        self.sink.send_message(fragment).await
    }

    /// Ends the message and sends the last fragment. Returns the number of frames sent.
    pub async fn finish(mut self) -> Result<usize, SinkError> {
        self.current.mark_end();
        let last = std::mem::replace(
            &mut self.current,
            Message::new(MessageTag::Idmef, Priority::default()),
        );
        self.sink.send_message(last).await?;
        Ok(self.fragments + 1)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::framing::{MessageCodec, ReadStatus};
    use anyhow::Result;
    use bytes::{BufMut, BytesMut};

    #[derive(Default)]
    struct Collect(Vec<Message>);

    #[async_trait]
    impl MessageSink for Collect {
        async fn send_message(&mut self, msg: Message) -> Result<(), SinkError> {
            self.0.push(msg);
            Ok(())
        }
    }

    #[test_log::test(tokio::test)]
    async fn large_message_is_fragmented_and_reassembled() -> Result<()> {
        let mut sink = Collect::default();
        let mut writer =
            MessageWriter::with_fragment_size(&mut sink, MessageTag::OptionReply, Priority::High, 64);
        for i in 0..20u32 {
            writer.encode_str(8, &format!("option-{}", i)).await?;
        }
        let frames = writer.finish().await?;
        assert!(frames > 1);
        assert_eq!(sink.0.len(), frames);
        assert!(sink.0[..frames - 1].iter().all(|m| !m.is_ended()));
        assert!(sink.0[frames - 1].is_ended());

        let mut wire = BytesMut::new();
        for m in &sink.0 {
            wire.put_slice(&m.to_buf());
        }
        let mut msg = match MessageCodec::new().read(&mut wire, false)? {
            ReadStatus::Finished(msg) => msg,
            other => panic!("expected a message, got {:?}", other),
        };
        assert_eq!(msg.tag, MessageTag::OptionReply);
        let mut i = 0;
        while let Some(field) = msg.get_field()? {
            assert_eq!(field.payload, format!("option-{}\0", i).as_bytes());
            i += 1;
        }
        assert_eq!(i, 20);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn small_message_is_a_single_frame() -> Result<()> {
        let mut sink = Collect::default();
        let mut writer = MessageWriter::new(&mut sink, MessageTag::Idmef, Priority::Mid);
        writer.encode_u64(1, 7).await?;
        assert_eq!(writer.finish().await?, 1);
        assert_eq!(sink.0.len(), 1);
        Ok(())
    }
}
