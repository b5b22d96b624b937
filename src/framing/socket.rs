use crate::framing::{FramingError, Message, MessageCodec, ReadStatus};
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{error, trace};

/// Message Stream + Sink over any byte stream
///
/// Malformed messages are logged and skipped. The stream yields an error when the
/// byte stream itself can no longer be trusted, and ends when the peer disconnects.
pub struct MessageSocket<IO> {
    read: FramedRead<ReadHalf<IO>, MessageCodec>,
    write: FramedWrite<WriteHalf<IO>, MessageCodec>,
}

impl<IO> MessageSocket<IO>
where
    IO: AsyncRead + AsyncWrite,
{
    pub fn new(io: IO) -> Self {
        let (read, write) = tokio::io::split(io);
        let read = FramedRead::new(read, MessageCodec::new());
        let write = FramedWrite::new(write, MessageCodec::new());
        Self { read, write }
    }

    /// Checks for an inbound message without waiting
    pub fn try_recv(&mut self) -> Result<ReadStatus, FramingError> {
        match self.next().now_or_never() {
            None => Ok(ReadStatus::Unfinished),
            Some(None) => Ok(ReadStatus::Eof),
            Some(Some(Ok(msg))) => Ok(ReadStatus::Finished(msg)),
            Some(Some(Err(e))) => Err(e),
        }
    }
}

impl<IO> Stream for MessageSocket<IO>
where
    IO: AsyncRead + AsyncWrite,
{
    type Item = Result<Message, FramingError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let msg = match ready!(this.read.poll_next_unpin(cx)) {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    error!("Failed to read message frame: {}", e);
                    return Poll::Ready(Some(Err(e)));
                }
                None => return Poll::Ready(None),
            };
            match msg {
                Ok(msg) => {
                    trace!(
                        "Received tag 0x{:x} message with 0x{:x} bytes body: {}",
                        msg.tag,
                        msg.body_len(),
                        hex::encode(msg.body()),
                    );
                    return Poll::Ready(Some(Ok(msg)));
                }
                Err(e) => {
                    error!("Bad message: {}", e);
                    continue;
                }
            }
        }
    }
}

impl<IO> Sink<Message> for MessageSocket<IO>
where
    IO: AsyncRead + AsyncWrite,
{
    type Error = FramingError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        SinkExt::<Message>::poll_ready_unpin(&mut self.get_mut().write, cx)
    }

    fn start_send(self: Pin<&mut Self>, msg: Message) -> Result<(), Self::Error> {
        let this = self.get_mut();
        trace!(
            "Sending tag 0x{:x} message with 0x{:x} bytes body: {}",
            msg.tag,
            msg.body_len(),
            hex::encode(msg.body()),
        );
        this.write.start_send_unpin(msg)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        SinkExt::<Message>::poll_flush_unpin(&mut self.get_mut().write, cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        SinkExt::<Message>::poll_close_unpin(&mut self.get_mut().write, cx)
    }
}
