//! Length-prefixed records used during connection setup, before message framing starts
//!
//! A record is a big endian u16 length followed by that many bytes.
//! Reads are exact so no byte of the following message stream is consumed.

use crate::framing::FramingError;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub const MAX_RECORD_LEN: usize = u16::MAX as usize;

pub async fn write_record<W>(io: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_RECORD_LEN {
        return Err(FramingError::InvalidLength(payload.len(), MAX_RECORD_LEN));
    }
    trace!("Sending setup record: {}", hex::encode(payload));
    io.write_u16(payload.len() as u16).await?;
    io.write_all(payload).await?;
    io.flush().await?;
    Ok(())
}

pub async fn read_record<R>(io: &mut R) -> Result<Bytes, FramingError>
where
    R: AsyncRead + Unpin,
{
    let len = io.read_u16().await? as usize;
    let mut buf = vec![0; len];
    io.read_exact(&mut buf).await?;
    trace!("Received setup record: {}", hex::encode(&buf));
    Ok(Bytes::from(buf))
}
