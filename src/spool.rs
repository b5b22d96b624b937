//! On-disk failover queue for messages that couldn't be delivered
//!
//! Each spool is a directory holding one append-only log. A record is a complete
//! message frame followed by a big endian CRC-32 of the frame. The log is scanned
//! once on open; anything after the last intact record is a torn write and gets truncated.

use crate::framing::{
    FramingError, Message, MessageSink, HDR_LEN, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use byteorder::{ByteOrder, BE};
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

const LOG_FILE: &str = "spool";
const COMPACT_FILE: &str = "spool.compact";
const CRC_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("Spool IO error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Message can't be spooled")]
    Framing(#[from] FramingError),
    #[error("Spool record at offset {0:#x} is corrupted")]
    Corrupted(u64),
}

/// Outcome of a [`Spool::flush`]
#[derive(Eq, PartialEq, Debug, Default, Clone, Copy)]
pub struct FlushReport {
    /// Records present when the flush started
    pub available: usize,
    /// Records accepted by the sink and removed from the spool
    pub delivered: usize,
    /// Unreadable records found on the way and discarded
    pub discarded: usize,
    /// Bytes removed along with the delivered and discarded records
    pub bytes: u64,
    /// Records evicted by the quota since the spool was opened
    pub deleted: u64,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.delivered + self.discarded == self.available
    }
}

/// Name of the spool directory for a destination
pub fn spool_dir_name(destination: &str) -> String {
    destination.replace('/', "_")
}

pub struct Spool {
    dir: PathBuf,
    path: PathBuf,
    append: File,
    read: File,
    /// Size of each record, oldest first
    records: VecDeque<u64>,
    size: u64,
    quota: Option<u64>,
    deleted: u64,
}

impl Spool {
    /// Opens or creates the spool in `dir`, dropping any torn record at the end of the log
    pub async fn open(dir: impl AsRef<Path>, quota: Option<u64>) -> Result<Self, SpoolError> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(LOG_FILE);
        let io_err = |source| SpoolError::Io {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(&dir).await.map_err(io_err)?;
        let (append, mut read) = open_handles(&path).await.map_err(io_err)?;

        let (records, size) = scan(&mut read).await.map_err(io_err)?;
        let file_len = append.metadata().await.map_err(io_err)?.len();
        if file_len > size {
            warn!(
                "Spool {} has 0x{:x} trailing bytes from an interrupted write, truncating",
                path.display(),
                file_len - size
            );
            append.set_len(size).await.map_err(io_err)?;
        }
        debug!(
            "Opened spool {} with {} records (0x{:x} bytes)",
            path.display(),
            records.len(),
            size
        );
        Ok(Self {
            dir,
            path,
            append,
            read,
            records,
            size,
            quota,
            deleted: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_available_count(&self) -> usize {
        self.records.len()
    }

    pub fn get_deleted_count(&self) -> u64 {
        self.deleted
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn quota(&self) -> Option<u64> {
        self.quota
    }

    fn io_err(&self) -> impl Fn(std::io::Error) -> SpoolError + '_ {
        |source| SpoolError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Appends one terminated message, evicting the oldest records if the quota requires it
    pub async fn save(&mut self, msg: &Message) -> Result<(), SpoolError> {
        if !msg.is_ended() {
            return Err(FramingError::InvalidMessage(
                "only terminated messages can be spooled".into(),
            )
            .into());
        }
        let mut record = msg.to_buf();
        let crc = crc32fast::hash(&record);
        record.extend_from_slice(&crc.to_be_bytes());
        let len = record.len() as u64;

        if let Some(quota) = self.quota {
            let mut evict = 0;
            let mut freed = 0;
            for r in self.records.iter() {
                if self.size - freed + len <= quota {
                    break;
                }
                freed += r;
                evict += 1;
            }
            if evict > 0 {
                self.drop_front(evict).await?;
                self.deleted += evict as u64;
                warn!(
                    "Spool {} over quota, erased {} oldest messages",
                    self.path.display(),
                    evict
                );
            }
        }

        if let Err(e) = self.append_record(&record).await {
            // Leave no partial record behind for the next read
            if let Err(trunc_err) = self.append.set_len(self.size).await {
                error!(
                    "Failed to truncate spool {} after a failed write: {}",
                    self.path.display(),
                    trunc_err
                );
            }
            return Err(self.io_err()(e));
        }
        self.records.push_back(len);
        self.size += len;
        Ok(())
    }

    async fn append_record(&mut self, record: &[u8]) -> std::io::Result<()> {
        self.append.write_all(record).await?;
        self.append.flush().await?;
        self.append.sync_data().await
    }

    /// Re-delivers spooled messages oldest first, stopping at the first one the sink refuses.
    /// Only records the sink accepted are removed.
    pub async fn flush<S>(&mut self, sink: &mut S) -> Result<FlushReport, SpoolError>
    where
        S: MessageSink + ?Sized,
    {
        let mut report = FlushReport {
            available: self.records.len(),
            deleted: self.deleted,
            ..Default::default()
        };
        if report.available == 0 {
            return Ok(report);
        }
        info!(
            "Flushing {} messages from {} ({} erased due to quota)",
            report.available,
            self.dir.display(),
            self.deleted
        );

        self.read
            .seek(SeekFrom::Start(0))
            .await
            .map_err(self.io_err())?;
        let mut outcome = Ok(());
        let mut offset = 0;
        for &len in self.records.iter() {
            let mut buf = vec![0; len as usize];
            if let Err(e) = self.read.read_exact(&mut buf).await {
                outcome = Err(self.io_err()(e));
                break;
            }
            match decode_record(&buf) {
                Ok(msg) => {
                    if let Err(e) = sink.send_message(msg).await {
                        debug!("Spool flush interrupted: {}", e);
                        break;
                    }
                    report.delivered += 1;
                }
                Err(e) => {
                    error!(
                        "{}, discarding it: {}",
                        SpoolError::Corrupted(offset),
                        e
                    );
                    report.discarded += 1;
                }
            }
            report.bytes += len;
            offset += len;
        }

        let removed = report.delivered + report.discarded;
        self.drop_front(removed).await?;
        self.deleted += report.discarded as u64;
        if report.is_complete() {
            info!(
                "Recovered: {}/{} messages flushed (0x{:x} bytes)",
                report.delivered, report.available, report.bytes
            );
        } else {
            warn!(
                "Failed recovering: {}/{} messages flushed (0x{:x} bytes)",
                report.delivered, report.available, report.bytes
            );
        }
        outcome.map(|_| report)
    }

    /// Removes the `count` oldest records
    async fn drop_front(&mut self, count: usize) -> Result<(), SpoolError> {
        if count == 0 {
            return Ok(());
        }
        if count >= self.records.len() {
            self.append.set_len(0).await.map_err(self.io_err())?;
            self.records.clear();
            self.size = 0;
            return Ok(());
        }

        let offset: u64 = self.records.iter().take(count).sum();
        let compact_path = self.dir.join(COMPACT_FILE);
        let compact_err = |source| SpoolError::Io {
            path: compact_path.clone(),
            source,
        };
        let mut compact = File::create(&compact_path).await.map_err(compact_err)?;
        self.read
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(self.io_err())?;
        tokio::io::copy(&mut self.read, &mut compact)
            .await
            .map_err(compact_err)?;
        compact.flush().await.map_err(compact_err)?;
        compact.sync_all().await.map_err(compact_err)?;
        drop(compact);
        tokio::fs::rename(&compact_path, &self.path)
            .await
            .map_err(compact_err)?;

        let (append, read) = open_handles(&self.path).await.map_err(self.io_err())?;
        self.append = append;
        self.read = read;
        self.records.drain(..count);
        self.size -= offset;
        Ok(())
    }
}

async fn open_handles(path: &Path) -> std::io::Result<(File, File)> {
    let append = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let read = OpenOptions::new().read(true).open(path).await?;
    Ok((append, read))
}

fn decode_record(buf: &[u8]) -> Result<Message, FramingError> {
    if buf.len() < HDR_LEN + CRC_LEN {
        return Err(FramingError::InvalidMessage("truncated spool record".into()));
    }
    let (frame, crc) = buf.split_at(buf.len() - CRC_LEN);
    if crc32fast::hash(frame) != BE::read_u32(crc) {
        return Err(FramingError::InvalidMessage("spool record checksum mismatch".into()));
    }
    Message::from_frame(frame)
}

/// Walks the log from the start and returns the size of every intact record
async fn scan(file: &mut File) -> std::io::Result<(VecDeque<u64>, u64)> {
    file.seek(SeekFrom::Start(0)).await?;
    let mut reader = BufReader::new(file);
    let mut records = VecDeque::new();
    let mut valid = 0;
    let mut hdr = [0u8; HDR_LEN];
    loop {
        if !read_or_eof(&mut reader, &mut hdr).await? {
            break;
        }
        let body_len = BE::read_u32(&hdr[3..HDR_LEN]) as usize;
        if hdr[0] != PROTOCOL_VERSION || body_len > MAX_MESSAGE_SIZE {
            break;
        }
        let mut rest = vec![0; body_len + CRC_LEN];
        if !read_or_eof(&mut reader, &mut rest).await? {
            break;
        }
        let mut record = Vec::with_capacity(HDR_LEN + rest.len());
        record.extend_from_slice(&hdr);
        record.extend_from_slice(&rest);
        if decode_record(&record).is_err() {
            break;
        }
        records.push_back(record.len() as u64);
        valid += record.len() as u64;
    }
    Ok((records, valid))
}

async fn read_or_eof(reader: &mut BufReader<&mut File>, buf: &mut [u8]) -> std::io::Result<bool> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::framing::{MessageTag, Priority, SinkError};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::io::Write;

    /// Accepts `budget` messages, then refuses everything
    struct FlakySink {
        budget: usize,
        got: Vec<Message>,
    }

    impl FlakySink {
        fn new(budget: usize) -> Self {
            Self {
                budget,
                got: Vec::new(),
            }
        }

        fn ids(&self) -> Vec<u32> {
            self.got.iter().map(|m| msg_id(m.clone())).collect()
        }
    }

    #[async_trait]
    impl MessageSink for FlakySink {
        async fn send_message(&mut self, msg: Message) -> Result<(), SinkError> {
            if self.budget == 0 {
                return Err(SinkError::Unavailable);
            }
            self.budget -= 1;
            self.got.push(msg);
            Ok(())
        }
    }

    fn msg(id: u32) -> Message {
        let mut msg = Message::new(MessageTag::Idmef, Priority::Mid);
        msg.encode_u32(1, id).unwrap();
        msg.mark_end();
        msg
    }

    fn msg_id(mut msg: Message) -> u32 {
        let field = msg.get_field().unwrap().unwrap();
        crate::framing::message::extract_u32(&field.payload).unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn partial_flush_keeps_the_rest_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut spool = Spool::open(dir.path(), None).await?;
        for id in 0..10 {
            spool.save(&msg(id)).await?;
        }
        assert_eq!(spool.get_available_count(), 10);

        let mut sink = FlakySink::new(4);
        let report = spool.flush(&mut sink).await?;
        assert_eq!(report.available, 10);
        assert_eq!(report.delivered, 4);
        assert!(!report.is_complete());
        assert_eq!(sink.ids(), vec![0, 1, 2, 3]);
        assert_eq!(spool.get_available_count(), 6);

        // The remainder survives a reopen, in order and without duplicates
        drop(spool);
        let mut spool = Spool::open(dir.path(), None).await?;
        assert_eq!(spool.get_available_count(), 6);
        let mut sink = FlakySink::new(usize::MAX);
        let report = spool.flush(&mut sink).await?;
        assert!(report.is_complete());
        assert_eq!(sink.ids(), vec![4, 5, 6, 7, 8, 9]);
        assert_eq!(spool.get_available_count(), 0);
        assert_eq!(spool.size(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn refused_first_message_changes_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut spool = Spool::open(dir.path(), None).await?;
        spool.save(&msg(1)).await?;
        spool.save(&msg(2)).await?;
        let size = spool.size();

        let report = spool.flush(&mut FlakySink::new(0)).await?;
        assert_eq!(report.delivered, 0);
        assert_eq!(spool.get_available_count(), 2);
        assert_eq!(spool.size(), size);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn quota_evicts_oldest_first() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let record_len = (msg(0).wire_len() + CRC_LEN) as u64;
        let mut spool = Spool::open(dir.path(), Some(3 * record_len)).await?;
        for id in 0..5 {
            spool.save(&msg(id)).await?;
        }
        assert_eq!(spool.get_available_count(), 3);
        assert_eq!(spool.get_deleted_count(), 2);

        let mut sink = FlakySink::new(usize::MAX);
        let report = spool.flush(&mut sink).await?;
        assert_eq!(report.deleted, 2);
        assert_eq!(sink.ids(), vec![2, 3, 4]);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn oversized_record_replaces_everything() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let record_len = (msg(0).wire_len() + CRC_LEN) as u64;
        let mut spool = Spool::open(dir.path(), Some(2 * record_len)).await?;
        spool.save(&msg(0)).await?;
        spool.save(&msg(1)).await?;

        let mut big = Message::new(MessageTag::Idmef, Priority::Mid);
        big.encode_field(1, &[0xAA; 256])?;
        big.mark_end();
        spool.save(&big).await?;
        assert_eq!(spool.get_available_count(), 1);
        assert_eq!(spool.get_deleted_count(), 2);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn torn_tail_is_truncated_on_open() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut spool = Spool::open(dir.path(), None).await?;
        for id in 0..3 {
            spool.save(&msg(id)).await?;
        }
        let good_size = spool.size();
        let path = spool.path().to_path_buf();
        drop(spool);

        // Simulate a crash halfway through the next append
        let partial = msg(3).to_buf();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(&partial[..partial.len() / 2])?;
        drop(file);

        let mut spool = Spool::open(dir.path(), None).await?;
        assert_eq!(spool.get_available_count(), 3);
        assert_eq!(std::fs::metadata(&path)?.len(), good_size);

        spool.save(&msg(3)).await?;
        let mut sink = FlakySink::new(usize::MAX);
        spool.flush(&mut sink).await?;
        assert_eq!(sink.ids(), vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn corrupted_checksum_ends_the_log() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut spool = Spool::open(dir.path(), None).await?;
        spool.save(&msg(0)).await?;
        spool.save(&msg(1)).await?;
        let path = spool.path().to_path_buf();
        drop(spool);

        let mut bytes = std::fs::read(&path)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes)?;

        let spool = Spool::open(dir.path(), None).await?;
        assert_eq!(spool.get_available_count(), 1);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn damaged_record_is_discarded_during_flush() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut spool = Spool::open(dir.path(), None).await?;
        for id in 0..3 {
            spool.save(&msg(id)).await?;
        }
        // Damage the payload of the second record after it was scanned
        let record_len = msg(0).wire_len() + CRC_LEN;
        let mut bytes = std::fs::read(spool.path())?;
        bytes[record_len + HDR_LEN + 5] ^= 0xFF;
        std::fs::write(spool.path(), &bytes)?;

        let mut sink = FlakySink::new(usize::MAX);
        let report = spool.flush(&mut sink).await?;
        assert_eq!(sink.ids(), vec![0, 2]);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.discarded, 1);
        assert!(report.is_complete());
        assert_eq!(spool.get_available_count(), 0);
        assert_eq!(spool.get_deleted_count(), 1);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn damaged_head_does_not_block_later_records() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut spool = Spool::open(dir.path(), None).await?;
        for id in 0..3 {
            spool.save(&msg(id)).await?;
        }
        let mut bytes = std::fs::read(spool.path())?;
        bytes[HDR_LEN + 5] ^= 0xFF;
        std::fs::write(spool.path(), &bytes)?;

        // The sink refuses the first good record: only the damaged one goes
        let report = spool.flush(&mut FlakySink::new(0)).await?;
        assert_eq!(report.discarded, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(spool.get_available_count(), 2);

        let mut sink = FlakySink::new(usize::MAX);
        spool.flush(&mut sink).await?;
        assert_eq!(sink.ids(), vec![1, 2]);
        Ok(())
    }

    #[test]
    fn destination_directory_names() {
        assert_eq!(spool_dir_name("10.0.0.1:4690"), "10.0.0.1:4690");
        assert_eq!(spool_dir_name("unix:/tmp/.sock"), "unix:_tmp_.sock");
    }

    #[test_log::test(tokio::test)]
    async fn unterminated_messages_are_refused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut spool = Spool::open(dir.path(), None).await?;
        let msg = Message::new(MessageTag::Idmef, Priority::Mid);
        assert!(matches!(
            spool.save(&msg).await,
            Err(SpoolError::Framing(_))
        ));
        Ok(())
    }
}
