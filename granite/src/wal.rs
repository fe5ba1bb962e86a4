//! The log-manager handle consumed by the buffer pool.
//!
//! The page cache holds a [`LogManager`] but never writes records to it;
//! recovery sits outside this crate. The format is real so the handle is
//! wired for integration: length-prefixed bincode payloads behind a
//! CRC-checked header.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::PageId;

/// A Log Sequence Number: the byte offset of a record in the log file.
pub type Lsn = u64;

/// Header for every log record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct LogRecordHeader {
    /// The total length of the record, including the header.
    pub total_len: u32,
    /// The CRC checksum of the payload.
    pub crc: u32,
}

/// Page-lifecycle events a storage front end may want made durable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// A fresh page id was handed out.
    PageAllocated { page_id: PageId },
    /// A page id was retired.
    PageDeallocated { page_id: PageId },
    /// A full page image, logged ahead of an in-place rewrite.
    PageImage { page_id: PageId, data: Vec<u8> },
}

pub struct LogManager {
    file: Mutex<File>,
    next_lsn: AtomicU64,
}

impl LogManager {
    /// Opens the log file and positions the next LSN at its end.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .write(true)
            .open(path)?;
        let next_lsn = AtomicU64::new(file.metadata()?.len());
        Ok(LogManager {
            file: Mutex::new(file),
            next_lsn,
        })
    }

    fn lock_file(&self) -> std::sync::MutexGuard<'_, File> {
        self.file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a record and returns its LSN.
    pub fn append(&self, record: &LogRecord) -> io::Result<Lsn> {
        let payload = bincode::serialize(record)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let header_len = std::mem::size_of::<LogRecordHeader>() as u32;
        let total_len = header_len + payload.len() as u32;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let header = LogRecordHeader {
            total_len,
            crc: hasher.finalize(),
        };

        let lsn = self.next_lsn.fetch_add(total_len as u64, Ordering::SeqCst);
        let mut file = self.lock_file();
        file.seek(SeekFrom::Start(lsn))?;
        file.write_all(unsafe {
            std::slice::from_raw_parts(&header as *const _ as *const u8, header_len as usize)
        })?;
        file.write_all(&payload)?;
        Ok(lsn)
    }

    /// Reads the record at `lsn` and the LSN following it. `None` past the
    /// end of the log.
    pub fn read_record(&self, lsn: Lsn) -> io::Result<Option<(LogRecord, Lsn)>> {
        let mut file = self.lock_file();
        if lsn >= file.metadata()?.len() {
            return Ok(None);
        }

        file.seek(SeekFrom::Start(lsn))?;
        let mut header_buf = [0u8; std::mem::size_of::<LogRecordHeader>()];
        if file.read_exact(&mut header_buf).is_err() {
            return Ok(None);
        }
        let header: LogRecordHeader = unsafe { std::mem::transmute(header_buf) };

        let payload_len = header.total_len as usize - std::mem::size_of::<LogRecordHeader>();
        let mut payload = vec![0; payload_len];
        file.read_exact(&mut payload)?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != header.crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "log record CRC mismatch",
            ));
        }

        let record = bincode::deserialize(&payload)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Some((record, lsn + header.total_len as u64)))
    }

    /// Forces everything appended so far to stable storage.
    pub fn flush(&self) -> io::Result<()> {
        self.lock_file().sync_all()
    }
}
