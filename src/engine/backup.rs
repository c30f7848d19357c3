//! CELLAR - Backup Stream Format
//! `CELLARBK` magic and a format byte, followed by one checksummed frame per
//! record using the value-log framing. Records are written in plaintext;
//! encryption at rest does not extend to backups.

use std::io::{Read, Write};

use super::wal::{encode_frame, read_frame, LogRecord};
use crate::error::EngineError;

pub const BACKUP_MAGIC: &[u8; 8] = b"CELLARBK";
pub const BACKUP_FORMAT_VERSION: u8 = 1;

/// Write `records` as a backup stream taken at watermark `since`.
///
/// Returns the watermark for the next incremental backup: one past the
/// highest version written, or `since` when there was nothing to write.
pub fn write_backup(
    sink: &mut dyn Write,
    records: &[LogRecord],
    since: u64,
) -> Result<u64, EngineError> {
    sink.write_all(BACKUP_MAGIC)?;
    sink.write_all(&[BACKUP_FORMAT_VERSION])?;

    let mut max_version = None;
    for record in records {
        let payload = bincode::serialize(record)?;
        sink.write_all(&encode_frame(&payload))?;
        max_version = max_version.max(Some(record.version));
    }
    sink.flush()?;

    Ok(max_version.map_or(since, |v| v + 1))
}

/// Streaming reader over a backup.
pub struct BackupReader<R: Read> {
    source: R,
}

impl<R: Read> BackupReader<R> {
    /// Validate the stream header.
    pub fn open(mut source: R) -> Result<Self, EngineError> {
        let mut header = [0u8; 9];
        source
            .read_exact(&mut header)
            .map_err(|_| EngineError::Corruption("backup stream too short".into()))?;
        if &header[..8] != BACKUP_MAGIC {
            return Err(EngineError::Corruption("not a cellar backup stream".into()));
        }
        if header[8] != BACKUP_FORMAT_VERSION {
            return Err(EngineError::Corruption(format!(
                "unsupported backup format version {}",
                header[8]
            )));
        }
        Ok(Self { source })
    }

    /// Next record, `None` at the end of the stream. Checksums are always
    /// verified.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>, EngineError> {
        match read_frame(&mut self.source, true)? {
            Some(payload) => Ok(Some(bincode::deserialize(&payload)?)),
            None => Ok(None),
        }
    }
}
