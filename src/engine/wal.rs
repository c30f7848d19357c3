//! CELLAR - Value Log
//! Every commit is appended to the head segment as a single checksummed
//! frame before it becomes visible, so a crash never exposes half a
//! transaction. Segments are sealed once they reach their record or byte
//! limit; sealed segments are what space reclamation rewrites.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::crypto::KeyRegistry;
use crate::error::EngineError;
use crate::logger::SharedLogger;

/// Frame header: payload length + CRC32 of the payload, both little endian.
pub const FRAME_HEADER_LEN: usize = 8;

/// Largest payload a frame may carry.
pub const MAX_FRAME_LEN: usize = 256 << 20;

/// Records written per frame when rewriting segments.
const REWRITE_CHUNK: usize = 1024;

const SEGMENT_EXT: &str = "vlog";

/// One key version as persisted in the value log and in backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub key: Vec<u8>,
    /// `None` is a tombstone.
    pub value: Option<Vec<u8>>,
    pub version: u64,
    pub expires_at: u64,
    pub user_meta: u8,
}

/// Frame body: records sealed with data key `key_id` (0 = plaintext).
#[derive(Debug, Serialize, Deserialize)]
struct FramePayload {
    key_id: u64,
    nonce: Vec<u8>,
    body: Vec<u8>,
}

/// Outcome of decoding one frame from a byte buffer.
#[derive(Debug)]
pub enum FrameDecode<'a> {
    Complete { payload: &'a [u8], consumed: usize },
    /// Not enough bytes for the header or the declared payload.
    Torn,
    ChecksumMismatch,
}

/// Encode `[len][crc][payload]`.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode the frame starting at the beginning of `buf`.
pub fn decode_frame(buf: &[u8], verify: bool) -> FrameDecode<'_> {
    if buf.len() < FRAME_HEADER_LEN {
        return FrameDecode::Torn;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let end = FRAME_HEADER_LEN + len;
    if buf.len() < end {
        return FrameDecode::Torn;
    }
    let payload = &buf[FRAME_HEADER_LEN..end];
    if verify && crc32fast::hash(payload) != crc {
        return FrameDecode::ChecksumMismatch;
    }
    FrameDecode::Complete {
        payload,
        consumed: end,
    }
}

/// Read one frame from a stream. `Ok(None)` on a clean end of stream.
pub fn read_frame(reader: &mut dyn Read, verify: bool) -> Result<Option<Vec<u8>>, EngineError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(EngineError::Corruption("truncated frame header".into()));
        }
        filled += n;
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_FRAME_LEN {
        return Err(EngineError::Corruption(format!(
            "frame length {} exceeds limit {}",
            len, MAX_FRAME_LEN
        )));
    }
    // Allocate as bytes arrive.
    let mut payload = Vec::with_capacity(len.min(64 << 10));
    Read::take(&mut *reader, len as u64).read_to_end(&mut payload)?;
    if payload.len() != len {
        return Err(EngineError::Corruption("truncated frame payload".into()));
    }
    if verify && crc32fast::hash(&payload) != crc {
        return Err(EngineError::Corruption("frame checksum mismatch".into()));
    }
    Ok(Some(payload))
}

/// Value-log tuning taken from the engine options.
#[derive(Debug, Clone)]
pub struct ValueLogConfig {
    pub max_entries: u32,
    pub max_file_size: u64,
    pub sync_writes: bool,
    pub verify_checksums: bool,
    /// Cut a torn or corrupt tail off the last segment instead of failing.
    pub truncate: bool,
    pub read_only: bool,
    pub logger: SharedLogger,
}

/// Record/byte accounting for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub id: u32,
    pub records: u64,
    pub bytes: u64,
}

/// What replay found on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayStats {
    pub segments: usize,
    pub frames: usize,
    pub records: usize,
    pub max_version: u64,
    pub truncated_bytes: u64,
}

/// Segmented, append-only value log.
pub struct ValueLog {
    dir: PathBuf,
    config: ValueLogConfig,
    sealed: BTreeMap<u32, SegmentInfo>,
    head: SegmentInfo,
    /// Append handle for the head segment (`None` when read-only).
    file: Option<File>,
}

impl ValueLog {
    /// Open the log in `dir`, replaying every frame through `apply`.
    pub fn open(
        dir: &Path,
        config: ValueLogConfig,
        registry: &KeyRegistry,
        mut apply: impl FnMut(u32, LogRecord),
    ) -> Result<(Self, ReplayStats), EngineError> {
        let ids = list_segments(dir)?;
        let mut stats = ReplayStats::default();
        let mut sealed = BTreeMap::new();

        let last = ids.last().copied();
        for &id in &ids {
            let is_last = Some(id) == last;
            let info = replay_segment(dir, id, &config, is_last, registry, &mut apply, &mut stats)?;
            stats.segments += 1;
            sealed.insert(id, info);
        }

        let head = match last {
            Some(id) => sealed.remove(&id).unwrap_or(SegmentInfo {
                id,
                records: 0,
                bytes: 0,
            }),
            None => SegmentInfo {
                id: 1,
                records: 0,
                bytes: 0,
            },
        };

        let file = if config.read_only {
            None
        } else {
            Some(open_append(&segment_path(dir, head.id))?)
        };

        Ok((
            Self {
                dir: dir.to_path_buf(),
                config,
                sealed,
                head,
                file,
            },
            stats,
        ))
    }

    pub fn head_id(&self) -> u32 {
        self.head.id
    }

    /// Sealed segments, oldest first.
    pub fn sealed_segments(&self) -> Vec<SegmentInfo> {
        self.sealed.values().copied().collect()
    }

    /// Oldest segment still on disk.
    pub fn oldest_segment(&self) -> u32 {
        self.sealed.keys().next().copied().unwrap_or(self.head.id)
    }

    pub fn segment_count(&self) -> usize {
        self.sealed.len() + 1
    }

    /// Append `records` as one atomic frame. Returns the segment written to.
    pub fn append(
        &mut self,
        records: &[LogRecord],
        registry: &mut KeyRegistry,
        now: u64,
    ) -> Result<u32, EngineError> {
        if self.head.records > 0
            && (self.head.records >= self.config.max_entries as u64
                || self.head.bytes >= self.config.max_file_size)
        {
            self.rotate()?;
        }

        let body = bincode::serialize(records)?;
        let (key_id, nonce, body) = registry.seal(&body, now)?;
        let payload = bincode::serialize(&FramePayload {
            key_id,
            nonce,
            body,
        })?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(EngineError::InvalidRequest(format!(
                "commit of {} bytes exceeds the {} byte frame limit",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }
        let frame = encode_frame(&payload);

        let file = self.file.as_mut().ok_or(EngineError::ReadOnly)?;
        file.write_all(&frame)?;
        if self.config.sync_writes {
            file.sync_data()?;
        }
        self.head.records += records.len() as u64;
        self.head.bytes += frame.len() as u64;
        Ok(self.head.id)
    }

    /// Append `records` in chunks; returns the segment of each record.
    pub fn append_chunked(
        &mut self,
        records: &[LogRecord],
        registry: &mut KeyRegistry,
        now: u64,
    ) -> Result<Vec<u32>, EngineError> {
        let mut placed = Vec::with_capacity(records.len());
        for chunk in records.chunks(REWRITE_CHUNK) {
            let segment = self.append(chunk, registry, now)?;
            placed.extend(std::iter::repeat(segment).take(chunk.len()));
        }
        Ok(placed)
    }

    /// Seal the head and start a fresh segment.
    fn rotate(&mut self) -> Result<(), EngineError> {
        if let Some(file) = self.file.as_mut() {
            file.sync_all()?;
        }
        let next = SegmentInfo {
            id: self.head.id + 1,
            records: 0,
            bytes: 0,
        };
        let file = open_append(&segment_path(&self.dir, next.id))?;
        let sealed = std::mem::replace(&mut self.head, next);
        self.config.logger.debug(&format!(
            "value log segment {} sealed ({} records, {} bytes)",
            sealed.id, sealed.records, sealed.bytes
        ));
        self.sealed.insert(sealed.id, sealed);
        self.file = Some(file);
        Ok(())
    }

    /// Delete a sealed segment whose live records were rewritten elsewhere.
    pub fn remove_segment(&mut self, id: u32) -> Result<(), EngineError> {
        if self.sealed.remove(&id).is_some() {
            fs::remove_file(segment_path(&self.dir, id))?;
            self.config
                .logger
                .debug(&format!("value log segment {} removed", id));
        }
        Ok(())
    }

    /// Replace the whole log with `records`. Returns the segment of each record.
    pub fn rewrite_all(
        &mut self,
        records: &[LogRecord],
        registry: &mut KeyRegistry,
        now: u64,
    ) -> Result<Vec<u32>, EngineError> {
        let old: Vec<u32> = self
            .sealed
            .keys()
            .copied()
            .chain(std::iter::once(self.head.id))
            .collect();
        self.rotate()?;
        let placed = self.append_chunked(records, registry, now)?;
        for id in old {
            self.remove_segment(id)?;
        }
        Ok(placed)
    }

    /// Delete every segment and start over with an empty head.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        let old: Vec<u32> = self
            .sealed
            .keys()
            .copied()
            .chain(std::iter::once(self.head.id))
            .collect();
        self.rotate()?;
        for id in old {
            self.remove_segment(id)?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), EngineError> {
        if let Some(file) = self.file.as_mut() {
            file.sync_all()?;
        }
        Ok(())
    }
}

fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{:06}.{}", id, SEGMENT_EXT))
}

fn open_append(path: &Path) -> Result<File, EngineError> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Segment ids present in `dir`, ascending.
fn list_segments(dir: &Path) -> Result<Vec<u32>, EngineError> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u32>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn replay_segment(
    dir: &Path,
    id: u32,
    config: &ValueLogConfig,
    is_last: bool,
    registry: &KeyRegistry,
    apply: &mut impl FnMut(u32, LogRecord),
    stats: &mut ReplayStats,
) -> Result<SegmentInfo, EngineError> {
    let path = segment_path(dir, id);
    let buf = fs::read(&path)?;
    let mut info = SegmentInfo {
        id,
        records: 0,
        bytes: 0,
    };
    let mut offset = 0usize;

    while offset < buf.len() {
        let failure = match decode_frame(&buf[offset..], config.verify_checksums) {
            FrameDecode::Complete { payload, consumed } => match decode_records(payload, registry) {
                Ok(records) => {
                    info.records += records.len() as u64;
                    stats.frames += 1;
                    stats.records += records.len();
                    for record in records {
                        stats.max_version = stats.max_version.max(record.version);
                        apply(id, record);
                    }
                    offset += consumed;
                    continue;
                }
                Err(EngineError::Encryption(msg)) => return Err(EngineError::Encryption(msg)),
                Err(err) => format!("undecodable frame: {}", err),
            },
            FrameDecode::Torn => "torn frame".to_string(),
            FrameDecode::ChecksumMismatch => "checksum mismatch".to_string(),
        };

        let detail = format!("{} at offset {} of {}", failure, offset, path.display());
        if !is_last || !config.truncate || config.read_only {
            return Err(EngineError::Corruption(detail));
        }
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(offset as u64)?;
        file.sync_all()?;
        stats.truncated_bytes += (buf.len() - offset) as u64;
        break;
    }

    info.bytes = offset as u64;
    Ok(info)
}

fn decode_records(payload: &[u8], registry: &KeyRegistry) -> Result<Vec<LogRecord>, EngineError> {
    let frame: FramePayload = bincode::deserialize(payload)?;
    let body = registry.unseal(frame.key_id, &frame.nonce, &frame.body)?;
    Ok(bincode::deserialize(&body)?)
}
