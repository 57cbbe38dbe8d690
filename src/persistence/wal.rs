//! Write-Ahead Log Store
//!
//! A binary, append-only log of store mutations with:
//! - 20-byte naturally aligned frame header
//! - CRC32 checksum per payload
//! - bincode serialization for payloads
//! - full replay into memory on open
//!
//! # Frame Header Layout (20 bytes)
//!
//! ```text
//! ┌────────────┬───────────┬────────────────────────────────────┐
//! │ seq_id     │ 8 bytes   │ Monotonic frame sequence           │
//! │ checksum   │ 4 bytes   │ CRC32 of payload                   │
//! │ payload_len│ 4 bytes   │ Payload size                       │
//! │ op         │ 1 byte    │ Set / Append / Truncate            │
//! │ version    │ 1 byte    │ Payload format version             │
//! │ reserved   │ 2 bytes   │ Zero                               │
//! └────────────┴───────────┴────────────────────────────────────┘
//! ```
//!
//! A frame cut short at the end of the file (crash mid-write) is dropped on
//! open. A checksum mismatch anywhere is corruption and refuses to open.
//!
//! # Compaction
//!
//! Overwritten cells and truncated records leave dead frames behind. Once the
//! file holds `compact_after` frames past its last rewrite, the live state is
//! written to a fresh log (one `Set` per cell, one `Append` per record),
//! fsync'd, and renamed over the old one. A failed rewrite leaves the old log
//! in place.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::memory::Tables;
use super::{Persistence, StoreError};

// ============================================================
// CONSTANTS
// ============================================================

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 20;

/// Current payload format version
pub const FRAME_VERSION: u8 = 1;

/// Log file name inside the data directory
pub const WAL_FILE_NAME: &str = "ledger.wal";

/// Scratch file a compaction is written to before the rename
pub const WAL_COMPACT_FILE_NAME: &str = "ledger.wal.compact";

/// Frames written past the last rewrite before the log is compacted
pub const DEFAULT_COMPACT_AFTER: u64 = 4096;

// ============================================================
// FRAME HEADER
// ============================================================

/// Frame header (20 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub seq_id: u64,
    pub checksum: u32,
    pub payload_len: u32,
    pub op: u8,
    pub version: u8,
}

impl FrameHeader {
    /// Create a header with CRC32 checksum calculated from payload
    pub fn new(op: OpCode, seq_id: u64, payload: &[u8]) -> io::Result<Self> {
        let payload_len = u32::try_from(payload.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "WAL payload exceeds 4GiB")
        })?;
        Ok(Self {
            seq_id,
            checksum: crc32_checksum(payload),
            payload_len,
            op: op as u8,
            version: FRAME_VERSION,
        })
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.seq_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[16] = self.op;
        buf[17] = self.version;
        buf
    }

    /// Deserialize header from bytes
    pub fn from_bytes(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            seq_id: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            checksum: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            payload_len: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            op: buf[16],
            version: buf[17],
        }
    }

    /// Verify CRC32 checksum against payload
    pub fn verify_checksum(&self, payload: &[u8]) -> bool {
        self.checksum == crc32_checksum(payload)
    }
}

/// Calculate CRC32 checksum of data
#[inline]
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

// ============================================================
// OPERATIONS
// ============================================================

/// Operation codes stored in the frame header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Set = 1,
    Append = 2,
    Truncate = 3,
}

/// Logged mutation (frame payload)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
enum WalOp {
    Set { key: String, value: Vec<u8> },
    Append { key: String, value: Vec<u8> },
    Truncate { key: String, len: u64 },
}

impl WalOp {
    fn code(&self) -> OpCode {
        match self {
            WalOp::Set { .. } => OpCode::Set,
            WalOp::Append { .. } => OpCode::Append,
            WalOp::Truncate { .. } => OpCode::Truncate,
        }
    }

    fn apply(self, tables: &mut Tables) {
        match self {
            WalOp::Set { key, value } => tables.set(&key, value),
            WalOp::Append { key, value } => {
                tables.append(&key, value);
            }
            WalOp::Truncate { key, len } => {
                tables.truncate(&key, usize::try_from(len).unwrap_or(usize::MAX))
            }
        }
    }
}

// ============================================================
// WAL STORE
// ============================================================

struct WalInner {
    file: File,
    /// Byte length of the valid log prefix
    len: u64,
    next_seq: u64,
    /// Frame count that triggers the next compaction
    compact_at: u64,
    tables: Tables,
}

/// File-backed store: every mutation is framed, fsync'd, then applied in memory
pub struct WalStore {
    path: PathBuf,
    compact_after: u64,
    inner: Mutex<WalInner>,
}

impl WalStore {
    /// Open (or create) the log inside `data_dir` and replay it
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(data_dir, DEFAULT_COMPACT_AFTER)
    }

    /// Like [`WalStore::open`], compacting every `compact_after` frames
    pub fn open_with(data_dir: impl AsRef<Path>, compact_after: u64) -> Result<Self, StoreError> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILE_NAME);

        // Leftover of a rewrite that never reached its rename
        let scratch = dir.join(WAL_COMPACT_FILE_NAME);
        if scratch.exists() {
            warn!(path = %scratch.display(), "Removing unfinished WAL compaction");
            fs::remove_file(&scratch)?;
        }

        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let replay = replay(&bytes)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        if replay.valid_len < bytes.len() as u64 {
            warn!(
                path = %path.display(),
                valid_len = replay.valid_len,
                file_len = bytes.len(),
                "Dropping torn WAL tail"
            );
            file.set_len(replay.valid_len)?;
        }

        info!(
            path = %path.display(),
            frames = replay.frames,
            "WAL store opened"
        );

        let compact_after = compact_after.max(1);
        Ok(Self {
            path,
            compact_after,
            inner: Mutex::new(WalInner {
                file,
                len: replay.valid_len,
                next_seq: replay.frames + 1,
                compact_at: replay.frames + compact_after,
                tables: replay.tables,
            }),
        })
    }

    /// Path of the underlying log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the log file in bytes
    pub fn log_len(&self) -> u64 {
        self.inner.lock().len
    }

    /// Rewrite the log to hold only live state
    pub fn compact(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        self.rewrite(&mut inner)
    }

    fn write(&self, op: WalOp) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();

        let code = op.code();
        let seq_id = inner.next_seq;
        let frame = encode_frame(&op, seq_id)?;

        let written = {
            let file = &mut inner.file;
            file.write_all(&frame).and_then(|()| file.sync_data())
        };
        if let Err(e) = written {
            // Cut the partial frame so the next write starts on a boundary
            let valid_len = inner.len;
            if let Err(trunc) = inner.file.set_len(valid_len) {
                warn!(error = %trunc, "Failed to trim partial WAL frame");
            }
            return Err(e.into());
        }

        inner.len += frame.len() as u64;
        inner.next_seq += 1;
        debug!(seq_id, op = ?code, "WAL frame written");

        let key_len = match &op {
            WalOp::Append { key, .. } => Some(key.clone()),
            _ => None,
        };
        op.apply(&mut inner.tables);
        let list_len = key_len.map_or(0, |key| inner.tables.list_len(&key));

        // The frame is durable; a failed rewrite only delays compaction
        if inner.next_seq > inner.compact_at
            && let Err(e) = self.rewrite(&mut inner)
        {
            warn!(path = %self.path.display(), error = %e, "WAL compaction failed");
            inner.compact_at = inner.next_seq + self.compact_after;
        }
        Ok(list_len)
    }

    /// Write live state to the scratch file, fsync it, rename it over the log
    fn rewrite(&self, inner: &mut WalInner) -> Result<(), StoreError> {
        let mut ops = Vec::new();
        for (key, value) in inner.tables.cells() {
            ops.push(WalOp::Set {
                key: key.clone(),
                value: value.clone(),
            });
        }
        for (key, records) in inner.tables.lists() {
            for value in records {
                ops.push(WalOp::Append {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }

        let mut bytes = Vec::new();
        for (seq_id, op) in (1u64..).zip(&ops) {
            bytes.extend_from_slice(&encode_frame(op, seq_id)?);
        }

        let scratch = self.path.with_file_name(WAL_COMPACT_FILE_NAME);
        fs::remove_file(&scratch).ok();
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .append(true)
            .open(&scratch)?;
        let renamed = file
            .write_all(&bytes)
            .and_then(|()| file.sync_all())
            .and_then(|()| fs::rename(&scratch, &self.path));
        if let Err(e) = renamed {
            fs::remove_file(&scratch).ok();
            return Err(e.into());
        }
        if let Some(dir) = self.path.parent()
            && let Err(e) = File::open(dir).and_then(|d| d.sync_all())
        {
            warn!(error = %e, "Failed to sync WAL directory after rename");
        }

        let frames = ops.len() as u64;
        let before = inner.len;
        inner.file = file;
        inner.len = bytes.len() as u64;
        inner.next_seq = frames + 1;
        inner.compact_at = frames + self.compact_after.max(frames);
        info!(
            path = %self.path.display(),
            frames,
            bytes_before = before,
            bytes_after = inner.len,
            "WAL compacted"
        );
        Ok(())
    }
}

/// Header + bincode payload for one mutation
fn encode_frame(op: &WalOp, seq_id: u64) -> Result<Vec<u8>, StoreError> {
    let payload = bincode::serialize(op)?;
    let header = FrameHeader::new(op.code(), seq_id, &payload)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

impl Persistence for WalStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.lock().tables.get(key))
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.write(WalOp::Set {
            key: key.to_string(),
            value,
        })?;
        Ok(())
    }

    fn append(&self, key: &str, value: Vec<u8>) -> Result<usize, StoreError> {
        self.write(WalOp::Append {
            key: key.to_string(),
            value,
        })
    }

    fn list(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok(self.inner.lock().tables.list(key))
    }

    fn truncate(&self, key: &str, len: usize) -> Result<(), StoreError> {
        self.write(WalOp::Truncate {
            key: key.to_string(),
            len: len as u64,
        })?;
        Ok(())
    }
}

// ============================================================
// REPLAY
// ============================================================

struct Replay {
    tables: Tables,
    frames: u64,
    valid_len: u64,
}

fn replay(bytes: &[u8]) -> Result<Replay, StoreError> {
    let mut tables = Tables::default();
    let mut offset = 0usize;
    let mut frames = 0u64;

    while offset < bytes.len() {
        let Some(header_bytes) = bytes.get(offset..offset + FRAME_HEADER_SIZE) else {
            break; // torn header
        };
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf.copy_from_slice(header_bytes);
        let header = FrameHeader::from_bytes(&buf);

        let start = offset + FRAME_HEADER_SIZE;
        let end = start + header.payload_len as usize;
        let Some(payload) = bytes.get(start..end) else {
            break; // torn payload
        };

        if !header.verify_checksum(payload) {
            return Err(StoreError::Corrupted {
                frame: header.seq_id,
                reason: format!(
                    "CRC32 checksum mismatch, expected={}, got={}",
                    header.checksum,
                    crc32_checksum(payload)
                ),
            });
        }

        let op: WalOp = bincode::deserialize(payload)?;
        if op.code() as u8 != header.op {
            return Err(StoreError::Corrupted {
                frame: header.seq_id,
                reason: format!("op code {} does not match payload", header.op),
            });
        }
        op.apply(&mut tables);

        frames += 1;
        offset = end;
    }

    Ok(Replay {
        tables,
        frames,
        valid_len: offset as u64,
    })
}

// ============================================================
// TESTS
// ============================================================
