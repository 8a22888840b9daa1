// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-only view of a Varnish log segment.
//!
//! A segment is a versioned header followed by a ring of fixed-size slots,
//! written by an external process. The writer bumps `head` (a monotonic
//! sequence number) after each slot is fully written, so a reader only ever
//! looks at sequences below `head`. A sequence maps to slot
//! `seq % slot_count`; its generation is `seq / slot_count`.
//!
//! ```text
//! +-------------------+--------+--------+-----+--------+
//! | header (40 bytes) | slot 0 | slot 1 | ... | slot N |
//! +-------------------+--------+--------+-----+--------+
//! ```
//!
//! The reader detects two hazards:
//! - **overrun**: the writer lapped an unread slot. Slot `head % slot_count`
//!   may be mid-rewrite, so only the last `slot_count - 1` sequences count as
//!   retained.
//! - **reset**: the writer re-initialised the segment (`epoch` changed)

pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::errors::{AttachError, SegmentError};

/// Magic bytes at offset 0 of every segment.
pub const SEGMENT_MAGIC: [u8; 8] = *b"VSLHEAD\0";
/// Current segment format version.
pub const SEGMENT_VERSION: u32 = 1;
/// Exact byte size of [`SegmentHeader`] on disk.
pub const HEADER_BYTES: usize = 40;
/// Smallest slot able to hold a slot header plus a few payload bytes.
pub const MIN_SLOT_SIZE: u32 = 16;
/// One slot is always the writer's next target, so a ring needs two.
pub const MIN_SLOT_COUNT: u32 = 2;
/// File looked up when the configured path is a directory.
pub const DEFAULT_SEGMENT_FILE: &str = "_.vsl";

const HEAD_OFFSET: usize = 24;

/// Header stored at the start of each segment.
///
/// Layout (little-endian):
/// - `magic[8]`
/// - `version: u32`
/// - `slot_size: u32`
/// - `slot_count: u32`
/// - `reserved: u32`
/// - `head: u64`
/// - `epoch: u64`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub slot_size: u32,
    pub slot_count: u32,
    /// Total slots ever written.
    pub head: u64,
    /// Writer incarnation.
    pub epoch: u64,
}

impl SegmentHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut out = [0_u8; HEADER_BYTES];
        out[0..8].copy_from_slice(&SEGMENT_MAGIC);
        out[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        out[12..16].copy_from_slice(&self.slot_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.slot_count.to_le_bytes());
        out[24..32].copy_from_slice(&self.head.to_le_bytes());
        out[32..40].copy_from_slice(&self.epoch.to_le_bytes());
        out
    }

    /// Decode and validate a header.
    pub fn decode(bytes: &[u8]) -> Result<Self, AttachError> {
        if bytes.len() < HEADER_BYTES {
            return Err(AttachError::InvalidGeometry(format!(
                "header too short: expected {HEADER_BYTES}, got {}",
                bytes.len()
            )));
        }

        let mut magic = [0_u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        if magic != SEGMENT_MAGIC {
            return Err(AttachError::BadMagic(magic));
        }

        let version = read_u32_at(bytes, 8);
        if version != SEGMENT_VERSION {
            return Err(AttachError::UnsupportedVersion {
                found: version,
                expected: SEGMENT_VERSION,
            });
        }

        let header = Self {
            slot_size: read_u32_at(bytes, 12),
            slot_count: read_u32_at(bytes, 16),
            head: read_u64_at(bytes, HEAD_OFFSET),
            epoch: read_u64_at(bytes, 32),
        };
        header.validate_geometry()?;
        Ok(header)
    }

    fn validate_geometry(&self) -> Result<(), AttachError> {
        if self.slot_size < MIN_SLOT_SIZE {
            return Err(AttachError::InvalidGeometry(format!(
                "slot size {} is below the minimum of {MIN_SLOT_SIZE}",
                self.slot_size
            )));
        }
        if self.slot_count < MIN_SLOT_COUNT {
            return Err(AttachError::InvalidGeometry(format!(
                "slot count {} is below the minimum of {MIN_SLOT_COUNT}",
                self.slot_count
            )));
        }
        Ok(())
    }

    /// Total byte length of a segment with this geometry.
    #[must_use]
    pub fn segment_len(&self) -> u64 {
        HEADER_BYTES as u64 + u64::from(self.slot_size) * u64::from(self.slot_count)
    }
}

fn read_u32_at(bytes: &[u8], start: usize) -> u32 {
    let mut array = [0_u8; 4];
    array.copy_from_slice(&bytes[start..start + 4]);
    u32::from_le_bytes(array)
}

fn read_u64_at(bytes: &[u8], start: usize) -> u64 {
    let mut array = [0_u8; 8];
    array.copy_from_slice(&bytes[start..start + 8]);
    u64::from_le_bytes(array)
}

/// Position of the reader in the ring.
///
/// `offset` is the slot index, `generation` counts how many times the
/// writer had wrapped when that slot was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    generation: u64,
    offset: u32,
    slot_count: u32,
}

impl Cursor {
    /// Cursor positioned at absolute sequence `seq`.
    #[must_use]
    pub fn at(seq: u64, slot_count: u32) -> Self {
        let count = u64::from(slot_count.max(1));
        #[allow(clippy::cast_possible_truncation)]
        let offset = (seq % count) as u32;
        Self {
            generation: seq / count,
            offset,
            slot_count: slot_count.max(1),
        }
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.generation * u64::from(self.slot_count) + u64::from(self.offset)
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Move to the next slot, wrapping into the next generation.
    pub fn advance(&mut self) {
        self.offset += 1;
        if self.offset == self.slot_count {
            self.offset = 0;
            self.generation += 1;
        }
    }
}

/// In-process segment storage shared between a writer and readers.
#[derive(Debug, Clone, Default)]
pub struct SharedMemory(Arc<RwLock<Vec<u8>>>);

impl SharedMemory {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        let bytes = self
            .0
            .read()
            .map_err(|_| std::io::Error::other("segment memory lock poisoned"))?;
        let start = usize::try_from(offset).map_err(std::io::Error::other)?;
        let end = start + buf.len();
        let src = bytes.get(start..end).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read {start}..{end} beyond segment of {} bytes", bytes.len()),
            )
        })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    pub(crate) fn write_at(&self, offset: usize, data: &[u8]) -> std::io::Result<()> {
        let mut bytes = self
            .0
            .write()
            .map_err(|_| std::io::Error::other("segment memory lock poisoned"))?;
        let end = offset + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn replace(&self, data: Vec<u8>) -> std::io::Result<()> {
        let mut bytes = self
            .0
            .write()
            .map_err(|_| std::io::Error::other("segment memory lock poisoned"))?;
        *bytes = data;
        Ok(())
    }
}

// Backing abstracts where segment bytes live.
#[derive(Debug)]
enum Backing {
    /// File written by an external process (shared via the page cache)
    File(std::fs::File),
    /// In-process buffer, used for replay and tests
    Memory(SharedMemory),
}

impl Backing {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        match self {
            #[cfg(unix)]
            Backing::File(file) => {
                use std::os::unix::fs::FileExt;
                file.read_exact_at(buf, offset)
            }
            #[cfg(windows)]
            Backing::File(file) => {
                use std::os::windows::fs::FileExt;
                let mut filled = 0;
                while filled < buf.len() {
                    let n = file.seek_read(&mut buf[filled..], offset + filled as u64)?;
                    if n == 0 {
                        return Err(std::io::ErrorKind::UnexpectedEof.into());
                    }
                    filled += n;
                }
                Ok(())
            }
            Backing::Memory(memory) => memory.read_exact_at(buf, offset),
        }
    }
}

/// Attached, read-only view of a segment.
#[derive(Debug)]
pub struct LogSegment {
    backing: Backing,
    source: String,
    slot_size: u32,
    slot_count: u32,
    epoch: u64,
}

impl LogSegment {
    /// Attach to the segment at `pattern`.
    ///
    /// `pattern` may be a file, a directory containing [`DEFAULT_SEGMENT_FILE`],
    /// or a glob; a glob resolves to its first match in sorted order.
    pub fn attach(pattern: &str) -> Result<Self, AttachError> {
        let path = resolve_path(pattern)?;
        let source = path.display().to_string();
        let file = std::fs::File::open(&path).map_err(|source_err| {
            if source_err.kind() == std::io::ErrorKind::NotFound {
                AttachError::NotFound(source.clone())
            } else {
                AttachError::Io {
                    path: source.clone(),
                    source: source_err,
                }
            }
        })?;
        Self::from_backing(Backing::File(file), source)
    }

    /// Attach to an in-process segment.
    pub fn attach_memory(memory: SharedMemory) -> Result<Self, AttachError> {
        Self::from_backing(Backing::Memory(memory), "memory".to_string())
    }

    fn from_backing(backing: Backing, source: String) -> Result<Self, AttachError> {
        let mut buf = [0_u8; HEADER_BYTES];
        backing
            .read_exact_at(&mut buf, 0)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => AttachError::InvalidGeometry(format!(
                    "segment {source} is shorter than its {HEADER_BYTES}-byte header"
                )),
                _ => AttachError::Io {
                    path: source.clone(),
                    source: e,
                },
            })?;
        let header = SegmentHeader::decode(&buf)?;

        debug!(
            "Attached to segment {source}: {} slots of {} bytes, epoch {}, head {}",
            header.slot_count, header.slot_size, header.epoch, header.head
        );

        Ok(Self {
            backing,
            source,
            slot_size: header.slot_size,
            slot_count: header.slot_count,
            epoch: header.epoch,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Re-read the header as currently written.
    pub fn header(&self) -> Result<SegmentHeader, SegmentError> {
        let mut buf = [0_u8; HEADER_BYTES];
        self.backing.read_exact_at(&mut buf, 0)?;
        SegmentHeader::decode(&buf).map_err(|e| SegmentError::Corrupt(e.to_string()))
    }

    /// Cursor at the next slot the writer will fill.
    pub fn tail(&self) -> Result<Cursor, SegmentError> {
        let header = self.header()?;
        Ok(Cursor::at(header.head, self.slot_count))
    }

    /// Cursor at the oldest slot still retained in the ring.
    pub fn oldest(&self) -> Result<Cursor, SegmentError> {
        let header = self.header()?;
        Ok(Cursor::at(self.retained_from(header.head), self.slot_count))
    }

    // The slot at `head` is the writer's next target and may already hold
    // part of the next record.
    fn retained_from(&self, head: u64) -> u64 {
        head.saturating_sub(u64::from(self.slot_count.saturating_sub(1)))
    }

    /// Read the slot under `cursor`.
    ///
    /// Returns `Ok(None)` when the writer has not produced that slot yet, or
    /// when the segment is shorter than its header says (a writer in the
    /// middle of re-initialising it). The header is checked again after the
    /// copy so a slot overwritten while it was being read is reported as an
    /// overrun instead of returned.
    pub fn read_slot(&mut self, cursor: &Cursor) -> Result<Option<Vec<u8>>, SegmentError> {
        let Some(header) = self.poll_header()? else {
            return Ok(None);
        };
        self.check_epoch(&header)?;

        let seq = cursor.seq();
        if seq >= header.head {
            return Ok(None);
        }
        self.check_overrun(seq, header.head)?;

        let mut slot = vec![0_u8; self.slot_size as usize];
        let offset =
            HEADER_BYTES as u64 + u64::from(cursor.offset()) * u64::from(self.slot_size);
        match self.backing.read_exact_at(&mut slot, offset) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Segment {} is short, waiting for the writer", self.source);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let Some(after) = self.poll_header()? else {
            return Ok(None);
        };
        self.check_epoch(&after)?;
        self.check_overrun(seq, after.head)?;

        Ok(Some(slot))
    }

    // Header read that treats a short segment as "not ready".
    fn poll_header(&self) -> Result<Option<SegmentHeader>, SegmentError> {
        match self.header() {
            Ok(header) => Ok(Some(header)),
            Err(SegmentError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Segment {} header is short, waiting for the writer", self.source);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // Adopts the new geometry so the caller can restart from a fresh tail.
    fn check_epoch(&mut self, header: &SegmentHeader) -> Result<(), SegmentError> {
        if header.epoch == self.epoch {
            return Ok(());
        }
        let old = self.epoch;
        self.epoch = header.epoch;
        self.slot_size = header.slot_size;
        self.slot_count = header.slot_count;
        Err(SegmentError::Reset {
            old,
            new: header.epoch,
        })
    }

    fn check_overrun(&self, seq: u64, head: u64) -> Result<(), SegmentError> {
        let retained_from = self.retained_from(head);
        if seq < retained_from {
            return Err(SegmentError::Overwritten {
                lost: retained_from - seq,
            });
        }
        Ok(())
    }
}

fn resolve_path(pattern: &str) -> Result<PathBuf, AttachError> {
    if !pattern.contains(|c| matches!(c, '*' | '?' | '[')) {
        let path = Path::new(pattern);
        if path.is_dir() {
            return Ok(path.join(DEFAULT_SEGMENT_FILE));
        }
        return Ok(path.to_path_buf());
    }

    let entries = glob::glob(pattern).map_err(|e| AttachError::Pattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;
    let mut matches: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    matches.sort();
    matches
        .into_iter()
        .next()
        .ok_or_else(|| AttachError::NotFound(pattern.to_string()))
}
