// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Segment writer.
//!
//! varnishd owns the real segment; this writer produces the same layout for
//! replaying captured logs and for tests. Each append writes the slot first
//! and publishes it by bumping `head` afterwards.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::decoder::{encode_slot, Marker, RawRecord, Tag};
use crate::segment::{SegmentHeader, SharedMemory, HEADER_BYTES, MIN_SLOT_COUNT, MIN_SLOT_SIZE};

enum Target {
    File(std::fs::File),
    Memory(SharedMemory),
}

impl Target {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        match self {
            Target::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)?;
                file.flush()
            }
            Target::Memory(memory) => {
                let offset = usize::try_from(offset).map_err(std::io::Error::other)?;
                memory.write_at(offset, data)
            }
        }
    }

    // Rewrites in place: slots are cleared before the new header lands, and
    // the file is never shorter than a header while readers are attached.
    fn initialise(&mut self, header: &SegmentHeader) -> std::io::Result<()> {
        let len = usize::try_from(header.segment_len()).map_err(std::io::Error::other)?;
        match self {
            Target::File(file) => {
                file.seek(SeekFrom::Start(HEADER_BYTES as u64))?;
                file.write_all(&vec![0_u8; len - HEADER_BYTES])?;
                file.seek(SeekFrom::Start(0))?;
                file.write_all(&header.encode())?;
                file.set_len(header.segment_len())?;
                file.flush()
            }
            Target::Memory(memory) => {
                let mut bytes = vec![0_u8; len];
                bytes[..HEADER_BYTES].copy_from_slice(&header.encode());
                memory.replace(bytes)
            }
        }
    }
}

/// Appends records to a segment ring.
pub struct SegmentWriter {
    target: Target,
    header: SegmentHeader,
}

impl SegmentWriter {
    /// Create (or truncate) a file-backed segment.
    pub fn create(
        path: impl AsRef<Path>,
        slot_size: u32,
        slot_count: u32,
    ) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        Self::new(Target::File(file), slot_size, slot_count)
    }

    /// Create an in-process segment and the memory readers attach to.
    pub fn in_memory(slot_size: u32, slot_count: u32) -> std::io::Result<(Self, SharedMemory)> {
        let memory = SharedMemory::default();
        let writer = Self::new(Target::Memory(memory.clone()), slot_size, slot_count)?;
        Ok((writer, memory))
    }

    fn new(mut target: Target, slot_size: u32, slot_count: u32) -> std::io::Result<Self> {
        if slot_size < MIN_SLOT_SIZE || slot_count < MIN_SLOT_COUNT {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid segment geometry: {slot_count} slots of {slot_size} bytes"),
            ));
        }
        let header = SegmentHeader {
            slot_size,
            slot_count,
            head: 0,
            epoch: 1,
        };
        target.initialise(&header)?;
        Ok(Self { target, header })
    }

    /// Sequence number the next append will get.
    #[must_use]
    pub fn head(&self) -> u64 {
        self.header.head
    }

    /// Append one record and return its sequence number.
    pub fn append(
        &mut self,
        marker: Marker,
        tag: Tag,
        vxid: u32,
        payload: &[u8],
    ) -> std::io::Result<u64> {
        let record = RawRecord::new(marker, tag, vxid, payload);
        let slot = encode_slot(&record, self.header.slot_size as usize);
        self.append_raw(&slot)
    }

    /// Append pre-encoded slot bytes, padded or cut to the slot size.
    pub fn append_raw(&mut self, bytes: &[u8]) -> std::io::Result<u64> {
        let slot_size = self.header.slot_size as usize;
        let mut slot = vec![0_u8; slot_size];
        let len = bytes.len().min(slot_size);
        slot[..len].copy_from_slice(&bytes[..len]);

        let seq = self.header.head;
        let index = seq % u64::from(self.header.slot_count);
        let offset = HEADER_BYTES as u64 + index * u64::from(self.header.slot_size);
        self.target.write_at(offset, &slot)?;

        self.header.head += 1;
        self.target.write_at(0, &self.header.encode())?;
        Ok(seq)
    }

    /// Re-initialise the ring under a new epoch, as a restarted varnishd would.
    pub fn reset(&mut self) -> std::io::Result<()> {
        self.header.head = 0;
        self.header.epoch += 1;
        let header = self.header;
        self.target.initialise(&header)
    }
}
