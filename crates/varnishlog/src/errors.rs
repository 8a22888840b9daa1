// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the log pipeline.
//!
//! Decode errors and degraded assembly are recoverable and never stop the
//! pipeline. Attach errors are fatal. Segment errors are either recoverable
//! (overwrite, writer reset) or fatal (I/O, corruption).

/// Failure to decode one slot. The slot is skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("slot too short: {0} bytes, need at least {min}", min = crate::decoder::SLOT_HEADER_BYTES)]
    ShortSlot(usize),

    #[error("declared payload length {declared} exceeds {available} available bytes")]
    Truncated { declared: usize, available: usize },

    #[error("unknown record tag {0}")]
    UnknownTag(u8),

    #[error("unknown client/backend marker {0:#04x}")]
    UnknownMarker(u8),
}

/// Failure to attach to a log segment. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("no log segment found at {0}")]
    NotFound(String),

    #[error("invalid segment path pattern {pattern}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("failed to open log segment {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bad segment magic: {0:02X?}")]
    BadMagic([u8; 8]),

    #[error("unsupported segment version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("invalid segment geometry: {0}")]
    InvalidGeometry(String),
}

/// Failure while reading an attached segment.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    /// The writer lapped the cursor; `lost` slots were never read.
    #[error("log overrun: {lost} unread records were overwritten")]
    Overwritten { lost: u64 },

    /// The writer re-initialised the segment (new epoch).
    #[error("segment was reset by the writer (epoch {old} -> {new})")]
    Reset { old: u64, new: u64 },

    #[error("segment corrupt: {0}")]
    Corrupt(String),

    #[error("segment I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SegmentError {
    /// Whether the pipeline can continue after discarding in-flight state.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Overwritten { .. } | Self::Reset { .. })
    }
}

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors that end a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to attach to log segment: {0}")]
    Attach(#[from] AttachError),

    #[error("Fatal segment error: {0}")]
    Segment(SegmentError),
}

/// An event the sink refused or kept asking to retry. Logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dropped event for vxid {vxid} after {attempts} attempt(s): {reason}")]
pub struct PublishFailure {
    pub vxid: u32,
    pub attempts: u32,
    pub reason: DropReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The sink answered `Drop`.
    Rejected,
    /// The sink kept answering `Retry` past the retry bound.
    RetriesExhausted,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected => write!(f, "rejected by sink"),
            Self::RetriesExhausted => write!(f, "retries exhausted"),
        }
    }
}
