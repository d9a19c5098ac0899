//! On-disk framing for `SpoolSegment`s (§3, §9): a directory of append-only
//! files, each record prefixed with a 4-byte little-endian length, ending in
//! a rotation trailer. `edge-queue` owns the actual file I/O; this module only
//! defines the shared wire shapes so the format is not duplicated between
//! writer and reader.

use serde::{Deserialize, Serialize};

/// Current on-disk schema version, written once per segment header.
pub const SPOOL_SCHEMA_VERSION: u16 = 1;

/// The maximum size a segment may reach before rotation (64 MiB, per §4.3).
pub const SEGMENT_ROTATE_BYTES: u64 = 64 * 1024 * 1024;

/// Header written at the start of every segment file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentHeader {
    /// The schema version the records in this segment were encoded with.
    pub schema_version: u16,
}

impl Default for SegmentHeader {
    fn default() -> Self {
        Self {
            schema_version: SPOOL_SCHEMA_VERSION,
        }
    }
}
