//! Virtual scan cursors spanning every primary of a cluster.
//!
//! Each primary has its own `SCAN` cursor space that starts and ends at `0`.
//! A virtual cursor packs the position of a primary in the name-sorted
//! topology into the bits above 48 and that primary's own cursor into the low
//! 48 bits:
//!
//! ```text
//!  63            48 47                                            0
//! +----------------+-----------------------------------------------+
//! |  shard index   |                 native cursor                 |
//! +----------------+-----------------------------------------------+
//! ```
//!
//! `0` is both "start of the cluster scan" and "iteration complete". Callers
//! treat the value as opaque and feed back only cursors produced here.

use crate::error::{PipeError, Result};

/// Bit position of the shard index.
pub const SHARD_SHIFT: u32 = 48;

/// Mask selecting the native cursor.
pub const NATIVE_MASK: u64 = (1 << SHARD_SHIFT) - 1;

/// Decoded scan state: which primary, and where within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanPosition {
    pub shard_index: usize,
    pub native_cursor: u64,
}

impl ScanPosition {
    pub fn from_cursor(cursor: u64) -> Self {
        Self {
            shard_index: (cursor >> SHARD_SHIFT) as usize,
            native_cursor: cursor & NATIVE_MASK,
        }
    }

    pub fn to_cursor(self) -> Result<u64> {
        if self.native_cursor > NATIVE_MASK {
            return Err(PipeError::CursorOverflow {
                cursor: self.native_cursor,
            });
        }
        let shard_index = u16::try_from(self.shard_index).map_err(|_| {
            PipeError::ShardIndexOverflow {
                shard_index: self.shard_index,
            }
        })?;
        Ok((u64::from(shard_index) << SHARD_SHIFT) | self.native_cursor)
    }

    /// Virtual cursor to hand back after the primary at `self.shard_index`
    /// answered with `returned`, given a topology of `shards` primaries.
    ///
    /// An exhausted primary (`returned == 0`) moves the scan to the start of
    /// the next one; running off the end of the topology completes it.
    pub fn advance(self, returned: u64, shards: usize) -> Result<u64> {
        let mut shard_index = self.shard_index;
        if returned == 0 {
            shard_index += 1;
        }

        if shard_index < shards {
            return Self {
                shard_index,
                native_cursor: returned,
            }
            .to_cursor();
        }
        if returned == 0 {
            return Ok(0);
        }
        // The primary still has keys but the topology shrank underneath it.
        Err(PipeError::ShardIndexOutOfRange {
            shard_index,
            shards,
        })
    }
}
