//! Channel identifiers and descriptors

use std::path::{Path, PathBuf};

/// Identifies one channel file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    id: u64,
    path: PathBuf,
}

impl ChannelId {
    pub(crate) fn new(id: u64, path: PathBuf) -> Self {
        Self { id, path }
    }

    /// Numeric id, unique within one IoManager
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Location of the channel file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A fully written channel: sorted records on disk
///
/// Holds everything a reader needs to verify the file: the exact byte
/// count, number of blocks and the CRC32 of the bytes written.
#[derive(Debug, Clone)]
pub struct SpillChannel {
    pub id: ChannelId,
    /// Number of blocks written
    pub blocks: u64,
    /// Number of bytes written
    pub bytes: u64,
    /// CRC32 over all bytes written
    pub checksum: u32,
}

impl SpillChannel {
    /// Numeric channel id
    pub fn channel_id(&self) -> u64 {
        self.id.id()
    }

    /// True if nothing was written to the channel
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}
