//! Disk I/O Module
//!
//! Asynchronous block I/O for spill channels.
//!
//! ## Responsibilities
//! - Create, open and delete temporary channel files
//! - Execute block reads and writes on dedicated I/O threads
//! - Hand segments back to their owner once a block is done
//! - Track channel length and CRC32 so readers can detect damaged files
//!
//! ## Request Flow
//! ```text
//!   BlockChannelWriter ──Write{segment}──► writer thread ──► file
//!          ▲                                   │
//!          └──────────completion{segment}──────┘
//!
//!   BlockChannelReader ──Read{segment}───► reader thread ◄── file
//!          ▲                                   │
//!          └──────completion{segment, len}─────┘
//! ```
//!
//! Each thread serves its queue in FIFO order, so blocks of one channel are
//! written and read strictly sequentially.
//!
//! ## File Format
//! A channel file is the plain concatenation of serialized records. Length
//! and checksum live in the in-memory [`SpillChannel`] descriptor only.

mod channel;
mod manager;
mod reader;
mod writer;

pub use channel::{ChannelId, SpillChannel};
pub use manager::IoManager;
pub use reader::{BlockChannelReader, ChannelInputView};
pub use writer::{BlockChannelWriter, ChannelOutputView};
