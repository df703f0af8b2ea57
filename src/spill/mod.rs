//! Spill Module
//!
//! Moves sorted records between memory and spill channels.
//!
//! - [`SpillWriter`]: sorted buffer (or any sorted stream) → new channel,
//!   optionally compacted through the combiner on the way
//! - [`ChannelRecordReader`]: channel → records, with read-ahead

mod reader;
mod writer;

pub use reader::ChannelRecordReader;
pub use writer::SpillWriter;
