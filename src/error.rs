//! Error types for sortmerge
//!
//! Provides a unified error type for all operations. Failures raised inside a
//! pipeline role are wrapped in a phase variant (`Reading`, `Sorting`,
//! `Spilling`, `Merging`) so the caller can tell where the sort broke down;
//! [`SortError::root`] strips those wrappers again.

use thiserror::Error;

/// Result type alias using SortError
pub type Result<T> = std::result::Result<T, SortError>;

/// Boxed error produced by user code (combiners, record sources)
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for sortmerge operations
#[derive(Debug, Error)]
pub enum SortError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error on channel {channel}: {source}")]
    ChannelIo {
        channel: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel {channel} corrupted: {reason}")]
    ChannelCorrupted { channel: u64, reason: String },

    // -------------------------------------------------------------------------
    // Memory Errors
    // -------------------------------------------------------------------------
    #[error("Out of memory: requested {requested} segments, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Record of {size} bytes exceeds the limit of {limit} bytes")]
    RecordTooLarge { size: usize, limit: usize },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // User Function Errors
    // -------------------------------------------------------------------------
    #[error("Combiner failed: {0}")]
    Combiner(#[source] BoxError),

    #[error("Record source failed: {0}")]
    Source(#[source] BoxError),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Sorter has been closed")]
    Closed,

    #[error("Thread panicked: {0}")]
    ThreadPanicked(String),

    // -------------------------------------------------------------------------
    // Phase Context
    // -------------------------------------------------------------------------
    #[error("Reading input failed: {0}")]
    Reading(Box<SortError>),

    #[error("Sorting batch {batch} failed: {source}")]
    Sorting {
        batch: usize,
        #[source]
        source: Box<SortError>,
    },

    #[error("Spilling batch {batch} failed: {source}")]
    Spilling {
        batch: usize,
        #[source]
        source: Box<SortError>,
    },

    #[error("Merging (round {round}) failed: {source}")]
    Merging {
        round: usize,
        #[source]
        source: Box<SortError>,
    },
}

impl SortError {
    /// Wrap a user combiner error
    pub fn combiner(err: impl Into<BoxError>) -> Self {
        SortError::Combiner(err.into())
    }

    /// Wrap a serialization failure raised by a serializer
    pub fn serialization(err: impl std::fmt::Display) -> Self {
        SortError::Serialization(err.to_string())
    }

    pub(crate) fn reading(self) -> Self {
        SortError::Reading(Box::new(self))
    }

    pub(crate) fn sorting(self, batch: usize) -> Self {
        SortError::Sorting {
            batch,
            source: Box::new(self),
        }
    }

    pub(crate) fn spilling(self, batch: usize) -> Self {
        SortError::Spilling {
            batch,
            source: Box::new(self),
        }
    }

    pub(crate) fn merging(self, round: usize) -> Self {
        SortError::Merging {
            round,
            source: Box::new(self),
        }
    }

    /// The innermost error, with all phase wrappers removed
    pub fn root(&self) -> &SortError {
        match self {
            SortError::Reading(inner) => inner.root(),
            SortError::Sorting { source, .. }
            | SortError::Spilling { source, .. }
            | SortError::Merging { source, .. } => source.root(),
            other => other,
        }
    }

    /// True if the root cause is an I/O failure (plain or channel-bound)
    pub fn is_io(&self) -> bool {
        matches!(
            self.root(),
            SortError::Io(_) | SortError::ChannelIo { .. } | SortError::ChannelCorrupted { .. }
        )
    }
}
