//! Configuration for sortmerge
//!
//! Centralized sorter configuration with sensible defaults.

use crate::error::{Result, SortError};

/// How much of the memory pool a sorter may claim
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemoryBudget {
    /// Absolute budget in bytes (rounded down to whole segments)
    Bytes(usize),

    /// Fraction of the pool's total size, in (0, 1]
    Fraction(f64),
}

/// Main configuration for a sorter instance
#[derive(Debug, Clone)]
pub struct SorterConfig {
    // -------------------------------------------------------------------------
    // Memory Configuration
    // -------------------------------------------------------------------------
    /// Memory claimed from the pool for sort buffers and I/O buffers
    pub memory: MemoryBudget,

    /// Number of sort buffers cycling through the pipeline.
    /// Two lets the reader fill one buffer while the other is sorted or spilled.
    pub num_sort_buffers: usize,

    // -------------------------------------------------------------------------
    // Spilling Configuration
    // -------------------------------------------------------------------------
    /// Fraction of sort memory that may be held by sorted, unspilled buffers
    /// before the engine starts writing them to disk
    pub spill_threshold: f32,

    /// Upper bound on spill channels read at the same time by one merge
    pub max_file_handles: usize,

    // -------------------------------------------------------------------------
    // Record Handling
    // -------------------------------------------------------------------------
    /// Reuse record instances when pulling from sources and channels
    pub object_reuse: bool,

    /// Accept records whose serialized form is longer than one memory segment
    pub large_records: bool,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            memory: MemoryBudget::Fraction(0.7),
            num_sort_buffers: 2,
            spill_threshold: 0.7,
            max_file_handles: 128,
            object_reuse: false,
            large_records: false,
        }
    }
}

impl SorterConfig {
    /// Create a new config builder
    pub fn builder() -> SorterConfigBuilder {
        SorterConfigBuilder::default()
    }

    /// Check that all values are within their allowed ranges
    pub fn validate(&self) -> Result<()> {
        match self.memory {
            MemoryBudget::Bytes(0) => {
                return Err(SortError::Config("memory budget must be non-zero".into()))
            }
            MemoryBudget::Fraction(f) if !(f > 0.0 && f <= 1.0) => {
                return Err(SortError::Config(format!(
                    "memory fraction must be in (0, 1], got {}",
                    f
                )))
            }
            _ => {}
        }

        if self.num_sort_buffers == 0 {
            return Err(SortError::Config(
                "at least one sort buffer is required".into(),
            ));
        }

        if !(self.spill_threshold > 0.0 && self.spill_threshold <= 1.0) {
            return Err(SortError::Config(format!(
                "spill threshold must be in (0, 1], got {}",
                self.spill_threshold
            )));
        }

        if self.max_file_handles < 2 {
            return Err(SortError::Config(format!(
                "max file handles must be at least 2, got {}",
                self.max_file_handles
            )));
        }

        Ok(())
    }
}

/// Builder for SorterConfig
#[derive(Default)]
pub struct SorterConfigBuilder {
    config: SorterConfig,
}

impl SorterConfigBuilder {
    /// Claim a fixed number of bytes from the pool
    pub fn memory_bytes(mut self, bytes: usize) -> Self {
        self.config.memory = MemoryBudget::Bytes(bytes);
        self
    }

    /// Claim a fraction of the pool
    pub fn memory_fraction(mut self, fraction: f64) -> Self {
        self.config.memory = MemoryBudget::Fraction(fraction);
        self
    }

    /// Set the number of sort buffers
    pub fn num_sort_buffers(mut self, count: usize) -> Self {
        self.config.num_sort_buffers = count;
        self
    }

    /// Set the spill threshold (fraction of sort memory)
    pub fn spill_threshold(mut self, fraction: f32) -> Self {
        self.config.spill_threshold = fraction;
        self
    }

    /// Set the maximum number of simultaneously open spill channels
    pub fn max_file_handles(mut self, count: usize) -> Self {
        self.config.max_file_handles = count;
        self
    }

    /// Enable or disable record instance reuse
    pub fn object_reuse(mut self, enabled: bool) -> Self {
        self.config.object_reuse = enabled;
        self
    }

    /// Enable or disable support for records larger than a segment
    pub fn large_records(mut self, enabled: bool) -> Self {
        self.config.large_records = enabled;
        self
    }

    pub fn build(self) -> SorterConfig {
        self.config
    }
}
