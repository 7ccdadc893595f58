//! Babe VM Configuration Module
//!
//! This module provides the process-level configuration types for the Babe VM.
//! Options are set once at startup (normally from the command line) and read-only
//! afterwards; every numeric option is validated against the documented bounds
//! before a VM is built from it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest heap a VM will accept, in bytes (128 KiB)
pub const HEAP_MIN_SIZE: usize = 128 * 1024;
/// Largest heap a VM will accept, in bytes (16 MiB; the chunk header carries a 24-bit size)
pub const HEAP_MAX_SIZE: usize = 16 * 1024 * 1024;
/// Heap sizes must be a multiple of this
pub const HEAP_ALIGNMENT: usize = 16;

/// Default heap size in bytes (1 MiB)
pub const DEFAULT_HEAP_SIZE: usize = 1024 * 1024;

/// Bounds for the transient GC-root stack depth
pub const TRANSIENT_ROOTS_MIN: usize = 50;
pub const TRANSIENT_ROOTS_MAX: usize = 5000;
/// Bounds for the permanent GC-root stack depth
pub const PERMANENT_ROOTS_MIN: usize = 100;
pub const PERMANENT_ROOTS_MAX: usize = 500;

/// Default depths for the two root stacks
pub const DEFAULT_TRANSIENT_ROOTS: usize = 250;
pub const DEFAULT_PERMANENT_ROOTS: usize = 100;

/// Default height of a thread stack segment, in cells
pub const DEFAULT_STACK_SEGMENT_CELLS: usize = 256;

/// Default number of bytecodes in a timeslice at NORMAL priority
pub const DEFAULT_TIMESLICE: u32 = 2000;

/// Default bucket counts for the small pools
pub const DEFAULT_UTF_BUCKETS: usize = 64;
pub const DEFAULT_CLASS_BUCKETS: usize = 32;
pub const DEFAULT_NATIVE_BUCKETS: usize = 32;

/// Default cap on concurrently open files
pub const DEFAULT_MAX_OPEN_FILES: usize = 8;

/// Thread priority range; timeslices scale linearly with priority
pub const PRIORITY_MIN: u32 = 1;
pub const PRIORITY_NORMAL: u32 = 5;
pub const PRIORITY_MAX: u32 = 10;

/// Errors produced when validating a [`VmOptions`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Heap size outside the accepted range
    #[error("heap size {size} outside range {min}..={max}")]
    HeapSizeOutOfRange { size: usize, min: usize, max: usize },

    /// Heap size not a multiple of the required alignment
    #[error("heap size {size} is not {alignment}-byte aligned")]
    HeapSizeMisaligned { size: usize, alignment: usize },

    /// Transient root stack depth outside the accepted range
    #[error("transient root depth {depth} outside range {min}..={max}")]
    TransientDepthOutOfRange {
        depth: usize,
        min: usize,
        max: usize,
    },

    /// Permanent root stack depth outside the accepted range
    #[error("permanent root depth {depth} outside range {min}..={max}")]
    PermanentDepthOutOfRange {
        depth: usize,
        min: usize,
        max: usize,
    },

    /// A pool was configured with no buckets
    #[error("pool bucket count must be non-zero: {pool}")]
    EmptyPool { pool: &'static str },

    /// Stack segments must hold at least one full frame header
    #[error("stack segment height {cells} cells is too small")]
    SegmentTooSmall { cells: usize },
}

/// Process-level VM options, set at startup and read once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmOptions {
    /// Total heap size in bytes
    pub heap_size: usize,
    /// Height of each thread stack segment, in cells
    pub stack_segment_cells: usize,
    /// Depth of the transient GC-root stack
    pub transient_root_depth: usize,
    /// Depth of the permanent GC-root stack
    pub permanent_root_depth: usize,
    /// Boot classpath entries (directories and archives)
    pub boot_classpath: Vec<String>,
    /// User classpath entries
    pub classpath: Vec<String>,
    /// Maximum number of concurrently open files
    pub max_open_files: usize,
    /// Bucket count for the interned UTF string pool
    pub utf_buckets: usize,
    /// Bucket count for the class pool
    pub class_buckets: usize,
    /// Bucket count for the native method pool
    pub native_buckets: usize,
    /// Whether language-level assertions are enabled
    pub assertions_enabled: bool,
    /// Bytecodes per timeslice at NORMAL priority
    pub timeslice: u32,
    /// Name of the class whose `main` is pushed on the bootstrap thread
    pub main_class: Option<String>,
    /// Arguments handed to `main`
    pub main_args: Vec<String>,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            stack_segment_cells: DEFAULT_STACK_SEGMENT_CELLS,
            transient_root_depth: DEFAULT_TRANSIENT_ROOTS,
            permanent_root_depth: DEFAULT_PERMANENT_ROOTS,
            boot_classpath: Vec::new(),
            classpath: Vec::new(),
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            utf_buckets: DEFAULT_UTF_BUCKETS,
            class_buckets: DEFAULT_CLASS_BUCKETS,
            native_buckets: DEFAULT_NATIVE_BUCKETS,
            assertions_enabled: false,
            timeslice: DEFAULT_TIMESLICE,
            main_class: None,
            main_args: Vec::new(),
        }
    }
}

impl VmOptions {
    /// Creates options with the given heap size and defaults for everything else.
    pub fn with_heap_size(heap_size: usize) -> Self {
        Self {
            heap_size,
            ..Self::default()
        }
    }

    /// Validates every bounded option against its documented range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_size < HEAP_MIN_SIZE || self.heap_size > HEAP_MAX_SIZE {
            return Err(ConfigError::HeapSizeOutOfRange {
                size: self.heap_size,
                min: HEAP_MIN_SIZE,
                max: HEAP_MAX_SIZE,
            });
        }
        if self.heap_size % HEAP_ALIGNMENT != 0 {
            return Err(ConfigError::HeapSizeMisaligned {
                size: self.heap_size,
                alignment: HEAP_ALIGNMENT,
            });
        }
        if self.transient_root_depth < TRANSIENT_ROOTS_MIN
            || self.transient_root_depth > TRANSIENT_ROOTS_MAX
        {
            return Err(ConfigError::TransientDepthOutOfRange {
                depth: self.transient_root_depth,
                min: TRANSIENT_ROOTS_MIN,
                max: TRANSIENT_ROOTS_MAX,
            });
        }
        if self.permanent_root_depth < PERMANENT_ROOTS_MIN
            || self.permanent_root_depth > PERMANENT_ROOTS_MAX
        {
            return Err(ConfigError::PermanentDepthOutOfRange {
                depth: self.permanent_root_depth,
                min: PERMANENT_ROOTS_MIN,
                max: PERMANENT_ROOTS_MAX,
            });
        }
        if self.utf_buckets == 0 {
            return Err(ConfigError::EmptyPool { pool: "utf" });
        }
        if self.class_buckets == 0 {
            return Err(ConfigError::EmptyPool { pool: "class" });
        }
        if self.native_buckets == 0 {
            return Err(ConfigError::EmptyPool { pool: "native" });
        }
        // A segment must at least hold a frame header plus a handful of cells.
        if self.stack_segment_cells < 16 {
            return Err(ConfigError::SegmentTooSmall {
                cells: self.stack_segment_cells,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_validate() {
        let options = VmOptions::default();
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_heap_bounds() {
        let mut options = VmOptions::default();
        options.heap_size = HEAP_MIN_SIZE - HEAP_ALIGNMENT;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::HeapSizeOutOfRange { .. })
        ));

        options.heap_size = HEAP_MAX_SIZE + HEAP_ALIGNMENT;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::HeapSizeOutOfRange { .. })
        ));

        options.heap_size = HEAP_MIN_SIZE + 8;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::HeapSizeMisaligned { .. })
        ));
    }

    #[test]
    fn test_root_depth_bounds() {
        let mut options = VmOptions::default();
        options.transient_root_depth = TRANSIENT_ROOTS_MAX + 1;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::TransientDepthOutOfRange { .. })
        ));

        let mut options = VmOptions::default();
        options.permanent_root_depth = PERMANENT_ROOTS_MIN - 1;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::PermanentDepthOutOfRange { .. })
        ));
    }

    #[test]
    fn test_serde_round_trip() {
        let options = VmOptions::with_heap_size(256 * 1024);
        let json = serde_json::to_string(&options).expect("serialize");
        let back: VmOptions = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.heap_size, 256 * 1024);
        assert_eq!(back.timeslice, DEFAULT_TIMESLICE);
    }
}
