//! Memory modes and the storage classifier.
//!
//! Every array ends a compilation with a memory mode stamped with a numeric
//! provenance code so a surprising classification can be traced back to the
//! check that produced it. The classifier condenses the mode, the usage
//! facts from tracing, and the parallelization predicates into the storage
//! class the C and CUDA backends consume.

use std::fmt;

use log::warn;
use serde::Serialize;

// =============================================================================
// Memory modes
// =============================================================================

/// How host memory backing an array behaves across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostedKind {
    /// The routine updates the host copy.
    Changed,
    /// The host copy is read-only for device code.
    Constant,
    /// Externally mutated between calls; never cached on device.
    Volatile,
}

/// Per-array storage tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MemoryMode {
    /// Never materialized; reads are replaced by replayed computations.
    Virtual,
    /// A scalar or small block local to one kernel invocation.
    Local,
    /// Lives in GPU shared memory.
    Shared,
    /// Lives in device-global memory.
    Global,
    /// Device-resident constant storage.
    Constant,
    /// Backed by a host buffer.
    Hosted(HostedKind),
    /// Must exist in memory somewhere; the backend picks where.
    Materialized,
}

impl MemoryMode {
    pub fn is_virtual(self) -> bool {
        matches!(self, MemoryMode::Virtual)
    }

    pub fn is_hosted(self) -> bool {
        matches!(self, MemoryMode::Hosted(_))
    }

    /// Whether the values are observable outside the routine.
    pub fn is_materialized(self) -> bool {
        !matches!(self, MemoryMode::Virtual | MemoryMode::Local)
    }
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryMode::Virtual => write!(f, "virtual"),
            MemoryMode::Local => write!(f, "local"),
            MemoryMode::Shared => write!(f, "shared"),
            MemoryMode::Global => write!(f, "global"),
            MemoryMode::Constant => write!(f, "constant"),
            MemoryMode::Hosted(HostedKind::Changed) => write!(f, "hosted"),
            MemoryMode::Hosted(HostedKind::Constant) => write!(f, "hosted-constant"),
            MemoryMode::Hosted(HostedKind::Volatile) => write!(f, "hosted-volatile"),
            MemoryMode::Materialized => write!(f, "materialized"),
        }
    }
}

// =============================================================================
// Storage classes
// =============================================================================

/// What the backend allocates for an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StorageClass {
    /// The user pinned the mode; pass it through.
    Declared(MemoryMode),
    /// Read-only data uploaded from the host once.
    ConstantFromHost,
    /// No external observer needs the values; keep them kernel-local.
    LocalOnly,
    /// Allocated and owned by the execution context.
    FromContext,
}

/// Provenance code for a user-declared mode.
pub const PROV_DECLARED: u8 = 33;

/// Pick the storage class for one array.
///
/// Priority: an explicitly declared mode wins; hosted read-only data becomes
/// a constant upload; values nobody observes stay local; everything else is
/// owned by the context.
pub fn storage_class(
    mode: Option<(MemoryMode, u8)>,
    read_only: bool,
) -> StorageClass {
    match mode {
        Some((m, PROV_DECLARED)) => StorageClass::Declared(m),
        Some((m, _)) if m.is_hosted() && read_only => StorageClass::ConstantFromHost,
        Some((m, _)) if !m.is_materialized() => StorageClass::LocalOnly,
        None => StorageClass::LocalOnly,
        _ => StorageClass::FromContext,
    }
}

// =============================================================================
// GPU sub-modes
// =============================================================================

/// Whether an array's computation is indexed by a dedicated parallel axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelIndexing {
    /// The axis exists and indexes the array's writes.
    Indexed,
    /// The axis exists but does not index the array's writes.
    NotIndexed,
    /// The routine has no such axis.
    Absent,
}

impl ParallelIndexing {
    fn yes_or_absent(self) -> bool {
        matches!(self, ParallelIndexing::Indexed | ParallelIndexing::Absent)
    }

    fn yes(self) -> bool {
        matches!(self, ParallelIndexing::Indexed)
    }

    fn no(self) -> bool {
        matches!(self, ParallelIndexing::NotIndexed)
    }
}

/// Storage sub-mode for GPU emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GpuMode {
    /// Private to one thread.
    ThreadOnly,
    /// Private to one block.
    BlockOnly,
    /// Partitioned across threads.
    ThreadParallel,
    /// Partitioned across blocks.
    BlockParallel,
    /// Uploaded once, read by everyone.
    Constant,
    /// A private copy per block.
    Replicated,
    /// Requires cross-block coordination; chosen only as a fallback.
    NonLocal,
}

/// The GPU decision table. `task` is the block axis, `sample` the thread
/// axis. Falls back to `NonLocal` with a warning.
pub fn gpu_mode(
    label: &str,
    task: ParallelIndexing,
    sample: ParallelIndexing,
    hosted: bool,
    read_only: bool,
    replicable: bool,
) -> GpuMode {
    if !hosted && task.yes_or_absent() && sample.yes_or_absent() {
        GpuMode::ThreadOnly
    } else if !hosted && task.yes_or_absent() && sample.no() {
        GpuMode::BlockOnly
    } else if task.yes() && sample.yes() {
        GpuMode::ThreadParallel
    } else if task.yes() && sample.no() {
        GpuMode::BlockParallel
    } else if hosted && read_only {
        GpuMode::Constant
    } else if sample.no() && replicable {
        GpuMode::Replicated
    } else {
        warn!(
            "array {}: no parallel placement fits (task {:?}, sample {:?}); \
             falling back to non-local storage",
            label, task, sample
        );
        GpuMode::NonLocal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ParallelIndexing::{Absent, Indexed, NotIndexed};

    #[test]
    fn device_only_arrays_stay_thread_private() {
        assert_eq!(
            gpu_mode("a", Absent, Absent, false, false, false),
            GpuMode::ThreadOnly
        );
        assert_eq!(
            gpu_mode("a", Indexed, Indexed, false, false, false),
            GpuMode::ThreadOnly
        );
    }

    #[test]
    fn unindexed_sample_axis_demotes_to_block() {
        assert_eq!(
            gpu_mode("a", Indexed, NotIndexed, false, false, false),
            GpuMode::BlockOnly
        );
    }

    #[test]
    fn hosted_arrays_partition_by_indexing() {
        assert_eq!(
            gpu_mode("a", Indexed, Indexed, true, false, false),
            GpuMode::ThreadParallel
        );
        assert_eq!(
            gpu_mode("a", Indexed, NotIndexed, true, false, false),
            GpuMode::BlockParallel
        );
    }

    #[test]
    fn hosted_read_only_is_constant() {
        assert_eq!(
            gpu_mode("a", NotIndexed, Indexed, true, true, false),
            GpuMode::Constant
        );
    }

    #[test]
    fn replicable_fallback_and_nonlocal() {
        assert_eq!(
            gpu_mode("a", NotIndexed, NotIndexed, true, false, true),
            GpuMode::Replicated
        );
        assert_eq!(
            gpu_mode("a", NotIndexed, Indexed, true, false, false),
            GpuMode::NonLocal
        );
    }
}
