use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointKind {
    /// Captures every live key as of `lsn`.
    Full,
    /// Captures only keys mutated since `base_checkpoint_id`'s watermark.
    /// Replay requires applying the base first.
    Incremental,
    /// A full capture taken outside the normal cadence (e.g. before a
    /// risky operation), retained independently of the regular policy
    /// until explicitly deleted.
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    Raw,
    Deflate,
}

/// Lifecycle state of a checkpoint, independent of whether its file still
/// exists on disk. `Creating` is never persisted to the catalog (a
/// checkpoint only gets a catalog entry once its file is durably
/// written); it exists as a value so in-flight creation can be reported
/// through the same type as everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    Creating,
    Completed,
    Failed,
    Validating,
    Corrupted,
}

/// Decision for `CheckpointKind::Incremental` when its declared base
/// checkpoint is missing (deleted by retention, or never existed).
///
/// `RejectIfMissingBase` (the default) refuses to create or replay such
/// an incremental checkpoint: without its base, it does not describe a
/// complete state. `TreatAsBase` instead allows an incremental
/// checkpoint with no resolvable base to stand in as if it covered LSN 1
/// onward, but only when it was actually built that way (see
/// `CheckpointManager::create_incremental`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementalBasePolicy {
    RejectIfMissingBase,
    TreatAsBase,
}

impl Default for IncrementalBasePolicy {
    fn default() -> Self {
        IncrementalBasePolicy::RejectIfMissingBase
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub id: String,
    pub kind: CheckpointKind,
    pub created_at_millis: u64,
    /// The highest LSN this checkpoint's contents are consistent with.
    pub lsn: u64,
    pub base_checkpoint_id: Option<String>,
    pub entry_count: u64,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub compression: CompressionAlgorithm,
    pub body_crc32: u32,
    pub status: CheckpointStatus,
    pub format_version: u32,
    pub engine_version: String,
    pub creator: String,
}

/// A single mismatch found during `CheckpointManager::validate`, e.g. a
/// CRC or size disagreement between the catalog entry and the file on
/// disk.
#[derive(Debug, Clone)]
pub struct ValidationMismatch {
    pub field: &'static str,
    pub expected: String,
    pub actual: String,
    /// Whether the checkpoint is still usable despite this mismatch (a
    /// deprecated-but-readable format version) or must be treated as
    /// `Corrupted` (a CRC or size mismatch).
    pub recoverable: bool,
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub mismatches: Vec<ValidationMismatch>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.mismatches.iter().all(|m| m.recoverable)
    }

    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}
