// Point-in-time captures of the index, used to bound recovery replay
// time: instead of replaying the entire WAL from LSN 1, recovery loads
// the newest viable checkpoint and replays only what came after it.

pub mod format;
pub mod manager;
pub mod metadata;

pub use format::CheckpointEntry;
pub use manager::{run_auto_checkpoint_loop, AutoCheckpointConfig, CheckpointManager, CheckpointStats, RetentionPolicy};
pub use metadata::{
    CheckpointKind, CheckpointMetadata, CheckpointStatus, CompressionAlgorithm, IncrementalBasePolicy,
    ValidationMismatch, ValidationReport, ValidationWarning,
};
