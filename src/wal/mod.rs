// Write-ahead log: append-only, crash-safe record stream that is the
// sole durability boundary for the storage engine. The index and cache
// are both derivable from replaying this log plus checkpoints; losing
// either without losing the WAL is always recoverable.

pub mod manager;
pub mod record;
pub mod segment;

pub use manager::{run_periodic_sync_loop, SyncPolicy, WalManager};
pub use record::{OperationKind, Record};
