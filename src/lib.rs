// MantisDB core: durable storage engine combining a write-ahead log, a
// lock-free ordered index, checkpointing, crash recovery, and an RPO
// (Recovery Point Objective) controller that enforces a configured
// data-loss ceiling.

pub mod alert;
pub mod cache;
pub mod cancel;
pub mod checkpoint;
pub mod concurrent;
pub mod engine;
pub mod error;
pub mod index;
pub mod lsn;
pub mod recovery;
pub mod rpo;
pub mod wal;

pub use engine::{CheckpointKindArg, Config, Engine};
pub use error::{DbError, Result};
