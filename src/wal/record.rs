// Wire format for a single WAL record: what's logged, independent of how
// frames are packed into segment files (see `segment.rs`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationKind {
    Put { key: Vec<u8>, value: Vec<u8>, ttl_millis: Option<u64> },
    Delete { key: Vec<u8> },
    /// Marks the LSN at which a checkpoint was taken, so recovery can
    /// recognize the boundary without consulting the checkpoint manager.
    CheckpointMarker { checkpoint_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    pub lsn: u64,
    pub timestamp_millis: u64,
    pub operation: OperationKind,
}

impl Record {
    /// Stamp `operation` with `lsn` and the current time. `lsn` must
    /// already have been minted; `WalManager::append_operation` is the
    /// only path that mints one and builds a `Record` from it atomically.
    pub fn new(lsn: u64, operation: OperationKind) -> Self {
        Self {
            lsn,
            timestamp_millis: now_millis(),
            operation,
        }
    }

    pub fn put(lsn: u64, key: Vec<u8>, value: Vec<u8>, ttl_millis: Option<u64>) -> Self {
        Self::new(lsn, OperationKind::Put { key, value, ttl_millis })
    }

    pub fn delete(lsn: u64, key: Vec<u8>) -> Self {
        Self::new(lsn, OperationKind::Delete { key })
    }

    pub fn checkpoint_marker(lsn: u64, checkpoint_id: String) -> Self {
        Self::new(lsn, OperationKind::CheckpointMarker { checkpoint_id })
    }

    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| crate::DbError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(record, _)| record)
            .map_err(|e| crate::DbError::Serialization(e.to_string()))
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
