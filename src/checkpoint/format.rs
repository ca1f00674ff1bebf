// On-disk codec for a checkpoint file.
//
// Layout: [ magic(8) | version(u32) | metadata_len(u32) | metadata(json) | body ]
// `body` is a bincode-encoded list, optionally Deflate-compressed per
// `metadata.compression`. Full/Snapshot checkpoints store a
// `Vec<CheckpointEntry>` body (one tuple per live key); Incremental
// checkpoints store a `Vec<Record>` body — the raw WAL frames for
// `(base_lsn, lsn]` — so a delete in that range survives as a tombstone
// record rather than being silently dropped.

use super::metadata::{CheckpointKind, CheckpointMetadata, CompressionAlgorithm};
use crate::wal::Record;
use crate::{DbError, Result};
use crc32fast::Hasher;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

pub const MAGIC: &[u8; 8] = b"MANTISCP";
pub const FORMAT_VERSION: u32 = 1;

/// A single entry captured in a Full or Snapshot checkpoint body.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub lsn: u64,
    pub expires_at_millis: Option<u64>,
}

struct DecodedHeader {
    metadata: CheckpointMetadata,
    /// Decompressed, CRC-verified body bytes, not yet deserialized into
    /// its typed shape.
    body: Vec<u8>,
}

fn decode_header(bytes: &[u8]) -> Result<DecodedHeader> {
    if bytes.len() < 16 {
        return Err(DbError::Corrupt("checkpoint file too short for header".into()));
    }
    if &bytes[0..8] != MAGIC {
        return Err(DbError::Corrupt("checkpoint file has bad magic".into()));
    }
    let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(DbError::Corrupt(format!("unsupported checkpoint version {version}")));
    }
    let metadata_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    let metadata_start = 16;
    let metadata_end = metadata_start
        .checked_add(metadata_len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| DbError::Corrupt("checkpoint metadata length out of bounds".into()))?;

    let metadata: CheckpointMetadata = serde_json::from_slice(&bytes[metadata_start..metadata_end])
        .map_err(|e| DbError::Corrupt(format!("bad checkpoint metadata json: {e}")))?;

    let body = &bytes[metadata_end..];

    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != metadata.body_crc32 {
        return Err(DbError::Corrupt("checkpoint body crc mismatch".into()));
    }

    let uncompressed = match metadata.compression {
        CompressionAlgorithm::Raw => body.to_vec(),
        CompressionAlgorithm::Deflate => {
            let mut decoder = DeflateDecoder::new(body);
            let mut out = Vec::with_capacity(metadata.uncompressed_size as usize);
            decoder.read_to_end(&mut out)?;
            out
        }
    };

    Ok(DecodedHeader { metadata, body: uncompressed })
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(body, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| DbError::Serialization(e.to_string()))
}

fn encode_generic<T: Serialize>(
    metadata_without_sizes: CheckpointMetadata,
    items: &T,
    count: u64,
) -> Result<(CheckpointMetadata, Vec<u8>)> {
    let uncompressed =
        bincode::serde::encode_to_vec(items, bincode::config::standard()).map_err(|e| DbError::Serialization(e.to_string()))?;

    let (body, compression) = match metadata_without_sizes.compression {
        CompressionAlgorithm::Raw => (uncompressed.clone(), CompressionAlgorithm::Raw),
        CompressionAlgorithm::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&uncompressed)?;
            (encoder.finish()?, CompressionAlgorithm::Deflate)
        }
    };

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let body_crc32 = hasher.finalize();

    let metadata = CheckpointMetadata {
        entry_count: count,
        uncompressed_size: uncompressed.len() as u64,
        compressed_size: body.len() as u64,
        compression,
        body_crc32,
        ..metadata_without_sizes
    };

    let metadata_json = serde_json::to_vec(&metadata).map_err(|e| DbError::Serialization(e.to_string()))?;

    let mut file = Vec::with_capacity(8 + 4 + 4 + metadata_json.len() + body.len());
    file.extend_from_slice(MAGIC);
    file.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    file.extend_from_slice(&(metadata_json.len() as u32).to_le_bytes());
    file.extend_from_slice(&metadata_json);
    file.extend_from_slice(&body);

    Ok((metadata, file))
}

/// Encode a Full or Snapshot checkpoint body: one tuple per live key.
pub fn encode(metadata_without_sizes: CheckpointMetadata, entries: &[CheckpointEntry]) -> Result<(CheckpointMetadata, Vec<u8>)> {
    encode_generic(metadata_without_sizes, &entries, entries.len() as u64)
}

pub fn decode(bytes: &[u8]) -> Result<(CheckpointMetadata, Vec<CheckpointEntry>)> {
    let header = decode_header(bytes)?;
    let entries = decode_body(&header.body)?;
    Ok((header.metadata, entries))
}

/// Encode an Incremental checkpoint body: the raw WAL records covering
/// `(base_lsn, lsn]`, so a delete in that range is preserved as a
/// tombstone record rather than collapsed into the live-key view.
pub fn encode_incremental(
    metadata_without_sizes: CheckpointMetadata,
    records: &[Record],
) -> Result<(CheckpointMetadata, Vec<u8>)> {
    encode_generic(metadata_without_sizes, &records, records.len() as u64)
}

pub fn decode_incremental(bytes: &[u8]) -> Result<(CheckpointMetadata, Vec<Record>)> {
    let header = decode_header(bytes)?;
    let records = decode_body(&header.body)?;
    Ok((header.metadata, records))
}

/// Decode whichever body shape `metadata.kind` implies and return just
/// the entry count, for `CheckpointManager::validate` to compare against
/// the catalog without the caller needing to know the body's type ahead
/// of time.
pub fn decode_for_validation(bytes: &[u8]) -> Result<(CheckpointMetadata, u64)> {
    let header = decode_header(bytes)?;
    let count = if header.metadata.kind == CheckpointKind::Incremental {
        decode_body::<Vec<Record>>(&header.body)?.len() as u64
    } else {
        decode_body::<Vec<CheckpointEntry>>(&header.body)?.len() as u64
    };
    Ok((header.metadata, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::OperationKind;

    fn sample_metadata(compression: CompressionAlgorithm) -> CheckpointMetadata {
        use super::super::metadata::CheckpointStatus;
        CheckpointMetadata {
            id: "test".into(),
            kind: CheckpointKind::Full,
            created_at_millis: 0,
            lsn: 10,
            base_checkpoint_id: None,
            entry_count: 0,
            uncompressed_size: 0,
            compressed_size: 0,
            compression,
            body_crc32: 0,
            status: CheckpointStatus::Completed,
            format_version: FORMAT_VERSION,
            engine_version: "test".into(),
            creator: "test".into(),
        }
    }

    #[test]
    fn round_trips_raw() {
        let entries = vec![CheckpointEntry {
            key: b"a".to_vec(),
            value: b"1".to_vec(),
            lsn: 1,
            expires_at_millis: None,
        }];
        let (metadata, bytes) = encode(sample_metadata(CompressionAlgorithm::Raw), &entries).unwrap();
        assert_eq!(metadata.entry_count, 1);
        let (decoded_metadata, decoded_entries) = decode(&bytes).unwrap();
        assert_eq!(decoded_metadata.lsn, 10);
        assert_eq!(decoded_entries, entries);
    }

    #[test]
    fn round_trips_deflate() {
        let entries = vec![CheckpointEntry {
            key: b"a".to_vec(),
            value: vec![7u8; 4096],
            lsn: 1,
            expires_at_millis: None,
        }];
        let (metadata, bytes) = encode(sample_metadata(CompressionAlgorithm::Deflate), &entries).unwrap();
        assert!(metadata.compressed_size < metadata.uncompressed_size);
        let (_, decoded_entries) = decode(&bytes).unwrap();
        assert_eq!(decoded_entries, entries);
    }

    #[test]
    fn rejects_corrupt_body() {
        let entries = vec![CheckpointEntry {
            key: b"a".to_vec(),
            value: b"1".to_vec(),
            lsn: 1,
            expires_at_millis: None,
        }];
        let (_, mut bytes) = encode(sample_metadata(CompressionAlgorithm::Raw), &entries).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn incremental_body_round_trips_a_delete() {
        let mut metadata = sample_metadata(CompressionAlgorithm::Raw);
        metadata.kind = CheckpointKind::Incremental;
        metadata.base_checkpoint_id = Some("base".into());
        let records = vec![
            Record::new(5, OperationKind::Put { key: b"a".to_vec(), value: b"1".to_vec(), ttl_millis: None }),
            Record::new(6, OperationKind::Delete { key: b"a".to_vec() }),
        ];
        let (metadata, bytes) = encode_incremental(metadata, &records).unwrap();
        assert_eq!(metadata.entry_count, 2);

        let (decoded_metadata, decoded_records) = decode_incremental(&bytes).unwrap();
        assert_eq!(decoded_records, records);

        let (validated_metadata, count) = decode_for_validation(&bytes).unwrap();
        assert_eq!(count, 2);
        assert_eq!(validated_metadata.id, decoded_metadata.id);
    }
}
