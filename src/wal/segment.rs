// A single on-disk WAL segment: a fixed header followed by a stream of
// length-prefixed, CRC-checked frames.
//
// File layout:
//   [ magic(9) | version(u32) | reserved(u32) ]
//   [ frame ]*
// Frame layout:
//   [ length(u32) | payload(length bytes) | crc32(u32) ]
//
// `wal-<first_lsn>.log` names a segment by the LSN of its first record,
// so segments can be ordered and located without reading them.

use crate::{DbError, Result};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MAGIC: &[u8; 9] = b"MANTISWAL";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_LEN: u64 = 9 + 4 + 4;
pub const DEFAULT_SEGMENT_CAP_BYTES: u64 = 64 * 1024 * 1024;

pub fn segment_path(dir: &Path, first_lsn: u64) -> PathBuf {
    dir.join(format!("wal-{:020}.log", first_lsn))
}

/// Parse the first LSN out of a segment file name, if it matches the
/// `wal-<lsn>.log` pattern.
pub fn parse_first_lsn(path: &Path) -> Option<u64> {
    let name = path.file_stem()?.to_str()?;
    name.strip_prefix("wal-")?.parse().ok()
}

pub struct WalSegment {
    file: File,
    path: PathBuf,
    pub first_lsn: u64,
    size: u64,
}

impl WalSegment {
    /// Create a new, empty segment starting at `first_lsn` and write its
    /// header.
    pub fn create(dir: &Path, first_lsn: u64) -> Result<Self> {
        let path = segment_path(dir, first_lsn);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        file.write_all(MAGIC).map_err(DbError::from_write_io)?;
        file.write_all(&FORMAT_VERSION.to_le_bytes()).map_err(DbError::from_write_io)?;
        file.write_all(&0u32.to_le_bytes()).map_err(DbError::from_write_io)?;
        file.sync_all().map_err(DbError::from_write_io)?;

        Ok(Self {
            file,
            path,
            first_lsn,
            size: HEADER_LEN,
        })
    }

    /// Open an existing segment for appending, validating its header.
    pub fn open_for_append(path: &Path) -> Result<Self> {
        let first_lsn = parse_first_lsn(path)
            .ok_or_else(|| DbError::Corrupt(format!("not a wal segment filename: {}", path.display())))?;

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::validate_header(&mut file, path)?;

        let size = file.metadata()?.len();
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            first_lsn,
            size,
        })
    }

    fn validate_header(file: &mut File, path: &Path) -> Result<()> {
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|e| DbError::Corrupt(format!("{}: truncated header: {e}", path.display())))?;

        if &header[0..9] != MAGIC {
            return Err(DbError::Corrupt(format!("{}: bad magic", path.display())));
        }
        let version = u32::from_le_bytes(header[9..13].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(DbError::Corrupt(format!(
                "{}: unsupported wal version {version}",
                path.display()
            )));
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a frame for `payload`. Does not fsync; callers batch syncs
    /// under the configured `SyncPolicy`.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        let mut hasher = Hasher::new();
        hasher.update(payload);
        let crc = hasher.finalize();

        let len = payload.len() as u32;
        self.file.write_all(&len.to_le_bytes()).map_err(DbError::from_write_io)?;
        self.file.write_all(payload).map_err(DbError::from_write_io)?;
        self.file.write_all(&crc.to_le_bytes()).map_err(DbError::from_write_io)?;

        self.size += 4 + payload.len() as u64 + 4;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data().map_err(DbError::from_write_io)?;
        Ok(())
    }

    /// Read every well-formed frame from the segment in order. Stops at
    /// the first truncated or CRC-mismatched frame rather than erroring,
    /// since that's the expected shape of a crash mid-append: whatever
    /// was fully flushed is valid, the tail is torn and discarded.
    pub fn read_frames(path: &Path) -> Result<Vec<Vec<u8>>> {
        let mut file = File::open(path)?;
        Self::validate_header(&mut file, path)?;
        let mut reader = BufReader::new(file);
        let mut frames = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            if reader.read_exact(&mut len_buf).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                break;
            }

            let mut crc_buf = [0u8; 4];
            if reader.read_exact(&mut crc_buf).is_err() {
                break;
            }
            let stored_crc = u32::from_le_bytes(crc_buf);

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != stored_crc {
                break;
            }

            frames.push(payload);
        }

        Ok(frames)
    }

    /// Truncate the file to the last known-good offset, discarding any
    /// torn tail left by a crash mid-append. `good_offset` must be a
    /// frame boundary (the caller tracks this while replaying).
    pub fn truncate_to(path: &Path, good_offset: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(good_offset)?;
        file.sync_all()?;
        Ok(())
    }
}
