// Checkpoint lifecycle: create, validate, list, and retire checkpoint
// files, plus the retention pass that keeps disk usage bounded without
// ever discarding the newest durable recovery point.
//
// Every create mints a fresh LSN from the shared allocator and logs a
// `CheckpointMarker` record before touching the filesystem, so recovery
// can recognize a checkpoint boundary purely by replaying the WAL even
// if the checkpoint directory is inspected independently.

use super::format::{self, CheckpointEntry};
use super::metadata::{
    CheckpointKind, CheckpointMetadata, CheckpointStatus, CompressionAlgorithm, IncrementalBasePolicy,
    ValidationMismatch, ValidationReport, ValidationWarning,
};
use crate::cancel::CancellationToken;
use crate::index::Index;
use crate::lsn::LsnAllocator;
use crate::wal::{OperationKind, Record, WalManager};
use crate::{DbError, Result};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size above which `validate` warns that a checkpoint is unusually
/// large, independent of whether it is otherwise sound.
const LARGE_CHECKPOINT_WARNING_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub min_checkpoints: usize,
    pub max_checkpoints: usize,
    pub max_disk_usage_bytes: u64,
    /// Completed checkpoints older than this are eligible for deletion,
    /// subject to `min_checkpoints` and watermark non-regression.
    pub retention_period: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            min_checkpoints: 2,
            max_checkpoints: 20,
            max_disk_usage_bytes: 8 * 1024 * 1024 * 1024,
            retention_period: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointStats {
    pub count: usize,
    pub total_bytes: u64,
    pub highest_lsn: u64,
    pub failed_creates: u64,
}

/// The on-disk shape of a checkpoint's payload before encoding. Full and
/// Snapshot checkpoints capture a point-in-time view of live keys;
/// Incremental checkpoints capture the raw wal records since their base,
/// deletes included, so chained replay never resurrects a removed key.
enum CheckpointBody {
    Entries(Vec<CheckpointEntry>),
    Records(Vec<Record>),
}

pub struct CheckpointManager {
    dir: PathBuf,
    index: Arc<Index>,
    wal: Arc<WalManager>,
    lsn: Arc<LsnAllocator>,
    retention: RetentionPolicy,
    compression: CompressionAlgorithm,
    incremental_base_policy: IncrementalBasePolicy,
    validate_on_create: bool,
    catalog: RwLock<Vec<CheckpointMetadata>>,
    failed_creates: AtomicU64,
}

impl CheckpointManager {
    pub fn open(
        dir: impl AsRef<Path>,
        index: Arc<Index>,
        wal: Arc<WalManager>,
        lsn: Arc<LsnAllocator>,
        retention: RetentionPolicy,
        compression: CompressionAlgorithm,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let catalog = Self::load_catalog(&dir)?;

        Ok(Self {
            dir,
            index,
            wal,
            lsn,
            retention,
            compression,
            incremental_base_policy: IncrementalBasePolicy::default(),
            validate_on_create: true,
            catalog: RwLock::new(catalog),
            failed_creates: AtomicU64::new(0),
        })
    }

    pub fn with_incremental_base_policy(mut self, policy: IncrementalBasePolicy) -> Self {
        self.incremental_base_policy = policy;
        self
    }

    fn index_path(dir: &Path) -> PathBuf {
        dir.join("checkpoint_index.json")
    }

    fn load_catalog(dir: &Path) -> Result<Vec<CheckpointMetadata>> {
        let path = Self::index_path(dir);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes).map_err(|e| DbError::Corrupt(format!("bad checkpoint_index.json: {e}")))
    }

    /// Rewrite `checkpoint_index.json` via temp-file-then-rename so a
    /// crash mid-write never leaves a torn catalog.
    fn persist_catalog_locked(&self, catalog: &[CheckpointMetadata]) -> Result<()> {
        let final_path = Self::index_path(&self.dir);
        let tmp_path = self.dir.join("checkpoint_index.json.tmp");
        let bytes = serde_json::to_vec_pretty(catalog).map_err(|e| DbError::Serialization(e.to_string()))?;

        {
            let mut file = fs::File::create(&tmp_path)?;
            use std::io::Write;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    fn checkpoint_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.cp"))
    }

    /// Mint the LSN this checkpoint will be consistent with and log the
    /// marker that lets recovery recognize the boundary (spec step 1 of
    /// checkpoint creation). `id` is the checkpoint's own id so the
    /// marker and the eventual catalog entry agree.
    fn begin(&self, id: &str) -> Result<u64> {
        self.wal
            .append_operation(OperationKind::CheckpointMarker { checkpoint_id: id.to_string() })
    }

    #[instrument(skip(self, body))]
    fn write_checkpoint(
        &self,
        id: String,
        kind: CheckpointKind,
        base_checkpoint_id: Option<String>,
        body: CheckpointBody,
        lsn: u64,
        cancel: &CancellationToken,
    ) -> Result<CheckpointMetadata> {
        let metadata = CheckpointMetadata {
            id: id.clone(),
            kind,
            created_at_millis: now_millis(),
            lsn,
            base_checkpoint_id,
            entry_count: 0,
            uncompressed_size: 0,
            compressed_size: 0,
            compression: self.compression,
            body_crc32: 0,
            status: CheckpointStatus::Creating,
            format_version: format::FORMAT_VERSION,
            engine_version: ENGINE_VERSION.to_string(),
            creator: "checkpoint_manager".to_string(),
        };

        let result = self.try_write_checkpoint(metadata, body, &id, cancel);
        match result {
            Ok(metadata) => {
                info!(id = %metadata.id, kind = ?metadata.kind, lsn, "checkpoint created");
                self.apply_retention()?;
                Ok(metadata)
            }
            Err(err) => {
                self.failed_creates.fetch_add(1, Ordering::Relaxed);
                let path = self.checkpoint_path(&id);
                if path.exists() {
                    let _ = fs::remove_file(&path);
                }
                let tmp_path = self.dir.join(format!("{id}.cp.tmp"));
                if tmp_path.exists() {
                    let _ = fs::remove_file(&tmp_path);
                }
                warn!(id = %id, error = %err, "checkpoint creation failed");
                Err(err)
            }
        }
    }

    fn try_write_checkpoint(
        &self,
        mut metadata_without_sizes: CheckpointMetadata,
        body: CheckpointBody,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<CheckpointMetadata> {
        cancel.check()?;
        metadata_without_sizes.status = CheckpointStatus::Completed;
        let (metadata, bytes) = match body {
            CheckpointBody::Entries(entries) => format::encode(metadata_without_sizes, &entries)?,
            CheckpointBody::Records(records) => format::encode_incremental(metadata_without_sizes, &records)?,
        };
        cancel.check()?;

        let path = self.checkpoint_path(id);
        let tmp_path = self.dir.join(format!("{id}.cp.tmp"));
        {
            let mut file = fs::File::create(&tmp_path)?;
            use std::io::Write;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        if self.validate_on_create {
            let report = self.validate_bytes(&fs::read(&path)?)?;
            if !report.is_clean() {
                fs::remove_file(&path)?;
                return Err(DbError::Corrupt(format!(
                    "checkpoint {id} failed post-create validation: {:?}",
                    report.mismatches
                )));
            }
        }

        let mut catalog = self.catalog.write();
        catalog.push(metadata.clone());
        self.persist_catalog_locked(&catalog)?;
        drop(catalog);

        // Advance truncation eligibility: request the WAL drop segments
        // fully covered by the lowest LSN still retained in the catalog.
        // Truncation safety (spec invariant 4) is preserved because this
        // is always <= the LSN of some Completed checkpoint still on disk.
        let watermark = self.retained_watermark();
        if let Err(err) = self.wal.truncate_through(watermark) {
            warn!(?err, watermark, "post-checkpoint wal truncation failed");
        }

        Ok(metadata)
    }

    /// Capture every live key as of a freshly minted LSN.
    pub fn create_full(&self) -> Result<CheckpointMetadata> {
        self.create_full_cancellable(&CancellationToken::new())
    }

    pub fn create_full_cancellable(&self, cancel: &CancellationToken) -> Result<CheckpointMetadata> {
        let id = uuid::Uuid::new_v4().to_string();
        let lsn = self.begin(&id)?;
        let entries = self.snapshot_entries(lsn);
        self.write_checkpoint(id, CheckpointKind::Full, None, CheckpointBody::Entries(entries), lsn, cancel)
    }

    /// Capture only the WAL records covering `(base_lsn, lsn]`, raw frames
    /// rather than a live-key view, so a delete in that range is carried
    /// forward as a tombstone instead of silently vanishing from the
    /// chain (checkpoint soundness, spec invariant 3). Rejects (per
    /// `IncrementalBasePolicy::RejectIfMissingBase`, the default) if
    /// `base` is not currently in the catalog.
    pub fn create_incremental(&self, base_id: &str) -> Result<CheckpointMetadata> {
        self.create_incremental_cancellable(base_id, &CancellationToken::new())
    }

    pub fn create_incremental_cancellable(
        &self,
        base_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CheckpointMetadata> {
        let base = self.get(base_id);
        let no_base_found = base.is_none();
        if no_base_found && self.incremental_base_policy == IncrementalBasePolicy::RejectIfMissingBase {
            return Err(DbError::InvalidArgument(format!(
                "incremental checkpoint base '{base_id}' not found"
            )));
        }
        let base_lsn = base.map(|b| b.lsn).unwrap_or(0);

        let id = uuid::Uuid::new_v4().to_string();
        let lsn = self.begin(&id)?;
        let records: Vec<Record> = self
            .wal
            .read_from(base_lsn + 1)?
            .into_iter()
            .filter(|r| r.lsn <= lsn)
            .collect();

        let base_checkpoint_id = if no_base_found {
            // TreatAsBase: only sound if this checkpoint covers LSN 1
            // onward, i.e. there truly is no earlier state it omits.
            if base_lsn != 0 {
                return Err(DbError::Internal(
                    "unreachable: base_lsn must be 0 when no base was found".into(),
                ));
            }
            None
        } else {
            Some(base_id.to_string())
        };

        self.write_checkpoint(
            id,
            CheckpointKind::Incremental,
            base_checkpoint_id,
            CheckpointBody::Records(records),
            lsn,
            cancel,
        )
    }

    /// A full capture outside the normal retention cadence; exempt from
    /// count/size-based eviction until explicitly deleted.
    pub fn create_snapshot(&self) -> Result<CheckpointMetadata> {
        let id = uuid::Uuid::new_v4().to_string();
        let lsn = self.begin(&id)?;
        let entries = self.snapshot_entries(lsn);
        self.write_checkpoint(
            id,
            CheckpointKind::Snapshot,
            None,
            CheckpointBody::Entries(entries),
            lsn,
            &CancellationToken::new(),
        )
    }

    fn snapshot_entries(&self, lsn: u64) -> Vec<CheckpointEntry> {
        self.index
            .snapshot_at_lsn(lsn)
            .into_iter()
            .filter(|(_, entry)| !entry.is_tombstone())
            .map(|(key, entry)| CheckpointEntry {
                key,
                value: entry.value.clone(),
                lsn: entry.lsn,
                expires_at_millis: entry.expires_at_millis,
            })
            .collect()
    }

    fn validate_bytes(&self, bytes: &[u8]) -> Result<ValidationReport> {
        let mut report = ValidationReport::default();

        if bytes.len() < 8 || &bytes[0..8] != format::MAGIC {
            report.mismatches.push(ValidationMismatch {
                field: "magic",
                expected: String::from_utf8_lossy(format::MAGIC).to_string(),
                actual: "<missing or corrupt>".to_string(),
                recoverable: false,
            });
            return Ok(report);
        }

        match format::decode_for_validation(bytes) {
            Ok((metadata, count)) => {
                if count != metadata.entry_count {
                    report.mismatches.push(ValidationMismatch {
                        field: "entry_count",
                        expected: metadata.entry_count.to_string(),
                        actual: count.to_string(),
                        recoverable: false,
                    });
                }
                if metadata.format_version != format::FORMAT_VERSION {
                    report.warnings.push(ValidationWarning {
                        message: format!(
                            "checkpoint format version {} is older than current {}",
                            metadata.format_version,
                            format::FORMAT_VERSION
                        ),
                    });
                }
                if metadata.compressed_size > LARGE_CHECKPOINT_WARNING_BYTES {
                    report.warnings.push(ValidationWarning {
                        message: format!("checkpoint body is {} bytes", metadata.compressed_size),
                    });
                }
            }
            Err(err) => {
                report.mismatches.push(ValidationMismatch {
                    field: "body_crc32_or_decode",
                    expected: "valid body".to_string(),
                    actual: err.to_string(),
                    recoverable: false,
                });
            }
        }

        Ok(report)
    }

    /// Re-read a checkpoint file and verify its header, CRC, size, and
    /// format-version compatibility. A checkpoint found Corrupted here is
    /// marked so in the catalog and becomes ineligible for recovery, but
    /// retention still applies to it (spec.md §4.E).
    pub fn validate(&self, id: &str) -> Result<ValidationReport> {
        let path = self.checkpoint_path(id);
        let bytes = fs::read(&path).map_err(|_| DbError::NotFound(format!("checkpoint '{id}' not found")))?;
        let report = self.validate_bytes(&bytes)?;

        if !report.is_clean() {
            let mut catalog = self.catalog.write();
            if let Some(entry) = catalog.iter_mut().find(|c| c.id == id) {
                entry.status = CheckpointStatus::Corrupted;
                self.persist_catalog_locked(&catalog)?;
            }
        }
        Ok(report)
    }

    pub fn list(&self) -> Vec<CheckpointMetadata> {
        self.catalog.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<CheckpointMetadata> {
        self.catalog.read().iter().find(|c| c.id == id).cloned()
    }

    /// A checkpoint is a sound, self-contained recovery base only if it's
    /// `Completed` and not `Incremental` — an incremental's body holds
    /// only the delta since its own base, so installing it alone without
    /// first applying that base would silently lose every key the base
    /// covered (checkpoint soundness, spec invariant 3).
    fn is_viable_base(c: &CheckpointMetadata) -> bool {
        c.status == CheckpointStatus::Completed && c.kind != CheckpointKind::Incremental
    }

    /// The newest checkpoint eligible as a recovery base: `Completed`,
    /// not `Corrupted`, not `Incremental`, ordered by LSN.
    pub fn latest_viable(&self) -> Option<CheckpointMetadata> {
        self.catalog
            .read()
            .iter()
            .filter(|c| Self::is_viable_base(c))
            .max_by_key(|c| c.lsn)
            .cloned()
    }

    /// The newest viable checkpoint at or before `lsn`.
    pub fn latest_viable_at_or_before_lsn(&self, lsn: u64) -> Option<CheckpointMetadata> {
        self.catalog
            .read()
            .iter()
            .filter(|c| Self::is_viable_base(c) && c.lsn <= lsn)
            .max_by_key(|c| c.lsn)
            .cloned()
    }

    /// The newest viable checkpoint created at or before `timestamp_millis`.
    pub fn latest_viable_at_or_before_time(&self, timestamp_millis: u64) -> Option<CheckpointMetadata> {
        self.catalog
            .read()
            .iter()
            .filter(|c| Self::is_viable_base(c) && c.created_at_millis <= timestamp_millis)
            .max_by_key(|c| c.created_at_millis)
            .cloned()
    }

    pub fn read_entries(&self, id: &str) -> Result<Vec<CheckpointEntry>> {
        let bytes = fs::read(self.checkpoint_path(id))?;
        let (_, entries) = format::decode(&bytes)?;
        Ok(entries)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut catalog = self.catalog.write();
        let before = catalog.len();
        catalog.retain(|c| c.id != id);
        if catalog.len() == before {
            return Err(DbError::NotFound(format!("checkpoint '{id}' not found")));
        }
        self.persist_catalog_locked(&catalog)?;
        drop(catalog);

        let path = self.checkpoint_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> CheckpointStats {
        let catalog = self.catalog.read();
        CheckpointStats {
            count: catalog.len(),
            total_bytes: catalog.iter().map(|c| c.compressed_size).sum(),
            highest_lsn: catalog.iter().map(|c| c.lsn).max().unwrap_or(0),
            failed_creates: self.failed_creates.load(Ordering::Relaxed),
        }
    }

    /// Timestamp of the newest `Completed` checkpoint, in millis since
    /// the Unix epoch. Read by the RPO controller as one freshness signal.
    pub fn last_completed_at_millis(&self) -> Option<u64> {
        self.catalog
            .read()
            .iter()
            .filter(|c| c.status == CheckpointStatus::Completed)
            .map(|c| c.created_at_millis)
            .max()
    }

    /// Highest LSN minted so far, independent of what's actually been
    /// checkpointed. Read by the auto-checkpoint loop to evaluate its
    /// LSN-delta trigger.
    pub fn current_lsn(&self) -> u64 {
        self.lsn.current()
    }

    /// The highest LSN covered by any Completed checkpoint still
    /// retained, i.e. the watermark below which the WAL can safely be
    /// truncated (truncation safety, spec.md §3 invariant 4).
    pub fn retained_watermark(&self) -> u64 {
        self.catalog
            .read()
            .iter()
            .filter(|c| c.status == CheckpointStatus::Completed)
            .map(|c| c.lsn)
            .min()
            .unwrap_or(0)
    }

    /// Evict the oldest eligible checkpoints to respect `retention_period`,
    /// `min_checkpoints`, `max_checkpoints`, and `max_disk_usage_bytes`, in
    /// that priority order. Never evicts below `min_checkpoints` total,
    /// and never evicts `Snapshot` checkpoints. The retained watermark
    /// (the lowest lsn among kept Completed checkpoints) never regresses
    /// past what a prior retention pass already established as safe.
    pub fn apply_retention(&self) -> Result<()> {
        let watermark_before = self.retained_watermark();
        let now = now_millis();
        let retention_period_millis = self.retention.retention_period.as_millis() as u64;

        let mut catalog = self.catalog.write();
        let mut eligible: Vec<usize> = (0..catalog.len())
            .filter(|&i| catalog[i].kind != CheckpointKind::Snapshot)
            .collect();
        eligible.sort_by_key(|&i| catalog[i].created_at_millis);

        let mut to_remove = Vec::new();
        let mut total_bytes: u64 = catalog.iter().map(|c| c.compressed_size).sum();
        let mut remaining = eligible.len();

        for &i in &eligible {
            if remaining <= self.retention.min_checkpoints {
                break;
            }
            let age = now.saturating_sub(catalog[i].created_at_millis);
            let past_retention = age >= retention_period_millis;
            let over_count = remaining > self.retention.max_checkpoints;
            let over_bytes = total_bytes > self.retention.max_disk_usage_bytes;
            if !past_retention && !over_count && !over_bytes {
                continue;
            }
            to_remove.push(i);
            total_bytes = total_bytes.saturating_sub(catalog[i].compressed_size);
            remaining -= 1;
        }

        if to_remove.is_empty() {
            return Ok(());
        }

        let ids_to_remove: Vec<String> = to_remove.iter().map(|&i| catalog[i].id.clone()).collect();
        let mut candidate = catalog.clone();
        candidate.retain(|c| !ids_to_remove.contains(&c.id));

        let watermark_after = candidate
            .iter()
            .filter(|c| c.status == CheckpointStatus::Completed)
            .map(|c| c.lsn)
            .min()
            .unwrap_or(0);
        if watermark_after < watermark_before {
            warn!(
                watermark_before,
                watermark_after, "retention pass would regress the retained watermark, skipping eviction"
            );
            return Ok(());
        }

        *catalog = candidate;
        self.persist_catalog_locked(&catalog)?;
        drop(catalog);

        for id in ids_to_remove {
            let path = self.checkpoint_path(&id);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Drives the two automatic-checkpoint triggers in spec.md §4.E: a
/// periodic ticker and an LSN-delta watermark. `poll_interval` is the
/// loop's own wakeup cadence, independent of and normally much finer
/// than `interval`, so the delta trigger can fire promptly between two
/// periodic checkpoints on a write-heavy workload.
#[derive(Debug, Clone, Copy)]
pub struct AutoCheckpointConfig {
    pub interval: Duration,
    pub lsn_delta: u64,
    pub poll_interval: Duration,
}

impl Default for AutoCheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            lsn_delta: 100_000,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Background loop spawned by `Engine::open` that calls `create_full`
/// once either trigger fires, offloading the checkpoint itself onto the
/// blocking-task pool so a slow snapshot never stalls this loop's own
/// timer (mirrors the rpo controller's forced-checkpoint path).
pub async fn run_auto_checkpoint_loop(manager: Arc<CheckpointManager>, config: AutoCheckpointConfig) {
    let mut ticker = tokio::time::interval(config.poll_interval);
    let mut last_triggered_lsn = manager.stats().highest_lsn;

    loop {
        ticker.tick().await;

        let due_by_time = manager
            .last_completed_at_millis()
            .map(|at| now_millis().saturating_sub(at) >= config.interval.as_millis() as u64)
            .unwrap_or(true);
        let due_by_delta =
            config.lsn_delta > 0 && manager.current_lsn().saturating_sub(last_triggered_lsn) >= config.lsn_delta;

        if !due_by_time && !due_by_delta {
            continue;
        }

        let task_manager = manager.clone();
        let result = tokio::task::spawn_blocking(move || task_manager.create_full()).await;
        match result {
            Ok(Ok(metadata)) => {
                last_triggered_lsn = metadata.lsn;
                info!(checkpoint_id = %metadata.id, due_by_time, due_by_delta, "automatic checkpoint completed");
            }
            Ok(Err(err)) => warn!(?err, "automatic checkpoint failed"),
            Err(err) => warn!(?err, "automatic checkpoint task panicked"),
        }
    }
}
