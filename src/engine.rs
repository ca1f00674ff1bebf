// Top-level wiring: owns the LSN allocator, WAL, index, cache, checkpoint
// manager, recovery engine, and RPO controller, and exposes the surface a
// query or service layer actually calls. Everything below this module
// talks to each other through `Arc`s handed out here; nothing outside
// `Engine::open` constructs them independently.

use crate::alert::{AlertSink, LoggingAlertSink};
use crate::cache::{Cache, CacheConfig};
use crate::checkpoint::{
    self, AutoCheckpointConfig, CheckpointManager, CheckpointMetadata, CompressionAlgorithm, RetentionPolicy,
};
use crate::index::{Index, KeyRange, ScanIter};
use crate::lsn::LsnAllocator;
use crate::recovery::RecoveryEngine;
use crate::rpo::{ComplianceStats, RpoConfig, RpoController};
use crate::wal::{self, OperationKind, SyncPolicy, WalManager};
use crate::{DbError, Result};
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Top-level configuration for opening an engine instance.
///
/// `wal_dir` and `checkpoint_dir` default to `<data_dir>/wal` and
/// `<data_dir>/checkpoints` respectively when left `None`, matching the
/// on-disk layout in spec.md §6.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub wal_dir: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
    pub sync_policy: SyncPolicy,
    pub retention: RetentionPolicy,
    pub compression: CompressionAlgorithm,
    pub cache: CacheConfig,
    pub rpo: RpoConfig,
    pub auto_checkpoint: AutoCheckpointConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_dir: None,
            checkpoint_dir: None,
            sync_policy: SyncPolicy::default(),
            retention: RetentionPolicy::default(),
            compression: CompressionAlgorithm::Raw,
            cache: CacheConfig::default(),
            rpo: RpoConfig::for_level(crate::rpo::RpoLevel::Medium),
            auto_checkpoint: AutoCheckpointConfig::default(),
        }
    }
}

impl Config {
    fn wal_dir(&self) -> PathBuf {
        self.wal_dir.clone().unwrap_or_else(|| self.data_dir.join("wal"))
    }

    fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir.clone().unwrap_or_else(|| self.data_dir.join("checkpoints"))
    }
}

/// Holds an exclusive advisory lock on a directory for the lifetime of
/// the engine. Released automatically (by the OS) when the underlying
/// file descriptor closes, including on an unclean process exit, so a
/// crash never leaves a stale lock behind.
struct DirLock {
    _file: File,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(".mantis.lock");
        let file = std::fs::OpenOptions::new().write(true).create(true).open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            DbError::InvalidConfig(format!(
                "directory '{}' is already locked by another engine instance",
                dir.display()
            ))
        })?;
        Ok(Self { _file: file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self._file.unlock();
    }
}

/// Background loops spawned by `Engine::open`, kept so the engine can
/// shut them down cleanly.
struct Background {
    sync_loop: Option<JoinHandle<()>>,
    rpo_monitor: JoinHandle<()>,
    rpo_metrics: JoinHandle<()>,
    auto_checkpoint: JoinHandle<()>,
}

pub struct Engine {
    lsn: Arc<LsnAllocator>,
    wal: Arc<WalManager>,
    index: Arc<Index>,
    cache: Arc<Cache>,
    checkpoints: Arc<CheckpointManager>,
    recovery: Arc<RecoveryEngine>,
    rpo: Arc<RpoController>,
    _wal_lock: DirLock,
    _checkpoint_lock: DirLock,
    background: std::sync::Mutex<Option<Background>>,
}

impl Engine {
    /// Open (or create) an engine rooted at `config.data_dir`, running
    /// startup recovery before returning so the index reflects every
    /// durable write as of the last clean or crash-recovered state.
    pub fn open(config: Config) -> Result<Arc<Self>> {
        Self::open_with_sink(config, Arc::new(LoggingAlertSink))
    }

    pub fn open_with_sink(config: Config, sink: Arc<dyn AlertSink>) -> Result<Arc<Self>> {
        let wal_dir = config.wal_dir();
        let checkpoint_dir = config.checkpoint_dir();

        let wal_lock = DirLock::acquire(&wal_dir)?;
        let checkpoint_lock = DirLock::acquire(&checkpoint_dir)?;

        let bootstrap_lsn = Arc::new(LsnAllocator::new(0));
        let wal = Arc::new(WalManager::open(&wal_dir, config.sync_policy.clone(), bootstrap_lsn.clone())?);
        bootstrap_lsn.reseed(wal.highest_persisted_lsn()?);
        let bootstrap_index = Arc::new(Index::new(bootstrap_lsn.clone()));
        let checkpoints = Arc::new(CheckpointManager::open(
            &checkpoint_dir,
            bootstrap_index,
            wal.clone(),
            bootstrap_lsn.clone(),
            config.retention.clone(),
            config.compression,
        )?);

        let recovery = Arc::new(RecoveryEngine::new(wal.clone(), checkpoints.clone(), bootstrap_lsn.clone()));
        let report = recovery.recover_latest()?;
        info!(
            applied_records = report.applied_records,
            base_checkpoint_lsn = report.base_checkpoint_lsn,
            highest_applied_lsn = report.highest_applied_lsn,
            "startup recovery complete"
        );

        let lsn = bootstrap_lsn;
        let index = report.index;
        let cache = Arc::new(Cache::new(config.cache.clone()));

        // Recreate the checkpoint manager bound to the recovered index,
        // since the bootstrap one above only existed to let recovery
        // read the on-disk catalog before the real index existed.
        let checkpoints = Arc::new(CheckpointManager::open(
            &checkpoint_dir,
            index.clone(),
            wal.clone(),
            lsn.clone(),
            config.retention.clone(),
            config.compression,
        )?);
        let recovery = Arc::new(RecoveryEngine::new(wal.clone(), checkpoints.clone(), lsn.clone()));

        let rpo = RpoController::new(wal.clone(), checkpoints.clone(), sink, config.rpo.clone())?;
        let (rpo_monitor, rpo_metrics) = rpo.spawn();

        let sync_loop = match &config.sync_policy {
            SyncPolicy::Periodic(period) => {
                Some(tokio::spawn(wal::run_periodic_sync_loop(wal.clone(), *period)))
            }
            _ => None,
        };

        // `checkpoint_frequency` is the single source of truth for the
        // periodic trigger's interval; `auto_checkpoint` only carries the
        // lsn-delta/poll knobs that rpo config has no equivalent for.
        let auto_checkpoint_config = AutoCheckpointConfig {
            interval: config.rpo.checkpoint_frequency,
            ..config.auto_checkpoint
        };
        let auto_checkpoint = tokio::spawn(checkpoint::run_auto_checkpoint_loop(
            checkpoints.clone(),
            auto_checkpoint_config,
        ));

        Ok(Arc::new(Self {
            lsn,
            wal,
            index,
            cache,
            checkpoints,
            recovery,
            rpo,
            _wal_lock: wal_lock,
            _checkpoint_lock: checkpoint_lock,
            background: std::sync::Mutex::new(Some(Background {
                sync_loop,
                rpo_monitor,
                rpo_metrics,
                auto_checkpoint,
            })),
        }))
    }

    pub fn shutdown(&self) {
        self.rpo.shutdown();
        if let Some(bg) = self.background.lock().unwrap().take() {
            if let Some(handle) = bg.sync_loop {
                handle.abort();
            }
            bg.rpo_monitor.abort();
            bg.rpo_metrics.abort();
            bg.auto_checkpoint.abort();
        }
    }

    // --- Index-backed data operations -----------------------------------

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(value) = self.cache.get(key) {
            return Some(value);
        }
        let value = self.index.get(key)?;
        self.cache.put(key.to_vec(), value.clone());
        Some(value)
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, ttl_millis: Option<u64>) -> Result<u64> {
        if key.is_empty() {
            return Err(DbError::InvalidArgument("key must not be empty".into()));
        }
        if self.rpo.is_read_only() {
            return Err(DbError::ReadOnly("writes are rejected while the rpo ceiling enforcement is latched".into()));
        }
        let lsn = self.wal.append_operation(OperationKind::Put {
            key: key.clone(),
            value: value.clone(),
            ttl_millis,
        })?;
        self.index.apply_put_at_lsn(
            key.clone(),
            value.clone(),
            lsn,
            ttl_millis.map(|ttl| now_millis().saturating_add(ttl)),
        );
        self.cache.put(key, value);
        Ok(lsn)
    }

    pub fn delete(&self, key: &[u8]) -> Result<u64> {
        if key.is_empty() {
            return Err(DbError::InvalidArgument("key must not be empty".into()));
        }
        if self.rpo.is_read_only() {
            return Err(DbError::ReadOnly("writes are rejected while the rpo ceiling enforcement is latched".into()));
        }
        let lsn = self.wal.append_operation(OperationKind::Delete { key: key.to_vec() })?;
        self.index.apply_delete_at_lsn(key.to_vec(), lsn);
        self.cache.invalidate(key);
        Ok(lsn)
    }

    pub fn scan(&self, range: KeyRange) -> ScanIter {
        self.index.scan(range)
    }

    /// Highest LSN minted so far, independent of what's been durably
    /// synced or checkpointed.
    pub fn current_lsn(&self) -> u64 {
        self.lsn.current()
    }

    pub fn snapshot_at_lsn(&self, lsn: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.index
            .snapshot_at_lsn(lsn)
            .into_iter()
            .map(|(key, entry)| (key, entry.value.clone()))
            .collect()
    }

    // --- Checkpoint operations --------------------------------------------

    pub fn create_checkpoint(&self, kind: CheckpointKindArg) -> Result<CheckpointMetadata> {
        match kind {
            CheckpointKindArg::Full => self.checkpoints.create_full(),
            CheckpointKindArg::Incremental(base_id) => self.checkpoints.create_incremental(&base_id),
            CheckpointKindArg::Snapshot => self.checkpoints.create_snapshot(),
        }
    }

    pub fn list_checkpoints(&self) -> Vec<CheckpointMetadata> {
        self.checkpoints.list()
    }

    pub fn get_checkpoint(&self, id: &str) -> Option<CheckpointMetadata> {
        self.checkpoints.get(id)
    }

    pub fn validate_checkpoint(&self, id: &str) -> Result<crate::checkpoint::ValidationReport> {
        self.checkpoints.validate(id)
    }

    pub fn delete_checkpoint(&self, id: &str) -> Result<()> {
        self.checkpoints.delete(id)
    }

    pub fn checkpoint_stats(&self) -> crate::checkpoint::CheckpointStats {
        self.checkpoints.stats()
    }

    // --- Recovery operations -----------------------------------------------

    pub fn recover_to_lsn(&self, target: u64) -> Result<Arc<Index>> {
        Ok(self.recovery.recover_to_lsn(target)?.index)
    }

    pub fn recover_to_timestamp(&self, timestamp_millis: u64) -> Result<Arc<Index>> {
        Ok(self.recovery.recover_to_timestamp(timestamp_millis)?.index)
    }

    // --- RPO operations ------------------------------------------------------

    pub fn check_compliance(&self) -> ComplianceStats {
        self.rpo.check_compliance()
    }

    pub fn rpo_stats(&self) -> ComplianceStats {
        self.rpo.get_stats()
    }

    pub fn rpo_violations(&self, active_only: bool) -> Vec<crate::alert::ViolationRecord> {
        self.rpo.get_violations(active_only)
    }

    pub fn update_rpo_config(&self, new: RpoConfig) -> Result<()> {
        self.rpo.update_config(new)
    }

    /// `true` once strict-mode enforcement has exhausted its retries and
    /// latched the engine read-only (spec.md §4.G escalation path).
    pub fn is_read_only(&self) -> bool {
        self.rpo.is_read_only()
    }
}

pub enum CheckpointKindArg {
    Full,
    Incremental(String),
    Snapshot,
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config {
            data_dir: dir.to_path_buf(),
            sync_policy: SyncPolicy::PerRecord,
            ..Config::default()
        };
        config.rpo.strict_mode = false;
        config
    }

    #[tokio::test]
    async fn open_put_get_roundtrips() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        engine.put(b"a".to_vec(), b"1".to_vec(), None).unwrap();
        assert_eq!(engine.get(b"a"), Some(b"1".to_vec()));
        engine.shutdown();
    }

    #[tokio::test]
    async fn reopening_a_locked_data_dir_fails() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        let second = Engine::open(test_config(dir.path()));
        assert!(second.is_err());
        engine.shutdown();
    }

    #[tokio::test]
    async fn recovery_rebuilds_state_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(test_config(dir.path())).unwrap();
            engine.put(b"x".to_vec(), b"1".to_vec(), None).unwrap();
            engine.shutdown();
        }
        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert_eq!(engine.get(b"x"), Some(b"1".to_vec()));
        engine.shutdown();
    }

    #[tokio::test]
    async fn checkpoint_then_delete_is_not_recoverable_by_id() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        engine.put(b"a".to_vec(), b"1".to_vec(), None).unwrap();
        let checkpoint = engine.create_checkpoint(CheckpointKindArg::Full).unwrap();
        engine.delete_checkpoint(&checkpoint.id).unwrap();
        assert!(engine.get_checkpoint(&checkpoint.id).is_none());
        engine.shutdown();
    }

    #[tokio::test]
    async fn empty_key_is_rejected_on_put_and_delete() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        assert!(matches!(engine.put(Vec::new(), b"1".to_vec(), None), Err(DbError::InvalidArgument(_))));
        assert!(matches!(engine.delete(b""), Err(DbError::InvalidArgument(_))));
        engine.shutdown();
    }

    #[tokio::test]
    async fn empty_value_is_permitted() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(test_config(dir.path())).unwrap();
        engine.put(b"a".to_vec(), Vec::new(), None).unwrap();
        assert_eq!(engine.get(b"a"), Some(Vec::new()));
        engine.shutdown();
    }
}
