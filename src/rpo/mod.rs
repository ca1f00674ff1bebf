// Supervisory loop that continuously enforces a data-loss ceiling: it
// observes WAL and checkpoint freshness, opens/escalates/closes
// violations, and — in `strict_mode` — is the only component in the
// system allowed to force a sync or a checkpoint outside their normal
// cadence.
//
// "Freshest" in the governing spec is read here as the *smaller* of
// (time since last WAL sync, time since last completed checkpoint):
// whichever durability action happened most recently sets the true
// bound on how much could be lost right now. Uncommitted-data age acts
// as a floor under that, for the degenerate case where neither signal
// is available yet. See DESIGN.md for the full reasoning.

use crate::alert::{Alert, AlertSeverity, AlertSink, RpoMetric, ViolationRecord};
use crate::checkpoint::CheckpointManager;
use crate::wal::WalManager;
use crate::{DbError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

pub const DEFAULT_VIOLATION_HISTORY: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpoLevel {
    Zero,
    Minimal,
    Low,
    Medium,
    High,
}

impl RpoLevel {
    /// Preset durations for this level. Individual `RpoConfig` fields set
    /// explicitly by the caller after `RpoConfig::for_level` override
    /// these.
    fn preset(self) -> (Duration, Duration, Duration) {
        // (max_data_loss, wal_sync_frequency, checkpoint_frequency)
        match self {
            RpoLevel::Zero => (Duration::ZERO, Duration::ZERO, Duration::from_secs(60)),
            RpoLevel::Minimal => (Duration::from_millis(100), Duration::from_millis(50), Duration::from_secs(30)),
            RpoLevel::Low => (Duration::from_secs(1), Duration::from_millis(250), Duration::from_secs(60)),
            RpoLevel::Medium => (Duration::from_secs(30), Duration::from_secs(5), Duration::from_secs(300)),
            RpoLevel::High => (Duration::from_secs(300), Duration::from_secs(30), Duration::from_secs(900)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpoConfig {
    pub level: RpoLevel,
    pub max_data_loss: Duration,
    pub checkpoint_frequency: Duration,
    pub wal_sync_frequency: Duration,
    pub monitoring_interval: Duration,
    pub alert_threshold: Duration,
    pub critical_threshold: Duration,
    pub strict_mode: bool,
    pub emergency_mode: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub metrics_interval: Duration,
}

impl RpoConfig {
    pub fn for_level(level: RpoLevel) -> Self {
        let (max_data_loss, wal_sync_frequency, checkpoint_frequency) = level.preset();
        Self {
            level,
            max_data_loss,
            checkpoint_frequency,
            wal_sync_frequency,
            monitoring_interval: Duration::from_secs(1),
            alert_threshold: max_data_loss.mul_f64(0.8),
            critical_threshold: max_data_loss,
            strict_mode: level == RpoLevel::Zero,
            emergency_mode: false,
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
            metrics_interval: Duration::from_secs(10),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.level == RpoLevel::Zero {
            if self.max_data_loss != Duration::ZERO {
                return Err(DbError::InvalidConfig(
                    "level Zero requires max_data_loss == 0".into(),
                ));
            }
            if self.wal_sync_frequency != Duration::ZERO {
                return Err(DbError::InvalidConfig(
                    "level Zero requires wal_sync_frequency == 0 (immediate sync)".into(),
                ));
            }
        }
        if self.alert_threshold > self.max_data_loss {
            return Err(DbError::InvalidConfig(
                "alert_threshold must be <= max_data_loss".into(),
            ));
        }
        if self.critical_threshold > self.max_data_loss {
            return Err(DbError::InvalidConfig(
                "critical_threshold must be <= max_data_loss".into(),
            ));
        }
        if self.critical_threshold < self.alert_threshold {
            return Err(DbError::InvalidConfig(
                "critical_threshold must be >= alert_threshold".into(),
            ));
        }
        if self.monitoring_interval == Duration::ZERO {
            return Err(DbError::InvalidConfig("monitoring_interval must be > 0".into()));
        }
        if self.metrics_interval == Duration::ZERO {
            return Err(DbError::InvalidConfig("metrics_interval must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComplianceStats {
    pub current_rpo_millis: u64,
    pub ceiling_millis: u64,
    pub checkpoint_age_millis: u64,
    pub wal_sync_age_millis: u64,
    pub active_violations: usize,
    pub total_violations_recorded: usize,
    pub compliance_ratio: f64,
    pub read_only: bool,
}

struct SyncPolicyFromConfig;

impl SyncPolicyFromConfig {
    fn resolve(cfg: &RpoConfig) -> crate::wal::SyncPolicy {
        if cfg.wal_sync_frequency == Duration::ZERO {
            crate::wal::SyncPolicy::PerRecord
        } else {
            crate::wal::SyncPolicy::Periodic(cfg.wal_sync_frequency)
        }
    }
}

/// Supervises WAL/checkpoint freshness against a configured ceiling. The
/// only component allowed to force a sync or checkpoint outside their
/// normal cadence (spec.md §4.G).
pub struct RpoController {
    wal: Arc<WalManager>,
    checkpoints: Arc<CheckpointManager>,
    sink: Arc<dyn AlertSink>,
    config: RwLock<RpoConfig>,
    violations: RwLock<VecDeque<ViolationRecord>>,
    open_violation: RwLock<Option<ViolationRecord>>,
    read_only: AtomicBool,
    consecutive_retries: AtomicU32,
    last_alert_at: Mutex<std::collections::HashMap<&'static str, std::time::Instant>>,
    compliant_ticks: AtomicU32,
    total_ticks: AtomicU32,
    stop: Arc<Notify>,
    stopped: AtomicBool,
}

impl RpoController {
    pub fn new(
        wal: Arc<WalManager>,
        checkpoints: Arc<CheckpointManager>,
        sink: Arc<dyn AlertSink>,
        config: RpoConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        wal.set_policy(SyncPolicyFromConfig::resolve(&config));
        Ok(Arc::new(Self {
            wal,
            checkpoints,
            sink,
            config: RwLock::new(config),
            violations: RwLock::new(VecDeque::with_capacity(DEFAULT_VIOLATION_HISTORY)),
            open_violation: RwLock::new(None),
            read_only: AtomicBool::new(false),
            consecutive_retries: AtomicU32::new(0),
            last_alert_at: Mutex::new(std::collections::HashMap::new()),
            compliant_ticks: AtomicU32::new(0),
            total_ticks: AtomicU32::new(0),
            stop: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Start the monitor and metrics background loops. Returns their
    /// join handles; dropping them does not stop the loops, call
    /// `shutdown` for that.
    pub fn spawn(self: &Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let monitor = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.monitor_loop().await })
        };
        let metrics = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.metrics_loop().await })
        };
        (monitor, metrics)
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop.notify_waiters();
    }

    async fn monitor_loop(self: Arc<Self>) {
        loop {
            let interval = self.config.read().monitoring_interval;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stop.notified() => break,
            }
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            if let Err(err) = self.tick().await {
                error!(?err, "rpo monitoring tick failed");
            }
        }
    }

    async fn metrics_loop(self: Arc<Self>) {
        loop {
            let interval = self.config.read().metrics_interval;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.stop.notified() => break,
            }
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            let stats = self.get_stats();
            let metric = RpoMetric {
                timestamp_millis: now_millis(),
                current_rpo_millis: stats.current_rpo_millis,
                ceiling_millis: stats.ceiling_millis,
                checkpoint_age_millis: stats.checkpoint_age_millis,
                wal_sync_age_millis: stats.wal_sync_age_millis,
                active_violations: stats.active_violations,
                compliance_ratio: stats.compliance_ratio,
            };
            if let Err(err) = self.sink.record_metric(&metric) {
                warn!(?err, "failed to record rpo metric");
            }
        }
    }

    /// One monitoring tick's worth of logic, exposed directly so tests
    /// and callers can drive it synchronously instead of waiting on the
    /// background loop.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<ComplianceStats> {
        let stats = self.check_compliance();
        let config = self.config.read().clone();
        self.total_ticks.fetch_add(1, Ordering::Relaxed);

        if stats.current_rpo_millis > config.alert_threshold.as_millis() as u64 {
            self.compliant_ticks.store(0, Ordering::Relaxed);
            self.open_or_escalate_violation(&stats, &config);
        } else {
            self.compliant_ticks.fetch_add(1, Ordering::Relaxed);
            self.maybe_close_violation();
        }

        if config.strict_mode && stats.current_rpo_millis > config.max_data_loss.as_millis() as u64 {
            self.enforce_strict_mode(&config).await?;
        } else {
            self.consecutive_retries.store(0, Ordering::Relaxed);
        }

        Ok(stats)
    }

    async fn enforce_strict_mode(&self, config: &RpoConfig) -> Result<()> {
        warn!("forcing wal sync to claw back rpo compliance");
        self.wal.sync()?;

        tokio::time::sleep(config.retry_delay).await;
        if self.check_compliance().current_rpo_millis <= config.max_data_loss.as_millis() as u64 {
            self.consecutive_retries.store(0, Ordering::Relaxed);
            return Ok(());
        }

        warn!("forcing full checkpoint to claw back rpo compliance");
        self.run_checkpoint_off_executor().await?;

        let retries = self.consecutive_retries.fetch_add(1, Ordering::Relaxed) + 1;
        if retries >= config.max_retries
            && self.check_compliance().current_rpo_millis > config.max_data_loss.as_millis() as u64
        {
            self.read_only.store(true, Ordering::Release);
            let alert = Alert {
                severity: AlertSeverity::Emergency,
                message: "rpo ceiling exceeded after exhausting retries; entering read-only mode".to_string(),
                timestamp_millis: now_millis(),
            };
            self.sink.send_alert(&alert)?;
            error!("entering read-only mode after exhausting rpo enforcement retries");
        }
        Ok(())
    }

    /// Runs a forced full checkpoint on tokio's blocking-task pool rather
    /// than the monitor loop's own executor thread, so a slow snapshot +
    /// fsync never stalls every other timer on this runtime (spec.md §5:
    /// "the checkpoint manager runs long operations on a dedicated thread
    /// pool").
    async fn run_checkpoint_off_executor(&self) -> Result<()> {
        let checkpoints = self.checkpoints.clone();
        tokio::task::spawn_blocking(move || checkpoints.create_full())
            .await
            .map_err(|e| DbError::Internal(format!("checkpoint task panicked: {e}")))?
    }

    fn open_or_escalate_violation(&self, stats: &ComplianceStats, config: &RpoConfig) {
        let severity = if stats.current_rpo_millis > config.critical_threshold.as_millis() as u64 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Major
        };

        {
            let mut open = self.open_violation.write();
            match open.as_mut() {
                Some(existing) => existing.severity = existing.severity.max(severity),
                None => {
                    *open = Some(ViolationRecord {
                        timestamp_millis: now_millis(),
                        measured_rpo_millis: stats.current_rpo_millis,
                        ceiling_millis: config.max_data_loss.as_millis() as u64,
                        severity,
                        resolved: false,
                        resolved_at_millis: None,
                        cause: "measured rpo exceeded alert threshold".to_string(),
                    });
                }
            }
        }

        if self.should_send_alert(severity, config.monitoring_interval) {
            let alert = Alert {
                severity,
                message: format!(
                    "rpo violation: measured {}ms exceeds ceiling {}ms",
                    stats.current_rpo_millis,
                    config.max_data_loss.as_millis()
                ),
                timestamp_millis: now_millis(),
            };
            let _ = self.sink.send_alert(&alert);
        }
    }

    fn should_send_alert(&self, severity: AlertSeverity, min_interval: Duration) -> bool {
        let key = match severity {
            AlertSeverity::Critical => "critical",
            AlertSeverity::Major => "major",
            AlertSeverity::Emergency => "emergency",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Info => "info",
        };
        let mut last = self.last_alert_at.lock();
        let now = std::time::Instant::now();
        match last.get(key) {
            Some(prev) if now.duration_since(*prev) < min_interval => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }

    fn maybe_close_violation(&self) {
        let mut open = self.open_violation.write();
        if let Some(mut violation) = open.take() {
            violation.resolved = true;
            violation.resolved_at_millis = Some(now_millis());
            let mut history = self.violations.write();
            if history.len() >= DEFAULT_VIOLATION_HISTORY {
                history.pop_front();
            }
            let _ = self.sink.record_violation(&violation);
            history.push_back(violation);
        }
    }

    /// Synchronous freshness computation used by `tick` and exposed
    /// directly for callers (e.g. an admin surface) that want a
    /// point-in-time read without waiting on the monitor loop.
    pub fn check_compliance(&self) -> ComplianceStats {
        let now = now_millis();
        let config = self.config.read();

        let wal_sync_age_millis = self
            .wal
            .last_synced_at()
            .map(|t| t.elapsed().as_millis() as u64);
        let checkpoint_age_millis = self
            .checkpoints
            .last_completed_at_millis()
            .map(|at| now.saturating_sub(at));
        let uncommitted_age_millis = self.wal.uncommitted_data_age().map(|d| d.as_millis() as u64).unwrap_or(0);

        let primary = match (wal_sync_age_millis, checkpoint_age_millis) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => 0,
        };
        let current_rpo_millis = primary.max(uncommitted_age_millis);

        let active_violations = if self.open_violation.read().is_some() { 1 } else { 0 };
        let total_ticks = self.total_ticks.load(Ordering::Relaxed).max(1);
        let compliance_ratio = self.compliant_ticks.load(Ordering::Relaxed) as f64 / total_ticks as f64;

        ComplianceStats {
            current_rpo_millis,
            ceiling_millis: config.max_data_loss.as_millis() as u64,
            checkpoint_age_millis: checkpoint_age_millis.unwrap_or(0),
            wal_sync_age_millis: wal_sync_age_millis.unwrap_or(0),
            active_violations,
            total_violations_recorded: self.violations.read().len(),
            compliance_ratio,
            read_only: self.read_only.load(Ordering::Acquire),
        }
    }

    pub fn get_stats(&self) -> ComplianceStats {
        self.check_compliance()
    }

    pub fn get_violations(&self, active_only: bool) -> Vec<ViolationRecord> {
        if active_only {
            self.open_violation.read().iter().cloned().collect()
        } else {
            self.violations.read().iter().cloned().collect()
        }
    }

    pub fn update_config(&self, new: RpoConfig) -> Result<()> {
        new.validate()?;
        self.wal.set_policy(SyncPolicyFromConfig::resolve(&new));
        *self.config.write() = new;
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Operator action clearing an emergency read-only latch once the
    /// underlying condition (disk space, hardware) has been addressed.
    pub fn clear_read_only(&self) {
        self.read_only.store(false, Ordering::Release);
        self.consecutive_retries.store(0, Ordering::Relaxed);
        info!("read-only mode cleared by operator");
    }
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::RecordingAlertSink;
    use crate::checkpoint::{CompressionAlgorithm, RetentionPolicy};
    use crate::index::Index;
    use crate::lsn::LsnAllocator;
    use crate::wal::SyncPolicy;
    use tempfile::tempdir;

    fn controller(config: RpoConfig) -> (Arc<RpoController>, Arc<RecordingAlertSink>, Arc<WalManager>) {
        let dir = tempdir().unwrap();
        let lsn = Arc::new(LsnAllocator::new(0));
        let wal = Arc::new(WalManager::open(dir.path().join("wal"), SyncPolicy::PerRecord, lsn.clone()).unwrap());
        let index = Arc::new(Index::new(lsn.clone()));
        let checkpoints = Arc::new(
            CheckpointManager::open(
                dir.path().join("checkpoints"),
                index,
                wal.clone(),
                lsn,
                RetentionPolicy::default(),
                CompressionAlgorithm::Raw,
            )
            .unwrap(),
        );
        let sink = Arc::new(RecordingAlertSink::new());
        let ctrl = RpoController::new(wal.clone(), checkpoints, sink.clone(), config).unwrap();
        (ctrl, sink, wal)
    }

    #[test]
    fn zero_level_requires_zero_max_data_loss() {
        let mut config = RpoConfig::for_level(RpoLevel::Zero);
        config.max_data_loss = Duration::from_millis(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn critical_must_be_at_least_alert_threshold() {
        let mut config = RpoConfig::for_level(RpoLevel::Medium);
        config.alert_threshold = Duration::from_secs(10);
        config.critical_threshold = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn compliant_tick_does_not_open_a_violation() {
        let mut config = RpoConfig::for_level(RpoLevel::Medium);
        config.strict_mode = false;
        let (ctrl, _sink, wal) = controller(config);
        wal.sync().unwrap();
        let stats = ctrl.tick().await.unwrap();
        assert_eq!(stats.active_violations, 0);
    }

    #[tokio::test]
    async fn stale_sync_opens_a_violation_and_alerts() {
        let mut config = RpoConfig::for_level(RpoLevel::Minimal);
        config.strict_mode = false;
        config.alert_threshold = Duration::from_millis(1);
        config.critical_threshold = Duration::from_millis(50);
        config.max_data_loss = Duration::from_millis(100);
        let (ctrl, sink, _wal) = controller(config);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let stats = ctrl.tick().await.unwrap();
        assert_eq!(stats.active_violations, 1);
        assert!(!sink.alerts().is_empty());
    }

    #[tokio::test]
    async fn strict_mode_forces_sync_on_breach() {
        let mut config = RpoConfig::for_level(RpoLevel::Minimal);
        config.strict_mode = true;
        config.max_data_loss = Duration::from_millis(1);
        config.alert_threshold = Duration::from_millis(1);
        config.critical_threshold = Duration::from_millis(1);
        config.retry_delay = Duration::from_millis(1);
        config.max_retries = 1;
        let (ctrl, _sink, wal) = controller(config);

        wal.append(&crate::wal::Record::put(1, b"a".to_vec(), b"1".to_vec(), None)).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        ctrl.tick().await.unwrap();
        assert!(wal.last_durable_lsn() >= 1);
    }
}
