// Crate-level end-to-end scenarios driving the fully wired `Engine`
// rather than individual module internals.

use mantis_core::alert::{AlertSink, RecordingAlertSink};
use mantis_core::checkpoint::{AutoCheckpointConfig, RetentionPolicy};
use mantis_core::engine::CheckpointKindArg;
use mantis_core::rpo::{RpoConfig, RpoLevel};
use mantis_core::wal::SyncPolicy;
use mantis_core::{Config, DbError, Engine};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn base_config(dir: &std::path::Path) -> Config {
    let mut config = Config {
        data_dir: dir.to_path_buf(),
        sync_policy: SyncPolicy::PerRecord,
        ..Config::default()
    };
    config.rpo.strict_mode = false;
    config
}

#[tokio::test]
async fn basic_durability_survives_a_clean_restart() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(base_config(dir.path())).unwrap();
        engine.put(b"k1".to_vec(), b"v1".to_vec(), None).unwrap();
        engine.put(b"k2".to_vec(), b"v2".to_vec(), None).unwrap();
        assert_eq!(engine.get(b"k1"), Some(b"v1".to_vec()));
        engine.shutdown();
    }

    let engine = Engine::open(base_config(dir.path())).unwrap();
    assert_eq!(engine.get(b"k1"), Some(b"v1".to_vec()));
    assert_eq!(engine.get(b"k2"), Some(b"v2".to_vec()));
    engine.shutdown();
}

#[tokio::test]
async fn crash_mid_append_recovers_only_the_synced_prefix() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(base_config(dir.path())).unwrap();
        engine.put(b"a".to_vec(), b"1".to_vec(), None).unwrap();
        engine.put(b"b".to_vec(), b"2".to_vec(), None).unwrap();
        engine.shutdown();
    }

    // Simulate a crash mid-append: append a length prefix with a torn
    // payload directly onto the active wal segment file.
    let wal_dir = dir.path().join("wal");
    let mut segment_path = None;
    for entry in std::fs::read_dir(&wal_dir).unwrap() {
        let entry = entry.unwrap();
        if entry.file_name().to_string_lossy().ends_with(".log") {
            segment_path = Some(entry.path());
        }
    }
    let segment_path = segment_path.expect("a wal segment must exist");
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&segment_path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(b"torn").unwrap();
    }

    // Recovery must not error on the torn tail; it should simply stop
    // replaying at the last well-formed frame.
    let engine = Engine::open(base_config(dir.path())).unwrap();
    assert_eq!(engine.get(b"a"), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"b"), Some(b"2".to_vec()));
    engine.shutdown();
}

#[tokio::test]
async fn checkpoint_then_replay_recovers_both_sides_of_the_boundary() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(base_config(dir.path())).unwrap();
        engine.put(b"before".to_vec(), b"1".to_vec(), None).unwrap();
        engine.create_checkpoint(CheckpointKindArg::Full).unwrap();
        engine.put(b"after".to_vec(), b"2".to_vec(), None).unwrap();
        engine.shutdown();
    }

    let engine = Engine::open(base_config(dir.path())).unwrap();
    assert_eq!(engine.get(b"before"), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"after"), Some(b"2".to_vec()));
    engine.shutdown();
}

#[tokio::test]
async fn retention_never_drops_below_the_configured_minimum() {
    let dir = tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.retention = RetentionPolicy {
        min_checkpoints: 2,
        max_checkpoints: 2,
        max_disk_usage_bytes: u64::MAX,
        retention_period: Duration::from_secs(3600),
    };
    let engine = Engine::open(config).unwrap();
    engine.put(b"k".to_vec(), b"v".to_vec(), None).unwrap();

    for _ in 0..5 {
        engine.create_checkpoint(CheckpointKindArg::Full).unwrap();
    }

    assert!(engine.list_checkpoints().len() >= 2);
    engine.shutdown();
}

#[tokio::test]
async fn sustained_rpo_breach_opens_a_violation_and_alerts() {
    let dir = tempdir().unwrap();
    let mut config = base_config(dir.path());
    // No periodic sync wired at the wal-manager level, so uncommitted
    // data keeps aging until the rpo controller itself forces a sync.
    config.sync_policy = SyncPolicy::Periodic(Duration::from_secs(3600));
    config.rpo = RpoConfig::for_level(RpoLevel::Minimal);
    config.rpo.strict_mode = false;
    config.rpo.max_data_loss = Duration::from_millis(200);
    config.rpo.alert_threshold = Duration::from_millis(1);
    config.rpo.critical_threshold = Duration::from_millis(50);
    config.rpo.monitoring_interval = Duration::from_millis(20);
    config.rpo.metrics_interval = Duration::from_secs(10);

    let sink = Arc::new(RecordingAlertSink::new());
    let engine = Engine::open_with_sink(config, sink.clone() as Arc<dyn AlertSink>).unwrap();
    engine.put(b"k".to_vec(), b"v".to_vec(), None).unwrap();

    // A handful of ticks is enough for the unsynced write to cross the
    // alert threshold and for the controller to open a violation.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(engine.rpo_stats().active_violations, 1);
    assert!(!sink.alerts().is_empty(), "an alert should have been emitted for the open violation");
    engine.shutdown();
}

#[tokio::test]
async fn strict_mode_forces_a_sync_to_restore_compliance() {
    let dir = tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.sync_policy = SyncPolicy::Periodic(Duration::from_secs(3600));
    config.rpo = RpoConfig::for_level(RpoLevel::Minimal);
    config.rpo.strict_mode = true;
    config.rpo.max_data_loss = Duration::from_millis(50);
    config.rpo.alert_threshold = Duration::from_millis(1);
    config.rpo.critical_threshold = Duration::from_millis(50);
    config.rpo.monitoring_interval = Duration::from_millis(20);
    config.rpo.metrics_interval = Duration::from_secs(10);
    config.rpo.retry_delay = Duration::from_millis(5);

    let engine = Engine::open(config).unwrap();
    engine.put(b"k".to_vec(), b"v".to_vec(), None).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    // Strict mode forces its own sync on breach; the engine should have
    // come back into compliance well before the conservative check below,
    // and writes must still be accepted (no escalation to read-only).
    assert!(engine.put(b"k2".to_vec(), b"v2".to_vec(), None).is_ok());
    assert!(!engine.is_read_only());
    engine.shutdown();
}

#[tokio::test]
async fn a_burst_of_writes_triggers_an_automatic_checkpoint_via_lsn_delta() {
    let dir = tempdir().unwrap();
    let mut config = base_config(dir.path());
    // A long periodic interval isolates the lsn-delta trigger: only a
    // burst of writes past the delta should produce a checkpoint here.
    config.rpo.checkpoint_frequency = Duration::from_secs(3600);
    config.auto_checkpoint = AutoCheckpointConfig {
        interval: Duration::from_secs(3600),
        lsn_delta: 5,
        poll_interval: Duration::from_millis(10),
    };

    let engine = Engine::open(config).unwrap();
    assert!(engine.list_checkpoints().is_empty());
    for i in 0..10u32 {
        engine.put(i.to_be_bytes().to_vec(), b"v".to_vec(), None).unwrap();
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        !engine.list_checkpoints().is_empty(),
        "the lsn-delta trigger should have produced at least one automatic checkpoint"
    );
    engine.shutdown();
}

#[tokio::test]
async fn point_in_time_recovery_before_any_checkpoint_is_rejected() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(base_config(dir.path())).unwrap();
    engine.put(b"a".to_vec(), b"1".to_vec(), None).unwrap();

    let result = engine.recover_to_lsn(1);
    assert!(matches!(result, Err(DbError::NoViableCheckpoint(_))));

    let result = engine.recover_to_timestamp(0);
    assert!(matches!(result, Err(DbError::NoViableCheckpoint(_))));
    engine.shutdown();
}
