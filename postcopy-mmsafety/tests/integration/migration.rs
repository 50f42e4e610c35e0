//! End-to-end runs of the orchestrator against scripted instances.
//!
//! These tests verify:
//! 1. A postcopy run walks every phase, sees STOP before RESUME and reaches
//!    `completed`
//! 2. A STOP absorbed while switching to postcopy is not waited for again
//! 3. `failed` aborts the run without another status poll or any cleanup
//! 4. Boot, command and completion failures name the phase they happened in
//! 5. Unsupported hosts skip without launching anything
//! 6. The relay carries migration traffic to the incoming endpoint

use crate::emulator::{Boot, FakeLauncher, Script};
use postcopy_mmsafety::config::Settings;
use postcopy_mmsafety::error::{HarnessError, WaitBound};
use postcopy_mmsafety::instance::{InstanceSpec, Role};
use postcopy_mmsafety::orchestrator::{Orchestrator, RunOptions, Verdict};
use postcopy_mmsafety::phase::Phase;
use postcopy_mmsafety::qmp::MigrationStatus;
use postcopy_mmsafety::qmp::protocol::{EVENT_RESUME, EVENT_STOP};
use postcopy_mmsafety::uffd::Support;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Helper to build settings that never touch a fixed outbound port.
fn test_settings() -> Settings {
    let mut settings = Settings::generate_default().with_ports(Some(0), Some(4445));
    settings.emulator.boot_image = "/images/geniux.img".into();
    settings.timeouts.boot_secs = 5;
    settings.timeouts.event_secs = 5;
    settings.timeouts.reply_secs = 5;
    settings.timeouts.completion_secs = 5;
    settings.validate().unwrap();
    settings
}

fn orchestrator(
    launcher: &FakeLauncher,
    settings: &Settings,
    dir: &TempDir,
) -> Orchestrator<FakeLauncher> {
    Orchestrator::from_settings(launcher.clone(), settings, dir.path())
}

fn serial(dir: &TempDir, role: Role) -> std::path::PathBuf {
    dir.path().join(role.serial_file_name())
}

/// Test: a full postcopy run passes.
///
/// Phases run in order, STOP on the source is seen before RESUME on the
/// destination, status polling ends at `completed` and both serial logs
/// are removed.
#[tokio::test]
async fn test_postcopy_run_completes() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new(Script::default());
    let settings = test_settings();

    let report = orchestrator(&launcher, &settings, &dir).run().await.unwrap();

    assert_eq!(report.phases, Phase::ALL);
    assert_eq!(report.final_status, Some(MigrationStatus::Completed));
    assert_eq!(report.polls, 4);

    let stop = report
        .events
        .iter()
        .position(|e| e.role == Role::Source && e.event.name == EVENT_STOP)
        .expect("STOP recorded");
    let resume = report
        .events
        .iter()
        .position(|e| e.role == Role::Destination && e.event.name == EVENT_RESUME)
        .expect("RESUME recorded");
    assert!(stop < resume);

    // `quit` may or may not have been read by the time run() returns.
    let executed = launcher.executed(Role::Source);
    assert_eq!(
        executed[..9],
        [
            "qmp_capabilities",
            "migrate-set-capabilities",
            "migrate-set-parameters",
            "migrate",
            "migrate-start-postcopy",
            "query-migrate",
            "query-migrate",
            "query-migrate",
            "query-migrate",
        ]
    );
    let executed = launcher.executed(Role::Destination);
    assert_eq!(executed[..2], ["qmp_capabilities", "migrate-set-capabilities"]);

    let source = launcher.commands(Role::Source);
    assert_eq!(
        source[1].arguments,
        json!({ "capabilities": [{ "capability": "postcopy-ram", "state": true }] })
    );
    assert_eq!(
        source[2].arguments,
        json!({ "max-bandwidth": 10_000_000, "downtime-limit": 1 })
    );

    assert!(!serial(&dir, Role::Source).exists());
    assert!(!serial(&dir, Role::Destination).exists());
}

/// Test: STOP arriving ahead of the postcopy reply is enough.
///
/// The event is absorbed while fetching the reply, so AwaitingStop must not
/// block on another one (it would time out if it did).
#[tokio::test]
async fn test_stop_absorbed_during_postcopy_switch() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new(Script {
        stop_before_postcopy_reply: true,
        ..Script::default()
    });
    let mut settings = test_settings();
    settings.timeouts.event_secs = 2;

    let report = tokio::time::timeout(
        Duration::from_secs(1),
        orchestrator(&launcher, &settings, &dir).run(),
    )
    .await
    .expect("run waited for a second STOP")
    .unwrap();

    let stops = report
        .events
        .iter()
        .filter(|e| e.event.name == EVENT_STOP)
        .count();
    assert_eq!(stops, 1);
    assert!(report.phases.contains(&Phase::AwaitingStop));
    assert_eq!(report.final_status, Some(MigrationStatus::Completed));
}

/// Test: `failed` is fatal on first sight.
///
/// No further `query-migrate` is sent and cleanup never runs, so the serial
/// logs stay behind.
#[tokio::test]
async fn test_failed_status_aborts_without_repoll() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new(Script {
        statuses: vec!["active", "failed", "completed"],
        ..Script::default()
    });
    let settings = test_settings();

    let err = orchestrator(&launcher, &settings, &dir)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HarnessError::ProtocolViolation {
            phase: Phase::AwaitingCompletion,
            ..
        }
    ));
    assert!(err.to_string().contains("failed"));
    assert_eq!(launcher.count(Role::Source, "query-migrate"), 2);
    assert!(serial(&dir, Role::Source).exists());
    assert!(serial(&dir, Role::Destination).exists());
}

/// Test: a first serial byte other than the sentinel stops the run before
/// migrating.
#[tokio::test]
async fn test_unexpected_boot_byte() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new(Script {
        boot: Boot::Garbage(b'X'),
        ..Script::default()
    });

    let err = orchestrator(&launcher, &test_settings(), &dir)
        .run()
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HarnessError::ProtocolViolation {
            phase: Phase::AwaitingBoot,
            ..
        }
    ));
    assert_eq!(err.phase(), Some(Phase::AwaitingBoot));
    assert_eq!(launcher.count(Role::Source, "migrate"), 0);
}

/// Test: an error reply is a protocol violation in the phase that sent the
/// command.
#[tokio::test]
async fn test_error_reply_names_phase() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new(Script {
        fail_command: Some((Role::Destination, "migrate-set-capabilities")),
        ..Script::default()
    });

    let err = orchestrator(&launcher, &test_settings(), &dir)
        .run()
        .await
        .unwrap_err();

    match err {
        HarnessError::ProtocolViolation { phase, detail } => {
            assert_eq!(phase, Phase::Configuring);
            assert!(detail.contains("destination"));
            assert!(detail.contains("scripted failure"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(launcher.count(Role::Source, "migrate-set-parameters"), 0);
}

/// Test: a migration that never completes times out instead of polling
/// forever.
#[tokio::test]
async fn test_completion_times_out() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new(Script {
        statuses: vec!["postcopy-active"],
        ..Script::default()
    });
    let settings = test_settings();
    let mut options = RunOptions::from_settings(&settings);
    options.completion_timeout = Duration::from_millis(200);
    options.poll_interval = Duration::from_millis(1);

    let source = InstanceSpec::new(Role::Source, &settings.emulator, dir.path());
    let destination = InstanceSpec::new(Role::Destination, &settings.emulator, dir.path())
        .with_incoming(settings.migration.incoming_uri.clone());
    let err = Orchestrator::new(launcher.clone(), options, source, destination)
        .run()
        .await
        .unwrap_err();

    match err {
        HarnessError::Timeout {
            phase,
            waiting_for,
            bound,
        } => {
            assert_eq!(phase, Phase::AwaitingCompletion);
            assert!(waiting_for.contains("postcopy-active"));
            assert_eq!(bound, WaitBound::Elapsed(Duration::from_millis(200)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(launcher.count(Role::Source, "query-migrate") > 1);
}

/// Test: the legacy command dialect sends speed and downtime separately.
#[tokio::test]
async fn test_legacy_commands() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new(Script::default());
    let mut settings = test_settings();
    settings.migration.legacy_commands = true;

    orchestrator(&launcher, &settings, &dir).run().await.unwrap();

    let source = launcher.commands(Role::Source);
    let speed = source
        .iter()
        .find(|c| c.execute == "migrate_set_speed")
        .unwrap();
    assert_eq!(speed.arguments, json!({ "value": 10_000_000 }));
    let downtime = source
        .iter()
        .find(|c| c.execute == "migrate_set_downtime")
        .unwrap();
    assert_eq!(downtime.arguments, json!({ "value": 0.0000001 }));
    assert_eq!(launcher.count(Role::Source, "migrate-set-parameters"), 0);
}

/// Test: an unsupported host is a skip with zero instances started.
#[tokio::test]
async fn test_unsupported_host_skips() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new(Script::default());

    let verdict = orchestrator(&launcher, &test_settings(), &dir)
        .run_suite(Support::MissingIoctls { ioctls: 0 })
        .await;

    assert!(matches!(verdict, Verdict::Skip(_)));
    assert_eq!(verdict.exit_code(), 0);
    assert_eq!(launcher.launches(), 0);
}

/// Test: a supported host runs the migration and passes.
#[tokio::test]
async fn test_supported_host_passes() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new(Script::default());

    let verdict = orchestrator(&launcher, &test_settings(), &dir)
        .run_suite(Support::Supported)
        .await;

    assert!(matches!(verdict, Verdict::Pass(_)));
    assert_eq!(verdict.exit_code(), 0);
    assert_eq!(launcher.launches(), 2);
}

/// Test: the relay listens on a free port and forwards to the destination.
#[tokio::test]
async fn test_relay_forwards_migration_stream() {
    let dir = TempDir::new().unwrap();
    let incoming = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let incoming_port = incoming.local_addr().unwrap().port();
    let launcher = FakeLauncher::new(Script {
        connect_on_migrate: true,
        ..Script::default()
    });
    let settings = test_settings().with_ports(Some(0), Some(incoming_port));

    let received = tokio::spawn(async move {
        let (mut stream, _) = incoming.accept().await.unwrap();
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(b"!").await.unwrap();
        buf
    });

    orchestrator(&launcher, &settings, &dir).run().await.unwrap();

    let migrate = launcher
        .commands(Role::Source)
        .into_iter()
        .find(|c| c.execute == "migrate")
        .unwrap();
    let uri = migrate.arguments["uri"].as_str().unwrap().to_string();
    assert!(uri.starts_with("tcp:127.0.0.1:"));
    assert!(!uri.ends_with(":0"));
    assert_ne!(uri, format!("tcp:127.0.0.1:{incoming_port}"));

    let bytes = tokio::time::timeout(Duration::from_secs(5), received)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&bytes, b"RAM");
}

#[test]
fn test_work_dir_layout() {
    let settings = test_settings();
    let spec = InstanceSpec::new(Role::Source, &settings.emulator, Path::new("/run/pm"));
    assert_eq!(spec.serial_path, Path::new("/run/pm/src_serial"));
    assert_eq!(spec.qmp_socket, Path::new("/run/pm/src.qmp"));
}
