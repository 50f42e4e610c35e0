use anyhow::{Context, Result};
use postcopy_mmsafety::config::Settings;
use postcopy_mmsafety::error::HarnessError;
use postcopy_mmsafety::instance::QemuLauncher;
use postcopy_mmsafety::orchestrator::{Orchestrator, Verdict};
use postcopy_mmsafety::uffd;
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::{info, warn};

const WORK_DIR_PREFIX: &str = "postcopy-mmsafety-";

/// Run the migration test once and return the process exit code.
pub async fn run_migration(
    config_path: PathBuf,
    source_port: Option<u16>,
    dest_port: Option<u16>,
    keep_workdir: bool,
) -> Result<i32> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?
        .with_ports(source_port, dest_port);
    settings
        .validate()
        .with_context(|| format!("Invalid config in {}", config_path.display()))?;

    let support = uffd::probe();
    info!("Host check: {}", support);

    let work_dir = create_work_dir(&settings)?;
    info!("Work directory: {}", work_dir.path().display());
    info!(
        "Migrating {} -> {} (relay: {})",
        settings.migration.outbound_uri, settings.migration.incoming_uri, settings.migration.relay
    );

    let launcher = QemuLauncher::new(settings.timeouts.launch());
    let orchestrator = Orchestrator::from_settings(launcher, &settings, work_dir.path());

    // Dropping the run on Ctrl-C kills both emulators.
    let verdict = tokio::select! {
        verdict = orchestrator.run_suite(support) => verdict,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, tearing down instances");
            Verdict::Fail(HarnessError::Cancelled)
        }
    };

    if keep_workdir {
        let path = work_dir.keep();
        info!("Keeping work directory {}", path.display());
    } else if let Err(e) = work_dir.close() {
        warn!("Failed to remove work directory: {}", e);
    }

    match &verdict {
        Verdict::Pass(report) => println!(
            "✓ PASS: postcopy migration completed ({} status polls, {} events observed)",
            report.polls,
            report.events.len()
        ),
        Verdict::Skip(support) => println!("ℹ SKIP: {}", support),
        Verdict::Fail(e) => {
            eprintln!("✗ FAIL: {}", e);
            if let Some(phase) = e.phase() {
                eprintln!("  failed during phase: {}", phase);
            }
        }
    }

    Ok(verdict.exit_code())
}

fn create_work_dir(settings: &Settings) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(WORK_DIR_PREFIX);
    match &settings.work_dir {
        Some(base) => {
            std::fs::create_dir_all(base)
                .with_context(|| format!("Failed to create {}", base.display()))?;
            builder
                .tempdir_in(base)
                .with_context(|| format!("Failed to create work directory in {}", base.display()))
        }
        None => builder
            .tempdir()
            .context("Failed to create temporary work directory"),
    }
}
