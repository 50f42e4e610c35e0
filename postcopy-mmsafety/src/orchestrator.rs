//! Drives a source and a destination instance through one postcopy
//! migration.
//!
//! The run is strictly sequential: every phase issues commands on one
//! connection at a time and waits for the reply before going on. Events that
//! show up while waiting are recorded in the run's [`RunContext`].

use crate::config::Settings;
use crate::error::{HarnessError, WaitBound};
use crate::instance::{Instance, InstanceLauncher, InstanceSpec, Role};
use crate::phase::Phase;
use crate::qmp::protocol::{EVENT_RESUME, EVENT_STOP};
use crate::qmp::{EventFilter, MigrationStatus, ObservedEvent, Request, RunContext, commands};
use crate::relay::{MigrationRelay, RelayHandle};
use crate::serial::{BOOT_SENTINEL, SerialWatcher, remove_serial_file};
use crate::uffd::Support;
use crate::uri::MigrationUri;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Knobs for a single run, resolved from [`Settings`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub outbound_uri: MigrationUri,
    pub incoming_uri: MigrationUri,
    pub max_bandwidth: u64,
    pub downtime_limit_secs: f64,
    pub legacy_commands: bool,
    pub relay: bool,
    pub reply_timeout: Duration,
    pub boot_timeout: Duration,
    pub event_timeout: Duration,
    pub completion_timeout: Duration,
    pub poll_interval: Duration,
    pub serial_poll_interval: Duration,
    pub max_events_per_reply: usize,
    pub shutdown_grace: Duration,
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let migration = &settings.migration;
        let timeouts = &settings.timeouts;
        Self {
            outbound_uri: migration.outbound_uri.clone(),
            incoming_uri: migration.incoming_uri.clone(),
            max_bandwidth: migration.max_bandwidth,
            downtime_limit_secs: migration.downtime_limit_secs,
            legacy_commands: migration.legacy_commands,
            relay: migration.relay,
            reply_timeout: timeouts.reply(),
            boot_timeout: timeouts.boot(),
            event_timeout: timeouts.event(),
            completion_timeout: timeouts.completion(),
            poll_interval: timeouts.poll_interval(),
            serial_poll_interval: timeouts.serial_poll(),
            max_events_per_reply: timeouts.max_events_per_reply,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    /// Phases in the order they were entered.
    pub phases: Vec<Phase>,
    pub events: Vec<ObservedEvent>,
    /// Number of `query-migrate` round-trips.
    pub polls: u64,
    pub final_status: Option<MigrationStatus>,
}

impl RunReport {
    fn enter(&mut self, phase: Phase) {
        info!("Entering phase {}", phase);
        self.phases.push(phase);
    }
}

/// Outcome of a whole suite run.
#[derive(Debug)]
pub enum Verdict {
    Pass(RunReport),
    Skip(Support),
    Fail(HarnessError),
}

impl Verdict {
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Pass(_) | Verdict::Skip(_) => 0,
            Verdict::Fail(_) => 1,
        }
    }
}

impl From<Result<RunReport, HarnessError>> for Verdict {
    fn from(result: Result<RunReport, HarnessError>) -> Self {
        match result {
            Ok(report) => Verdict::Pass(report),
            Err(HarnessError::EnvironmentUnsupported(support)) => Verdict::Skip(support),
            Err(e) => Verdict::Fail(e),
        }
    }
}

pub struct Orchestrator<L> {
    launcher: L,
    options: RunOptions,
    source: InstanceSpec,
    destination: InstanceSpec,
}

impl<L: InstanceLauncher> Orchestrator<L> {
    pub fn new(
        launcher: L,
        options: RunOptions,
        source: InstanceSpec,
        destination: InstanceSpec,
    ) -> Self {
        Self {
            launcher,
            options,
            source,
            destination,
        }
    }

    /// Build both instance specs from the config, placing serial logs and
    /// QMP sockets under `work_dir`.
    pub fn from_settings(launcher: L, settings: &Settings, work_dir: &Path) -> Self {
        let source = InstanceSpec::new(Role::Source, &settings.emulator, work_dir);
        let destination = InstanceSpec::new(Role::Destination, &settings.emulator, work_dir)
            .with_incoming(settings.migration.incoming_uri.clone());
        Self::new(
            launcher,
            RunOptions::from_settings(settings),
            source,
            destination,
        )
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run the migration if the host can do postcopy, otherwise skip
    /// without launching anything.
    pub async fn run_suite(&self, support: Support) -> Verdict {
        let result = if support.is_supported() {
            self.run().await
        } else {
            warn!("Skipping postcopy migration test: {}", support);
            Err(HarnessError::EnvironmentUnsupported(support))
        };
        Verdict::from(result)
    }

    pub async fn run(&self) -> Result<RunReport, HarnessError> {
        let mut report = RunReport::default();
        let mut ctx = RunContext::new();

        report.enter(Phase::Init);
        let mut source = self.launch(&self.source).await?;
        let mut destination = match self.launch(&self.destination).await {
            Ok(destination) => destination,
            Err(e) => {
                source.shutdown(self.options.shutdown_grace).await;
                return Err(e);
            }
        };

        let mut relay = None;
        let outcome = self
            .drive(
                &mut source,
                &mut destination,
                &mut relay,
                &mut ctx,
                &mut report,
            )
            .await;

        if let Some(relay) = relay {
            relay.stop().await;
        }

        match outcome {
            Ok(status) => {
                report.final_status = Some(status);
                report.enter(Phase::Cleanup);
                self.cleanup(source, destination).await;
                report.enter(Phase::Done);
                report.events = ctx.take_events();
                info!(
                    "Postcopy migration completed after {} status polls",
                    report.polls
                );
                Ok(report)
            }
            Err(e) => {
                error!("Run aborted: {}", e);
                // Serial logs stay behind for inspection.
                source.shutdown(self.options.shutdown_grace).await;
                destination.shutdown(self.options.shutdown_grace).await;
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        source: &mut Instance,
        destination: &mut Instance,
        relay: &mut Option<RelayHandle>,
        ctx: &mut RunContext,
        report: &mut RunReport,
    ) -> Result<MigrationStatus, HarnessError> {
        report.enter(Phase::Configuring);
        self.configure(source, destination, ctx).await?;

        report.enter(Phase::AwaitingBoot);
        self.await_boot(source).await?;

        report.enter(Phase::Migrating);
        self.migrate(source, relay, ctx).await?;

        report.enter(Phase::AwaitingStop);
        self.await_stop(source, ctx).await?;

        report.enter(Phase::AwaitingResume);
        self.await_resume(destination, ctx).await?;

        report.enter(Phase::AwaitingCompletion);
        let (status, polls) = self.await_completion(source, ctx).await?;
        report.polls = polls;
        Ok(status)
    }

    async fn launch(&self, spec: &InstanceSpec) -> Result<Instance, HarnessError> {
        self.launcher
            .launch(spec)
            .await
            .map_err(|source| HarnessError::Launch {
                role: spec.role,
                source,
            })
    }

    fn filter(&self, role: Role) -> EventFilter {
        EventFilter::new(role)
            .with_max_events(self.options.max_events_per_reply)
            .with_reply_timeout(self.options.reply_timeout)
    }

    async fn command(
        &self,
        phase: Phase,
        instance: &mut Instance,
        ctx: &mut RunContext,
        request: &Request,
    ) -> Result<Value, HarnessError> {
        let role = instance.role();
        debug!("{} <- {}", role, request.execute);
        self.filter(role)
            .command(instance.qmp(), ctx, request)
            .await
            .map_err(|e| HarnessError::from_qmp(phase, role, e))
    }

    pub async fn configure(
        &self,
        source: &mut Instance,
        destination: &mut Instance,
        ctx: &mut RunContext,
    ) -> Result<(), HarnessError> {
        let phase = Phase::Configuring;
        let enable_postcopy = commands::set_capability(commands::POSTCOPY_RAM, true);
        self.command(phase, source, ctx, &enable_postcopy).await?;
        self.command(phase, destination, ctx, &enable_postcopy).await?;

        let options = &self.options;
        if options.legacy_commands {
            self.command(phase, source, ctx, &commands::set_speed(options.max_bandwidth))
                .await?;
            self.command(
                phase,
                source,
                ctx,
                &commands::set_downtime(options.downtime_limit_secs),
            )
            .await?;
        } else {
            let downtime_ms = commands::downtime_limit_ms(options.downtime_limit_secs);
            self.command(
                phase,
                source,
                ctx,
                &commands::set_parameters(options.max_bandwidth, downtime_ms),
            )
            .await?;
        }
        info!(
            "postcopy-ram enabled on both instances, source capped at {} B/s with {}s downtime",
            options.max_bandwidth, options.downtime_limit_secs
        );
        Ok(())
    }

    pub async fn await_boot(&self, source: &Instance) -> Result<(), HarnessError> {
        SerialWatcher::new(self.options.boot_timeout)
            .with_poll_interval(self.options.serial_poll_interval)
            .wait_for_sentinel(source.serial_path(), BOOT_SENTINEL)
            .await
            .map_err(|e| HarnessError::from_serial(Phase::AwaitingBoot, e))?;
        info!("Source guest booted");
        Ok(())
    }

    /// Start the migration and switch it to postcopy. Returns the URI the
    /// source was told to migrate to.
    pub async fn migrate(
        &self,
        source: &mut Instance,
        relay: &mut Option<RelayHandle>,
        ctx: &mut RunContext,
    ) -> Result<MigrationUri, HarnessError> {
        let phase = Phase::Migrating;
        let mut uri = self.options.outbound_uri.clone();

        if self.options.relay {
            let handle = MigrationRelay::new(uri.clone(), self.options.incoming_uri.clone())
                .start()
                .await
                .map_err(|source| HarnessError::Io { phase, source })?;
            uri = uri.with_port(handle.local_addr().port());
            *relay = Some(handle);
        }

        info!("Migrating source to {}", uri);
        self.command(phase, source, ctx, &commands::migrate(&uri.to_string()))
            .await?;
        self.command(phase, source, ctx, &commands::start_postcopy())
            .await?;
        info!("Postcopy switch requested");
        Ok(uri)
    }

    pub async fn await_stop(
        &self,
        source: &mut Instance,
        ctx: &mut RunContext,
    ) -> Result<(), HarnessError> {
        if ctx.stop_seen() {
            debug!("STOP already observed on source, not waiting for it");
            return Ok(());
        }
        self.filter(Role::Source)
            .wait_for_event(source.qmp(), ctx, EVENT_STOP, self.options.event_timeout)
            .await
            .map_err(|e| HarnessError::from_qmp(Phase::AwaitingStop, Role::Source, e))?;
        info!("Source stopped");
        Ok(())
    }

    pub async fn await_resume(
        &self,
        destination: &mut Instance,
        ctx: &mut RunContext,
    ) -> Result<(), HarnessError> {
        if ctx.position_of(Role::Destination, EVENT_RESUME).is_some() {
            debug!("RESUME already observed on destination");
            return Ok(());
        }
        self.filter(Role::Destination)
            .wait_for_event(
                destination.qmp(),
                ctx,
                EVENT_RESUME,
                self.options.event_timeout,
            )
            .await
            .map_err(|e| HarnessError::from_qmp(Phase::AwaitingResume, Role::Destination, e))?;
        info!("Destination resumed");
        Ok(())
    }

    /// Poll `query-migrate` on the source until it reports `completed`.
    ///
    /// `failed` (or a cancelled migration) ends the run immediately without
    /// another poll.
    pub async fn await_completion(
        &self,
        source: &mut Instance,
        ctx: &mut RunContext,
    ) -> Result<(MigrationStatus, u64), HarnessError> {
        let phase = Phase::AwaitingCompletion;
        let deadline = Instant::now() + self.options.completion_timeout;
        let mut polls = 0u64;
        let mut last = None;

        loop {
            let reply = self
                .command(phase, source, ctx, &commands::query_migrate())
                .await?;
            polls += 1;
            let status = MigrationStatus::from_query_reply(&reply)
                .map_err(|e| HarnessError::from_qmp(phase, Role::Source, e))?;

            if last != Some(status) {
                debug!("Migration status now {} (poll {})", status, polls);
                last = Some(status);
            }

            match status {
                MigrationStatus::Completed => return Ok((status, polls)),
                MigrationStatus::Failed
                | MigrationStatus::Cancelling
                | MigrationStatus::Cancelled => {
                    return Err(HarnessError::protocol(
                        phase,
                        format!("source reported migration status '{status}' on poll {polls}"),
                    ));
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(HarnessError::Timeout {
                    phase,
                    waiting_for: format!("migration to complete (last status '{status}')"),
                    bound: WaitBound::Elapsed(self.options.completion_timeout),
                });
            }
            sleep(self.options.poll_interval).await;
        }
    }

    /// Stop both instances and delete their serial logs.
    pub async fn cleanup(&self, source: Instance, destination: Instance) {
        let paths = [
            source.serial_path().to_path_buf(),
            destination.serial_path().to_path_buf(),
        ];

        source.shutdown(self.options.shutdown_grace).await;
        destination.shutdown(self.options.shutdown_grace).await;

        for path in &paths {
            if let Err(e) = remove_serial_file(path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}
