//! Emulator instances under test and how they are started.
//!
//! The orchestrator only needs a QMP connection and the path of the serial
//! log for each peer; how the process behind them comes to exist is behind
//! [`InstanceLauncher`]. [`QemuLauncher`] is the real implementation.

use crate::config::EmulatorConfig;
use crate::qmp::{QmpClient, QmpError, Transport, commands};
use crate::uri::MigrationUri;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, info, warn};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Destination,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Destination => "destination",
        }
    }

    pub fn serial_file_name(&self) -> &'static str {
        match self {
            Role::Source => "src_serial",
            Role::Destination => "dest_serial",
        }
    }

    pub fn qmp_socket_name(&self) -> &'static str {
        match self {
            Role::Source => "src.qmp",
            Role::Destination => "dest.qmp",
        }
    }

    /// Guest name passed to `-name`.
    pub fn machine_name(&self) -> &'static str {
        match self {
            Role::Source => "pcsource",
            Role::Destination => "pcdest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to start one instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub role: Role,
    pub binary: PathBuf,
    pub accel: String,
    pub memory: String,
    pub display: String,
    pub boot_image: PathBuf,
    pub serial_path: PathBuf,
    pub qmp_socket: PathBuf,
    /// Listening endpoint for an incoming migration (destination only).
    pub incoming: Option<MigrationUri>,
    pub extra_args: Vec<String>,
}

impl InstanceSpec {
    pub fn new(role: Role, emulator: &EmulatorConfig, work_dir: &Path) -> Self {
        Self {
            role,
            binary: emulator.binary.clone(),
            accel: emulator.accel.clone(),
            memory: emulator.memory.clone(),
            display: emulator.display.clone(),
            boot_image: emulator.boot_image.clone(),
            serial_path: work_dir.join(role.serial_file_name()),
            qmp_socket: work_dir.join(role.qmp_socket_name()),
            incoming: None,
            extra_args: emulator.extra_args.clone(),
        }
    }

    pub fn with_incoming(mut self, uri: MigrationUri) -> Self {
        self.incoming = Some(uri);
        self
    }

    /// Emulator command line, without the binary.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-machine".to_string(),
            format!("accel={}", self.accel),
            "-m".to_string(),
            self.memory.clone(),
            "-name".to_string(),
            format!("{},debug-threads=on", self.role.machine_name()),
            "-display".to_string(),
            self.display.clone(),
            "-serial".to_string(),
            format!("file:{}", self.serial_path.display()),
            "-fda".to_string(),
            self.boot_image.display().to_string(),
            "-qmp".to_string(),
            format!("unix:{},server=on,wait=off", self.qmp_socket.display()),
        ];
        if let Some(incoming) = &self.incoming {
            args.push("-incoming".to_string());
            args.push(incoming.to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

pub type Connection = QmpClient<Box<dyn Transport>>;

/// One running emulator: its QMP connection and, for real processes, the
/// child handle. Dropping an `Instance` kills the process.
pub struct Instance {
    role: Role,
    qmp: Connection,
    process: Option<Child>,
    serial_path: PathBuf,
}

impl Instance {
    pub fn new(role: Role, qmp: Connection, serial_path: impl Into<PathBuf>) -> Self {
        Self {
            role,
            qmp,
            process: None,
            serial_path: serial_path.into(),
        }
    }

    pub fn with_process(mut self, child: Child) -> Self {
        self.process = Some(child);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn serial_path(&self) -> &Path {
        &self.serial_path
    }

    pub fn qmp(&mut self) -> &mut Connection {
        &mut self.qmp
    }

    /// Ask the emulator to quit, then make sure the process is gone.
    pub async fn shutdown(mut self, grace: Duration) {
        match timeout(grace, self.qmp.send(&commands::quit())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{} did not take quit: {}", self.role, e),
            Err(_) => debug!("{} quit request timed out", self.role),
        }
        let _ = timeout(grace, self.qmp.close()).await;

        let Some(mut child) = self.process.take() else {
            return;
        };
        match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!("{} instance exited with {}", self.role, status),
            Ok(Err(e)) => warn!("Failed to reap {} instance: {}", self.role, e),
            Err(_) => {
                warn!(
                    "{} instance still running after {:?}, killing it",
                    self.role, grace
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {} instance: {}", self.role, e);
                }
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to spawn {}: {source}", .binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("QMP socket {} not ready after {after:?}", .path.display())]
    NotReady { path: PathBuf, after: Duration },

    #[error("Emulator exited before QMP was ready: {0}")]
    Exited(ExitStatus),

    #[error("QMP negotiation failed: {0}")]
    Negotiation(#[from] QmpError),
}

#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    async fn launch(&self, spec: &InstanceSpec) -> Result<Instance, LaunchError>;
}

/// Starts QEMU and connects to its QMP unix socket.
#[derive(Debug, Clone)]
pub struct QemuLauncher {
    ready_timeout: Duration,
}

impl QemuLauncher {
    pub fn new(ready_timeout: Duration) -> Self {
        Self { ready_timeout }
    }
}

#[async_trait]
impl InstanceLauncher for QemuLauncher {
    async fn launch(&self, spec: &InstanceSpec) -> Result<Instance, LaunchError> {
        let args = spec.args();
        info!(
            "Starting {} instance: {} {}",
            spec.role,
            spec.binary.display(),
            args.join(" ")
        );

        let mut child = Command::new(&spec.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                binary: spec.binary.clone(),
                source,
            })?;

        let deadline = Instant::now() + self.ready_timeout;
        let stream = connect_qmp(&spec.qmp_socket, &mut child, deadline, self.ready_timeout).await?;

        let stream: Box<dyn Transport> = Box::new(stream);
        let mut qmp = QmpClient::new(stream);
        match timeout_at(deadline, qmp.negotiate()).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                return Err(LaunchError::NotReady {
                    path: spec.qmp_socket.clone(),
                    after: self.ready_timeout,
                });
            }
        }
        debug!("{} instance QMP ready", spec.role);

        Ok(Instance::new(spec.role, qmp, spec.serial_path.clone()).with_process(child))
    }
}

/// QEMU creates the socket some time after exec; retry until it accepts.
async fn connect_qmp(
    path: &Path,
    child: &mut Child,
    deadline: Instant,
    ready_timeout: Duration,
) -> Result<UnixStream, LaunchError> {
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(LaunchError::Exited(status));
                }
                if Instant::now() >= deadline {
                    return Err(LaunchError::NotReady {
                        path: path.to_path_buf(),
                        after: ready_timeout,
                    });
                }
                debug!("QMP socket {} not ready yet: {}", path.display(), e);
                sleep(CONNECT_RETRY_INTERVAL).await;
            }
        }
    }
}
