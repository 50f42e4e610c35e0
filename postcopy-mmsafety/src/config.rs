use crate::uri::MigrationUri;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Where serial logs and QMP sockets go (default: a fresh temp dir)
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_expandable_path",
        default
    )]
    pub work_dir: Option<PathBuf>,
    pub emulator: EmulatorConfig,
    pub migration: MigrationConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// How each emulator instance is started.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EmulatorConfig {
    #[serde(deserialize_with = "deserialize_expandable_path")]
    pub binary: PathBuf,
    #[serde(default = "default_accel")]
    pub accel: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_display")]
    pub display: String,
    /// Guest image that writes 'A' then a stream of 'B's to its serial port
    #[serde(deserialize_with = "deserialize_expandable_path")]
    pub boot_image: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("qemu-system-x86_64"),
            accel: default_accel(),
            memory: default_memory(),
            display: default_display(),
            boot_image: PathBuf::from("/tmp/geniux.img"),
            extra_args: Vec::new(),
        }
    }
}

fn default_accel() -> String {
    "kvm:tcg".to_string()
}

fn default_memory() -> String {
    "10M".to_string()
}

fn default_display() -> String {
    "none".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    /// Where the source sends migration traffic
    pub outbound_uri: MigrationUri,
    /// Where the destination listens for it
    pub incoming_uri: MigrationUri,
    /// Bytes per second. Kept low so postcopy can be started mid-migration.
    #[serde(default = "default_max_bandwidth")]
    pub max_bandwidth: u64,
    /// Kept near zero so precopy never converges on its own.
    #[serde(default = "default_downtime_limit_secs")]
    pub downtime_limit_secs: f64,
    /// Use migrate_set_speed / migrate_set_downtime instead of
    /// migrate-set-parameters
    #[serde(default)]
    pub legacy_commands: bool,
    /// Forward outbound_uri to incoming_uri ourselves
    #[serde(default = "default_relay")]
    pub relay: bool,
}

fn default_max_bandwidth() -> u64 {
    10_000_000
}

fn default_downtime_limit_secs() -> f64 {
    0.0000001
}

fn default_relay() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct TimeoutConfig {
    pub launch_secs: u64,
    pub reply_secs: u64,
    pub boot_secs: u64,
    pub event_secs: u64,
    pub completion_secs: u64,
    pub poll_interval_us: u64,
    pub serial_poll_ms: u64,
    pub max_events_per_reply: usize,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            launch_secs: 30,
            reply_secs: 30,
            boot_secs: 120,
            event_secs: 60,
            completion_secs: 300,
            poll_interval_us: 100,
            serial_poll_ms: 1,
            max_events_per_reply: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn launch(&self) -> Duration {
        Duration::from_secs(self.launch_secs)
    }

    pub fn reply(&self) -> Duration {
        Duration::from_secs(self.reply_secs)
    }

    pub fn boot(&self) -> Duration {
        Duration::from_secs(self.boot_secs)
    }

    pub fn event(&self) -> Duration {
        Duration::from_secs(self.event_secs)
    }

    pub fn completion(&self) -> Duration {
        Duration::from_secs(self.completion_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn serial_poll(&self) -> Duration {
        Duration::from_millis(self.serial_poll_ms)
    }
}

fn deserialize_expandable_path<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match shellexpand::env(&s) {
        Ok(expanded) => Ok(PathBuf::from(expanded.into_owned())),
        Err(e) => Err(serde::de::Error::custom(format!(
            "Failed to expand environment variable: {}",
            e
        ))),
    }
}

fn deserialize_optional_expandable_path<'de, D>(
    deserializer: D,
) -> Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<String>::deserialize(deserializer)?;
    opt.map(|s| match shellexpand::env(&s) {
        Ok(expanded) => Ok(PathBuf::from(expanded.into_owned())),
        Err(e) => Err(serde::de::Error::custom(format!(
            "Failed to expand environment variable: {}",
            e
        ))),
    })
    .transpose()
}

impl Settings {
    pub fn from_file(config_path: impl AsRef<Path>) -> Result<Self> {
        let path = config_path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(settings)
    }

    /// Replace the ports of the migration endpoints, e.g. from the command line.
    pub fn with_ports(mut self, source_port: Option<u16>, dest_port: Option<u16>) -> Self {
        if let Some(port) = source_port {
            self.migration.outbound_uri = self.migration.outbound_uri.with_port(port);
        }
        if let Some(port) = dest_port {
            self.migration.incoming_uri = self.migration.incoming_uri.with_port(port);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let migration = &self.migration;
        if migration.outbound_uri == migration.incoming_uri {
            bail!(
                "outbound_uri and incoming_uri must differ (both are {})",
                migration.outbound_uri
            );
        }
        if migration.incoming_uri.port() == 0 {
            bail!("incoming_uri needs a fixed port, got {}", migration.incoming_uri);
        }
        if migration.outbound_uri.port() == 0 && !migration.relay {
            bail!(
                "outbound_uri port 0 is only allowed when relay = true, got {}",
                migration.outbound_uri
            );
        }
        if migration.max_bandwidth == 0 {
            bail!("max_bandwidth must be greater than zero");
        }
        if !migration.downtime_limit_secs.is_finite() || migration.downtime_limit_secs < 0.0 {
            bail!(
                "downtime_limit_secs must be a non-negative number, got {}",
                migration.downtime_limit_secs
            );
        }

        let timeouts = &self.timeouts;
        for (name, value) in [
            ("launch_secs", timeouts.launch_secs),
            ("reply_secs", timeouts.reply_secs),
            ("boot_secs", timeouts.boot_secs),
            ("event_secs", timeouts.event_secs),
            ("completion_secs", timeouts.completion_secs),
            ("poll_interval_us", timeouts.poll_interval_us),
            ("serial_poll_ms", timeouts.serial_poll_ms),
        ] {
            if value == 0 {
                bail!("timeouts.{} must be greater than zero", name);
            }
        }
        if timeouts.max_events_per_reply == 0 {
            bail!("timeouts.max_events_per_reply must be greater than zero");
        }

        Ok(())
    }

    pub fn generate_default() -> Self {
        Settings {
            work_dir: None,
            emulator: EmulatorConfig {
                boot_image: PathBuf::from("${HOME}/images/geniux.img"),
                ..EmulatorConfig::default()
            },
            migration: MigrationConfig {
                outbound_uri: MigrationUri::tcp("127.0.0.1", 4444),
                incoming_uri: MigrationUri::tcp("127.0.0.1", 4445),
                max_bandwidth: default_max_bandwidth(),
                downtime_limit_secs: default_downtime_limit_secs(),
                legacy_commands: false,
                relay: default_relay(),
            },
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn write_default_config(path: impl AsRef<Path>) -> Result<()> {
        let default = Self::generate_default();
        let toml_string = toml::to_string_pretty(&default)?;

        let commented = format!(
            "# postcopy-mmsafety Configuration File\n\
             # Generated by postcopy-mmsafety v{}\n\
             #\n\
             # Migrates a guest between two emulator instances using postcopy\n\
             # and checks that the migration completes.\n\
             #\n\
             # Environment variables are supported in paths: ${{VAR}} or $VAR\n\
             #\n\
             # Migration:\n\
             #   - max_bandwidth and downtime_limit_secs keep precopy from converging\n\
             #   - relay = true forwards outbound_uri to incoming_uri in-process\n\
             #   - outbound_uri may use port 0 with the relay (any free port)\n\
             #\n\
             \n{}",
            env!("CARGO_PKG_VERSION"),
            toml_string
        );

        fs::write(path, commented)?;
        Ok(())
    }
}
