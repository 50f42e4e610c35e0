use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod probe;
pub mod run;

#[derive(Parser)]
#[command(name = "postcopy-mmsafety")]
#[command(author, version, about = "Postcopy live migration test between two emulator instances", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a default configuration file
    Init {
        #[arg(default_value = "postcopy-mmsafety.toml")]
        path: PathBuf,
    },
    /// Run the postcopy migration test
    ///
    /// Exits 0 when the migration completes or the host cannot do postcopy,
    /// 1 otherwise.
    Run {
        #[arg(short, long)]
        config: PathBuf,
        /// Override the port of migration.outbound_uri
        #[arg(long)]
        source_port: Option<u16>,
        /// Override the port of migration.incoming_uri
        #[arg(long)]
        dest_port: Option<u16>,
        /// Leave serial logs and QMP sockets behind after the run
        #[arg(long)]
        keep_workdir: bool,
    },
    /// Check whether this host supports userfaultfd
    Probe,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
