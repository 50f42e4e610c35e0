use anyhow::Result;
use postcopy_mmsafety::config;

mod cli;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse_args();

    match cli.command {
        cli::Commands::Init { path } => {
            println!("Generating configuration file at: {}", path.display());
            config::Settings::write_default_config(&path)?;
            println!("Configuration file created successfully!");
            println!(
                "Point boot_image at a guest image and run: postcopy-mmsafety run -c {}",
                path.display()
            );
        }
        cli::Commands::Run {
            config,
            source_port,
            dest_port,
            keep_workdir,
        } => {
            let code = cli::run::run_migration(config, source_port, dest_port, keep_workdir).await?;
            std::process::exit(code);
        }
        cli::Commands::Probe => cli::probe::probe(),
    }

    Ok(())
}
