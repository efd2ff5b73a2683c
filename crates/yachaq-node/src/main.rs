//! Command-line entry point for the YACHAQ node
//!
//! Inspect configuration, verify an exported audit chain, or run the
//! weekly-trips scenario in process.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use yachaq_audit::{read_chain_file, verify_chain};
use yachaq_core::config::{ConfigValidation, NodeConfig};

#[derive(Parser)]
#[command(name = "yachaq-node")]
#[command(about = "YACHAQ on-device privacy node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path; built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or check the effective configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Verify the hash chain of an audit log file
    AuditVerify {
        /// JSON-lines audit chain
        file: PathBuf,
    },

    /// Run the weekly-trips scenario against simulated collaborators
    #[cfg(feature = "demo")]
    Demo {
        /// Seed for deterministic effects
        #[arg(long, default_value = "7")]
        seed: u64,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Print,
    /// Validate the configuration and report the result
    Validate,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config(ConfigCommand::Print) => {
            let config = load_config(cli.config.as_deref())?;
            print!("{}", config.to_toml_string()?);
        }

        Commands::Config(ConfigCommand::Validate) => {
            let config = load_config(cli.config.as_deref())?;
            config.validate()?;
            println!(
                "configuration valid (k_min {}, capsule ttl {}s)",
                config.privacy.k_min, config.capsule.default_ttl_secs
            );
        }

        Commands::AuditVerify { file } => {
            let entries = read_chain_file(&file)
                .with_context(|| format!("reading audit chain {}", file.display()))?;
            let report = verify_chain(&entries);
            if !report.is_valid() {
                for error in &report.errors {
                    eprintln!("  {error}");
                }
                bail!(
                    "audit chain {} is corrupt: {} problem(s) in {} entries",
                    file.display(),
                    report.errors.len(),
                    report.entries_checked
                );
            }
            println!("audit chain valid: {} entries checked", report.entries_checked);
        }

        #[cfg(feature = "demo")]
        Commands::Demo { seed } => {
            let config = load_config(cli.config.as_deref())?;
            let report = yachaq_node::demo::run(config, seed).await?;
            println!("node                {}", report.node_id);
            println!("offer score         {:.2}", report.score);
            println!("avg_trips_per_week  {}", report.avg_trips_per_week);
            println!("capsule ttl         {}s", report.capsule_ttl_secs);
            println!("chunks delivered    {}", report.chunks);
            println!(
                "audit chain         {} entries, valid: {}",
                report.audit.len(),
                report.chain_valid
            );
            for event in &report.audit {
                println!("  {event}");
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(NodeConfig::default()),
    }
}
