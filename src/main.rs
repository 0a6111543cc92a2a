//! rookiso - Rookery OS boot archive builder.
//!
//! Composes the minimal early-boot root (manifest tools, their library
//! closure, boot kernel modules, the `rookiso-init` boot resolver) and packs
//! it into a gzip-compressed cpio archive.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rookiso::config::Config;

#[derive(Parser)]
#[command(name = "rookiso")]
#[command(about = "Rookery OS boot archive builder")]
#[command(
    after_help = "QUICK START:\n  rookiso preflight  Check the source root and tools\n  rookiso build      Build the boot archive\n  rookiso show manifest  List what goes into it"
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the boot archive (skipped when inputs are unchanged)
    Build {
        /// Rebuild even if the inputs hash matches
        #[arg(long)]
        force: bool,
    },

    /// Run preflight checks (verify the source root before building)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Print the shared libraries a binary in the source root needs
    Resolve {
        /// Path of the binary, relative to the source root
        binary: PathBuf,
        /// Only the libraries the binary names itself
        #[arg(long)]
        direct: bool,
    },

    /// Clean build artifacts (default: the staging tree only)
    Clean {
        /// Remove the whole output directory
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration
    Config,
    /// Show the compiled-in manifest
    Manifest {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_target(false)
        .without_time()
        .init();

    let base_dir = std::env::current_dir()?;
    let config = Config::load(&base_dir);

    match cli.command {
        Commands::Build { force } => {
            commands::cmd_build(&config, force)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(&config, strict)?;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
                ShowTarget::Manifest { json } => commands::show::ShowTarget::Manifest { json },
            };
            commands::cmd_show(show_target, &config)?;
        }

        Commands::Resolve { binary, direct } => {
            commands::cmd_resolve(&config, &binary, direct)?;
        }

        Commands::Clean { all } => {
            let target = if all {
                commands::clean::CleanTarget::All
            } else {
                commands::clean::CleanTarget::Staging
            };
            commands::cmd_clean(&config, target)?;
        }
    }

    Ok(())
}
