//! Clean command - removes build artifacts.

use anyhow::Result;
use std::fs;

use rookiso::config::Config;

/// Clean target for the clean command.
pub enum CleanTarget {
    /// Remove the staging tree, keep the archive (default)
    Staging,
    /// Remove the whole output directory
    All,
}

/// Execute the clean command.
pub fn cmd_clean(config: &Config, target: CleanTarget) -> Result<()> {
    let victims = match target {
        CleanTarget::Staging => vec![config.staging_dir()],
        CleanTarget::All => vec![config.output_dir.clone()],
    };

    let mut cleaned = false;
    for path in victims {
        if path.exists() {
            println!("Removing {}...", path.display());
            fs::remove_dir_all(&path)?;
            cleaned = true;
        }
    }

    if cleaned {
        println!("Clean complete.");
    } else {
        println!("Nothing to clean.");
    }
    Ok(())
}
