//! Show command - displays information.

use anyhow::Result;

use rookiso::config::Config;
use rookiso::manifest::{default_manifest, default_modules, MANIFEST_VERSION};

/// Show target for the show command.
pub enum ShowTarget {
    /// Show configuration
    Config,
    /// Show the compiled-in manifest
    Manifest { json: bool },
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Config => config.print(),
        ShowTarget::Manifest { json: true } => {
            let doc = serde_json::json!({
                "version": MANIFEST_VERSION,
                "binaries": default_manifest(),
                "modules": default_modules(),
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        ShowTarget::Manifest { json: false } => {
            println!("Manifest v{}\n", MANIFEST_VERSION);
            println!("Binaries:");
            for entry in default_manifest() {
                let mut flags = Vec::new();
                if !entry.required {
                    flags.push("optional");
                }
                if entry.shell {
                    flags.push("shell");
                }
                let flags = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", flags.join(", "))
                };
                println!("  {}{}", entry.destination().display(), flags);
            }
            println!("\nKernel modules:");
            for module in default_modules() {
                println!("  {:<14} {}", module.name, module.class.subdir());
            }
        }
    }
    Ok(())
}
