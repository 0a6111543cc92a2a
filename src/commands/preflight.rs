//! Preflight command - runs preflight checks.

use anyhow::Result;

use rookiso::config::Config;
use rookiso::manifest::default_manifest;
use rookiso::preflight;

/// Execute the preflight command.
pub fn cmd_preflight(config: &Config, strict: bool) -> Result<()> {
    let manifest = default_manifest();
    if strict {
        preflight::run_preflight_or_fail(config, &manifest)?;
    } else {
        let report = preflight::run_preflight(config, &manifest);
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to fail the build.");
        }
    }
    Ok(())
}
