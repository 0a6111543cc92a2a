//! Preflight checks for the boot archive build.
//!
//! Validates host tools and build inputs before composing.
//! Run with `rookiso preflight` to check everything is ready.

mod environment;
mod host_tools;
mod types;

use anyhow::{bail, Result};

use crate::config::Config;
use crate::manifest::ManifestEntry;

pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Run all preflight checks.
pub fn run_preflight(config: &Config, manifest: &[ManifestEntry]) -> PreflightReport {
    let mut checks = Vec::new();

    tracing::info!("Checking host tools...");
    checks.extend(host_tools::check_host_tools());

    tracing::info!("Checking source root...");
    checks.extend(environment::check_source_root(config, manifest));

    tracing::info!("Checking kernel modules...");
    checks.extend(environment::check_modules(config));

    tracing::info!("Checking build environment...");
    checks.extend(environment::check_build_environment(config));

    PreflightReport { checks }
}

/// Run preflight, print the report and bail if any check failed.
pub fn run_preflight_or_fail(config: &Config, manifest: &[ManifestEntry]) -> Result<()> {
    let report = run_preflight(config, manifest);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}
