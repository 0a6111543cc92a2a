//! Build command - composes the boot archive.

use anyhow::{bail, Context, Result};
use std::fs;

use rookiso::archive;
use rookiso::cache;
use rookiso::compose::{self, ComposeContext};
use rookiso::config::Config;
use rookiso::manifest::{
    default_manifest, default_modules, ManifestEntry, ModuleSelection, MANIFEST_VERSION,
};
use rookiso::preflight;
use rookiso::timing::Timer;

/// Hash of everything the archive is built from.
///
/// The source root is treated as an opaque input identified by its path;
/// `--force` covers the case where its contents changed in place.
pub fn input_hash(
    config: &Config,
    kernel_version: &str,
    manifest: &[ManifestEntry],
    modules: &[ModuleSelection],
) -> Result<String> {
    let manifest_json = serde_json::to_vec(manifest)?;
    let modules_json = serde_json::to_vec(modules)?;
    let init_hash = cache::hash_file(&config.init_binary)
        .with_context(|| format!("Cannot hash {}", config.init_binary.display()))?;
    let version = MANIFEST_VERSION.to_string();
    let level = config.gzip_level.to_string();
    let root = config.source_root.to_string_lossy();

    Ok(cache::hash_parts([
        version.as_bytes(),
        manifest_json.as_slice(),
        modules_json.as_slice(),
        kernel_version.as_bytes(),
        init_hash.as_bytes(),
        level.as_bytes(),
        root.as_bytes(),
    ]))
}

/// Execute the build command.
pub fn cmd_build(config: &Config, force: bool) -> Result<()> {
    println!("=== Building Rookery boot archive ===\n");

    let manifest = default_manifest();
    let modules = default_modules();

    let report = preflight::run_preflight(config, &manifest);
    if !report.all_passed() {
        report.print();
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }

    let kernel_version = config.resolve_kernel_version()?;
    let hash = input_hash(config, &kernel_version, &manifest, &modules)?;
    let archive_path = config.archive_path();

    if !force && !cache::needs_rebuild(&hash, &config.hash_file(), &archive_path) {
        println!("[SKIP] Boot archive up to date: {}", archive_path.display());
        println!("       Use --force to rebuild.");
        return Ok(());
    }

    let ctx = ComposeContext {
        source_root: config.source_root.clone(),
        module_root: config.module_root(&kernel_version),
        kernel_version,
        init_program: config.init_binary.clone(),
        staging_dir: config.staging_dir(),
    };

    let timer = Timer::start("Compose");
    let composition = compose::compose(&ctx, &manifest, &modules)?;
    timer.finish();

    let timer = Timer::start("Archive");
    let size = archive::build_boot_archive(&composition.staging, &archive_path, config.gzip_level)?;
    timer.finish();

    let report_path = config.report_path();
    fs::write(
        &report_path,
        serde_json::to_string_pretty(&composition.report)?,
    )
    .with_context(|| format!("Failed to write {}", report_path.display()))?;
    cache::write_cached_hash(&config.hash_file(), &hash)?;

    let r = &composition.report;
    println!("\n=== Boot archive complete ===");
    println!("  Output:    {}", archive_path.display());
    println!("  Size:      {} KB", size / 1024);
    println!("  Kernel:    {}", r.kernel_version);
    println!("  Binaries:  {}", r.binaries.len());
    println!("  Libraries: {}", r.libraries.len());
    println!(
        "  Modules:   {} staged, {} not found",
        r.modules.staged.len(),
        r.modules.missing.len()
    );
    if !r.missing_optional.is_empty() {
        println!("  Skipped:   {}", r.missing_optional.join(", "));
    }
    println!("  Report:    {}", report_path.display());
    Ok(())
}
