//! Kernel module staging.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::manifest::ModuleSelection;
use crate::process::Cmd;
use crate::resolve::STAGED_LIBRARY_DIR;
use crate::staging::StagingRoot;

/// Module filename suffixes, plain first.
const MODULE_SUFFIXES: &[&str] = &[".ko", ".ko.xz", ".ko.zst", ".ko.gz"];

/// Kernel-provided metadata copied verbatim so modprobe knows the built-ins.
const MODULE_METADATA_FILES: &[&str] = &["modules.builtin", "modules.builtin.modinfo", "modules.order"];

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleReport {
    /// (module name, staged path)
    pub staged: Vec<(String, PathBuf)>,
    pub missing: Vec<String>,
}

/// `lib64/modules/<kver>`: where modules live in the staged tree.
pub fn staged_module_dir(kernel_version: &str) -> PathBuf {
    Path::new(STAGED_LIBRARY_DIR).join("modules").join(kernel_version)
}

/// Module name of a file name, or None if it isn't a module.
///
/// `usb-storage.ko.xz` and `usb_storage.ko` both map to `usb_storage`, the
/// same way the kernel treats dashes and underscores as equal.
pub fn module_name(file_name: &str) -> Option<String> {
    MODULE_SUFFIXES
        .iter()
        .find_map(|suffix| file_name.strip_suffix(suffix))
        .filter(|stem| !stem.is_empty())
        .map(canonical_name)
}

fn canonical_name(name: &str) -> String {
    name.replace('-', "_")
}

/// Find the module file for `name` anywhere below `module_root`.
pub fn find_module(module_root: &Path, name: &str) -> Option<PathBuf> {
    let wanted = canonical_name(name);
    WalkDir::new(module_root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .find(|e| {
            e.file_name()
                .to_str()
                .and_then(module_name)
                .is_some_and(|n| n == wanted)
        })
        .map(|e| e.into_path())
}

/// Copy each selected module into its classified staging directory.
///
/// A module that isn't found is not an error: the kernel may have it built
/// in, which the boot resolver handles when loading.
pub fn stage_modules(
    staging: &mut StagingRoot,
    module_root: &Path,
    kernel_version: &str,
    selections: &[ModuleSelection],
) -> Result<ModuleReport> {
    let mut report = ModuleReport::default();
    let dest_root = staged_module_dir(kernel_version);
    staging.create_dir(&dest_root)?;

    for sel in selections {
        let Some(src) = find_module(module_root, &sel.name) else {
            tracing::warn!(
                "Kernel module '{}' not found under {} (built-in or unavailable)",
                sel.name,
                module_root.display()
            );
            report.missing.push(sel.name.clone());
            continue;
        };
        let file_name = src.file_name().context("Module path has no file name")?;
        let dest = dest_root.join(sel.class.subdir()).join(file_name);
        staging.install_file(&dest, &src, 0o644)?;
        tracing::debug!("module {} -> {}", sel.name, dest.display());
        report.staged.push((sel.name.clone(), dest));
    }

    for meta in MODULE_METADATA_FILES {
        let src = module_root.join(meta);
        if src.is_file() {
            staging.install_file(dest_root.join(meta), &src, 0o644)?;
        }
    }

    Ok(report)
}

/// Run depmod over a materialized staging tree.
///
/// Failure is a warning: without the index modprobe can still load modules
/// that have no dependencies, and the boot resolver tolerates failed loads.
pub fn regenerate_index(staging_dir: &Path, kernel_version: &str) -> Result<bool> {
    let result = Cmd::new("depmod")
        .args(["-a", "-b"])
        .arg_path(staging_dir)
        .arg(kernel_version)
        .allow_fail()
        .run();

    match result {
        Ok(r) if r.success() => {
            tracing::info!("depmod completed for {}", kernel_version);
            Ok(true)
        }
        Ok(r) => {
            tracing::warn!("depmod exited with status {}: {}", r.code(), r.stderr_trimmed());
            Ok(false)
        }
        Err(e) => {
            tracing::warn!("Could not run depmod: {:#}", e);
            Ok(false)
        }
    }
}

/// Record the index files depmod wrote into the staging map.
pub fn absorb_index(
    staging: &mut StagingRoot,
    staging_dir: &Path,
    kernel_version: &str,
) -> Result<usize> {
    let rel = staged_module_dir(kernel_version);
    let on_disk = staging_dir.join(&rel);
    let mut names: Vec<String> = fs::read_dir(&on_disk)
        .with_context(|| format!("Failed to read {}", on_disk.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with("modules."))
        .collect();
    names.sort();

    let mut added = 0;
    for name in names {
        let dest = rel.join(&name);
        if staging.contains(&dest) {
            continue;
        }
        staging.install_file(&dest, &on_disk.join(&name), 0o644)?;
        added += 1;
    }
    Ok(added)
}

/// First versioned directory below a modules directory.
pub fn find_kernel_version(modules_base: &Path) -> Result<String> {
    let mut versions: Vec<String> = fs::read_dir(modules_base)
        .with_context(|| format!("Failed to read {}", modules_base.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.contains('.'))
        .collect();
    versions.sort();
    versions
        .into_iter()
        .next()
        .with_context(|| format!("No kernel version directory in {}", modules_base.display()))
}
