//! Build input checks: source root, manifest, modules, init binary.

use std::path::Path;

use crate::compose::existing_file;
use crate::config::Config;
use crate::manifest::{ManifestEntry, DYNAMIC_LINKER_CANDIDATES};

use super::types::CheckResult;

pub fn check_source_root(config: &Config, manifest: &[ManifestEntry]) -> Vec<CheckResult> {
    let root = &config.source_root;
    if !root.is_dir() {
        return vec![CheckResult::fail(
            "source root",
            &format!("{} not found (set ROOKISO_SOURCE_ROOT)", root.display()),
        )];
    }
    let mut results = vec![CheckResult::pass_with("source root", &root.display().to_string())];

    match DYNAMIC_LINKER_CANDIDATES
        .iter()
        .find_map(|c| existing_file(root, Path::new(c)))
    {
        Some(real) => results.push(CheckResult::pass_with(
            "dynamic linker",
            &real.display().to_string(),
        )),
        None => results.push(CheckResult::fail(
            "dynamic linker",
            "No ld-linux found in the source root",
        )),
    }

    for entry in manifest {
        let found = entry
            .candidate_paths
            .iter()
            .find_map(|c| existing_file(root, c));
        let name = format!("tool {}", entry.name);
        results.push(match (found, entry.required) {
            (Some(real), _) => CheckResult::pass_with(&name, &real.display().to_string()),
            (None, true) => CheckResult::fail(&name, "Required, no candidate exists"),
            (None, false) => CheckResult::warn(&name, "Optional, will be skipped"),
        });
    }

    results
}

pub fn check_modules(config: &Config) -> Vec<CheckResult> {
    let kver = match config.resolve_kernel_version() {
        Ok(v) => v,
        Err(e) => return vec![CheckResult::fail("kernel version", &format!("{:#}", e))],
    };
    let mut results = vec![CheckResult::pass_with("kernel version", &kver)];

    let module_root = config.module_root(&kver);
    if module_root.is_dir() {
        results.push(CheckResult::pass_with(
            "module tree",
            &module_root.display().to_string(),
        ));
    } else {
        results.push(CheckResult::warn(
            "module tree",
            &format!(
                "{} not found; only built-in drivers will be available",
                module_root.display()
            ),
        ));
    }
    results
}

pub fn check_build_environment(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    if config.init_binary.is_file() {
        results.push(CheckResult::pass_with(
            "init binary",
            &config.init_binary.display().to_string(),
        ));
    } else {
        results.push(CheckResult::fail(
            "init binary",
            &format!(
                "{} not found. Run: cargo build --release --bin rookiso-init",
                config.init_binary.display()
            ),
        ));
    }

    let output_dir = &config.output_dir;
    let writable = std::fs::create_dir_all(output_dir).and_then(|_| {
        let test_file = output_dir.join(".preflight-test");
        std::fs::write(&test_file, "test")?;
        std::fs::remove_file(&test_file)
    });
    match writable {
        Ok(()) => results.push(CheckResult::pass("output directory writable")),
        Err(e) => results.push(CheckResult::fail(
            "output directory writable",
            &format!("Cannot write to {}: {}", output_dir.display(), e),
        )),
    }

    results
}
