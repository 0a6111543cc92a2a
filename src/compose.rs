//! Minimal root composer.
//!
//! Turns the compiled-in manifest plus a source root into a [`StagingRoot`]:
//! the layout, the dynamic linker, every manifest binary with its library
//! closure, the selected kernel modules and the boot resolver at `/init`.
//!
//! ```text
//! /
//! ├── bin/  sbin/          manifest binaries, bin/sh -> staged shell
//! ├── lib64/               every library, real files only
//! ├── lib -> lib64
//! ├── usr/lib -> ../lib64
//! ├── lib64/modules/<kver>/kernel/...
//! ├── mnt/media  mnt/rootfs  overlay  newroot
//! └── init                 rookiso-init
//! ```

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::elf;
use crate::manifest::{BinDir, ManifestEntry, ModuleSelection, DYNAMIC_LINKER_CANDIDATES};
use crate::modules::{self, ModuleReport};
use crate::resolve::{resolve_in_root, LibraryReference, Resolver, STAGED_LIBRARY_DIR};
use crate::staging::{StagingRoot, EXEC_MODE};

/// Empty directories of the staged tree.
const LAYOUT_DIRS: &[&str] = &[
    "bin", "sbin", "etc", "proc", "sys", "dev", "run", "tmp", "newroot", "root", "usr",
    "mnt/media", "mnt/rootfs", "overlay",
];

/// Compatibility links into the single library directory.
const LAYOUT_SYMLINKS: &[(&str, &str)] = &[("lib", "lib64"), ("usr/lib", "../lib64")];

/// Everything a composition reads.
#[derive(Debug, Clone)]
pub struct ComposeContext {
    /// Root filesystem the binaries and libraries come from
    pub source_root: PathBuf,
    pub kernel_version: String,
    /// `lib/modules/<kver>` of the source kernel
    pub module_root: PathBuf,
    /// The boot resolver binary installed as `/init`
    pub init_program: PathBuf,
    /// Where the tree is materialized for depmod and inspection
    pub staging_dir: PathBuf,
}

/// One staged manifest binary.
#[derive(Debug, Clone, Serialize)]
pub struct StagedBinary {
    pub name: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Set when the candidate was a symlink and the link was preserved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_target: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ComposeReport {
    pub kernel_version: String,
    pub dynamic_linker: PathBuf,
    pub binaries: Vec<StagedBinary>,
    pub missing_optional: Vec<String>,
    pub libraries: BTreeSet<LibraryReference>,
    pub modules: ModuleReport,
    pub index_regenerated: bool,
    pub entries: usize,
}

#[derive(Debug)]
pub struct Composition {
    pub staging: StagingRoot,
    pub report: ComposeReport,
}

/// Compose the boot archive tree.
pub fn compose(
    ctx: &ComposeContext,
    manifest: &[ManifestEntry],
    selections: &[ModuleSelection],
) -> Result<Composition> {
    if !ctx.source_root.is_dir() {
        bail!("Source root not found at {}", ctx.source_root.display());
    }

    let resolver = Resolver::new(&ctx.source_root);
    let mut staging = StagingRoot::new();
    let mut report = ComposeReport {
        kernel_version: ctx.kernel_version.clone(),
        ..Default::default()
    };

    create_layout(&mut staging)?;
    report.dynamic_linker = install_dynamic_linker(ctx, manifest, &mut staging)?;

    let mut shell: Option<&ManifestEntry> = None;
    for entry in manifest {
        match install_entry(ctx, &resolver, entry, &mut staging, &mut report)? {
            true if entry.shell => shell = Some(entry),
            true => {}
            false => report.missing_optional.push(entry.name.clone()),
        }
    }
    install_shell_link(&mut staging, shell)?;
    install_etc(&mut staging)?;

    report.modules = modules::stage_modules(
        &mut staging,
        &ctx.module_root,
        &ctx.kernel_version,
        selections,
    )?;

    install_init(ctx, &resolver, &mut staging, &mut report)?;

    staging.materialize(&ctx.staging_dir)?;
    if !report.modules.staged.is_empty() {
        report.index_regenerated =
            modules::regenerate_index(&ctx.staging_dir, &ctx.kernel_version)?;
        if report.index_regenerated {
            modules::absorb_index(&mut staging, &ctx.staging_dir, &ctx.kernel_version)?;
        }
    }

    report.entries = staging.len();
    tracing::info!(
        "Composed {} entries: {} binaries, {} libraries, {} modules",
        report.entries,
        report.binaries.len(),
        report.libraries.len(),
        report.modules.staged.len()
    );
    Ok(Composition { staging, report })
}

fn create_layout(staging: &mut StagingRoot) -> Result<()> {
    staging.create_dir(STAGED_LIBRARY_DIR)?;
    for dir in LAYOUT_DIRS {
        staging.create_dir(dir)?;
    }
    for (link, target) in LAYOUT_SYMLINKS {
        staging.install_symlink(link, target)?;
    }
    Ok(())
}

/// Stage the dynamic linker into `lib64/` under its program-interpreter name.
///
/// The shell's `PT_INTERP` is tried first, then the usual locations.
fn install_dynamic_linker(
    ctx: &ComposeContext,
    manifest: &[ManifestEntry],
    staging: &mut StagingRoot,
) -> Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = shell_interpreter(ctx, manifest).into_iter().collect();
    candidates.extend(DYNAMIC_LINKER_CANDIDATES.iter().map(PathBuf::from));

    for candidate in &candidates {
        let Some(real) = existing_file(&ctx.source_root, candidate) else {
            continue;
        };
        let name = candidate
            .file_name()
            .context("Dynamic linker path has no file name")?;
        let dest = Path::new(STAGED_LIBRARY_DIR).join(name);
        let source = ctx.source_root.join(&real);
        staging.install_file(&dest, &source, file_mode(&source)?)?;
        tracing::info!("Dynamic linker: {} -> {}", real.display(), dest.display());
        return Ok(dest);
    }

    bail!(
        "Dynamic linker not found under {} (tried {})",
        ctx.source_root.display(),
        candidates
            .iter()
            .map(|c| c.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    )
}

fn shell_interpreter(ctx: &ComposeContext, manifest: &[ManifestEntry]) -> Option<PathBuf> {
    let shell = manifest.iter().find(|e| e.shell)?;
    let real = shell
        .candidate_paths
        .iter()
        .find_map(|c| existing_file(&ctx.source_root, c))?;
    let info = elf::read_dynamic_info(&ctx.source_root.join(real)).ok()??;
    let interp = info.interpreter?;
    Some(PathBuf::from(interp.trim_start_matches('/')))
}

/// Stage one manifest entry and its libraries.
///
/// Returns false for an optional entry with no existing candidate.
fn install_entry(
    ctx: &ComposeContext,
    resolver: &Resolver,
    entry: &ManifestEntry,
    staging: &mut StagingRoot,
    report: &mut ComposeReport,
) -> Result<bool> {
    let found = entry
        .candidate_paths
        .iter()
        .find_map(|c| existing_file(&ctx.source_root, c).map(|real| (c, real)));

    let Some((candidate, real)) = found else {
        if entry.required {
            bail!(
                "Required binary '{}' not found (searched: {})",
                entry.name,
                entry
                    .candidate_paths
                    .iter()
                    .map(|c| c.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        tracing::warn!("Optional binary '{}' not found, skipping", entry.name);
        return Ok(false);
    };

    let source = ctx.source_root.join(&real);
    let dest = entry.destination();
    let real_name = real
        .file_name()
        .context("Resolved binary has no file name")?
        .to_string_lossy()
        .into_owned();

    // `sbin/modprobe -> kmod`: keep the link, stage the file next to it
    let link_target = if real_name == entry.name {
        staging.install_file(&dest, &source, EXEC_MODE)?;
        None
    } else {
        let target_dest = entry.dest_dir.as_path().join(&real_name);
        staging.install_file(&target_dest, &source, EXEC_MODE)?;
        staging.install_symlink(&dest, &real_name)?;
        Some(PathBuf::from(&real_name))
    };
    tracing::debug!("{} -> {}", candidate.display(), dest.display());

    install_libraries(ctx, resolver.resolve(&source)?, staging, report)?;
    report.binaries.push(StagedBinary {
        name: entry.name.clone(),
        source,
        destination: dest,
        link_target,
    });
    Ok(true)
}

fn install_libraries(
    ctx: &ComposeContext,
    libs: BTreeSet<LibraryReference>,
    staging: &mut StagingRoot,
    report: &mut ComposeReport,
) -> Result<()> {
    for lib in libs {
        let mode = file_mode(&lib.resolved_real_path)?;
        staging
            .install_file(&lib.destination_path, &lib.resolved_real_path, mode)
            .with_context(|| {
                format!(
                    "Failed to stage {} from {}",
                    lib.soname,
                    ctx.source_root.display()
                )
            })?;
        report.libraries.insert(lib);
    }
    Ok(())
}

/// Point `/bin/sh` at the staged shell, replacing anything staged there.
fn install_shell_link(staging: &mut StagingRoot, shell: Option<&ManifestEntry>) -> Result<()> {
    let Some(shell) = shell else {
        bail!("No shell staged; the boot resolver needs /bin/sh");
    };
    let sh = Path::new("bin/sh");
    if shell.destination() == sh {
        return Ok(());
    }
    let target = match shell.dest_dir {
        BinDir::Bin => PathBuf::from(&shell.name),
        BinDir::Sbin => Path::new("../sbin").join(&shell.name),
    };
    staging.replace_symlink(sh, target)
}

fn install_etc(staging: &mut StagingRoot) -> Result<()> {
    staging.install_data("etc/passwd", "root:x:0:0:root:/root:/bin/sh\n", 0o644)?;
    staging.install_data("etc/group", "root:x:0:\n", 0o644)?;
    staging.install_data(
        "etc/profile",
        "export PATH=/bin:/sbin\nexport PS1='rookery-initramfs# '\n",
        0o644,
    )?;
    Ok(())
}

fn install_init(
    ctx: &ComposeContext,
    resolver: &Resolver,
    staging: &mut StagingRoot,
    report: &mut ComposeReport,
) -> Result<()> {
    if !ctx.init_program.is_file() {
        bail!(
            "Boot resolver binary not found at {}\n\
             Build it first: cargo build --release --bin rookiso-init",
            ctx.init_program.display()
        );
    }
    staging.install_file("init", &ctx.init_program, EXEC_MODE)?;
    let libs = resolver.resolve_external(&ctx.init_program)?;
    install_libraries(ctx, libs, staging, report)
}

/// Resolve `candidate` inside `root`; `Some` only if it ends at a regular file.
pub(crate) fn existing_file(root: &Path, candidate: &Path) -> Option<PathBuf> {
    let real = resolve_in_root(root, candidate).ok()?;
    root.join(&real).is_file().then_some(real)
}

fn file_mode(path: &Path) -> Result<u32> {
    let md = fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(md.permissions().mode() & 0o7777)
}
