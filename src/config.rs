//! Configuration management for rookiso.
//!
//! Reads configuration from a .env file and environment variables.
//! Environment variables take precedence over the .env file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::archive::DEFAULT_GZIP_LEVEL;
use crate::modules;

/// Boot archive file name inside the output directory.
pub const ARCHIVE_NAME: &str = "rookery-initramfs.cpio.gz";

/// Composition report written next to the archive.
pub const REPORT_NAME: &str = "rookery-initramfs.json";

/// Rookiso configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root filesystem binaries and libraries are taken from (default: downloads/rootfs)
    pub source_root: PathBuf,
    /// Kernel version the modules are taken for (default: first under lib/modules)
    pub kernel_version: Option<String>,
    /// Module tree override (default: <source_root>/lib/modules/<kver>)
    pub modules_dir: Option<PathBuf>,
    /// Build output directory (default: output)
    pub output_dir: PathBuf,
    /// Boot resolver binary (default: target/release/rookiso-init)
    pub init_binary: PathBuf,
    pub gzip_level: u32,
}

impl Config {
    /// Load configuration from .env and the environment.
    ///
    /// Relative paths are taken relative to `base_dir`.
    pub fn load(base_dir: &Path) -> Self {
        // Environment variables win; dotenvy never overwrites them
        let _ = dotenvy::from_path(base_dir.join(".env"));

        let path_var = |key: &str| {
            std::env::var(key).ok().filter(|s| !s.is_empty()).map(|s| {
                let path = PathBuf::from(s);
                if path.is_absolute() {
                    path
                } else {
                    base_dir.join(path)
                }
            })
        };

        let gzip_level = match std::env::var("ROOKISO_GZIP_LEVEL") {
            Ok(s) => match s.trim().parse::<u32>() {
                Ok(level) if level <= 9 => level,
                _ => {
                    tracing::warn!(
                        "Ignoring ROOKISO_GZIP_LEVEL={}, expected 0-9; using {}",
                        s,
                        DEFAULT_GZIP_LEVEL
                    );
                    DEFAULT_GZIP_LEVEL
                }
            },
            Err(_) => DEFAULT_GZIP_LEVEL,
        };

        Self {
            source_root: path_var("ROOKISO_SOURCE_ROOT")
                .unwrap_or_else(|| base_dir.join("downloads/rootfs")),
            kernel_version: std::env::var("ROOKISO_KERNEL_VERSION")
                .ok()
                .filter(|s| !s.is_empty()),
            modules_dir: path_var("ROOKISO_MODULES_DIR"),
            output_dir: path_var("ROOKISO_OUTPUT_DIR").unwrap_or_else(|| base_dir.join("output")),
            init_binary: path_var("ROOKISO_INIT_BINARY")
                .unwrap_or_else(|| base_dir.join("target/release/rookiso-init")),
            gzip_level,
        }
    }

    /// Modules base directory of the source root (`lib/modules`).
    pub fn modules_base(&self) -> PathBuf {
        self.source_root.join("lib/modules")
    }

    /// The configured kernel version, or the one found in the source root.
    pub fn resolve_kernel_version(&self) -> Result<String> {
        match &self.kernel_version {
            Some(v) => Ok(v.clone()),
            None => modules::find_kernel_version(&self.modules_base())
                .context("Set ROOKISO_KERNEL_VERSION or populate lib/modules in the source root"),
        }
    }

    /// Module tree for `kernel_version`.
    pub fn module_root(&self, kernel_version: &str) -> PathBuf {
        self.modules_dir
            .clone()
            .unwrap_or_else(|| self.modules_base().join(kernel_version))
    }

    pub fn archive_path(&self) -> PathBuf {
        self.output_dir.join(ARCHIVE_NAME)
    }

    pub fn report_path(&self) -> PathBuf {
        self.output_dir.join(REPORT_NAME)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.output_dir.join("initramfs-root")
    }

    pub fn hash_file(&self) -> PathBuf {
        self.output_dir.join(".initramfs-inputs.hash")
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  ROOKISO_SOURCE_ROOT: {}", self.source_root.display());
        match self.resolve_kernel_version() {
            Ok(v) => println!("  ROOKISO_KERNEL_VERSION: {}", v),
            Err(_) => println!("  ROOKISO_KERNEL_VERSION: (not found)"),
        }
        match &self.modules_dir {
            Some(dir) => println!("  ROOKISO_MODULES_DIR: {}", dir.display()),
            None => println!("  ROOKISO_MODULES_DIR: (source root lib/modules)"),
        }
        println!("  ROOKISO_OUTPUT_DIR: {}", self.output_dir.display());
        println!("  ROOKISO_INIT_BINARY: {}", self.init_binary.display());
        println!("  ROOKISO_GZIP_LEVEL: {}", self.gzip_level);
        if self.source_root.is_dir() {
            println!("  Source root: FOUND");
        } else {
            println!("  Source root: NOT FOUND");
        }
        if self.init_binary.is_file() {
            println!("  Init binary: FOUND");
        } else {
            println!("  Init binary: NOT FOUND (cargo build --release --bin rookiso-init)");
        }
    }
}
