//! Resolve command - prints the library closure of one binary.

use anyhow::{bail, Result};
use std::path::Path;

use rookiso::config::Config;
use rookiso::resolve::{Depth, Resolver};

/// Execute the resolve command.
///
/// `binary` is taken relative to the source root unless it already points
/// inside it.
pub fn cmd_resolve(config: &Config, binary: &Path, direct: bool) -> Result<()> {
    let root = &config.source_root;
    if !root.is_dir() {
        bail!("Source root not found at {}", root.display());
    }
    let path = if binary.starts_with(root) {
        binary.to_path_buf()
    } else {
        root.join(binary.strip_prefix("/").unwrap_or(binary))
    };

    let depth = if direct { Depth::Direct } else { Depth::Transitive };
    let resolver = Resolver::new(root).depth(depth);
    let libs = resolver.resolve(&path)?;

    if libs.is_empty() {
        println!("{}: no shared libraries", binary.display());
        return Ok(());
    }
    for lib in &libs {
        let real = lib
            .resolved_real_path
            .strip_prefix(root)
            .unwrap_or(&lib.resolved_real_path);
        println!("  {} => /{}", lib.soname, real.display());
    }
    println!("{} libraries", libs.len());
    Ok(())
}
