//! Boot archive serialization: staged tree → gzip-compressed newc cpio.

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::cpio::CpioWriter;
use crate::staging::{Node, StagingRoot};

/// Default gzip level, same as `gzip -9`.
pub const DEFAULT_GZIP_LEVEL: u32 = 9;

/// Serialize `staging` into a compressed archive stream.
pub fn write_archive<W: Write>(staging: &StagingRoot, out: W, level: u32) -> Result<W> {
    let encoder = GzEncoder::new(out, Compression::new(level.min(9)));
    let mut cpio = CpioWriter::new(encoder);

    for (path, node) in staging.iter() {
        let name = path
            .to_str()
            .with_context(|| format!("Non UTF-8 staging path {}", path.display()))?;
        match node {
            Node::Dir { mode } => cpio.append_dir(name, *mode)?,
            Node::File { source, mode } => {
                let f = fs::File::open(source)
                    .with_context(|| format!("Failed to open {}", source.display()))?;
                let len = f.metadata()?.len();
                cpio.append_file(name, *mode, len, f)
                    .with_context(|| format!("Failed to archive {}", source.display()))?;
            }
            Node::Data { contents, mode } => {
                cpio.append_file(name, *mode, contents.len() as u64, contents.as_slice())?
            }
            Node::Symlink { target } => {
                let target = target
                    .to_str()
                    .with_context(|| format!("Non UTF-8 symlink target for {name}"))?;
                cpio.append_symlink(name, target)?;
            }
        }
    }

    if cpio.entries() == 0 {
        bail!("Refusing to write a boot archive with no entries");
    }
    let encoder = cpio.finish()?;
    Ok(encoder.finish()?)
}

/// Write the boot archive to `output`.
///
/// The archive is built next to the destination and renamed into place, so a
/// failed build never leaves a truncated archive where the bootloader
/// configuration expects a good one.
pub fn build_boot_archive(staging: &StagingRoot, output: &Path, level: u32) -> Result<u64> {
    if staging.is_empty() {
        bail!("Staging tree is empty, nothing to archive");
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    let file_name = output
        .file_name()
        .context("Boot archive path has no file name")?
        .to_string_lossy();
    let temp = output.with_file_name(format!("{}.tmp", file_name));

    let result = (|| -> Result<()> {
        let f = fs::File::create(&temp)
            .with_context(|| format!("Failed to create {}", temp.display()))?;
        let mut w = write_archive(staging, BufWriter::new(f), level)?;
        w.flush()?;
        Ok(())
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }

    let size = fs::metadata(&temp)?.len();
    if size == 0 {
        let _ = fs::remove_file(&temp);
        bail!("Boot archive build produced an empty file");
    }

    fs::rename(&temp, output)
        .with_context(|| format!("Failed to move archive into {}", output.display()))?;
    tracing::info!("Boot archive written: {} ({} KB)", output.display(), size / 1024);
    Ok(size)
}
