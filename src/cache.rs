//! Build skipping: hash-based rebuild detection.
//!
//! Uses SHA256 hashes of the build inputs, not mtimes, so touching a file
//! without changing it does not force a new archive.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Hash of a set of named byte inputs.
///
/// Each part is length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
pub fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

/// Hash a file's contents. Returns None if it can't be read.
pub fn hash_file(path: &Path) -> Option<String> {
    match fs::read(path) {
        Ok(content) => Some(format!("{:x}", Sha256::digest(&content))),
        Err(e) => {
            tracing::warn!(
                "Failed to read {} for hashing: {} (cache will be invalidated)",
                path.display(),
                e
            );
            None
        }
    }
}

/// Read cached hash from a .hash file.
pub fn read_cached_hash(hash_file: &Path) -> Option<String> {
    if !hash_file.exists() {
        return None;
    }
    match fs::read_to_string(hash_file) {
        Ok(s) => Some(s.trim().to_string()),
        Err(e) => {
            tracing::warn!(
                "Failed to read cache hash file {}: {} (will rebuild)",
                hash_file.display(),
                e
            );
            None
        }
    }
}

/// Write hash to a .hash file.
pub fn write_cached_hash(hash_file: &Path, hash: &str) -> Result<()> {
    if let Some(parent) = hash_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(hash_file, hash)
        .with_context(|| format!("Failed to write {}", hash_file.display()))?;
    Ok(())
}

/// Check if target needs rebuild based on the input hash.
///
/// Returns true if the target doesn't exist, there is no recorded hash, or
/// the recorded hash differs. Unlike a plain mtime check a missing hash file
/// always rebuilds: the archive may come from a build that failed midway.
pub fn needs_rebuild(input_hash: &str, hash_file: &Path, target: &Path) -> bool {
    if !target.exists() {
        return true;
    }
    match read_cached_hash(hash_file) {
        Some(cached) => cached != input_hash,
        None => true,
    }
}
