//! Shared-library dependency closure.
//!
//! Given a source root and a binary inside it, find every shared library the
//! binary loads at runtime. Lookups never leave the source root: absolute
//! symlink targets such as `/usr/lib64/libc.so.6` are re-rooted under the
//! source tree instead of being resolved against the host.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::elf;

/// Library directories probed, in order, relative to the source root.
pub const LIBRARY_SEARCH_DIRS: &[&str] = &[
    "lib64",
    "usr/lib64",
    "lib",
    "usr/lib",
    "lib/x86_64-linux-gnu",
    "usr/lib/x86_64-linux-gnu",
    "usr/lib64/systemd",
    "usr/lib/systemd",
];

/// Staged location of every library; the only real library directory.
pub const STAGED_LIBRARY_DIR: &str = "lib64";

/// Same limit the kernel applies when following symlink chains.
const MAX_SYMLINK_HOPS: usize = 40;

/// A shared library needed by some binary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LibraryReference {
    /// The `DT_NEEDED` name, e.g. `libc.so.6`.
    pub soname: String,
    /// The regular file behind the name (never a symlink).
    pub resolved_real_path: PathBuf,
    /// Where the library lands in the staged tree, relative to its root.
    pub destination_path: PathBuf,
}

/// How far to follow dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Depth {
    /// Only the libraries the binary itself declares.
    Direct,
    /// The full closure: libraries of libraries, to a fixed point.
    #[default]
    Transitive,
}

/// Resolves library closures inside one source root.
#[derive(Debug, Clone)]
pub struct Resolver {
    root: PathBuf,
    search_dirs: Vec<PathBuf>,
    depth: Depth,
}

impl Resolver {
    /// Resolver over `root` using [`LIBRARY_SEARCH_DIRS`].
    pub fn new(root: &Path) -> Self {
        Self::with_search_dirs(root, LIBRARY_SEARCH_DIRS)
    }

    pub fn with_search_dirs<S: AsRef<Path>>(root: &Path, search_dirs: &[S]) -> Self {
        Self {
            root: root.to_path_buf(),
            search_dirs: search_dirs.iter().map(|d| d.as_ref().to_path_buf()).collect(),
            depth: Depth::default(),
        }
    }

    pub fn depth(mut self, depth: Depth) -> Self {
        self.depth = depth;
        self
    }

    /// Resolve the libraries needed by `binary` (a path inside the root).
    ///
    /// Names that cannot be found in any search directory are logged and
    /// dropped; only I/O and ELF parse errors fail the call.
    pub fn resolve(&self, binary: &Path) -> Result<BTreeSet<LibraryReference>> {
        let start = self.real_path(binary)?;
        self.closure(start)
    }

    /// Resolve a binary that lives outside the root (the init program)
    /// against the libraries inside it.
    pub fn resolve_external(&self, binary: &Path) -> Result<BTreeSet<LibraryReference>> {
        self.closure(binary.to_path_buf())
    }

    fn closure(&self, start: PathBuf) -> Result<BTreeSet<LibraryReference>> {
        let mut refs = BTreeSet::new();
        let mut names_seen: HashSet<String> = HashSet::new();
        let mut paths_seen: HashSet<PathBuf> = HashSet::from([start.clone()]);
        let mut worklist = VecDeque::from([start]);

        while let Some(path) = worklist.pop_front() {
            let needed = elf::needed_libraries(&path)
                .with_context(|| format!("Failed to read dependencies of {}", path.display()))?;

            for soname in needed {
                if !names_seen.insert(soname.clone()) {
                    continue;
                }
                let Some(found) = self.find_library(&soname) else {
                    tracing::warn!(
                        "{} needs '{}', not found under {}",
                        path.display(),
                        soname,
                        self.root.display()
                    );
                    continue;
                };
                let real = self.real_path(&found)?;
                tracing::debug!("{} -> {}", soname, real.display());

                refs.insert(LibraryReference {
                    destination_path: Path::new(STAGED_LIBRARY_DIR).join(&soname),
                    soname,
                    resolved_real_path: real.clone(),
                });

                if self.depth == Depth::Transitive && paths_seen.insert(real.clone()) {
                    worklist.push_back(real);
                }
            }
        }

        Ok(refs)
    }

    /// First search directory holding `soname`, as a path under the root.
    pub fn find_library(&self, soname: &str) -> Option<PathBuf> {
        self.search_dirs.iter().find_map(|dir| {
            let rel = dir.join(soname);
            let resolved = resolve_in_root(&self.root, &rel).ok()?;
            let candidate = self.root.join(resolved);
            candidate.is_file().then_some(candidate)
        })
    }

    /// Follow every symlink of `path` (under the root) to the regular file.
    pub fn real_path(&self, path: &Path) -> Result<PathBuf> {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        Ok(self.root.join(resolve_in_root(&self.root, rel)?))
    }
}

/// Resolve `path` inside `root`, following symlinks component by component.
///
/// The result is relative to `root` and contains no symlinks. `..` never
/// climbs above the root, and absolute link targets restart from the root.
pub fn resolve_in_root(root: &Path, path: &Path) -> Result<PathBuf> {
    let mut pending: VecDeque<OsString> = components(path);
    let mut resolved = PathBuf::new();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        match part.to_str() {
            Some("/") => resolved.clear(),
            Some(".") => {}
            Some("..") => {
                resolved.pop();
            }
            _ => {
                let candidate = resolved.join(&part);
                let full = root.join(&candidate);
                let md = fs::symlink_metadata(&full)
                    .with_context(|| format!("{} does not exist", full.display()))?;
                if !md.file_type().is_symlink() {
                    resolved = candidate;
                    continue;
                }

                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    bail!("Too many levels of symlinks resolving {}", path.display());
                }
                let target = fs::read_link(&full)?;
                if target.is_absolute() {
                    resolved.clear();
                }
                for comp in components(&target).into_iter().rev() {
                    pending.push_front(comp);
                }
            }
        }
    }

    Ok(resolved)
}

fn components(path: &Path) -> VecDeque<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::RootDir => Some(OsString::from("/")),
            Component::CurDir => None,
            Component::ParentDir => Some(OsString::from("..")),
            Component::Normal(n) => Some(n.to_os_string()),
            Component::Prefix(_) => None,
        })
        .collect()
}
