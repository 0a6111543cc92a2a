//! The in-progress boot archive tree.
//!
//! [`StagingRoot`] is a plain value: a sorted map from destination path
//! (relative to the archive root) to the node that will be installed there.
//! Nothing touches the disk until [`StagingRoot::materialize`], and the
//! archive writer reads the same map, so the staged tree and the archive can
//! never disagree.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

/// Default mode for staged directories.
pub const DIR_MODE: u32 = 0o755;

/// Mode for staged executables.
pub const EXEC_MODE: u32 = 0o755;

/// One installed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    Dir {
        mode: u32,
    },
    /// Regular file copied from `source` (a regular file, never a symlink).
    File {
        source: PathBuf,
        mode: u32,
    },
    /// Regular file with generated contents.
    Data {
        #[serde(skip)]
        contents: Vec<u8>,
        mode: u32,
    },
    Symlink {
        target: PathBuf,
    },
}

/// Outcome of an install call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installed {
    /// The path was new and now holds the node.
    New,
    /// The path was already staged; the existing node was kept.
    Existing,
}

#[derive(Debug, Clone, Default)]
pub struct StagingRoot {
    nodes: BTreeMap<PathBuf, Node>,
}

impl StagingRoot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&Node> {
        self.nodes.get(path.as_ref())
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.nodes.contains_key(path.as_ref())
    }

    /// Entries in archive order: every parent sorts before its children.
    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &Node)> {
        self.nodes.iter()
    }

    /// Create a directory (and its parents).
    pub fn create_dir(&mut self, path: impl AsRef<Path>) -> Result<Installed> {
        let path = normalize(path.as_ref())?;
        self.insert(path, Node::Dir { mode: DIR_MODE })
    }

    /// Stage a copy of the regular file `source` at `dest`.
    pub fn install_file(
        &mut self,
        dest: impl AsRef<Path>,
        source: &Path,
        mode: u32,
    ) -> Result<Installed> {
        let md = fs::symlink_metadata(source)
            .with_context(|| format!("Cannot stage missing file {}", source.display()))?;
        if !md.file_type().is_file() {
            bail!("{} is not a regular file", source.display());
        }
        let dest = normalize(dest.as_ref())?;
        self.insert(
            dest,
            Node::File {
                source: source.to_path_buf(),
                mode,
            },
        )
    }

    /// Stage a file holding `contents`.
    pub fn install_data(
        &mut self,
        dest: impl AsRef<Path>,
        contents: impl Into<Vec<u8>>,
        mode: u32,
    ) -> Result<Installed> {
        let dest = normalize(dest.as_ref())?;
        self.insert(
            dest,
            Node::Data {
                contents: contents.into(),
                mode,
            },
        )
    }

    /// Stage a symlink `dest -> target`.
    pub fn install_symlink(
        &mut self,
        dest: impl AsRef<Path>,
        target: impl AsRef<Path>,
    ) -> Result<Installed> {
        let dest = normalize(dest.as_ref())?;
        self.insert(
            dest,
            Node::Symlink {
                target: target.as_ref().to_path_buf(),
            },
        )
    }

    /// Stage a symlink, replacing whatever was staged at `dest` before.
    ///
    /// Only for links whose target must track the current composition
    /// (`/bin/sh`); everything else goes through first-write-wins.
    pub fn replace_symlink(
        &mut self,
        dest: impl AsRef<Path>,
        target: impl AsRef<Path>,
    ) -> Result<()> {
        let dest = normalize(dest.as_ref())?;
        self.ensure_parents(&dest)?;
        if let Some(Node::Dir { .. }) = self.nodes.get(&dest) {
            bail!("Refusing to replace directory {} with a symlink", dest.display());
        }
        self.nodes.insert(
            dest,
            Node::Symlink {
                target: target.as_ref().to_path_buf(),
            },
        );
        Ok(())
    }

    fn insert(&mut self, dest: PathBuf, node: Node) -> Result<Installed> {
        self.ensure_parents(&dest)?;
        match self.nodes.get(&dest) {
            Some(existing) => {
                if *existing != node {
                    tracing::debug!("{} already staged, keeping first entry", dest.display());
                }
                Ok(Installed::Existing)
            }
            None => {
                self.nodes.insert(dest, node);
                Ok(Installed::New)
            }
        }
    }

    /// Make sure every ancestor of `dest` is a staged directory.
    ///
    /// Paths through a staged symlink are rejected: callers stage under the
    /// real directory (`lib64/modules/x`, never `lib/modules/x`).
    fn ensure_parents(&mut self, dest: &Path) -> Result<()> {
        let mut here = PathBuf::new();
        let Some(parent) = dest.parent() else {
            return Ok(());
        };
        for comp in parent.components() {
            here.push(comp);
            match self.nodes.get(&here) {
                Some(Node::Dir { .. }) => {}
                Some(Node::Symlink { .. }) => bail!(
                    "{} goes through staged symlink {}; stage it under the link target",
                    dest.display(),
                    here.display()
                ),
                Some(_) => bail!(
                    "{} is staged as a file but is needed as a directory",
                    here.display()
                ),
                None => {
                    self.nodes.insert(here.clone(), Node::Dir { mode: DIR_MODE });
                }
            }
        }
        Ok(())
    }

    /// Write the staged tree below `dir`, replacing any previous contents.
    pub fn materialize(&self, dir: &Path) -> Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir)
                .with_context(|| format!("Failed to clean {}", dir.display()))?;
        }
        fs::create_dir_all(dir)?;

        for (path, node) in &self.nodes {
            let dest = dir.join(path);
            match node {
                Node::Dir { mode } => {
                    fs::create_dir_all(&dest)?;
                    set_mode(&dest, *mode)?;
                }
                Node::File { source, mode } => {
                    fs::copy(source, &dest).with_context(|| {
                        format!("Failed to copy {} to {}", source.display(), dest.display())
                    })?;
                    set_mode(&dest, *mode)?;
                }
                Node::Data { contents, mode } => {
                    fs::write(&dest, contents)?;
                    set_mode(&dest, *mode)?;
                }
                Node::Symlink { target } => {
                    symlink(target, &dest).with_context(|| {
                        format!("Failed to link {} -> {}", dest.display(), target.display())
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Paths of all staged regular files, for reports.
    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.nodes
            .iter()
            .filter(|(_, n)| matches!(n, Node::File { .. } | Node::Data { .. }))
            .map(|(p, _)| p)
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions: {}", path.display()))
}

/// Turn `/bin/sh` or `bin/./sh` into `bin/sh`; reject `..` and empty paths.
fn normalize(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                bail!("Invalid staging path {}", path.display())
            }
        }
    }
    if out.as_os_str().is_empty() {
        bail!("Empty staging path");
    }
    Ok(out)
}
