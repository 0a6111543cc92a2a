//! Boot media discovery.
//!
//! Candidates come from an ordered list of sources. A source only produces
//! its devices when the search reaches it, so the `/dev` scan never runs if
//! an optical drive already had the medium.

use nix::mount::MsFlags;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::ops::BootOps;

/// Optical drives, probed before anything else.
pub const OPTICAL_DEVICES: &[&str] = &["/dev/sr0", "/dev/sr1", "/dev/cdrom"];

/// Outcome of walking a fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Found(T),
    Exhausted,
}

/// A device that was probed for the live medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootCandidate {
    pub device_path: PathBuf,
    pub mounted: bool,
    pub contains_marker: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSource {
    /// A device named on the kernel command line.
    Explicit(PathBuf),
    Optical,
    /// Every disk-like node in `/dev`, sorted by name.
    DiskScan,
}

impl CandidateSource {
    /// The default chain, with an explicit device first if one was given.
    pub fn chain(explicit: Option<&Path>) -> Vec<CandidateSource> {
        let mut sources: Vec<_> = explicit
            .map(|p| CandidateSource::Explicit(p.to_path_buf()))
            .into_iter()
            .collect();
        sources.push(CandidateSource::Optical);
        sources.push(CandidateSource::DiskScan);
        sources
    }

    pub fn candidates<O: BootOps>(&self, ops: &O) -> Vec<PathBuf> {
        match self {
            CandidateSource::Explicit(dev) => vec![dev.clone()],
            CandidateSource::Optical => OPTICAL_DEVICES.iter().map(PathBuf::from).collect(),
            CandidateSource::DiskScan => {
                let mut names: Vec<String> = match ops.list_devices() {
                    Ok(names) => names.into_iter().filter(|n| is_disk_like(n)).collect(),
                    Err(e) => {
                        tracing::warn!("Cannot list /dev: {}", e);
                        Vec::new()
                    }
                };
                names.sort();
                names.into_iter().map(|n| Path::new("/dev").join(n)).collect()
            }
        }
    }
}

/// `sd*`, `vd*`, `xvd*`, `hd*`, `nvme*n*` and `mmcblk*` nodes, partitions
/// included.
pub fn is_disk_like(name: &str) -> bool {
    for prefix in ["sd", "vd", "xvd", "hd"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            return rest.starts_with(|c: char| c.is_ascii_lowercase());
        }
    }
    if let Some(rest) = name.strip_prefix("nvme") {
        let after_ctrl = rest.trim_start_matches(|c: char| c.is_ascii_digit());
        return after_ctrl.len() < rest.len()
            && after_ctrl
                .strip_prefix('n')
                .is_some_and(|ns| ns.starts_with(|c: char| c.is_ascii_digit()));
    }
    if let Some(rest) = name.strip_prefix("mmcblk") {
        return rest.starts_with(|c: char| c.is_ascii_digit());
    }
    false
}

/// True once any optical or disk-like node exists.
pub fn any_block_device<O: BootOps>(ops: &O, explicit: Option<&Path>) -> bool {
    explicit.is_some_and(|dev| ops.exists(dev))
        || OPTICAL_DEVICES.iter().any(|d| ops.exists(Path::new(d)))
        || ops
            .list_devices()
            .map(|names| names.iter().any(|n| is_disk_like(n)))
            .unwrap_or(false)
}

/// Result of [`find_media`]: the probe outcome plus every rejected device
/// with the reason, for the diagnostic.
#[derive(Debug)]
pub struct MediaSearch {
    pub probe: Probe<BootCandidate>,
    pub rejected: Vec<(PathBuf, String)>,
}

/// Walk `sources` until a device carries `marker`.
///
/// Each existing device is mounted read-only as iso9660 at `mount_point`.
/// The winner stays mounted; every other mounted candidate is unmounted
/// before moving on.
pub fn find_media<O: BootOps>(
    ops: &mut O,
    sources: &[CandidateSource],
    mount_point: &Path,
    marker: &Path,
) -> MediaSearch {
    let mut rejected = Vec::new();
    let mut seen = HashSet::new();

    if let Err(e) = ops.create_dir(mount_point) {
        tracing::warn!("Cannot create {}: {}", mount_point.display(), e);
    }

    for source in sources {
        for device in source.candidates(ops) {
            if !seen.insert(device.clone()) || !ops.exists(&device) {
                continue;
            }
            let mut candidate = BootCandidate {
                device_path: device.clone(),
                mounted: false,
                contains_marker: false,
            };

            let source_str = device.to_string_lossy();
            if let Err(e) = ops.mount(
                &source_str,
                mount_point,
                Some("iso9660"),
                MsFlags::MS_RDONLY,
                None,
            ) {
                tracing::debug!("{}: not mountable as iso9660: {}", device.display(), e);
                rejected.push((device, e.to_string()));
                continue;
            }
            candidate.mounted = true;
            candidate.contains_marker = ops.exists(&mount_point.join(marker));

            if candidate.contains_marker {
                tracing::info!("Boot media found on {}", device.display());
                return MediaSearch {
                    probe: Probe::Found(candidate),
                    rejected,
                };
            }

            tracing::debug!("{}: no {}", device.display(), marker.display());
            if let Err(e) = ops.umount(mount_point) {
                tracing::warn!("Failed to unmount {}: {}", device.display(), e);
            }
            rejected.push((device, format!("mounted, no {}", marker.display())));
        }
    }

    MediaSearch {
        probe: Probe::Exhausted,
        rejected,
    }
}

/// First of `candidates` (absolute paths inside `root`) that is a regular
/// file there, following symlinks as `root` would see them.
pub fn first_existing<O: BootOps>(ops: &O, root: &Path, candidates: &[&str]) -> Probe<PathBuf> {
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|c| ops.is_file_in_root(root, c))
        .map_or(Probe::Exhausted, Probe::Found)
}
