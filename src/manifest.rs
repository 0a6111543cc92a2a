//! The compiled-in boot archive manifest.
//!
//! Which tools and kernel modules end up in the boot archive is a versioned
//! constant of this crate, not runtime input. Bump [`MANIFEST_VERSION`] when
//! the lists change so the build gate notices.

use serde::Serialize;
use std::path::{Path, PathBuf};

pub const MANIFEST_VERSION: u32 = 1;

/// Staged directory for a manifest binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BinDir {
    Bin,
    Sbin,
}

impl BinDir {
    pub fn as_path(self) -> &'static Path {
        match self {
            BinDir::Bin => Path::new("bin"),
            BinDir::Sbin => Path::new("sbin"),
        }
    }
}

/// One logical tool that may live under several names in the source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    /// Staged file name, e.g. `mount`.
    pub name: String,
    /// Paths relative to the source root; the first existing one wins.
    pub candidate_paths: Vec<PathBuf>,
    pub required: bool,
    pub dest_dir: BinDir,
    /// This entry provides `/bin/sh`.
    pub shell: bool,
}

impl ManifestEntry {
    pub fn new(name: &str, dest_dir: BinDir, candidates: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            candidate_paths: candidates.iter().map(PathBuf::from).collect(),
            required: true,
            dest_dir,
            shell: false,
        }
    }

    /// A `bin/<name>` tool searched in the usual bin directories.
    pub fn bin(name: &str) -> Self {
        let candidates = [
            format!("usr/bin/{name}"),
            format!("bin/{name}"),
            format!("usr/sbin/{name}"),
            format!("sbin/{name}"),
        ];
        let refs: Vec<&str> = candidates.iter().map(String::as_str).collect();
        Self::new(name, BinDir::Bin, &refs)
    }

    /// A `sbin/<name>` tool, preferring the sbin directories.
    pub fn sbin(name: &str) -> Self {
        let candidates = [
            format!("usr/sbin/{name}"),
            format!("sbin/{name}"),
            format!("usr/bin/{name}"),
            format!("bin/{name}"),
        ];
        let refs: Vec<&str> = candidates.iter().map(String::as_str).collect();
        Self::new(name, BinDir::Sbin, &refs)
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn as_shell(mut self) -> Self {
        self.shell = true;
        self
    }

    /// Destination of the staged binary, relative to the archive root.
    pub fn destination(&self) -> PathBuf {
        self.dest_dir.as_path().join(&self.name)
    }
}

/// Destination class of a kernel module; only decides the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleClass {
    Fs,
    Block,
    Scsi,
    Cdrom,
    Ata,
    Virtio,
}

impl ModuleClass {
    /// Directory below `lib/modules/<kver>/`.
    pub fn subdir(self) -> &'static str {
        match self {
            ModuleClass::Fs => "kernel/fs",
            ModuleClass::Block => "kernel/drivers/block",
            ModuleClass::Scsi => "kernel/drivers/scsi",
            ModuleClass::Cdrom => "kernel/drivers/cdrom",
            ModuleClass::Ata => "kernel/drivers/ata",
            ModuleClass::Virtio => "kernel/drivers/virtio",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSelection {
    pub name: String,
    pub class: ModuleClass,
}

impl ModuleSelection {
    pub fn new(name: &str, class: ModuleClass) -> Self {
        Self {
            name: name.to_string(),
            class,
        }
    }
}

/// Dynamic linker locations, relative to the source root.
pub const DYNAMIC_LINKER_CANDIDATES: &[&str] = &[
    "lib64/ld-linux-x86-64.so.2",
    "usr/lib64/ld-linux-x86-64.so.2",
    "lib/x86_64-linux-gnu/ld-linux-x86-64.so.2",
    "usr/lib/x86_64-linux-gnu/ld-linux-x86-64.so.2",
    "lib/ld-linux-aarch64.so.1",
    "usr/lib/ld-linux-aarch64.so.1",
];

/// Shell, core file utilities, block/device utilities, kernel-module
/// utilities: everything the boot resolver and the rescue shell call.
pub fn default_manifest() -> Vec<ManifestEntry> {
    let mut entries = vec![ManifestEntry::bin("bash").as_shell()];
    for name in [
        "ls", "cat", "cp", "mv", "rm", "mkdir", "ln", "echo", "sleep", "readlink", "dmesg",
    ] {
        entries.push(ManifestEntry::bin(name));
    }
    for name in ["grep", "less", "find"] {
        entries.push(ManifestEntry::bin(name).optional());
    }
    for name in ["mount", "umount", "losetup", "blkid", "switch_root"] {
        entries.push(ManifestEntry::sbin(name));
    }
    entries.push(ManifestEntry::sbin("lsblk").optional());
    for name in ["modprobe", "insmod", "lsmod"] {
        entries.push(ManifestEntry::sbin(name));
    }
    entries
}

/// Modules for every boot medium the resolver knows how to find.
pub fn default_modules() -> Vec<ModuleSelection> {
    use ModuleClass::*;
    [
        // storage buses
        ("libata", Ata),
        ("ahci", Ata),
        ("ata_piix", Ata),
        ("scsi_mod", Scsi),
        ("sd_mod", Scsi),
        ("usb-storage", Scsi),
        ("uas", Scsi),
        ("nvme", Block),
        // cd-rom
        ("cdrom", Cdrom),
        ("sr_mod", Scsi),
        // filesystems
        ("loop", Block),
        ("squashfs", Fs),
        ("isofs", Fs),
        ("overlay", Fs),
        // virtualization transports
        ("virtio_pci", Virtio),
        ("virtio_blk", Block),
        ("virtio_scsi", Scsi),
    ]
    .into_iter()
    .map(|(name, class)| ModuleSelection::new(name, class))
    .collect()
}
