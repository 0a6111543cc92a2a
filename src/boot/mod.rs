//! Boot resolver: what `/init` does between kernel start and the real init.
//!
//! # Boot Flow
//!
//! ```text
//! 1. Mount /proc, /sys (fatal), /dev, /dev/pts, /dev/shm, /run (best effort)
//! 2. Load storage, device-class, filesystem and virtio modules
//! 3. Wait (bounded) for a block device to appear
//! 4. Find the medium carrying rookery/.live-media, mounted at /mnt/media
//! 5. Loop-mount LiveOS/rootfs.img (squashfs) at /mnt/rootfs
//! 6. tmpfs at /overlay + overlay at /newroot (read-only bind on failure)
//! 7. Check /newroot/usr
//! 8. Move /dev, /proc, /sys, /run and the medium into /newroot
//! 9. switch root and exec systemd, /sbin/init or /bin/sh
//! ```
//!
//! Any fatal step returns a [`BootFailure`]; the init binary prints it and
//! drops to a shell.

pub mod cmdline;
pub mod discovery;
pub mod error;
pub mod ops;

use nix::mount::MsFlags;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use cmdline::{BootCmdline, BootMode};
pub use discovery::{BootCandidate, CandidateSource, Probe};
pub use error::BootFailure;
pub use ops::{BootOps, LinuxOps};

pub const MEDIA_MOUNT: &str = "/mnt/media";
pub const ROOTFS_MOUNT: &str = "/mnt/rootfs";
pub const OVERLAY_DIR: &str = "/overlay";
pub const NEW_ROOT: &str = "/newroot";

/// Marker identifying the live medium, relative to its root.
pub const MEDIA_MARKER: &str = "rookery/.live-media";

/// Compressed system image, relative to the medium's root.
pub const SYSTEM_IMAGE: &str = "LiveOS/rootfs.img";

/// Where the medium stays reachable after handoff, relative to the new root.
pub const MEDIA_HANDOFF_DIR: &str = "run/rookery/media";

/// Init programs in order of preference, inside the new root.
pub const INIT_CANDIDATES: &[&str] = &["/usr/lib/systemd/systemd", "/sbin/init", "/bin/sh"];

/// Module load order: storage buses, device classes, filesystems, virtio.
pub const MODULE_LOAD_ORDER: &[&[&str]] = &[
    &["scsi_mod", "libata", "ahci", "ata_piix", "nvme", "usb_storage", "uas"],
    &["cdrom", "sr_mod", "sd_mod"],
    &["loop", "squashfs", "isofs", "overlay"],
    &["virtio_pci", "virtio_blk", "virtio_scsi"],
];

pub const SETTLE_INTERVAL: Duration = Duration::from_millis(250);

/// Environment variable carrying the boot mode to the real init.
pub const BOOT_MODE_ENV: &str = "ROOKERY_BOOT_MODE";

/// Mounts migrated into the new root, in order.
const MIGRATED_MOUNTS: &[&str] = &["/dev", "/proc", "/sys", "/run"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PseudoFilesystems,
    Modules,
    Settle,
    Discovery,
    SystemImage,
    Overlay,
    Validate,
    Migrate,
    Emergency,
    Handoff,
}

/// Layers of the writable root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySpec {
    pub lower_dir: PathBuf,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
    pub merged_dir: PathBuf,
}

impl OverlaySpec {
    /// Upper and work on the tmpfs at `tmpfs_dir`.
    pub fn on_tmpfs(lower: &Path, tmpfs_dir: &Path, merged: &Path) -> Self {
        Self {
            lower_dir: lower.to_path_buf(),
            upper_dir: tmpfs_dir.join("upper"),
            work_dir: tmpfs_dir.join("work"),
            merged_dir: merged.to_path_buf(),
        }
    }

    pub fn mount_options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower_dir.display(),
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// How the new root ended up mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootMode {
    Overlay,
    /// The overlay failed; the image is bind-mounted and changes are lost
    /// on write.
    ReadOnly,
}

pub struct BootResolver<O: BootOps> {
    ops: O,
    cmdline: BootCmdline,
    trace: Vec<Stage>,
    media: Option<BootCandidate>,
    root_mode: Option<RootMode>,
}

impl<O: BootOps> BootResolver<O> {
    pub fn new(ops: O) -> Self {
        Self {
            ops,
            cmdline: BootCmdline::default(),
            trace: Vec::new(),
            media: None,
            root_mode: None,
        }
    }

    /// Stages entered so far, in order.
    pub fn trace(&self) -> &[Stage] {
        &self.trace
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn media(&self) -> Option<&BootCandidate> {
        self.media.as_ref()
    }

    pub fn root_mode(&self) -> Option<RootMode> {
        self.root_mode
    }

    /// Run the boot sequence.
    ///
    /// On success this never returns: the process image is replaced by the
    /// real init. `on_cmdline` is called once the kernel command line has
    /// been read, before anything it influences.
    pub fn run(
        &mut self,
        on_cmdline: impl FnOnce(&BootCmdline),
    ) -> Result<Infallible, BootFailure> {
        self.mount_pseudo_filesystems()?;

        self.cmdline = match self.ops.kernel_cmdline() {
            Ok(line) => BootCmdline::parse(&line),
            Err(e) => {
                tracing::warn!("Cannot read /proc/cmdline: {}", e);
                BootCmdline::default()
            }
        };
        on_cmdline(&self.cmdline);
        tracing::debug!("{:?}", self.cmdline);

        self.load_modules();
        self.settle();
        self.discover_media()?;
        self.mount_system_image()?;
        self.mount_overlay()?;
        self.validate()?;
        self.migrate_mounts();
        if self.cmdline.emergency {
            self.emergency_shell();
        }
        self.handoff()
    }

    fn enter(&mut self, stage: Stage) {
        tracing::debug!("stage: {:?}", stage);
        self.trace.push(stage);
    }

    fn mount_pseudo_filesystems(&mut self) -> Result<(), BootFailure> {
        self.enter(Stage::PseudoFilesystems);
        let restricted = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;

        for (fstype, target) in [("proc", "/proc"), ("sysfs", "/sys")] {
            let target = Path::new(target);
            let result = self
                .ops
                .create_dir(target)
                .and_then(|_| self.ops.mount(fstype, target, Some(fstype), restricted, None));
            if let Err(source) = result {
                return Err(BootFailure::PseudoFs {
                    fstype,
                    target: target.to_path_buf(),
                    source,
                });
            }
        }

        let best_effort: [(&str, &str, MsFlags, Option<&str>); 4] = [
            ("devtmpfs", "/dev", MsFlags::MS_NOSUID, Some("mode=0755")),
            ("devpts", "/dev/pts", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC, None),
            ("tmpfs", "/dev/shm", MsFlags::MS_NOSUID | MsFlags::MS_NODEV, None),
            ("tmpfs", "/run", MsFlags::MS_NOSUID | MsFlags::MS_NODEV, Some("mode=0755")),
        ];
        for (fstype, target, flags, data) in best_effort {
            let target = Path::new(target);
            let result = self
                .ops
                .create_dir(target)
                .and_then(|_| self.ops.mount(fstype, target, Some(fstype), flags, data));
            if let Err(e) = result {
                tracing::warn!("Failed to mount {} on {}: {}", fstype, target.display(), e);
            }
        }
        Ok(())
    }

    fn load_modules(&mut self) {
        self.enter(Stage::Modules);
        for group in MODULE_LOAD_ORDER {
            for name in *group {
                match self.ops.load_module(name) {
                    Ok(()) => tracing::debug!("loaded {}", name),
                    Err(e) => tracing::debug!("{}: built-in or unavailable ({})", name, e),
                }
            }
        }
    }

    /// Poll until a block device shows up or the settle time runs out.
    fn settle(&mut self) {
        self.enter(Stage::Settle);
        let limit = self.cmdline.settle;
        let mut waited = Duration::ZERO;
        let explicit = self.cmdline.media.clone();

        while !discovery::any_block_device(&self.ops, explicit.as_deref()) {
            if waited >= limit {
                tracing::warn!("No block device after {:?}, probing anyway", limit);
                return;
            }
            self.ops.sleep(SETTLE_INTERVAL);
            waited += SETTLE_INTERVAL;
        }
        tracing::debug!("Devices settled after {:?}", waited);
    }

    fn discover_media(&mut self) -> Result<(), BootFailure> {
        self.enter(Stage::Discovery);
        let sources = CandidateSource::chain(self.cmdline.media.as_deref());
        let search = discovery::find_media(
            &mut self.ops,
            &sources,
            Path::new(MEDIA_MOUNT),
            Path::new(MEDIA_MARKER),
        );
        match search.probe {
            Probe::Found(candidate) => {
                self.media = Some(candidate);
                Ok(())
            }
            Probe::Exhausted => Err(BootFailure::NoMedia {
                attempts: search.rejected,
            }),
        }
    }

    fn mount_system_image(&mut self) -> Result<(), BootFailure> {
        self.enter(Stage::SystemImage);
        let image = Path::new(MEDIA_MOUNT).join(SYSTEM_IMAGE);
        let fail = |reason: String| BootFailure::SystemImage {
            image: image.clone(),
            reason,
        };

        if !self.ops.exists(&image) {
            return Err(fail("not present on the boot media".to_string()));
        }
        let loop_dev = self
            .ops
            .attach_loop(&image)
            .map_err(|e| fail(format!("loop setup: {}", e)))?;

        let target = Path::new(ROOTFS_MOUNT);
        self.ops
            .create_dir(target)
            .and_then(|_| {
                self.ops.mount(
                    &loop_dev.to_string_lossy(),
                    target,
                    Some("squashfs"),
                    MsFlags::MS_RDONLY,
                    None,
                )
            })
            .map_err(|e| fail(format!("squashfs mount of {}: {}", loop_dev.display(), e)))?;

        tracing::info!("System image mounted from {}", loop_dev.display());
        Ok(())
    }

    fn mount_overlay(&mut self) -> Result<(), BootFailure> {
        self.enter(Stage::Overlay);
        let layers = OverlaySpec::on_tmpfs(
            Path::new(ROOTFS_MOUNT),
            Path::new(OVERLAY_DIR),
            Path::new(NEW_ROOT),
        );

        let overlay = self.try_overlay(&layers);
        let overlay_err = match overlay {
            Ok(()) => {
                tracing::info!("Overlay root mounted at {}", NEW_ROOT);
                self.root_mode = Some(RootMode::Overlay);
                return Ok(());
            }
            Err(e) => e,
        };

        tracing::warn!(
            "Overlay failed ({}); continuing with a read-only root",
            overlay_err
        );
        let bind = self.ops.create_dir(&layers.merged_dir).and_then(|_| {
            self.ops.mount(
                ROOTFS_MOUNT,
                &layers.merged_dir,
                None,
                MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                None,
            )
        });
        match bind {
            Ok(()) => {
                self.root_mode = Some(RootMode::ReadOnly);
                Ok(())
            }
            Err(e) => Err(BootFailure::Overlay {
                overlay: overlay_err.to_string(),
                bind: e.to_string(),
            }),
        }
    }

    fn try_overlay(&mut self, layers: &OverlaySpec) -> std::io::Result<()> {
        let tmpfs = Path::new(OVERLAY_DIR);
        let tmpfs_opts = format!("size={},mode=0755", self.cmdline.overlay_size);
        self.ops.create_dir(tmpfs)?;
        self.ops.mount(
            "tmpfs",
            tmpfs,
            Some("tmpfs"),
            MsFlags::empty(),
            Some(tmpfs_opts.as_str()),
        )?;
        self.ops.create_dir(&layers.upper_dir)?;
        self.ops.create_dir(&layers.work_dir)?;
        self.ops.create_dir(&layers.merged_dir)?;
        self.ops.mount(
            "overlay",
            &layers.merged_dir,
            Some("overlay"),
            MsFlags::empty(),
            Some(layers.mount_options().as_str()),
        )
    }

    fn validate(&mut self) -> Result<(), BootFailure> {
        self.enter(Stage::Validate);
        let usr = Path::new(NEW_ROOT).join("usr");
        if self.ops.exists(&usr) {
            Ok(())
        } else {
            Err(BootFailure::Validation { missing: usr })
        }
    }

    fn migrate_mounts(&mut self) {
        self.enter(Stage::Migrate);
        let new_root = Path::new(NEW_ROOT);

        let mut moves: Vec<(PathBuf, PathBuf)> = MIGRATED_MOUNTS
            .iter()
            .map(|m| (PathBuf::from(m), new_root.join(&m[1..])))
            .collect();
        moves.push((PathBuf::from(MEDIA_MOUNT), new_root.join(MEDIA_HANDOFF_DIR)));

        for (from, to) in moves {
            let result = self.ops.create_dir(&to).and_then(|_| {
                self.ops.mount(
                    &from.to_string_lossy(),
                    &to,
                    None,
                    MsFlags::MS_MOVE,
                    None,
                )
            });
            if let Err(e) = result {
                tracing::warn!(
                    "Failed to move {} to {}: {}",
                    from.display(),
                    to.display(),
                    e
                );
            }
        }
    }

    fn emergency_shell(&mut self) {
        self.enter(Stage::Emergency);
        println!("rookery: emergency shell requested; exit to continue booting");
        if let Err(e) = self.ops.shell() {
            tracing::warn!("Emergency shell failed: {}", e);
        }
    }

    fn handoff(&mut self) -> Result<Infallible, BootFailure> {
        self.enter(Stage::Handoff);
        let new_root = Path::new(NEW_ROOT);

        let init = match discovery::first_existing(&self.ops, new_root, INIT_CANDIDATES) {
            Probe::Found(init) => init,
            Probe::Exhausted => {
                return Err(BootFailure::NoInit {
                    tried: INIT_CANDIDATES.iter().map(|s| s.to_string()).collect(),
                })
            }
        };

        tracing::info!(
            "Switching root to {} ({} mode)",
            NEW_ROOT,
            self.cmdline.mode.as_str()
        );
        let env = [(BOOT_MODE_ENV, self.cmdline.mode.as_str())];
        match self.ops.switch_root(new_root, &init, &env) {
            Ok(never) => match never {},
            Err(source) => Err(BootFailure::Handoff { init, source }),
        }
    }
}
