//! The system calls the boot resolver makes, behind a trait.
//!
//! [`LinuxOps`] is the real thing, used as PID 1 inside the boot archive.
//! Tests drive the resolver with a recording fake instead.

use nix::dir::Dir;
use nix::fcntl::{AtFlags, OFlag};
use nix::libc::dev_t;
use nix::mount::MsFlags;
use nix::sys::stat::{fstat, fstatat, Mode, SFlag};
use nix::unistd::UnlinkatFlags;
use std::convert::Infallible;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::Cmd;
use crate::resolve::resolve_in_root;

pub trait BootOps {
    fn mount(
        &mut self,
        source: &str,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> io::Result<()>;

    fn umount(&mut self, target: &Path) -> io::Result<()>;

    fn create_dir(&mut self, path: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;

    /// Whether `path` is a regular file once its symlinks are resolved
    /// inside `root` rather than against the running system.
    fn is_file_in_root(&self, root: &Path, path: &Path) -> bool;

    /// Names of the entries in `/dev`.
    fn list_devices(&self) -> io::Result<Vec<String>>;

    fn kernel_cmdline(&self) -> io::Result<String>;

    fn load_module(&mut self, name: &str) -> io::Result<()>;

    /// Attach `image` to a free read-only loop device and return the device.
    fn attach_loop(&mut self, image: &Path) -> io::Result<PathBuf>;

    fn sleep(&mut self, duration: Duration);

    /// Run an interactive shell and wait for it to exit.
    fn shell(&mut self) -> io::Result<()>;

    /// Make `new_root` the root and exec `init` inside it. Only returns on
    /// failure.
    fn switch_root(
        &mut self,
        new_root: &Path,
        init: &Path,
        env: &[(&str, &str)],
    ) -> io::Result<Infallible>;
}

/// Boot operations on the running system.
#[derive(Debug, Default)]
pub struct LinuxOps;

impl LinuxOps {
    pub fn new() -> Self {
        Self
    }
}

fn cmd_error(e: anyhow::Error) -> io::Error {
    io::Error::other(format!("{:#}", e))
}

impl BootOps for LinuxOps {
    fn mount(
        &mut self,
        source: &str,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> io::Result<()> {
        nix::mount::mount(Some(source), target, fstype, flags, data)?;
        Ok(())
    }

    fn umount(&mut self, target: &Path) -> io::Result<()> {
        nix::mount::umount(target)?;
        Ok(())
    }

    fn create_dir(&mut self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file_in_root(&self, root: &Path, path: &Path) -> bool {
        resolve_in_root(root, path)
            .map(|real| root.join(real).is_file())
            .unwrap_or(false)
    }

    fn list_devices(&self) -> io::Result<Vec<String>> {
        Ok(fs::read_dir("/dev")?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect())
    }

    fn kernel_cmdline(&self) -> io::Result<String> {
        fs::read_to_string("/proc/cmdline")
    }

    fn load_module(&mut self, name: &str) -> io::Result<()> {
        let result = Cmd::new("modprobe")
            .arg(name)
            .allow_fail()
            .run()
            .map_err(cmd_error)?;
        if result.success() {
            Ok(())
        } else {
            Err(io::Error::other(result.stderr_trimmed().to_string()))
        }
    }

    fn attach_loop(&mut self, image: &Path) -> io::Result<PathBuf> {
        let result = Cmd::new("losetup")
            .args(["-f", "--show", "-r"])
            .arg_path(image)
            .error_msg("losetup failed")
            .run()
            .map_err(cmd_error)?;
        Ok(PathBuf::from(result.stdout_trimmed()))
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn shell(&mut self) -> io::Result<()> {
        Cmd::new("/bin/sh")
            .allow_fail()
            .run_interactive()
            .map_err(cmd_error)?;
        Ok(())
    }

    fn switch_root(
        &mut self,
        new_root: &Path,
        init: &Path,
        env: &[(&str, &str)],
    ) -> io::Result<Infallible> {
        let init_c = CString::new(init.as_os_str().as_bytes())?;

        nix::unistd::chdir(new_root)?;
        // Held across the move so the archive can be emptied once the new
        // root is in place.
        let old_root = if std::process::id() == 1 {
            match Dir::open("/", OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty()) {
                Ok(dir) => Some(dir),
                Err(e) => {
                    tracing::warn!("Cannot open the boot archive root: {}", e);
                    None
                }
            }
        } else {
            None
        };

        nix::mount::mount(
            Some("."),
            "/",
            None::<&str>,
            MsFlags::MS_MOVE,
            None::<&str>,
        )?;
        nix::unistd::chroot(".")?;
        nix::unistd::chdir("/")?;

        if let Some(mut dir) = old_root {
            match fstat(dir.as_raw_fd()) {
                Ok(st) => free_initramfs(&mut dir, st.st_dev),
                Err(e) => tracing::warn!("Cannot stat the boot archive root: {}", e),
            }
        }

        for (key, value) in env {
            std::env::set_var(key, value);
        }
        tracing::info!("Handing off to {}", init.display());
        let argv = [init_c.clone()];
        match nix::unistd::execv(&init_c, &argv) {
            Ok(never) => match never {},
            Err(errno) => Err(errno.into()),
        }
    }
}

/// Delete the boot archive contents through `dir`.
///
/// Mirrors `switch_root(8)`: the rootfs memory is only reclaimed if its files
/// are gone. Runs after the root has moved, so everything is reached through
/// descriptors. Directories on another device than `dev` are left alone.
fn free_initramfs(dir: &mut Dir, dev: dev_t) {
    let fd = dir.as_raw_fd();
    let names: Vec<CString> = dir
        .iter()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_owned())
        .filter(|n| n.as_bytes() != b"." && n.as_bytes() != b"..")
        .collect();

    for name in names {
        let Ok(st) = fstatat(Some(fd), name.as_c_str(), AtFlags::AT_SYMLINK_NOFOLLOW) else {
            continue;
        };
        let is_dir = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFDIR;
        if is_dir {
            if st.st_dev != dev {
                continue;
            }
            match Dir::openat(
                Some(fd),
                name.as_c_str(),
                OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW,
                Mode::empty(),
            ) {
                Ok(mut sub) => free_initramfs(&mut sub, dev),
                Err(e) => tracing::debug!("Could not open {:?}: {}", name, e),
            }
        }

        let flag = if is_dir {
            UnlinkatFlags::RemoveDir
        } else {
            UnlinkatFlags::NoRemoveDir
        };
        if let Err(e) = nix::unistd::unlinkat(Some(fd), name.as_c_str(), flag) {
            tracing::debug!("Could not remove {:?}: {}", name, e);
        }
    }
}
