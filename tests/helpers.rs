//! Shared test utilities for rookiso tests.

#![allow(dead_code)]

use nix::mount::MsFlags;
use rookiso::boot::BootOps;
use rookiso::compose::ComposeContext;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::convert::Infallible;
use std::fs;
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Test environment with a source root and a work directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Mock root filesystem (source of binaries and libraries)
    pub source_root: PathBuf,
    /// Build outputs (staging tree, archive)
    pub work: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let source_root = temp_dir.path().join("rootfs");
        let work = temp_dir.path().join("work");
        fs::create_dir_all(&source_root).expect("Failed to create rootfs dir");
        fs::create_dir_all(&work).expect("Failed to create work dir");

        Self {
            _temp_dir: temp_dir,
            source_root,
            work,
        }
    }

    /// Compose context staging into `work/<name>`, with a mock init program
    /// that needs only libc.
    pub fn compose_context(&self, name: &str) -> ComposeContext {
        let init = self.work.join("rookiso-init");
        if !init.exists() {
            write_elf(&init, &["libc.so.6"], None);
        }
        ComposeContext {
            source_root: self.source_root.clone(),
            kernel_version: "6.6.1-rookery".to_string(),
            module_root: self.source_root.join("lib/modules/6.6.1-rookery"),
            init_program: init,
            staging_dir: self.work.join(name),
        }
    }
}

/// Build a minimal little-endian x86_64 ELF shared object.
///
/// Contains `.dynstr`, a one-entry `.dynsym`, a `.dynamic` with one
/// `DT_NEEDED` per name, and optionally a `PT_INTERP` segment. Not runnable,
/// but every field the dependency reader looks at is real.
pub fn elf_bytes(needed: &[&str], interp: Option<&str>) -> Vec<u8> {
    const EHDR: usize = 64;
    const PHDR: usize = 56;
    const SHDR: usize = 64;

    let phnum = usize::from(interp.is_some());
    let mut data = Vec::new();
    let data_start = EHDR + PHDR * phnum;

    let interp_off = data_start + data.len();
    if let Some(interp) = interp {
        data.extend_from_slice(interp.as_bytes());
        data.push(0);
    }
    let interp_len = data_start + data.len() - interp_off;

    let dynstr_off = data_start + data.len();
    let mut name_offsets = Vec::new();
    data.push(0);
    for name in needed {
        name_offsets.push(data_start + data.len() - dynstr_off);
        data.extend_from_slice(name.as_bytes());
        data.push(0);
    }
    let dynstr_len = data_start + data.len() - dynstr_off;

    pad_to(&mut data, data_start, 8);
    let dynsym_off = data_start + data.len();
    data.extend_from_slice(&[0u8; 24]);

    let dynamic_off = data_start + data.len();
    for off in &name_offsets {
        data.extend_from_slice(&1i64.to_le_bytes()); // DT_NEEDED
        data.extend_from_slice(&(*off as u64).to_le_bytes());
    }
    data.extend_from_slice(&[0u8; 16]); // DT_NULL
    let dynamic_len = data_start + data.len() - dynamic_off;

    let shstrtab_off = data_start + data.len();
    let shstrtab = b"\0.dynstr\0.dynsym\0.dynamic\0.shstrtab\0";
    data.extend_from_slice(shstrtab);

    pad_to(&mut data, data_start, 8);
    let shoff = data_start + data.len();

    let mut out = Vec::new();
    // e_ident: magic, ELFCLASS64, ELFDATA2LSB, EV_CURRENT, SYSV
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&3u16.to_le_bytes()); // ET_DYN
    out.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // e_entry
    let phoff = if phnum > 0 { EHDR as u64 } else { 0 };
    out.extend_from_slice(&phoff.to_le_bytes());
    out.extend_from_slice(&(shoff as u64).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHDR as u16).to_le_bytes());
    out.extend_from_slice(&(PHDR as u16).to_le_bytes());
    out.extend_from_slice(&(phnum as u16).to_le_bytes());
    out.extend_from_slice(&(SHDR as u16).to_le_bytes());
    out.extend_from_slice(&5u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&4u16.to_le_bytes()); // e_shstrndx

    if interp.is_some() {
        out.extend_from_slice(&3u32.to_le_bytes()); // PT_INTERP
        out.extend_from_slice(&4u32.to_le_bytes()); // PF_R
        out.extend_from_slice(&(interp_off as u64).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&(interp_len as u64).to_le_bytes());
        out.extend_from_slice(&(interp_len as u64).to_le_bytes());
        out.extend_from_slice(&1u64.to_le_bytes());
    }

    out.extend_from_slice(&data);

    // name, type, flags, offset, size, link, info, align, entsize
    let sections: [(u32, u32, u64, usize, usize, u32, u32, u64, u64); 5] = [
        (0, 0, 0, 0, 0, 0, 0, 0, 0),
        (1, 3, 2, dynstr_off, dynstr_len, 0, 0, 1, 0), // .dynstr SHT_STRTAB
        (9, 11, 2, dynsym_off, 24, 1, 1, 8, 24),       // .dynsym SHT_DYNSYM
        (17, 6, 3, dynamic_off, dynamic_len, 1, 0, 8, 16), // .dynamic SHT_DYNAMIC
        (26, 3, 0, shstrtab_off, shstrtab.len(), 0, 0, 1, 0), // .shstrtab
    ];
    for (name, ty, flags, off, size, link, info, align, entsize) in sections {
        out.extend_from_slice(&name.to_le_bytes());
        out.extend_from_slice(&ty.to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
        out.extend_from_slice(&(off as u64).to_le_bytes());
        out.extend_from_slice(&(size as u64).to_le_bytes());
        out.extend_from_slice(&link.to_le_bytes());
        out.extend_from_slice(&info.to_le_bytes());
        out.extend_from_slice(&align.to_le_bytes());
        out.extend_from_slice(&entsize.to_le_bytes());
    }
    out
}

fn pad_to(data: &mut Vec<u8>, base: usize, align: usize) {
    while (base + data.len()) % align != 0 {
        data.push(0);
    }
}

/// Write an executable mock ELF file.
pub fn write_elf(path: &Path, needed: &[&str], interp: Option<&str>) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir for ELF");
    }
    fs::write(path, elf_bytes(needed, interp)).expect("Failed to write ELF");
    let mut perms = fs::metadata(path).expect("Failed to get metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("Failed to set permissions");
}

/// Create a relative or absolute symlink, making parents as needed.
pub fn link(path: &Path, target: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir for symlink");
    }
    symlink(target, path).expect("Failed to create symlink");
}

/// Libraries of the standard mock root.
pub const MOCK_LIBRARIES: &[&str] = &["libc.so.6", "libtinfo.so.6", "libselinux.so.1"];

/// Binaries of the standard mock root: (manifest name, bin or sbin).
pub const MOCK_BINARIES: &[(&str, &str)] = &[
    ("bash", "bin"),
    ("ls", "bin"),
    ("cat", "bin"),
    ("mount", "sbin"),
    ("umount", "sbin"),
    ("losetup", "sbin"),
];

/// A usrmerged root: `lib64 -> usr/lib64`, versioned libraries behind
/// soname symlinks, six binaries needing exactly three libraries.
pub fn create_mock_rootfs(root: &Path) {
    fs::create_dir_all(root.join("usr/lib64")).expect("Failed to create usr/lib64");
    link(&root.join("lib64"), "usr/lib64");
    link(&root.join("bin"), "usr/bin");
    link(&root.join("sbin"), "usr/sbin");

    write_elf(&root.join("usr/lib64/ld-linux-x86-64.so.2"), &[], None);

    write_elf(&root.join("usr/lib64/libc-2.34.so"), &[], None);
    link(&root.join("usr/lib64/libc.so.6"), "libc-2.34.so");
    write_elf(&root.join("usr/lib64/libtinfo.so.6.2"), &["libc.so.6"], None);
    link(&root.join("usr/lib64/libtinfo.so.6"), "libtinfo.so.6.2");
    // absolute target, must be re-rooted
    write_elf(&root.join("usr/lib64/libselinux.so.1.0"), &["libc.so.6"], None);
    link(&root.join("usr/lib64/libselinux.so.1"), "/usr/lib64/libselinux.so.1.0");

    let interp = Some("/lib64/ld-linux-x86-64.so.2");
    write_elf(&root.join("usr/bin/bash"), &["libtinfo.so.6", "libc.so.6"], interp);
    write_elf(&root.join("usr/bin/ls"), &["libselinux.so.1", "libc.so.6"], interp);
    write_elf(&root.join("usr/bin/cat"), &["libc.so.6"], interp);
    write_elf(&root.join("usr/bin/mount"), &["libc.so.6"], interp);
    write_elf(&root.join("usr/bin/umount"), &["libc.so.6"], interp);
    write_elf(&root.join("usr/sbin/losetup"), &["libc.so.6"], interp);
}

/// Manifest matching [`create_mock_rootfs`].
pub fn mock_manifest() -> Vec<rookiso::manifest::ManifestEntry> {
    use rookiso::manifest::ManifestEntry;
    MOCK_BINARIES
        .iter()
        .map(|(name, dir)| {
            let entry = if *dir == "bin" {
                ManifestEntry::bin(name)
            } else {
                ManifestEntry::sbin(name)
            };
            if *name == "bash" {
                entry.as_shell()
            } else {
                entry
            }
        })
        .collect()
}

/// Entry names of a gzip-compressed newc archive, in order.
pub fn archive_entries(path: &Path) -> Vec<(String, u32)> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut raw = Vec::new();
    GzDecoder::new(fs::File::open(path).expect("Failed to open archive"))
        .read_to_end(&mut raw)
        .expect("Failed to decompress archive");

    let field = |at: usize, idx: usize| {
        let s = std::str::from_utf8(&raw[at + 6 + idx * 8..at + 14 + idx * 8]).unwrap();
        u32::from_str_radix(s, 16).unwrap()
    };
    let align = |n: usize| (n + 3) & !3;

    let mut entries = Vec::new();
    let mut at = 0;
    loop {
        assert_eq!(&raw[at..at + 6], b"070701", "bad magic at offset {at}");
        let mode = field(at, 1);
        let filesize = field(at, 6) as usize;
        let namesize = field(at, 11) as usize;
        let name_start = at + 110;
        let name = String::from_utf8(raw[name_start..name_start + namesize - 1].to_vec()).unwrap();
        if name == "TRAILER!!!" {
            break;
        }
        entries.push((name, mode));
        let data_start = align(name_start + namesize);
        at = align(data_start + filesize);
    }
    entries
}

/// Assert that a symlink exists and points to the expected target.
pub fn assert_symlink(path: &Path, expected_target: &str) {
    assert!(
        path.is_symlink(),
        "Expected symlink at {}, but it's not a symlink",
        path.display()
    );

    let target = fs::read_link(path).expect("Failed to read symlink");
    assert_eq!(
        target.to_string_lossy(),
        expected_target,
        "Symlink {} points to {:?}, expected {}",
        path.display(),
        target,
        expected_target
    );
}

/// Assert that a path is a regular file, not a symlink.
pub fn assert_regular_file(path: &Path) {
    let md = fs::symlink_metadata(path)
        .unwrap_or_else(|_| panic!("Expected file to exist: {}", path.display()));
    assert!(
        md.file_type().is_file(),
        "Expected regular file at {}",
        path.display()
    );
}

// =============================================================================
// Boot resolver fake
// =============================================================================

/// One recorded side effect of the boot resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Mount {
        source: String,
        target: PathBuf,
        fstype: Option<String>,
    },
    Umount(PathBuf),
    LoadModule(String),
    AttachLoop(PathBuf),
    Sleep(Duration),
    Shell,
    SwitchRoot {
        new_root: PathBuf,
        init: PathBuf,
        env: Vec<(String, String)>,
    },
}

/// In-memory machine for driving the boot resolver.
///
/// Paths "exist" when something created or mounted them. Mounting a medium
/// makes its files appear under the mount point; unmounting removes them.
#[derive(Debug, Default)]
pub struct FakeOps {
    pub cmdline: String,
    paths: BTreeSet<PathBuf>,
    devices: Vec<String>,
    media: HashMap<PathBuf, Vec<String>>,
    system: Vec<String>,
    failing: HashSet<String>,
    unavailable_modules: HashSet<String>,
    /// Sleeps before any device node shows up.
    device_delay: usize,
    sleeps: usize,
    mounts: Vec<(PathBuf, Vec<PathBuf>)>,
    pub calls: Vec<Call>,
}

impl FakeOps {
    pub fn new(cmdline: &str) -> Self {
        Self {
            cmdline: cmdline.to_string(),
            ..Default::default()
        }
    }

    /// A device node with no filesystem the fake can mount.
    pub fn with_device(mut self, name: &str) -> Self {
        self.devices.push(name.to_string());
        self
    }

    /// A device carrying an iso9660 filesystem with `files`.
    pub fn with_media(mut self, name: &str, files: &[&str]) -> Self {
        self.devices.push(name.to_string());
        self.media.insert(
            Path::new("/dev").join(name),
            files.iter().map(|f| f.to_string()).collect(),
        );
        self
    }

    /// A live medium: marker plus system image.
    pub fn with_live_media(self, name: &str) -> Self {
        self.with_media(name, &["rookery/.live-media", "LiveOS/rootfs.img"])
    }

    /// Files inside the system image.
    pub fn with_system(mut self, files: &[&str]) -> Self {
        self.system = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_failing(mut self, fstype: &str) -> Self {
        self.failing.insert(fstype.to_string());
        self
    }

    pub fn with_unavailable_module(mut self, name: &str) -> Self {
        self.unavailable_modules.insert(name.to_string());
        self
    }

    pub fn with_device_delay(mut self, sleeps: usize) -> Self {
        self.device_delay = sleeps;
        self
    }

    pub fn mounts(&self) -> Vec<&Call> {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Mount { .. }))
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    pub fn sleeps(&self) -> usize {
        self.count(|c| matches!(c, Call::Sleep(_)))
    }

    fn device_visible(&self, path: &Path) -> bool {
        self.sleeps >= self.device_delay
            && path.parent() == Some(Path::new("/dev"))
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| self.devices.iter().any(|d| d == n))
    }

    fn add_files(&mut self, target: &Path, files: &[String]) -> Vec<PathBuf> {
        let added: Vec<PathBuf> = files.iter().map(|f| target.join(f)).collect();
        self.paths.extend(added.iter().cloned());
        added
    }
}

fn fake_error(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

impl BootOps for FakeOps {
    fn mount(
        &mut self,
        source: &str,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        _data: Option<&str>,
    ) -> io::Result<()> {
        self.calls.push(Call::Mount {
            source: source.to_string(),
            target: target.to_path_buf(),
            fstype: fstype.map(str::to_string),
        });
        if fstype.is_some_and(|t| self.failing.contains(t)) {
            return Err(fake_error("mount failed (fake)"));
        }

        if flags.contains(MsFlags::MS_MOVE) {
            let moved: Vec<PathBuf> = self
                .paths
                .iter()
                .filter(|p| p.starts_with(source))
                .cloned()
                .collect();
            for p in moved {
                self.paths.remove(&p);
                if let Ok(rel) = p.strip_prefix(source) {
                    self.paths.insert(target.join(rel));
                }
            }
            return Ok(());
        }

        let added = match fstype {
            Some("iso9660") => {
                let Some(files) = self.media.get(Path::new(source)).cloned() else {
                    return Err(fake_error("wrong fs type, bad superblock (fake)"));
                };
                self.add_files(target, &files)
            }
            Some("squashfs") | Some("overlay") | None => {
                let files = self.system.clone();
                self.add_files(target, &files)
            }
            _ => Vec::new(),
        };
        self.paths.insert(target.to_path_buf());
        self.mounts.push((target.to_path_buf(), added));
        Ok(())
    }

    fn umount(&mut self, target: &Path) -> io::Result<()> {
        self.calls.push(Call::Umount(target.to_path_buf()));
        let Some(idx) = self.mounts.iter().rposition(|(t, _)| t == target) else {
            return Err(fake_error("not mounted (fake)"));
        };
        let (_, added) = self.mounts.remove(idx);
        for p in added {
            self.paths.remove(&p);
        }
        Ok(())
    }

    fn create_dir(&mut self, path: &Path) -> io::Result<()> {
        self.paths.insert(path.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.paths.contains(path) || self.device_visible(path)
    }

    fn is_file_in_root(&self, root: &Path, path: &Path) -> bool {
        let rel = path.strip_prefix("/").unwrap_or(path);
        self.paths.contains(&root.join(rel))
    }

    fn list_devices(&self) -> io::Result<Vec<String>> {
        if self.sleeps < self.device_delay {
            return Ok(Vec::new());
        }
        Ok(self.devices.clone())
    }

    fn kernel_cmdline(&self) -> io::Result<String> {
        Ok(self.cmdline.clone())
    }

    fn load_module(&mut self, name: &str) -> io::Result<()> {
        self.calls.push(Call::LoadModule(name.to_string()));
        if self.unavailable_modules.contains(name) {
            return Err(fake_error("module not found (fake)"));
        }
        Ok(())
    }

    fn attach_loop(&mut self, image: &Path) -> io::Result<PathBuf> {
        self.calls.push(Call::AttachLoop(image.to_path_buf()));
        if !self.paths.contains(image) {
            return Err(fake_error("no such file (fake)"));
        }
        Ok(PathBuf::from("/dev/loop0"))
    }

    fn sleep(&mut self, duration: Duration) {
        self.calls.push(Call::Sleep(duration));
        self.sleeps += 1;
    }

    fn shell(&mut self) -> io::Result<()> {
        self.calls.push(Call::Shell);
        Ok(())
    }

    fn switch_root(
        &mut self,
        new_root: &Path,
        init: &Path,
        env: &[(&str, &str)],
    ) -> io::Result<Infallible> {
        self.calls.push(Call::SwitchRoot {
            new_root: new_root.to_path_buf(),
            init: init.to_path_buf(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        Err(io::Error::other("exec not possible in tests (fake)"))
    }
}
