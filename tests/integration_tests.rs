//! Integration tests for the boot archive composer.
//!
//! These tests compose a staging tree from a mock root filesystem made of
//! hand-built ELF files, then pack it. No host tools are required.

mod helpers;

use helpers::{
    archive_entries, assert_regular_file, assert_symlink, create_mock_rootfs, mock_manifest,
    write_elf, TestEnv, MOCK_BINARIES, MOCK_LIBRARIES,
};
use rookiso::archive::{build_boot_archive, DEFAULT_GZIP_LEVEL};
use rookiso::compose::compose;
use rookiso::manifest::{ManifestEntry, ModuleClass, ModuleSelection};
use rookiso::resolve::{Depth, Resolver};
use rookiso::staging::Node;
use std::fs;
use std::path::{Path, PathBuf};

// =============================================================================
// Composition
// =============================================================================

#[test]
fn test_six_binaries_three_libraries() {
    let env = TestEnv::new();
    create_mock_rootfs(&env.source_root);

    let c = compose(&env.compose_context("staging"), &mock_manifest(), &[]).unwrap();

    for (name, dir) in MOCK_BINARIES {
        let path = Path::new(dir).join(name);
        assert!(
            matches!(c.staging.get(&path), Some(Node::File { .. })),
            "{} not staged as a file",
            path.display()
        );
    }
    assert_eq!(
        c.staging.get("bin/sh"),
        Some(&Node::Symlink {
            target: PathBuf::from("bash")
        })
    );
    assert_eq!(
        c.report.dynamic_linker,
        PathBuf::from("lib64/ld-linux-x86-64.so.2")
    );

    let sonames: Vec<&str> = c.report.libraries.iter().map(|l| l.soname.as_str()).collect();
    assert_eq!(sonames.len(), MOCK_LIBRARIES.len(), "{sonames:?}");
    for lib in MOCK_LIBRARIES {
        assert!(sonames.contains(lib), "{lib} missing from {sonames:?}");
    }

    let mut staged_libs: Vec<String> = c
        .staging
        .iter()
        .filter(|(p, n)| p.parent() == Some(Path::new("lib64")) && matches!(n, Node::File { .. }))
        .map(|(p, _)| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    staged_libs.sort();
    assert_eq!(
        staged_libs,
        vec![
            "ld-linux-x86-64.so.2",
            "libc.so.6",
            "libselinux.so.1",
            "libtinfo.so.6",
        ]
    );
}

#[test]
fn test_libraries_are_copied_from_real_files() {
    let env = TestEnv::new();
    create_mock_rootfs(&env.source_root);

    let c = compose(&env.compose_context("staging"), &mock_manifest(), &[]).unwrap();

    let expect = [
        ("lib64/libc.so.6", "usr/lib64/libc-2.34.so"),
        ("lib64/libtinfo.so.6", "usr/lib64/libtinfo.so.6.2"),
        // absolute symlink in the source root, resolved inside it
        ("lib64/libselinux.so.1", "usr/lib64/libselinux.so.1.0"),
    ];
    for (dest, real) in expect {
        match c.staging.get(dest) {
            Some(Node::File { source, .. }) => {
                assert_eq!(source, &env.source_root.join(real), "{dest}");
            }
            other => panic!("{dest}: expected a staged file, got {other:?}"),
        }
    }
}

#[test]
fn test_single_library_directory() {
    let env = TestEnv::new();
    create_mock_rootfs(&env.source_root);
    let ctx = env.compose_context("staging");

    let c = compose(&ctx, &mock_manifest(), &[]).unwrap();

    for path in c.staging.files() {
        assert!(
            !path.starts_with("lib") && !path.starts_with("usr/lib"),
            "library outside lib64: {}",
            path.display()
        );
    }
    assert_symlink(&ctx.staging_dir.join("lib"), "lib64");
    assert_symlink(&ctx.staging_dir.join("usr/lib"), "../lib64");
    assert_regular_file(&ctx.staging_dir.join("lib64/libc.so.6"));
    assert_regular_file(&ctx.staging_dir.join("init"));
}

#[test]
fn test_closure_is_complete() {
    let env = TestEnv::new();
    create_mock_rootfs(&env.source_root);
    let ctx = env.compose_context("staging");
    let c = compose(&ctx, &mock_manifest(), &[]).unwrap();

    // every DT_NEEDED of every staged file is itself staged in lib64
    for path in c.staging.files() {
        let Some(Node::File { source, .. }) = c.staging.get(path) else {
            continue;
        };
        for needed in rookiso::elf::needed_libraries(source).unwrap() {
            assert!(
                c.staging.contains(Path::new("lib64").join(&needed)),
                "{} needs {} which is not staged",
                path.display(),
                needed
            );
        }
    }
}

#[test]
fn test_missing_library_is_dropped() {
    let env = TestEnv::new();
    create_mock_rootfs(&env.source_root);
    write_elf(
        &env.source_root.join("usr/bin/blkid"),
        &["libblkid.so.1", "libc.so.6"],
        None,
    );

    let mut manifest = mock_manifest();
    manifest.push(ManifestEntry::sbin("blkid"));
    let c = compose(&env.compose_context("staging"), &manifest, &[]).unwrap();

    assert!(matches!(c.staging.get("sbin/blkid"), Some(Node::File { .. })));
    assert!(!c.staging.contains("lib64/libblkid.so.1"));
    assert!(c.report.libraries.iter().all(|l| l.soname != "libblkid.so.1"));
}

#[test]
fn test_direct_depth_stops_at_first_level() {
    let env = TestEnv::new();
    create_mock_rootfs(&env.source_root);
    let app = env.source_root.join("usr/bin/app");
    write_elf(&app, &["libselinux.so.1"], None);

    let direct = Resolver::new(&env.source_root)
        .depth(Depth::Direct)
        .resolve(&app)
        .unwrap();
    let full = Resolver::new(&env.source_root).resolve(&app).unwrap();

    let names = |set: &std::collections::BTreeSet<rookiso::resolve::LibraryReference>| {
        set.iter().map(|l| l.soname.clone()).collect::<Vec<_>>()
    };
    assert_eq!(names(&direct), vec!["libselinux.so.1"]);
    assert_eq!(names(&full).len(), 2);
    assert!(names(&full).contains(&"libc.so.6".to_string()));
}

#[test]
fn test_shared_library_staged_once() {
    let env = TestEnv::new();
    create_mock_rootfs(&env.source_root);

    let c = compose(&env.compose_context("staging"), &mock_manifest(), &[]).unwrap();

    let libc = c
        .report
        .libraries
        .iter()
        .filter(|l| l.soname == "libc.so.6")
        .count();
    assert_eq!(libc, 1);
}

#[test]
fn test_modules_are_classified() {
    let env = TestEnv::new();
    create_mock_rootfs(&env.source_root);
    let module_root = env.source_root.join("lib/modules/6.6.1-rookery");
    fs::create_dir_all(module_root.join("kernel/fs/squashfs")).unwrap();
    fs::write(module_root.join("kernel/fs/squashfs/squashfs.ko.xz"), b"mod").unwrap();
    fs::create_dir_all(module_root.join("kernel/drivers/usb/storage")).unwrap();
    fs::write(
        module_root.join("kernel/drivers/usb/storage/usb-storage.ko"),
        b"mod",
    )
    .unwrap();

    let selections = vec![
        ModuleSelection::new("squashfs", ModuleClass::Fs),
        ModuleSelection::new("usb_storage", ModuleClass::Scsi),
        ModuleSelection::new("isofs", ModuleClass::Fs),
    ];
    let c = compose(&env.compose_context("staging"), &mock_manifest(), &selections).unwrap();

    let staged: Vec<&str> = c.report.modules.staged.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(staged, vec!["squashfs", "usb_storage"]);
    assert_eq!(c.report.modules.missing, vec!["isofs".to_string()]);
    assert!(c
        .staging
        .contains("lib64/modules/6.6.1-rookery/kernel/fs/squashfs.ko.xz"));
    assert!(c
        .staging
        .contains("lib64/modules/6.6.1-rookery/kernel/drivers/scsi/usb-storage.ko"));
}

// =============================================================================
// Archive
// =============================================================================

#[test]
fn test_archive_contains_boot_essentials() {
    let env = TestEnv::new();
    create_mock_rootfs(&env.source_root);
    let c = compose(&env.compose_context("staging"), &mock_manifest(), &[]).unwrap();

    let archive = env.work.join("initramfs.cpio.gz");
    let size = build_boot_archive(&c.staging, &archive, DEFAULT_GZIP_LEVEL).unwrap();
    assert_eq!(size, fs::metadata(&archive).unwrap().len());

    let entries = archive_entries(&archive);
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    for wanted in [
        "init",
        "bin/sh",
        "bin/bash",
        "sbin/losetup",
        "lib64/ld-linux-x86-64.so.2",
        "lib64/libc.so.6",
        "newroot",
        "mnt/media",
    ] {
        assert!(names.contains(&wanted), "{wanted} not in archive");
    }

    // parents precede children
    let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
    assert!(pos("mnt") < pos("mnt/media"));
    assert!(pos("lib64") < pos("lib64/libc.so.6"));

    let (_, init_mode) = entries.iter().find(|(n, _)| n == "init").unwrap();
    assert_eq!(init_mode & 0o170000, 0o100000);
    assert_eq!(init_mode & 0o777, 0o755);
    let (_, sh_mode) = entries.iter().find(|(n, _)| n == "bin/sh").unwrap();
    assert_eq!(sh_mode & 0o170000, 0o120000);
}

#[test]
fn test_rebuild_is_byte_identical() {
    let env = TestEnv::new();
    create_mock_rootfs(&env.source_root);

    let first = compose(&env.compose_context("staging-a"), &mock_manifest(), &[]).unwrap();
    let second = compose(&env.compose_context("staging-b"), &mock_manifest(), &[]).unwrap();

    let a = env.work.join("a.cpio.gz");
    let b = env.work.join("b.cpio.gz");
    build_boot_archive(&first.staging, &a, DEFAULT_GZIP_LEVEL).unwrap();
    build_boot_archive(&second.staging, &b, DEFAULT_GZIP_LEVEL).unwrap();

    assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
}

#[test]
fn test_failed_compose_leaves_previous_archive() {
    let env = TestEnv::new();
    create_mock_rootfs(&env.source_root);
    let c = compose(&env.compose_context("staging"), &mock_manifest(), &[]).unwrap();
    let archive = env.work.join("initramfs.cpio.gz");
    build_boot_archive(&c.staging, &archive, DEFAULT_GZIP_LEVEL).unwrap();
    let before = fs::read(&archive).unwrap();

    fs::remove_file(env.source_root.join("usr/bin/cat")).unwrap();
    assert!(compose(&env.compose_context("staging"), &mock_manifest(), &[]).is_err());

    assert_eq!(fs::read(&archive).unwrap(), before);
}

/// Boots the staged tree far enough to run the staged shell.
///
/// Needs root and a real source root with working binaries.
#[test]
#[ignore]
fn test_staged_shell_runs_in_chroot() {
    let source = std::env::var("ROOKISO_SOURCE_ROOT").expect("ROOKISO_SOURCE_ROOT not set");
    let env = TestEnv::new();
    let mut ctx = env.compose_context("staging");
    ctx.source_root = PathBuf::from(source);

    let manifest: Vec<ManifestEntry> = rookiso::manifest::default_manifest();
    compose(&ctx, &manifest, &[]).unwrap();

    let status = std::process::Command::new("chroot")
        .arg(&ctx.staging_dir)
        .args(["/bin/sh", "-c", "ls / && cat /etc/passwd"])
        .status()
        .unwrap();
    assert!(status.success());
}
