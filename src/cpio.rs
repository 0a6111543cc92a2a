//! Minimal `newc` (SVR4, no CRC) cpio writer for initramfs archives.
//!
//! Only what the kernel's initramfs unpacker needs: directories, regular
//! files and symlinks. Inode numbers are assigned sequentially and every
//! entry carries the metadata handed in by the caller, so the same input
//! always produces the same bytes.

use std::io::{self, Read, Write};

macro_rules! NEWC_HDR_FMT {
    () => {
        concat!(
            "{magic}{ino:08X}{mode:08X}{uid:08X}{gid:08X}{nlink:08X}",
            "{mtime:08X}{filesize:08X}{major:08X}{minor:08X}{rmajor:08X}",
            "{rminor:08X}{namesize:08X}{chksum:08X}"
        )
    };
}

pub const NEWC_MAGIC: &str = "070701";
pub const NEWC_HDR_LEN: u64 = 110;
pub const TRAILER: &str = "TRAILER!!!";

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Metadata shared by every entry of an archive.
#[derive(Debug, Clone, Copy)]
pub struct EntryOwner {
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
}

impl Default for EntryOwner {
    fn default() -> Self {
        // root-owned, epoch mtime: reproducible archives
        Self {
            uid: 0,
            gid: 0,
            mtime: 0,
        }
    }
}

pub struct CpioWriter<W: Write> {
    inner: W,
    owner: EntryOwner,
    next_ino: u32,
    off: u64,
    entries: usize,
}

impl<W: Write> CpioWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_owner(inner, EntryOwner::default())
    }

    pub fn with_owner(inner: W, owner: EntryOwner) -> Self {
        Self {
            inner,
            owner,
            // GNU cpio starts numbering at 0 as well
            next_ino: 0,
            off: 0,
            entries: 0,
        }
    }

    /// Number of entries written so far, trailer excluded.
    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn append_dir(&mut self, name: &str, perm: u32) -> io::Result<()> {
        self.header(name, S_IFDIR | (perm & !S_IFMT), 2, 0)?;
        self.entries += 1;
        Ok(())
    }

    pub fn append_file<R: Read>(
        &mut self,
        name: &str,
        perm: u32,
        len: u64,
        mut data: R,
    ) -> io::Result<()> {
        let filesize = u32::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file too large for newc"))?;
        self.header(name, S_IFREG | (perm & !S_IFMT), 1, filesize)?;

        let copied = io::copy(&mut (&mut data).take(len), &mut self.inner)?;
        if copied != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{name}: expected {len} bytes, source gave {copied}"),
            ));
        }
        self.off += copied;
        self.pad()?;
        self.entries += 1;
        Ok(())
    }

    pub fn append_symlink(&mut self, name: &str, target: &str) -> io::Result<()> {
        let tgt = target.as_bytes();
        self.header(name, S_IFLNK | 0o777, 1, tgt.len() as u32)?;
        self.inner.write_all(tgt)?;
        self.off += tgt.len() as u64;
        self.pad()?;
        self.entries += 1;
        Ok(())
    }

    /// Write the trailer, pad to a 512-byte block and hand back the writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.next_ino = 0;
        self.header(TRAILER, 0, 1, 0)?;
        let rem = self.off % 512;
        if rem != 0 {
            let zeros = vec![0u8; (512 - rem) as usize];
            self.inner.write_all(&zeros)?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn header(&mut self, name: &str, mode: u32, nlink: u32, filesize: u32) -> io::Result<()> {
        if name.is_empty() || name.contains('\0') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid cpio entry name {name:?}"),
            ));
        }
        let namesize = name.len() + 1;
        let ino = self.next_ino;
        self.next_ino += 1;

        let hdr = format!(
            NEWC_HDR_FMT!(),
            magic = NEWC_MAGIC,
            ino = ino,
            mode = mode,
            uid = self.owner.uid,
            gid = self.owner.gid,
            nlink = nlink,
            mtime = self.owner.mtime,
            filesize = filesize,
            major = 0,
            minor = 0,
            rmajor = 0,
            rminor = 0,
            namesize = namesize,
            chksum = 0,
        );
        self.inner.write_all(hdr.as_bytes())?;
        self.inner.write_all(name.as_bytes())?;
        self.inner.write_all(&[0])?;
        self.off += NEWC_HDR_LEN + namesize as u64;
        self.pad()
    }

    /// Pad to the next 4-byte boundary.
    fn pad(&mut self) -> io::Result<()> {
        let rem = self.off % 4;
        if rem != 0 {
            let n = 4 - rem;
            self.inner.write_all(&[0u8; 3][..n as usize])?;
            self.off += n;
        }
        Ok(())
    }
}
