//! The block device contract and two devices that implement it.
//!
//! A [`BlockDevice`] moves whole blocks between memory and its current position, and reports how
//! many it actually moved. Short counts are normal (end of media, a full disk, a transient
//! failure) and are never errors at this layer; the caller compares counts instead.

use std::fs::{File, OpenOptions};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::path::Path;

use crate::helpers::sync_file;

/// Capabilities a [`BufferedProxy`](crate::BufferedProxy) needs from the device underneath it.
///
/// The proxy guarantees that `dst`/`src` always hold exactly `blocks` whole blocks, that the
/// slice address honours the configured buffer alignment, and that the current position was set
/// by a sector-aligned [`seek`](BlockDevice::seek).
pub trait BlockDevice {
    /// Reads up to `blocks` blocks at the current position into `dst` and advances past them.
    ///
    /// Returns the number of whole blocks transferred.
    fn read(&mut self, dst: &mut [u8], blocks: usize) -> usize;

    /// Writes up to `blocks` blocks from `src` at the current position and advances past them.
    ///
    /// Returns the number of whole blocks transferred.
    fn write(&mut self, src: &[u8], blocks: usize) -> usize;

    /// Moves the current position to `block`, counted from the start of the device.
    ///
    /// Returns the resulting position, which may differ from the request (for example when the
    /// device clamps to its capacity). Callers treat the returned value as authoritative.
    fn seek(&mut self, block: u64) -> u64;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn read(&mut self, dst: &mut [u8], blocks: usize) -> usize {
        (**self).read(dst, blocks)
    }

    fn write(&mut self, src: &[u8], blocks: usize) -> usize {
        (**self).write(src, blocks)
    }

    fn seek(&mut self, block: u64) -> u64 {
        (**self).seek(block)
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for Box<D> {
    fn read(&mut self, dst: &mut [u8], blocks: usize) -> usize {
        (**self).read(dst, blocks)
    }

    fn write(&mut self, src: &[u8], blocks: usize) -> usize {
        (**self).write(src, blocks)
    }

    fn seek(&mut self, block: u64) -> u64 {
        (**self).seek(block)
    }
}

/// A fixed-capacity block device held in memory.
///
/// Seeks clamp to the capacity, and transfers that run past the end come back short.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    data: Vec<u8>,
    block_size: usize,
    position: u64,
}

impl MemoryDevice {
    /// A zero-filled device of `capacity_blocks` blocks.
    #[must_use]
    pub fn new(capacity_blocks: usize, block_size: usize) -> Self {
        Self { data: vec![0; capacity_blocks * block_size], block_size, position: 0 }
    }

    /// Wraps existing bytes, zero-padding the tail up to a whole block.
    #[must_use]
    pub fn from_bytes(mut data: Vec<u8>, block_size: usize) -> Self {
        data.resize(data.len().next_multiple_of(block_size), 0);
        Self { data, block_size, position: 0 }
    }

    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    pub const fn capacity_blocks(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }

    pub const fn position(&self) -> u64 {
        self.position
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn transferable(&self, blocks: usize, buf_len: usize) -> usize {
        let left = self.capacity_blocks().saturating_sub(self.position) as usize;
        blocks.min(left).min(buf_len / self.block_size)
    }

    fn byte_range(&self, blocks: usize) -> std::ops::Range<usize> {
        let start = self.position as usize * self.block_size;
        start..start + blocks * self.block_size
    }
}

impl BlockDevice for MemoryDevice {
    fn read(&mut self, dst: &mut [u8], blocks: usize) -> usize {
        let count = self.transferable(blocks, dst.len());
        let range = self.byte_range(count);
        dst[..range.len()].copy_from_slice(&self.data[range]);
        self.position += count as u64;
        count
    }

    fn write(&mut self, src: &[u8], blocks: usize) -> usize {
        let count = self.transferable(blocks, src.len());
        let range = self.byte_range(count);
        let len = range.len();
        self.data[range].copy_from_slice(&src[..len]);
        self.position += count as u64;
        count
    }

    fn seek(&mut self, block: u64) -> u64 {
        self.position = block.min(self.capacity_blocks());
        self.position
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, reads only.
    Read,
    /// Existing file, reads and writes.
    ReadWrite,
    /// Created or truncated, reads and writes.
    Create,
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    file.seek_write(buf, offset)
}

/// A file treated as an array of blocks.
///
/// Reads that hit end-of-file in the middle of a block return that block zero-padded, so a file
/// whose length is not a block multiple can still be read completely. Writes past the end grow
/// the file. With `direct` set on Linux the file is opened with `O_DIRECT`, which makes the
/// kernel enforce the alignment the proxy already guarantees.
pub struct FileDevice {
    file: File,
    block_size: usize,
    position: u64,
}

impl FileDevice {
    pub fn open(path: &Path, block_size: usize, mode: OpenMode, direct: bool) -> io::Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        match mode {
            OpenMode::Read => {}
            OpenMode::ReadWrite => {
                opts.write(true);
            }
            OpenMode::Create => {
                opts.write(true).create(true).truncate(true);
            }
        }

        Self::set_direct(&mut opts, direct);

        let file = opts.open(path)?;
        Ok(Self::from_file(file, block_size))
    }

    #[cfg(target_os = "linux")]
    fn set_direct(opts: &mut OpenOptions, direct: bool) {
        if direct {
            opts.custom_flags(libc::O_DIRECT);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn set_direct(_opts: &mut OpenOptions, direct: bool) {
        if direct {
            log::debug!("O_DIRECT is only available on Linux; using buffered file I/O");
        }
    }

    #[must_use]
    pub const fn from_file(file: File, block_size: usize) -> Self {
        Self { file, block_size, position: 0 }
    }

    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    pub const fn position(&self) -> u64 {
        self.position
    }

    pub const fn get_ref(&self) -> &File {
        &self.file
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    pub fn sync(&self) -> io::Result<()> {
        sync_file(&self.file)
    }

    const fn offset(&self) -> u64 {
        self.position * self.block_size as u64
    }
}

impl BlockDevice for FileDevice {
    fn read(&mut self, dst: &mut [u8], blocks: usize) -> usize {
        let len = (blocks * self.block_size).min(dst.len() - dst.len() % self.block_size);
        let dst = &mut dst[..len];
        let base = self.offset();
        let mut done = 0;

        while done < len {
            match pread(&self.file, &mut dst[done..], base + done as u64) {
                Ok(0) => break,
                Ok(n) => {
                    done += n;
                    // pread(2) only stops mid-block at end-of-file.
                    if done % self.block_size != 0 {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("read of block {} failed: {e}", base / self.block_size as u64);
                    break;
                }
            }
        }

        let mut whole = done / self.block_size;
        if done % self.block_size != 0 {
            dst[done..(whole + 1) * self.block_size].fill(0);
            whole += 1;
        }

        self.position += whole as u64;
        whole
    }

    fn write(&mut self, src: &[u8], blocks: usize) -> usize {
        let len = (blocks * self.block_size).min(src.len() - src.len() % self.block_size);
        let base = self.offset();
        let mut done = 0;

        while done < len {
            match pwrite(&self.file, &src[done..len], base + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("write of block {} failed: {e}", base / self.block_size as u64);
                    break;
                }
            }
        }

        let whole = done / self.block_size;
        self.position += whole as u64;
        whole
    }

    fn seek(&mut self, block: u64) -> u64 {
        self.position = block;
        self.position
    }
}
