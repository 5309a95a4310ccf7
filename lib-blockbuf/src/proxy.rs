//! The buffering engine.
//!
//! A [`BufferedProxy`] keeps one window of the device in memory. Small or unaligned requests are
//! served from the window, which is filled from and flushed to the device a whole window at a
//! time. Requests of at least a window's worth skip the window and go straight between the
//! caller's slice and the device when the slice address and the device location are both
//! suitably aligned.
//!
//! Run-time trouble (short transfers, a device that seeks somewhere else, a flush that only
//! partly lands) never surfaces as an error. It shows up as a smaller byte count, or as a window
//! that stays dirty until a later flush succeeds.

use std::alloc::LayoutError;
use std::fmt;
use std::io::{self, SeekFrom};

use bitflags::bitflags;

use crate::buffer::AlignedBuffer;
use crate::device::BlockDevice;
use crate::helpers::{align_down, highest_multiple, is_addr_aligned};
use crate::map_err;

bitflags! {
    /// Behaviour modifiers fixed at construction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        /// Only reads will be issued. A hint, not enforced.
        const READ_ONLY = 0x01;
        /// Only writes will be issued. A hint, not enforced.
        const WRITE_ONLY = 0x02;
        /// Never bypass the window, even for large aligned transfers.
        ///
        /// Useful when the device can only reach part of the address space (e.g. a DMA engine
        /// limited to low memory) and so cannot transfer into arbitrary caller slices.
        const NO_DIRECT_IO = 0x04;
        /// Never read device data into the window.
        ///
        /// Suits pure write-through use, where partial-block updates cannot clobber anything.
        const NO_FILLS = 0x08;
        /// Access is mostly random and smaller than the window.
        const RANDOM_ACCESS = 0x10;
    }
}

/// Errors reported by [`BufferedProxy`] constructors and [`BufferedProxy::close`].
#[derive(Debug)]
pub enum Error {
    ZeroBlockSize,
    EmptyWindow,
    SectorAlignNotPowerOfTwo(usize),
    BufferAlignNotPowerOfTwo(usize),
    BufferSizeNotBlockMultiple { buffer_size: usize, block_size: usize },
    MisalignedWindow { addr: usize, align: usize },
    /// Neither of sector alignment and block size is a multiple of the other.
    IncompatibleAlignment { block_size: usize, sector_align: usize },
    /// The window would not end on a sector boundary, so it could not advance by whole windows.
    WindowNotSectorMultiple { buffer_size: usize, sector_align: usize },
    Allocation(LayoutError),
    /// The final flush did not reach the device; the window's data is lost.
    Unflushed { blocks: usize },
}

map_err!(Allocation, LayoutError);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroBlockSize => write!(f, "block size must be non-zero"),
            Self::EmptyWindow => write!(f, "window must hold at least one block"),
            Self::SectorAlignNotPowerOfTwo(v) => {
                write!(f, "sector alignment must be a power of two, got {v}")
            }
            Self::BufferAlignNotPowerOfTwo(v) => {
                write!(f, "buffer alignment must be a power of two, got {v}")
            }
            Self::BufferSizeNotBlockMultiple { buffer_size, block_size } => {
                write!(
                    f,
                    "buffer size {buffer_size} is not a multiple of the block size {block_size}"
                )
            }
            Self::MisalignedWindow { addr, align } => {
                write!(f, "window address {addr:#x} is not aligned to {align} bytes")
            }
            Self::IncompatibleAlignment { block_size, sector_align } => {
                let (larger, smaller) = if sector_align > block_size {
                    ("sector alignment", "block size")
                } else {
                    ("block size", "sector alignment")
                };
                write!(
                    f,
                    "{larger} must be a multiple of the {smaller} \
                     (block size {block_size}, sector alignment {sector_align})"
                )
            }
            Self::WindowNotSectorMultiple { buffer_size, sector_align } => {
                write!(
                    f,
                    "buffer size {buffer_size} is not a multiple of the sector alignment \
                     {sector_align}"
                )
            }
            Self::Allocation(e) => write!(f, "window allocation failed: {e}"),
            Self::Unflushed { blocks } => write!(f, "{blocks} buffered blocks were not flushed"),
        }
    }
}

impl std::error::Error for Error {}

/// Geometry and behaviour of a [`BufferedProxy`].
///
/// # Examples
///
/// ```
/// use lib_blockbuf::{Config, Flags};
///
/// // 512-byte sectors, window and caller buffers aligned for DMA.
/// let config = Config {
///     block_size: 512,
///     sector_align: 512,
///     buffer_align: 4096,
///     flags: Flags::RANDOM_ACCESS,
/// };
/// assert_eq!(Config::default().block_size, 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Every device transfer is a whole number of blocks of this many bytes. Default: 1.
    pub block_size: usize,

    /// Every device transfer starts at a byte location that is a multiple of this power of two.
    /// Default: 1.
    pub sector_align: usize,

    /// The window, and any caller slice used for a direct transfer, starts at a memory address
    /// that is a multiple of this power of two. Default: 1.
    pub buffer_align: usize,

    pub flags: Flags,
}

impl Default for Config {
    fn default() -> Self {
        Self { block_size: 1, sector_align: 1, buffer_align: 1, flags: Flags::empty() }
    }
}

/// Counters of the device traffic a proxy has generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    /// Successful window fills.
    pub fills: u64,
    /// Flushes that wrote the whole window.
    pub flushes: u64,
    /// Flushes abandoned after a seek mismatch or a short write.
    pub failed_flushes: u64,
    /// Reads that bypassed the window.
    pub direct_reads: u64,
    /// Writes that bypassed the window.
    pub direct_writes: u64,
    pub device_seeks: u64,
    pub blocks_read: u64,
    pub blocks_written: u64,
}

/// Byte-granular access to a [`BlockDevice`] through a single aligned window.
///
/// The window type `B` must keep its bytes at a fixed address when moved (`Vec<u8>`,
/// `Box<[u8]>`, `&mut [u8]`, [`AlignedBuffer`]); an inline array would move with the proxy.
///
/// Dropping the proxy flushes dirty data. A flush that fails at that point is only logged; use
/// [`close`](Self::close) to observe it.
pub struct BufferedProxy<D: BlockDevice, B: AsRef<[u8]> + AsMut<[u8]> = AlignedBuffer> {
    device: D,
    window: B,
    buffer_size: usize,
    window_blocks: usize,
    // Blocks per sector-aligned step; 1 when blocks are at least a sector.
    sector_blocks: usize,
    block_size: usize,
    sector_align: usize,
    buffer_align: usize,
    flags: Flags,
    // Byte offset of the client's read/write point within the window.
    cursor: usize,
    // Block index of the window's first byte on the device.
    window_location: u64,
    // Blocks of the window holding valid data.
    data_blocks: usize,
    dirty: bool,
    stats: ProxyStats,
}

impl<D: BlockDevice> BufferedProxy<D, AlignedBuffer> {
    /// Allocates a `buffer_size` window aligned to `config.buffer_align`.
    pub fn with_capacity(buffer_size: usize, device: D, config: Config) -> Result<Self, Error> {
        if !config.buffer_align.is_power_of_two() {
            return Err(Error::BufferAlignNotPowerOfTwo(config.buffer_align));
        }

        let window = AlignedBuffer::new(buffer_size, config.buffer_align)?;
        Self::new(window, device, config)
    }
}

impl<D: BlockDevice, B: AsRef<[u8]> + AsMut<[u8]>> BufferedProxy<D, B> {
    /// Binds `window` and `device` together. No device I/O happens here.
    pub fn new(window: B, device: D, config: Config) -> Result<Self, Error> {
        let Config { block_size, sector_align, buffer_align, flags } = config;

        if !sector_align.is_power_of_two() {
            return Err(Error::SectorAlignNotPowerOfTwo(sector_align));
        }

        if !buffer_align.is_power_of_two() {
            return Err(Error::BufferAlignNotPowerOfTwo(buffer_align));
        }

        if block_size == 0 {
            return Err(Error::ZeroBlockSize);
        }

        let buffer_size = window.as_ref().len();
        if buffer_size == 0 {
            return Err(Error::EmptyWindow);
        }

        if !buffer_size.is_multiple_of(block_size) {
            return Err(Error::BufferSizeNotBlockMultiple { buffer_size, block_size });
        }

        let base = window.as_ref().as_ptr();
        if !is_addr_aligned(base, buffer_align) {
            return Err(Error::MisalignedWindow { addr: base.addr(), align: buffer_align });
        }

        let compatible = if sector_align > block_size {
            sector_align.is_multiple_of(block_size)
        } else {
            block_size.is_multiple_of(sector_align)
        };
        if !compatible {
            return Err(Error::IncompatibleAlignment { block_size, sector_align });
        }

        if !buffer_size.is_multiple_of(sector_align) {
            return Err(Error::WindowNotSectorMultiple { buffer_size, sector_align });
        }

        Ok(Self {
            device,
            window,
            buffer_size,
            window_blocks: buffer_size / block_size,
            sector_blocks: sector_align.max(block_size) / block_size,
            block_size,
            sector_align,
            buffer_align,
            flags,
            cursor: 0,
            window_location: 0,
            data_blocks: 0,
            dirty: false,
            stats: ProxyStats::default(),
        })
    }

    /// Bytes that can be read before the window has to be refilled.
    pub const fn remaining_read_amount(&self) -> usize {
        (self.data_blocks * self.block_size).saturating_sub(self.cursor)
    }

    /// Bytes that can be written before the window has to be flushed.
    pub const fn remaining_write_space(&self) -> usize {
        self.window_blocks * self.block_size - self.cursor
    }

    /// Logical byte location of the next read or write.
    pub const fn position(&self) -> u64 {
        self.byte_location(self.window_location).saturating_add(self.cursor as u64)
    }

    /// Block index of the window's first byte on the device.
    pub const fn window_location(&self) -> u64 {
        self.window_location
    }

    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub const fn flags(&self) -> Flags {
        self.flags
    }

    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub const fn stats(&self) -> ProxyStats {
        self.stats
    }

    pub const fn device(&self) -> &D {
        &self.device
    }

    /// Direct access to the device. Moving its position is harmless: the proxy seeks before
    /// every transfer.
    pub const fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Reads up to `dst.len()` bytes from the current position.
    ///
    /// A short count means the device ran out of data or refused a transfer.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        if self.flags.contains(Flags::WRITE_ONLY) {
            log::debug!("read issued through a write-only proxy");
        }

        let mut done = self.serve(dst);
        let mut exhausted = false;

        if dst.len() - done >= self.buffer_size {
            // Filling over unflushed data would lose it.
            if !self.sync_window() {
                return done;
            }
            self.reposition(self.consumed_blocks());

            if self.direct_allowed(dst[done..].as_ptr()) {
                let blocks = highest_multiple(dst.len() - done, self.buffer_size) / self.block_size;
                let len = blocks * self.block_size;
                let read = self.direct_read(&mut dst[done..done + len], blocks);
                done += read * self.block_size;
                exhausted = read < blocks;
            } else {
                while dst.len() - done >= self.buffer_size {
                    self.reposition(self.consumed_blocks());
                    self.load();
                    done += self.serve(&mut dst[done..]);

                    if self.data_blocks < self.window_blocks {
                        exhausted = true;
                        break;
                    }
                }
            }
        }

        if done < dst.len() && !exhausted {
            if !self.sync_window() {
                return done;
            }
            self.reposition(self.consumed_blocks());
            self.load();
            done += self.serve(&mut dst[done..]);
        }

        done
    }

    /// Writes up to `src.len()` bytes at the current position.
    ///
    /// A short count means the device refused part of the transfer; the bytes counted may still
    /// be sitting in a dirty window.
    pub fn write(&mut self, src: &[u8]) -> usize {
        if self.flags.contains(Flags::READ_ONLY) {
            log::debug!("write issued through a read-only proxy");
        }

        // A partial-window write into a window that mirrors nothing would flush stale bytes
        // around it, so load the device contents first.
        if src.len() < self.buffer_size && self.is_vacant() {
            self.load();
        }

        let mut done = self.absorb(src);

        if src.len() - done >= self.buffer_size {
            if !self.sync_window() {
                return done;
            }
            self.reposition(self.consumed_blocks());

            if self.direct_allowed(src[done..].as_ptr()) {
                let blocks = highest_multiple(src.len() - done, self.buffer_size) / self.block_size;
                let len = blocks * self.block_size;
                let written = self.direct_write(&src[done..done + len], blocks);
                done += written * self.block_size;
                if written < blocks {
                    return done;
                }
            } else {
                while src.len() - done >= self.buffer_size {
                    // Blocks carried in front of the cursor must hold device data.
                    if self.cursor > 0 && self.is_vacant() {
                        self.load();
                    }
                    done += self.absorb(&src[done..]);

                    if !self.sync_window() {
                        return done;
                    }
                    self.reposition(self.window_blocks);
                }
            }
        }

        while done < src.len() {
            if self.remaining_write_space() == 0 {
                if !self.sync_window() {
                    break;
                }
                self.reposition(self.consumed_blocks());
            }

            if src.len() - done < self.buffer_size && self.is_vacant() {
                self.load();
            }

            let n = self.absorb(&src[done..]);
            if n == 0 {
                break;
            }
            done += n;

            if self.remaining_write_space() == 0 {
                self.flush();
            }
        }

        done
    }

    /// Moves the read/write point to byte `location` and returns `location`.
    ///
    /// Inside the window's valid data this is free. Otherwise the window is flushed and moved to
    /// the aligned block at or below `location`, wherever the device actually lands, and filled.
    /// A target outside the device's data leaves the cursor clamped to the window, and the next
    /// read reports zero bytes.
    pub fn seek(&mut self, location: u64) -> u64 {
        let start = self.byte_location(self.window_location);
        let end = start.saturating_add((self.data_blocks * self.block_size) as u64);

        if (start..end).contains(&location) {
            self.cursor = (location - start) as usize;
            return location;
        }

        self.flush();
        if self.dirty {
            log::warn!(
                "seek discards {} unflushed blocks at block {}",
                self.data_blocks,
                self.window_location
            );
            self.dirty = false;
        }

        let granularity = self.sector_align.max(self.block_size) as u64;
        let target = align_down(location, granularity) / self.block_size as u64;
        self.window_location = self.device_seek(target);
        if self.window_location != target {
            log::debug!("seek to block {target} landed on block {}", self.window_location);
        }

        self.data_blocks = 0;
        self.fill();

        let base = self.byte_location(self.window_location);
        self.cursor = location.saturating_sub(base).min(self.buffer_size as u64) as usize;

        location
    }

    /// Writes dirty window data back to the device.
    ///
    /// The window stays dirty if the device seeks elsewhere or writes fewer blocks than asked;
    /// nothing is retried until the next flush.
    pub fn flush(&mut self) {
        if !self.dirty || self.data_blocks == 0 || !self.window_transferable() {
            return;
        }

        let location = self.window_location;
        let landed = self.device_seek(location);
        if landed != location {
            log::debug!("flush skipped: device seeked to block {landed}, wanted {location}");
            self.stats.failed_flushes += 1;
            return;
        }

        let blocks = self.data_blocks;
        let len = blocks * self.block_size;
        let written = self.device.write(&self.window.as_ref()[..len], blocks);
        self.stats.blocks_written += written.min(blocks) as u64;

        if written == blocks {
            self.dirty = false;
            self.stats.flushes += 1;
        } else {
            log::debug!("flush at block {location} wrote {written} of {blocks} blocks");
            self.stats.failed_flushes += 1;
        }
    }

    /// Reloads the window from the device at its current location.
    ///
    /// Unflushed data in the window is overwritten. The cursor returns to the start of the
    /// window even when no fill happens.
    pub fn fill(&mut self) {
        self.load();
        self.cursor = 0;
    }

    /// Flushes and releases the proxy, reporting data that could not be written.
    pub fn close(mut self) -> Result<(), Error> {
        self.flush();
        if self.dirty {
            let blocks = self.data_blocks;
            // Already reported; keep Drop from retrying and warning again.
            self.dirty = false;
            return Err(Error::Unflushed { blocks });
        }
        Ok(())
    }

    // Fill without moving the cursor.
    fn load(&mut self) {
        if self.flags.contains(Flags::NO_FILLS) || !self.window_transferable() {
            return;
        }

        let location = self.window_location;
        let landed = self.device_seek(location);
        if landed != location {
            log::debug!("fill skipped: device seeked to block {landed}, wanted {location}");
            return;
        }

        let blocks = self.window_blocks;
        let read = self.device.read(self.window.as_mut(), blocks).min(blocks);
        self.data_blocks = read;
        self.dirty = false;
        self.stats.fills += 1;
        self.stats.blocks_read += read as u64;
    }

    const fn byte_location(&self, block: u64) -> u64 {
        block.saturating_mul(self.block_size as u64)
    }

    const fn is_sector_aligned(&self, block: u64) -> bool {
        self.byte_location(block).is_multiple_of(self.sector_align as u64)
    }

    fn direct_allowed(&self, addr: *const u8) -> bool {
        !self.flags.contains(Flags::NO_DIRECT_IO)
            && self.cursor == 0
            && is_addr_aligned(addr, self.buffer_align)
            && self.is_sector_aligned(self.window_location)
    }

    fn window_transferable(&self) -> bool {
        if !self.is_sector_aligned(self.window_location) {
            log::warn!("window at block {} is not sector-aligned", self.window_location);
            return false;
        }

        if !is_addr_aligned(self.window.as_ref().as_ptr(), self.buffer_align) {
            log::warn!("window memory moved off its {}-byte alignment", self.buffer_align);
            return false;
        }

        true
    }

    // Fills are pointless when the window already holds something or is used up.
    fn is_vacant(&self) -> bool {
        !self.flags.contains(Flags::NO_FILLS)
            && !self.dirty
            && self.data_blocks == 0
            && self.cursor < self.buffer_size
    }

    fn consumed_blocks(&self) -> usize {
        self.data_blocks.max(self.cursor.div_ceil(self.block_size))
    }

    /// Moves the window `blocks` blocks forward.
    ///
    /// The window only starts on sector boundaries. When the target falls between two, the
    /// window starts at the boundary below and the cursor skips the blocks in between. Without
    /// fills those blocks are carried over from the old window instead of being reloaded.
    fn reposition(&mut self, blocks: usize) {
        let target = self.window_location + blocks as u64;
        let carried = (target % self.sector_blocks as u64) as usize;
        let start = target - carried as u64;

        let mut kept = 0;
        if carried > 0 && self.flags.contains(Flags::NO_FILLS) && start >= self.window_location {
            let from = (start - self.window_location) as usize;
            kept = self.data_blocks.saturating_sub(from).min(carried);
            if kept > 0 {
                let bs = self.block_size;
                self.window.as_mut().copy_within(from * bs..(from + kept) * bs, 0);
            }
        }

        self.window_location = start;
        self.data_blocks = kept;
        self.cursor = carried * self.block_size;
    }

    fn sync_window(&mut self) -> bool {
        self.flush();
        !self.dirty
    }

    fn device_seek(&mut self, block: u64) -> u64 {
        self.stats.device_seeks += 1;
        self.device.seek(block)
    }

    fn direct_read(&mut self, dst: &mut [u8], blocks: usize) -> usize {
        let location = self.window_location;
        let landed = self.device_seek(location);
        if landed != location {
            log::debug!("direct read skipped: device seeked to block {landed}, wanted {location}");
            return 0;
        }

        let read = self.device.read(dst, blocks).min(blocks);
        self.stats.direct_reads += 1;
        self.stats.blocks_read += read as u64;
        self.reposition(read);
        read
    }

    fn direct_write(&mut self, src: &[u8], blocks: usize) -> usize {
        let location = self.window_location;
        let landed = self.device_seek(location);
        if landed != location {
            log::debug!("direct write skipped: device seeked to block {landed}, wanted {location}");
            return 0;
        }

        let written = self.device.write(src, blocks).min(blocks);
        self.stats.direct_writes += 1;
        self.stats.blocks_written += written as u64;
        self.reposition(written);
        written
    }

    fn serve(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.remaining_read_amount());
        if n > 0 {
            self.copy_out(&mut dst[..n]);
        }
        n
    }

    fn absorb(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining_write_space());
        if n > 0 {
            self.copy_in(&src[..n]);
        }
        n
    }

    fn copy_out(&mut self, dst: &mut [u8]) {
        debug_assert!(self.cursor + dst.len() <= self.data_blocks * self.block_size);
        let end = self.cursor + dst.len();
        dst.copy_from_slice(&self.window.as_ref()[self.cursor..end]);
        self.cursor = end;
    }

    fn copy_in(&mut self, src: &[u8]) {
        debug_assert!(self.cursor + src.len() <= self.buffer_size);
        let start = self.cursor;
        let end = start + src.len();
        let valid = self.data_blocks * self.block_size;
        let window = self.window.as_mut();

        if end > valid {
            // Past the valid data the window still holds an earlier location's bytes.
            let blocks = end.div_ceil(self.block_size);
            if start > valid {
                window[valid..start].fill(0);
            }
            window[end..blocks * self.block_size].fill(0);
            self.data_blocks = blocks;
        }

        window[start..end].copy_from_slice(src);
        self.cursor = end;
        self.dirty = true;
    }
}

impl<D: BlockDevice, B: AsRef<[u8]> + AsMut<[u8]>> Drop for BufferedProxy<D, B> {
    fn drop(&mut self) {
        self.flush();
        if self.dirty {
            log::warn!(
                "dropping {} unflushed blocks at block {}",
                self.data_blocks,
                self.window_location
            );
        }
    }
}

impl<D: BlockDevice, B: AsRef<[u8]> + AsMut<[u8]>> io::Read for BufferedProxy<D, B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(BufferedProxy::read(self, buf))
    }
}

impl<D: BlockDevice, B: AsRef<[u8]> + AsMut<[u8]>> io::Write for BufferedProxy<D, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(BufferedProxy::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        BufferedProxy::flush(self);
        if self.dirty {
            return Err(io::Error::other(Error::Unflushed { blocks: self.data_blocks }));
        }
        Ok(())
    }
}

impl<D: BlockDevice, B: AsRef<[u8]> + AsMut<[u8]>> io::Seek for BufferedProxy<D, B> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let location = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.position().checked_add_signed(delta),
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "block devices do not report their end",
                ));
            }
        };

        let location = location.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start or past u64::MAX")
        })?;

        Ok(BufferedProxy::seek(self, location))
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.position())
    }
}
