//! Buffered access to devices that only speak aligned, block-sized I/O.
//!
//! Raw disk sectors, DMA engines and `O_DIRECT` files all share the same constraint: every
//! transfer must start on a sector boundary, cover whole blocks, and sometimes come from a
//! suitably aligned memory address. [`BufferedProxy`] hides that constraint behind byte-granular
//! `read`/`write`/`seek` calls by keeping a single window of the device in memory, and bypasses
//! the window entirely when a transfer is large and aligned enough to go straight to the device.
//!
//! ```
//! use lib_blockbuf::{BufferedProxy, Config, MemoryDevice};
//!
//! let mut device = MemoryDevice::new(64, 512);
//! let config = Config { block_size: 512, sector_align: 512, ..Config::default() };
//!
//! let mut proxy = BufferedProxy::with_capacity(4096, &mut device, config).unwrap();
//! assert_eq!(proxy.write(b"unaligned bytes"), 15);
//! proxy.seek(0);
//!
//! let mut out = [0; 15];
//! assert_eq!(proxy.read(&mut out), 15);
//! assert_eq!(&out, b"unaligned bytes");
//! ```

#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions
)]

#[macro_use]
pub mod helpers;
pub mod buffer;
pub mod device;
pub mod proxy;

pub use buffer::AlignedBuffer;
pub use device::{BlockDevice, FileDevice, MemoryDevice, OpenMode};
pub use helpers::{KIBI, MEBI, SECTOR_SIZE};
pub use proxy::{BufferedProxy, Config, Error, Flags, ProxyStats};
