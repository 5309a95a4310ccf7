use std::fs::File;
use std::io;

pub const KIBI: usize = 1024; // 1KB

pub const MEBI: usize = KIBI * KIBI; // 1MB

/// Alignment that satisfies `O_DIRECT` on every filesystem we care about.
pub const SECTOR_SIZE: usize = 4 * KIBI; // 4KB

#[macro_export]
macro_rules! map_err {
    ($variant:ident, $err_ty:ty) => {
        impl From<$err_ty> for Error {
            fn from(err: $err_ty) -> Self {
                Error::$variant(err)
            }
        }
    };
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn sync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

#[cfg(target_os = "linux")]
pub(crate) fn sync_file(file: &File) -> io::Result<()> {
    file.sync_data()
}

/// Whether `addr` sits on an `align` boundary. `align` must be a power of two.
///
/// This is the only place the crate looks at raw addresses.
#[inline]
pub(crate) fn is_addr_aligned(addr: *const u8, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    addr.addr() & (align - 1) == 0
}

/// Largest multiple of `m` that is not greater than `n`.
#[inline]
pub(crate) const fn highest_multiple(n: usize, m: usize) -> usize {
    n - n % m
}

/// Rounds `value` down to a multiple of `granularity`, which need not be a power of two.
#[inline]
pub(crate) const fn align_down(value: u64, granularity: u64) -> u64 {
    value - value % granularity
}
