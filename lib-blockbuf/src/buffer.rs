//! Address-aligned memory windows.
//!
//! Devices that DMA into memory, and Linux's `O_DIRECT`, need buffers whose address is a multiple
//! of some alignment. `Vec<u8>` only guarantees 1-byte alignment and the standard library has no
//! safe API for custom-aligned allocations, so we use `std::alloc::Layout` directly.

use std::alloc::{self, Layout, LayoutError};
use std::ptr::NonNull;
use std::slice;

pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: `AlignedBuffer` uniquely owns its allocation, like `Box<[u8]>`. Shared access only hands
// out `&[u8]` and mutation requires `&mut self`.
unsafe impl Send for AlignedBuffer {}
// SAFETY: see above.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates `size` zeroed bytes starting on an `align` boundary.
    ///
    /// Fails if `align` is not a power of two or the rounded size overflows `isize`.
    pub fn new(size: usize, align: usize) -> Result<Self, LayoutError> {
        // A zero-sized request still gets a real allocation so the pointer honours `align`.
        let layout = Layout::from_size_align(size.max(1), align)?;
        // SAFETY: `layout` has a non-zero size. The returned pointer is checked for null and
        // `handle_alloc_error` diverges on failure.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Ok(Self { ptr, len: size, layout })
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn alignment(&self) -> usize {
        self.layout.align()
    }

    pub const fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid, aligned, zero-initialized in `new()`, and points to at least
        // `len` bytes. The slice lifetime is tied to `&self`, preventing use after free.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub const fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_slice`; `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr` was allocated with exactly `self.layout` in `new()`. After `dealloc`, no
        // code can access the memory because `Drop` consumes `self`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
