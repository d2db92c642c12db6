//! Guarded page allocator and aligned heap buffers
//!
//! A [`GuardedRegion`] is one OS reservation laid out as:
//!
//! ```text
//!  real_base            page_base                         page_base + page_len
//!  │  guard (optional)  │  usable pages ............usable│  guard (optional)  │
//!  └────────────────────┴──────────────────────────────────┴────────────────────┘
//! ```
//!
//! With only an "after" guard the usable pointer is slid toward the end of
//! its last page (aligned down to [`SIMD_ALIGN`]) so that small overruns
//! land in the guard page immediately.
//!
//! # Safety Invariants
//!
//! 1. **Containment**: `usable..usable+usable_size` lies inside
//!    `page_base..page_base+page_len`
//! 2. **Guards stay armed**: guard pages are `PROT_NONE` from allocation
//!    until the whole reservation is released; `protect` never touches them
//! 3. **Single release**: `free` releases the reservation once and zeroes
//!    the descriptor, so `Drop` after `free` is a no-op

use alloc::alloc::{alloc, dealloc, Layout};
use core::ptr::{self, NonNull};

use crate::pages::{self, MemError, Protection};

/// Alignment preserved for the usable pointer of guard-after regions and
/// for [`AlignedBuffer`], wide enough for SIMD loads on mapped data.
pub const SIMD_ALIGN: usize = 32;

/// One allocation plus its guard pages.
pub struct GuardedRegion {
    usable: *mut u8,
    page_base: *mut u8,
    real_base: *mut u8,
    usable_size: usize,
    page_len: usize,
    real_len: usize,
}

// SAFETY: The region exclusively owns its reservation; nothing else aliases
// the pages, so moving or sharing the descriptor across threads is sound.
unsafe impl Send for GuardedRegion {}
unsafe impl Sync for GuardedRegion {}

impl GuardedRegion {
    /// Allocate `bytes` of usable memory with the given protection and guards.
    ///
    /// Size 0 is legal and yields a one-page region. Every OS failure is
    /// reported as [`MemError::AllocationFailure`] (or `Unsupported`) and
    /// nothing stays reserved.
    pub fn alloc(bytes: usize, flags: Protection) -> Result<Self, MemError> {
        let p = pages::page_size();
        let page_len = pages::round_up_to_pages(bytes);
        let before = if flags.contains(Protection::GUARD_BEFORE) { p } else { 0 };
        let after = if flags.contains(Protection::GUARD_AFTER) { p } else { 0 };
        let real_len = page_len + before + after;

        let real_base = pages::reserve(real_len)?.as_ptr();
        // SAFETY: `before <= real_len`, so the offset stays inside the reservation.
        let page_base = unsafe { real_base.add(before) };

        let mut region = Self {
            usable: page_base,
            page_base,
            real_base,
            usable_size: bytes,
            page_len,
            real_len,
        };

        if before != 0 {
            // SAFETY: First page of our own reservation.
            unsafe { pages::protect(real_base, p, Protection::empty()) }
                .map_err(as_allocation_failure)?;
        }
        if after != 0 {
            // SAFETY: The page right after the usable pages, still inside the reservation.
            let guard = unsafe { page_base.add(page_len) };
            unsafe { pages::protect(guard, p, Protection::empty()) }
                .map_err(as_allocation_failure)?;
            if before == 0 {
                let pad = (page_len - bytes.min(page_len)) & !(SIMD_ALIGN - 1);
                // SAFETY: `pad <= page_len - bytes`, so usable + bytes <= page_base + page_len.
                region.usable = unsafe { page_base.add(pad) };
            }
        }

        region.protect(flags).map_err(as_allocation_failure)?;
        Ok(region)
    }

    /// Change access protection of the usable pages only.
    ///
    /// Guard bits in `flags` are ignored; guard pages stay inaccessible.
    /// Applying the same flags twice is the same as applying them once.
    pub fn protect(&self, flags: Protection) -> Result<(), MemError> {
        if self.real_base.is_null() {
            return Err(MemError::ProtectionFailure { errno: 0 });
        }
        // SAFETY: page_base/page_len describe the usable pages of our live reservation.
        unsafe { pages::protect(self.page_base, self.page_len, flags.access()) }
    }

    /// Release the entire reservation, guards included, and zero the descriptor.
    pub fn free(&mut self) {
        if !self.real_base.is_null() {
            // SAFETY: real_base/real_len is exactly the reservation from `alloc`,
            // and the null check guarantees it has not been released yet.
            unsafe { pages::release(self.real_base, self.real_len) };
        }
        self.usable = ptr::null_mut();
        self.page_base = ptr::null_mut();
        self.real_base = ptr::null_mut();
        self.usable_size = 0;
        self.page_len = 0;
        self.real_len = 0;
    }

    /// Whether the region still owns a reservation.
    pub fn is_allocated(&self) -> bool {
        !self.real_base.is_null()
    }

    /// Pointer handed to the user.
    pub fn as_ptr(&self) -> *mut u8 {
        self.usable
    }

    /// Bytes requested at allocation time.
    pub fn len(&self) -> usize {
        self.usable_size
    }

    /// Whether zero bytes were requested.
    pub fn is_empty(&self) -> bool {
        self.usable_size == 0
    }

    /// Start of the usable pages.
    pub fn page_base(&self) -> *mut u8 {
        self.page_base
    }

    /// Size of the usable pages.
    pub fn page_len(&self) -> usize {
        self.page_len
    }

    /// Start of the whole reservation (first guard page when present).
    pub fn real_base(&self) -> *mut u8 {
        self.real_base
    }

    /// Size of the whole reservation.
    pub fn real_len(&self) -> usize {
        self.real_len
    }
}

impl Drop for GuardedRegion {
    fn drop(&mut self) {
        self.free();
    }
}

impl core::fmt::Debug for GuardedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GuardedRegion")
            .field("usable", &self.usable)
            .field("page_base", &self.page_base)
            .field("real_base", &self.real_base)
            .field("usable_size", &self.usable_size)
            .field("page_len", &self.page_len)
            .field("real_len", &self.real_len)
            .finish()
    }
}

fn as_allocation_failure(err: MemError) -> MemError {
    match err {
        MemError::ProtectionFailure { errno } => MemError::AllocationFailure { errno },
        other => other,
    }
}

// ============================================================================
// AlignedBuffer
// ============================================================================

/// A plain heap buffer aligned to [`SIMD_ALIGN`].
///
/// Used when mapping checks only want a private copy of the data and no
/// page protection.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// SAFETY: Exclusively owned heap allocation.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` uninitialized bytes (at least one byte is reserved).
    pub fn new(len: usize) -> Result<Self, MemError> {
        let layout = Layout::from_size_align(len.max(1), SIMD_ALIGN)
            .map_err(|_| MemError::AllocationFailure { errno: 0 })?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(MemError::AllocationFailure { errno: 0 })?;
        Ok(Self { ptr, layout, len })
    }

    /// Pointer to the buffer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Requested length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the requested length is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/layout come from the matching `alloc` call in `new`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl core::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Copy `len` bytes between two host buffers.
///
/// # Safety
///
/// `src` must be readable and `dst` writable for `len` bytes, and the two
/// ranges must not overlap.
pub unsafe fn copy_bytes(src: *const u8, dst: *mut u8, len: usize) {
    if len != 0 {
        ptr::copy_nonoverlapping(src, dst, len);
    }
}

// ============================================================================
// Tests
// ============================================================================
