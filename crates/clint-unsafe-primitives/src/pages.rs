//! OS page reservation, protection and release
//!
//! The only module that talks to the virtual memory system. Everything here
//! works on page-aligned ranges; callers (the guarded allocator) decide how
//! usable pages and guard pages are laid out inside one reservation.
//!
//! # Platform Support
//!
//! - **unix**: `mmap(MAP_PRIVATE | MAP_ANONYMOUS)`, `mprotect`, `munmap`
//! - **other**: reservation reports [`MemError::Unsupported`], so callers
//!   fall back to unguarded memory

use bitflags::bitflags;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

bitflags! {
    /// Access protection and guard layout requested for a region.
    ///
    /// `READ`/`WRITE`/`EXECUTE` describe the usable pages. The guard bits
    /// only matter at allocation time and are ignored by `protect`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        /// Usable pages are readable.
        const READ = 1 << 0;
        /// Usable pages are writable.
        const WRITE = 1 << 1;
        /// Usable pages are executable.
        const EXECUTE = 1 << 2;
        /// Place an inaccessible page immediately before the usable pages.
        const GUARD_BEFORE = 1 << 3;
        /// Place an inaccessible page immediately after the usable pages.
        const GUARD_AFTER = 1 << 4;
    }
}

impl Protection {
    /// Read and write access.
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    /// Only the access bits (guard bits stripped).
    pub fn access(self) -> Self {
        self & (Self::READ | Self::WRITE | Self::EXECUTE)
    }

    /// Only the guard bits.
    pub fn guards(self) -> Self {
        self & (Self::GUARD_BEFORE | Self::GUARD_AFTER)
    }
}

/// Errors from the virtual memory layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemError {
    /// Reserving pages (or arming a guard page) failed
    AllocationFailure {
        /// OS error number, 0 when unknown
        errno: i32,
    },
    /// Changing protection of the usable pages failed
    ProtectionFailure {
        /// OS error number, 0 when unknown
        errno: i32,
    },
    /// Page-based allocation is not available on this platform
    Unsupported,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailure { errno } => {
                write!(f, "page allocation failed (errno {})", errno)
            }
            Self::ProtectionFailure { errno } => {
                write!(f, "page protection change failed (errno {})", errno)
            }
            Self::Unsupported => write!(f, "guarded pages are not supported on this platform"),
        }
    }
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

#[cfg(unix)]
fn query_page_size() -> usize {
    // SAFETY: sysconf has no memory side effects.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    4096
}

/// The OS page size in bytes (queried once, then cached).
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = query_page_size();
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Round `bytes` up to a whole number of pages, never less than one page.
pub fn round_up_to_pages(bytes: usize) -> usize {
    let p = page_size();
    let rounded = bytes.saturating_add(p - 1) & !(p - 1);
    rounded.max(p)
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "emscripten"))]
fn last_errno() -> i32 {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    unsafe { *libc::__errno_location() }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
fn last_errno() -> i32 {
    // SAFETY: __error always returns a valid thread-local pointer.
    unsafe { *libc::__error() }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "emscripten",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
)))]
fn last_errno() -> i32 {
    0
}

#[cfg(unix)]
fn os_protection(prot: Protection) -> libc::c_int {
    let mut flags = libc::PROT_NONE;
    if prot.contains(Protection::READ) {
        flags |= libc::PROT_READ;
    }
    if prot.contains(Protection::WRITE) {
        flags |= libc::PROT_WRITE;
    }
    if prot.contains(Protection::EXECUTE) {
        flags |= libc::PROT_EXEC;
    }
    flags
}

/// Reserve `len` bytes of fresh read/write pages as one mapping.
///
/// `len` must be a multiple of [`page_size`].
#[cfg(unix)]
pub fn reserve(len: usize) -> Result<NonNull<u8>, MemError> {
    debug_assert!(len % page_size() == 0);
    // SAFETY: Anonymous private mapping with no fixed address; the kernel
    // picks a fresh range that aliases nothing.
    let addr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(MemError::AllocationFailure {
            errno: last_errno(),
        });
    }
    NonNull::new(addr as *mut u8).ok_or(MemError::AllocationFailure { errno: 0 })
}

#[cfg(not(unix))]
pub fn reserve(_len: usize) -> Result<NonNull<u8>, MemError> {
    Err(MemError::Unsupported)
}

/// Change the protection of `[base, base + len)`.
///
/// # Safety
///
/// The range must lie inside a live reservation returned by [`reserve`]
/// and `base`/`len` must be page aligned.
#[cfg(unix)]
pub unsafe fn protect(base: *mut u8, len: usize, prot: Protection) -> Result<(), MemError> {
    if libc::mprotect(base as *mut libc::c_void, len, os_protection(prot)) != 0 {
        return Err(MemError::ProtectionFailure {
            errno: last_errno(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
pub unsafe fn protect(_base: *mut u8, _len: usize, _prot: Protection) -> Result<(), MemError> {
    Err(MemError::Unsupported)
}

/// Release a whole reservation in one call.
///
/// # Safety
///
/// `base`/`len` must be exactly a reservation returned by [`reserve`] that
/// has not been released yet. No pointer into it may be used afterwards.
#[cfg(unix)]
pub unsafe fn release(base: *mut u8, len: usize) {
    // munmap only fails for invalid arguments, which the contract excludes.
    let _ = libc::munmap(base as *mut libc::c_void, len);
}

#[cfg(not(unix))]
pub unsafe fn release(_base: *mut u8, _len: usize) {}
