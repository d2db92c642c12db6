//! Mapped-buffer shadow manager
//!
//! While a memory object is mapped, the application can be handed a
//! substitute pointer instead of the driver's: a private copy that is
//! either plain heap memory or guarded, access-protected pages. Writes are
//! copied back when the last mapping goes away.
//!
//! ```text
//!            map (count 0 -> 1)                unmap (count 1 -> 0)
//! Unmapped ──────────────────────▶ Shadowed ──────────────────────▶ Unmapped
//!                                  │      ▲
//!                                  └──────┘ nested map/unmap reuse the shadow
//! ```
//!
//! Checking is best-effort. When the shadow cannot be allocated or
//! protected, the driver's pointer is returned and the caller is told why.
//!
//! # Safety
//!
//! This is the only module of the crate that dereferences host pointers.
//! The caller of [`ShadowManager::map`] guarantees `real` is readable and
//! writable for `size` bytes until the matching [`ShadowManager::unmap`].

use std::sync::atomic::{AtomicUsize, Ordering};

use clint_unsafe_primitives::{
    copy_bytes, AlignedBuffer, AtomicCounter, GuardedRegion, Protection, SendSyncPtr, SpinLock,
};

use crate::error::ShadowError;
use crate::policy::MappingMode;
use crate::types::{ImageFormat, MapFlags, MemFlags, Sharing};

/// Memory backing an active shadow.
#[derive(Debug)]
pub enum ShadowBuffer {
    /// Plain copy, no bounds or access checks
    Heap(AlignedBuffer),
    /// Protected pages with optional guard pages
    Guarded(GuardedRegion),
}

impl ShadowBuffer {
    pub fn as_ptr(&self) -> *mut u8 {
        match self {
            ShadowBuffer::Heap(buf) => buf.as_ptr(),
            ShadowBuffer::Guarded(region) => region.as_ptr(),
        }
    }
}

/// An active substitution for one memory object.
#[derive(Debug)]
pub struct ShadowMapping {
    real: SendSyncPtr,
    size: usize,
    flags: MapFlags,
    buffer: ShadowBuffer,
}

impl ShadowMapping {
    /// Pointer handed to the application.
    pub fn shadow_ptr(&self) -> *mut u8 {
        self.buffer.as_ptr()
    }

    /// The driver's pointer.
    pub fn real_ptr(&self) -> *mut u8 {
        self.real.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn buffer(&self) -> &ShadowBuffer {
        &self.buffer
    }

    /// Shadow address for a driver pointer inside this mapping.
    fn translate(&self, real: *mut u8, size: usize) -> Option<*mut u8> {
        let start = self.real.addr();
        let offset = (real as usize).checked_sub(start)?;
        if offset.checked_add(size)? > self.size {
            return None;
        }
        Some(self.shadow_ptr().wrapping_add(offset))
    }
}

/// Memory-object fields of a tracking record.
#[derive(Debug)]
pub struct MemState {
    flags: MemFlags,
    sharing: Sharing,
    pixel_size: AtomicUsize,
    map_count: AtomicCounter,
    mapping: SpinLock<Option<ShadowMapping>>,
}

impl MemState {
    pub fn new(flags: MemFlags, sharing: Sharing, format: Option<&ImageFormat>) -> Self {
        Self {
            flags,
            sharing,
            pixel_size: AtomicUsize::new(format.map_or(0, ImageFormat::pixel_size)),
            map_count: AtomicCounter::new(0),
            mapping: SpinLock::new(None),
        }
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    pub fn sharing(&self) -> Sharing {
        self.sharing
    }

    /// Bytes per pixel for images, 0 for buffers.
    pub fn pixel_size(&self) -> usize {
        self.pixel_size.load(Ordering::Acquire)
    }

    pub fn set_image_format(&self, format: &ImageFormat) {
        self.pixel_size.store(format.pixel_size(), Ordering::Release);
    }

    /// Outstanding maps.
    pub fn map_count(&self) -> i32 {
        self.map_count.get()
    }

    /// Whether a shadow is currently substituted.
    pub fn is_shadowed(&self) -> bool {
        self.mapping.lock().is_some()
    }

    /// Shadow pointer of the active substitution.
    pub fn shadow_ptr(&self) -> Option<*mut u8> {
        self.mapping.lock().as_ref().map(ShadowMapping::shadow_ptr)
    }
}

impl Default for MemState {
    fn default() -> Self {
        Self::new(MemFlags::empty(), Sharing::None, None)
    }
}

/// Result of a map request.
#[derive(Debug)]
pub enum MapOutcome {
    /// First map: a fresh shadow was substituted
    Shadowed(*mut u8),
    /// Nested map inside the active shadow
    Nested(*mut u8),
    /// Checking off, or a nested map with no usable shadow
    PassThrough(*mut u8),
    /// The object uses the application's own memory; its pointer is kept
    HostPointer(*mut u8),
    /// Checking was requested but the shadow could not be set up
    Fallback { ptr: *mut u8, error: ShadowError },
}

impl MapOutcome {
    /// Pointer to return to the application.
    pub fn ptr(&self) -> *mut u8 {
        match self {
            MapOutcome::Shadowed(p)
            | MapOutcome::Nested(p)
            | MapOutcome::PassThrough(p)
            | MapOutcome::HostPointer(p) => *p,
            MapOutcome::Fallback { ptr, .. } => *ptr,
        }
    }
}

/// Result of an unmap request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnmapOutcome {
    /// Other maps remain
    StillMapped(i32),
    /// Last unmap; `copied_back` tells whether shadow contents were written
    /// to the driver's memory
    Unmapped { copied_back: bool },
    /// Unmap without a matching map; the count stays at 0
    NotMapped,
}

/// Applies one [`MappingMode`] to map and unmap requests.
#[derive(Clone, Copy, Debug)]
pub struct ShadowManager {
    mode: MappingMode,
}

impl ShadowManager {
    pub fn new(mode: MappingMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> MappingMode {
        self.mode
    }

    /// Count a map of `size` bytes at `real` and pick the pointer to hand out.
    pub fn map(&self, mem: &MemState, flags: MapFlags, real: *mut u8, size: usize) -> MapOutcome {
        let mut slot = mem.mapping.lock();
        let count = mem.map_count.increment();

        if count > 1 {
            return match slot.as_ref().and_then(|m| m.translate(real, size)) {
                Some(ptr) => MapOutcome::Nested(ptr),
                None => MapOutcome::PassThrough(real),
            };
        }
        if !self.mode.is_enabled() {
            return MapOutcome::PassThrough(real);
        }
        if mem.flags.contains(MemFlags::USE_HOST_PTR) {
            return MapOutcome::HostPointer(real);
        }

        let outcome = match self.activate(flags, real, size) {
            Ok(mapping) => {
                let ptr = mapping.shadow_ptr();
                *slot = Some(mapping);
                MapOutcome::Shadowed(ptr)
            }
            Err(error) => MapOutcome::Fallback { ptr: real, error },
        };
        // Subscribers may inspect this object, so never emit under the slot lock
        drop(slot);
        if let MapOutcome::Shadowed(_) = outcome {
            tracing::debug!(size, ?flags, mode = ?self.mode, "shadow mapping active");
        }
        outcome
    }

    /// Count an unmap; the last one copies writes back and frees the shadow.
    pub fn unmap(&self, mem: &MemState) -> UnmapOutcome {
        let taken = {
            let mut slot = mem.mapping.lock();
            match mem.map_count.decrement_if_positive() {
                None => return UnmapOutcome::NotMapped,
                Some(0) => slot.take(),
                Some(remaining) => return UnmapOutcome::StillMapped(remaining),
            }
        };
        let copied_back = taken.is_some_and(deactivate);
        UnmapOutcome::Unmapped { copied_back }
    }

    #[allow(unsafe_code)]
    fn activate(
        &self,
        flags: MapFlags,
        real: *mut u8,
        size: usize,
    ) -> Result<ShadowMapping, ShadowError> {
        let buffer = if self.mode.uses_pages() {
            let region = GuardedRegion::alloc(size, self.mode.guards() | Protection::READ_WRITE)
                .map_err(ShadowError::Allocation)?;
            if flags.preserves_contents() {
                // SAFETY: `real` is mapped for `size` bytes by the caller's
                // contract and the region's usable range holds `size` bytes.
                unsafe { copy_bytes(real, region.as_ptr(), size) };
            }
            region
                .protect(access_for(flags))
                .map_err(ShadowError::Protection)?;
            ShadowBuffer::Guarded(region)
        } else {
            let buf = AlignedBuffer::new(size).map_err(ShadowError::Allocation)?;
            if flags.preserves_contents() {
                // SAFETY: As above; the buffer holds `size` bytes.
                unsafe { copy_bytes(real, buf.as_ptr(), size) };
            }
            ShadowBuffer::Heap(buf)
        };

        Ok(ShadowMapping {
            real: SendSyncPtr::new(real),
            size,
            flags,
            buffer,
        })
    }
}

/// Page protection matching the requested map access.
fn access_for(flags: MapFlags) -> Protection {
    let mut access = Protection::empty();
    if flags.contains(MapFlags::READ) {
        access |= Protection::READ;
    }
    if flags.allows_write() {
        access |= Protection::WRITE;
    }
    access
}

/// Tear down a shadow, copying writes back. Returns whether data was copied.
#[allow(unsafe_code)]
fn deactivate(mapping: ShadowMapping) -> bool {
    if !mapping.flags.allows_write() {
        return false;
    }
    if let ShadowBuffer::Guarded(region) = &mapping.buffer {
        if let Err(err) = region.protect(Protection::READ) {
            tracing::debug!(error = %err, "shadow not readable, dropping writes");
            return false;
        }
    }
    // SAFETY: The shadow is readable for `size` bytes and the driver's
    // pointer is still mapped until the unmap this call belongs to.
    unsafe { copy_bytes(mapping.shadow_ptr(), mapping.real_ptr(), mapping.size) };
    true
}
