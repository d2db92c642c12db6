//! CLint Unsafe Primitives - Consolidated Unsafe Code TCB
//!
//! This crate contains ALL unsafe code of the CLint interception layer,
//! consolidated into a single auditable location. `clint-core` uses
//! `#![deny(unsafe_code)]` everywhere except the shadow manager, which has
//! to trust the host pointers handed out by the driver.
//!
//! # Design Principles
//!
//! 1. **Minimal unsafe surface**: Only truly necessary unsafe operations
//! 2. **Safe wrappers**: Spinlock guards, counters and page regions expose safe APIs
//! 3. **Auditable**: All raw pointer arithmetic lives in `pages` and `allocator`
//! 4. **Verified**: Loom models for every atomic protocol
//!
//! # Module Organization
//!
//! - `sync` - Short-hold spinlock, atomic ref/entry counters, Send/Sync pointer wrapper
//! - `pages` - OS page reservation, protection and release
//! - `allocator` - Guarded regions (usable pages + inaccessible guard pages) and aligned heap buffers
//! - `loom_tests` - Concurrency tests using loom (with `loom` feature)
//!
//! # Verification
//!
//! 1. **Loom tests** (`cargo test --features loom`): Concurrency testing
//! 2. **Kani proofs** (`cargo kani`): Counter floor
//! 3. **Unit tests**: Traditional testing, including forked fault probes on unix

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod allocator;
pub mod pages;
pub mod sync;

#[cfg(any(test, feature = "loom"))]
mod loom_tests;

// Re-export commonly used items
pub use allocator::{copy_bytes, AlignedBuffer, GuardedRegion, SIMD_ALIGN};
pub use pages::{page_size, MemError, Protection};
pub use sync::{AtomicCounter, SendSyncPtr, SpinLock, SpinLockGuard};
