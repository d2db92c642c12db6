//! Short-hold synchronization primitives
//!
//! This module provides the only locking and counting primitives the
//! tracker uses:
//!
//! - [`SpinLock`] - test-and-test-and-set lock for short critical sections
//! - [`AtomicCounter`] - signed fetch-add/fetch-sub counter returning the
//!   post-operation value (reference counts, map counts, entry counts)
//! - [`SendSyncPtr`] - a host pointer that may cross threads
//!
//! # Safety Documentation
//!
//! A spinlock must never be held across a call into the wrapped driver or
//! into diagnostic I/O. Critical sections are tree lookups and inserts only.
//!
//! With the `loom` feature the atomics come from loom so the real protocol
//! is what the models in `loom_tests` explore.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicBool, AtomicI32, Ordering};

#[cfg(not(feature = "loom"))]
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

#[inline]
fn relax() {
    #[cfg(feature = "loom")]
    loom::thread::yield_now();
    #[cfg(not(feature = "loom"))]
    core::hint::spin_loop();
}

// ============================================================================
// SpinLock
// ============================================================================

/// A busy-wait mutual exclusion lock.
///
/// # Safety Invariants
///
/// 1. **Mutual exclusion**: at most one [`SpinLockGuard`] exists at a time
/// 2. **Acquire/Release pairing**: data written under the lock is visible
///    to the next holder
/// 3. **Short hold**: callers never block, allocate large buffers or call
///    out while holding the guard
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock.
    pub fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it is free.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin on a plain load so contended waiters don't hammer the cache line
            while self.locked.load(Ordering::Relaxed) {
                relax();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Returns whether the lock is currently held (racy, debugging only).
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

// SAFETY: The lock hands out at most one guard at a time, so sharing the
// lock between threads only ever gives one thread access to `T`. `T: Send`
// is required because the value is effectively moved between threads.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

/// RAII guard for [`SpinLock`]; releases on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard exists only while `locked` is held by this thread.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Same as Deref; the guard is the unique accessor.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ============================================================================
// AtomicCounter
// ============================================================================

/// Signed atomic counter.
///
/// All mutating operations return the value *after* the update, matching
/// how the tracker reasons about transitions (refcount reaching 0, map
/// count reaching 1, entry count exceeding 1).
pub struct AtomicCounter {
    value: AtomicI32,
}

impl AtomicCounter {
    /// Create a counter with an initial value.
    pub fn new(value: i32) -> Self {
        Self {
            value: AtomicI32::new(value),
        }
    }

    /// Add `n` and return the new value.
    pub fn add(&self, n: i32) -> i32 {
        self.value.fetch_add(n, Ordering::AcqRel).wrapping_add(n)
    }

    /// Subtract `n` and return the new value.
    pub fn sub(&self, n: i32) -> i32 {
        self.value.fetch_sub(n, Ordering::AcqRel).wrapping_sub(n)
    }

    /// Increment by one and return the new value.
    pub fn increment(&self) -> i32 {
        self.add(1)
    }

    /// Decrement by one and return the new value.
    pub fn decrement(&self) -> i32 {
        self.sub(1)
    }

    /// Decrement only if the current value is positive.
    ///
    /// Returns the new value, or `None` when the counter was already `<= 0`
    /// (the counter is left untouched in that case).
    pub fn decrement_if_positive(&self) -> Option<i32> {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return None;
            }
            match self.value.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current - 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Current value.
    pub fn get(&self) -> i32 {
        self.value.load(Ordering::Acquire)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

impl core::fmt::Debug for AtomicCounter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("AtomicCounter").field(&self.get()).finish()
    }
}

// ============================================================================
// SendSyncPtr
// ============================================================================

/// A host pointer owned by someone else (usually the driver) that the
/// tracker needs to store in shared records.
///
/// # Safety Invariants
///
/// 1. The wrapper never dereferences the pointer on its own
/// 2. Whoever dereferences it must prove it is still mapped and valid
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SendSyncPtr {
    ptr: *mut u8,
}

impl SendSyncPtr {
    /// Wrap a raw pointer (may be null).
    pub const fn new(ptr: *mut u8) -> Self {
        Self { ptr }
    }

    /// The raw pointer.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// The pointer as an address, for range arithmetic.
    pub fn addr(&self) -> usize {
        self.ptr as usize
    }
}

// SAFETY: The wrapper is an opaque address; it carries no aliasing
// guarantees and is never dereferenced without its owner's contract.
unsafe impl Send for SendSyncPtr {}
unsafe impl Sync for SendSyncPtr {}

impl core::fmt::Debug for SendSyncPtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SendSyncPtr({:p})", self.ptr)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn test_spinlock_guards_value() {
        let lock = SpinLock::new(5);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_spinlock_concurrent_increments() {
        let lock = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn test_counter_returns_post_value() {
        let c = AtomicCounter::new(1);
        assert_eq!(c.increment(), 2);
        assert_eq!(c.add(3), 5);
        assert_eq!(c.sub(4), 1);
        assert_eq!(c.decrement(), 0);
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn test_decrement_if_positive_stops_at_zero() {
        let c = AtomicCounter::new(1);
        assert_eq!(c.decrement_if_positive(), Some(0));
        assert_eq!(c.decrement_if_positive(), None);
        assert_eq!(c.get(), 0);
    }

    #[test]
    fn test_ptr_wrapper() {
        let mut value = 7u8;
        let p = SendSyncPtr::new(&mut value as *mut u8);
        assert_eq!(p.addr(), &value as *const u8 as usize);
    }

    fn _assert_send<T: Send>() {}
    fn _assert_sync<T: Sync>() {}

    #[test]
    fn test_send_sync_traits() {
        _assert_send::<SpinLock<u32>>();
        _assert_sync::<SpinLock<u32>>();
        _assert_send::<SendSyncPtr>();
        _assert_sync::<SendSyncPtr>();
        _assert_sync::<AtomicCounter>();
    }
}

// ============================================================================
// Kani proofs
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: A conditional decrement never takes the counter below zero
    #[kani::proof]
    #[kani::unwind(3)]
    fn decrement_if_positive_has_floor() {
        let start: i32 = kani::any();
        kani::assume(start > i32::MIN);
        let counter = AtomicCounter::new(start);
        match counter.decrement_if_positive() {
            Some(n) => {
                kani::assert(start > 0, "Only positive counters decrement");
                kani::assert(n == start - 1, "Decrements by exactly one");
            }
            None => kani::assert(counter.get() == start, "Non-positive counters are untouched"),
        }
    }
}
