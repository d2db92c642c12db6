//! Thread-safety monitor
//!
//! Counts how many threads are inside a scope. Entering a scope that
//! already has a thread inside is a violation of the API's concurrency
//! contract. The monitor only reports: it never blocks the second thread.
//!
//! Two scopes exist: [`Scope::Api`], for the strict rule that no two entry
//! points run at once, and [`Scope::Kernel`], for the rule that only one
//! thread may set a given kernel's arguments at a time.

use core::fmt;

use clint_unsafe_primitives::AtomicCounter;

use crate::error::UsageViolation;
use crate::types::Handle;

/// Threads allowed inside one scope at a time.
pub const ENTRY_BOUND: i32 = 1;

/// What an entry counter protects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Any tracked entry point (strict-thread mode)
    Api,
    /// Argument updates of one kernel
    Kernel(Handle),
}

impl Scope {
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Scope::Api => None,
            Scope::Kernel(h) => Some(*h),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Api => f.write_str("calling OpenCL concurrently"),
            Scope::Kernel(h) => write!(f, "modifying the kernel {}", h),
        }
    }
}

/// Record an entry into `scope`.
///
/// The counter is incremented even when a violation is returned, so every
/// `enter` must be paired with an [`exit`].
pub fn enter(counter: &AtomicCounter, scope: Scope) -> Result<i32, UsageViolation> {
    let count = counter.increment();
    if count > ENTRY_BOUND {
        return Err(UsageViolation::ConcurrentAccess { scope, count });
    }
    Ok(count)
}

/// Record an exit from a scope, returning the remaining count.
pub fn exit(counter: &AtomicCounter) -> i32 {
    counter.decrement()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_single_entry_is_legal() {
        let counter = AtomicCounter::new(0);
        assert_eq!(enter(&counter, Scope::Api), Ok(1));
        assert_eq!(exit(&counter), 0);
    }

    #[test]
    fn test_overlapping_entry_is_reported() {
        let counter = AtomicCounter::new(0);
        enter(&counter, Scope::Kernel(Handle(4))).unwrap();
        let err = enter(&counter, Scope::Kernel(Handle(4))).unwrap_err();
        assert_eq!(
            err,
            UsageViolation::ConcurrentAccess {
                scope: Scope::Kernel(Handle(4)),
                count: 2
            }
        );
        exit(&counter);
        assert_eq!(exit(&counter), 0);
    }

    #[test]
    fn test_two_threads_inside_detect_exactly_one_violation() {
        let counter = Arc::new(AtomicCounter::new(0));
        let inside = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let counter = counter.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    let result = enter(&counter, Scope::Api);
                    // Both threads are inside before either leaves
                    inside.wait();
                    exit(&counter);
                    result.is_err()
                })
            })
            .collect();
        let violations = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|v| *v)
            .count();
        assert_eq!(violations, 1);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(Scope::Api.to_string(), "calling OpenCL concurrently");
        assert_eq!(Scope::Kernel(Handle(0xab)).handle(), Some(Handle(0xab)));
    }
}
