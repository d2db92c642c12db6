//! Object registry
//!
//! One [`Registry`] per resource kind maps driver handles to
//! [`TrackingRecord`]s. The tree lives behind a [`SpinLock`]; reference
//! counts live in each record and are updated atomically outside the lock.
//!
//! # Zombies
//!
//! With zombie retention a record whose reference count reaches 0 stays in
//! the tree so later uses of the handle can be reported as use-after-free.
//! When the driver hands the same handle value out again, the zombie is
//! purged before the new record goes in.
//!
//! # Static objects
//!
//! [`ObjectKind::is_dynamic`] marks records that exist for lookups only
//! (root devices). They are recorded once, never counted and never leak.
//!
//! # Locking
//!
//! The lock covers tree lookups and structural changes only. Records are
//! shared as `Arc`s, so a record erased while another thread still holds
//! it stays valid for that thread.

use std::marker::PhantomData;
use std::sync::Arc;

use clint_unsafe_primitives::{AtomicCounter, SpinLock};

use crate::error::{TreeViolation, UsageViolation};
use crate::invariants::check_red_black;
use crate::tree::RbTree;
use crate::types::{Handle, KindId};

/// Per-kind configuration of a registry.
pub trait ObjectKind: Send + Sync + 'static {
    /// Kind-specific record fields.
    type Extra: Send + Sync + 'static;

    /// Which kind this is.
    const KIND: KindId;

    /// Whether a record takes part in reference counting and leak reports.
    fn is_dynamic(_extra: &Self::Extra) -> bool {
        true
    }
}

/// Tracking state of one live (or zombie) handle.
pub struct TrackingRecord<E> {
    key: Handle,
    ref_count: AtomicCounter,
    context: Option<Handle>,
    stack: Option<String>,
    extra: E,
}

impl<E> TrackingRecord<E> {
    pub fn new(key: Handle, context: Option<Handle>, stack: Option<String>, extra: E) -> Self {
        Self {
            key,
            ref_count: AtomicCounter::new(1),
            context,
            stack,
            extra,
        }
    }

    pub fn key(&self) -> Handle {
        self.key
    }

    /// Current reference count.
    pub fn ref_count(&self) -> i32 {
        self.ref_count.get()
    }

    /// Owning context, by handle.
    pub fn context(&self) -> Option<Handle> {
        self.context
    }

    /// Stack captured at creation.
    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// Kind-specific fields.
    pub fn extra(&self) -> &E {
        &self.extra
    }

    /// Released but retained for diagnosis.
    pub fn is_zombie(&self) -> bool {
        self.ref_count.get() <= 0
    }
}

impl<E> core::fmt::Debug for TrackingRecord<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrackingRecord")
            .field("key", &self.key)
            .field("ref_count", &self.ref_count.get())
            .field("context", &self.context)
            .field("has_stack", &self.stack.is_some())
            .finish_non_exhaustive()
    }
}

/// What `check_output` did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insertion {
    /// A new record went in
    Inserted,
    /// A live record with the same handle was replaced
    Replaced,
    /// A static record already existed; nothing changed
    Existing,
}

/// Outcome of a release that passed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Released {
    /// References remain
    Live(i32),
    /// The count reached 0 and the record was erased
    Erased,
    /// The count reached 0 and the record stays as a zombie
    Zombie,
    /// Static record, nothing to count
    Static,
}

type Shared<K> = Arc<TrackingRecord<<K as ObjectKind>::Extra>>;

/// Thread-safe map from handles of one kind to their records.
pub struct Registry<K: ObjectKind> {
    tree: SpinLock<RbTree<Handle, Shared<K>>>,
    zombies: bool,
    _kind: PhantomData<K>,
}

impl<K: ObjectKind> Registry<K> {
    /// Create an empty registry. `zombies` turns on zombie retention.
    pub fn new(zombies: bool) -> Self {
        Self {
            tree: SpinLock::new(RbTree::new()),
            zombies,
            _kind: PhantomData,
        }
    }

    pub fn kind(&self) -> KindId {
        K::KIND
    }

    pub fn keeps_zombies(&self) -> bool {
        self.zombies
    }

    /// Number of records, zombies included.
    pub fn len(&self) -> usize {
        self.tree.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record for `handle`, without validation.
    pub fn find(&self, handle: Handle) -> Option<Shared<K>> {
        self.tree.lock().get(&handle).cloned()
    }

    /// Record for `handle`, failing for unknown handles and zombies.
    pub fn lookup(&self, handle: Handle) -> Result<Shared<K>, UsageViolation> {
        let record = self.find(handle).ok_or(UsageViolation::UnknownHandle {
            kind: K::KIND,
            handle,
        })?;
        if K::is_dynamic(record.extra()) && record.is_zombie() {
            return Err(UsageViolation::AlreadyFreed {
                kind: K::KIND,
                handle,
                stack: record.stack.clone(),
            });
        }
        Ok(record)
    }

    /// Validate an input handle.
    pub fn check_input(&self, handle: Handle) -> Result<(), UsageViolation> {
        self.lookup(handle).map(|_| ())
    }

    /// Validate a list of input handles, returning the first violation.
    ///
    /// Every handle is checked; `report` sees each violation in order.
    pub fn check_inputs<F>(&self, handles: &[Handle], mut report: F) -> Result<(), UsageViolation>
    where
        F: FnMut(&UsageViolation),
    {
        let mut first = None;
        for handle in handles {
            if let Err(violation) = self.check_input(*handle) {
                report(&violation);
                first.get_or_insert(violation);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Record a handle the driver just produced.
    ///
    /// A zombie occupying the handle is purged first. Static records are
    /// kept as they are when already present.
    pub fn check_output(
        &self,
        handle: Handle,
        context: Option<Handle>,
        stack: Option<String>,
        extra: K::Extra,
    ) -> Insertion {
        let dynamic = K::is_dynamic(&extra);
        let record = Arc::new(TrackingRecord::new(handle, context, stack, extra));

        let mut tree = self.tree.lock();
        let zombie = match tree.get_mut(&handle) {
            None => false,
            Some(existing) if K::is_dynamic(existing.extra()) && existing.is_zombie() => true,
            Some(_) if !dynamic => return Insertion::Existing,
            Some(existing) => {
                *existing = record;
                return Insertion::Replaced;
            }
        };
        if zombie {
            tree.remove(&handle);
        }
        match tree.insert(handle, record) {
            Ok(_) => Insertion::Inserted,
            // The key was removed above under the same lock
            Err(_) => Insertion::Existing,
        }
    }

    /// Add a reference, returning the new count.
    pub fn retain(&self, handle: Handle) -> Result<i32, UsageViolation> {
        let record = self.lookup(handle)?;
        if !K::is_dynamic(record.extra()) {
            return Ok(record.ref_count());
        }
        Ok(record.ref_count.increment())
    }

    /// Drop a reference.
    ///
    /// The count never goes below 0: releasing a zombie (or losing a race
    /// to the last release) reports `AlreadyFreed` and changes nothing.
    pub fn release(&self, handle: Handle) -> Result<Released, UsageViolation> {
        let record = self.lookup(handle)?;
        if !K::is_dynamic(record.extra()) {
            return Ok(Released::Static);
        }
        let remaining =
            record
                .ref_count
                .decrement_if_positive()
                .ok_or_else(|| UsageViolation::AlreadyFreed {
                    kind: K::KIND,
                    handle,
                    stack: record.stack.clone(),
                })?;
        if remaining > 0 {
            return Ok(Released::Live(remaining));
        }
        if self.zombies {
            return Ok(Released::Zombie);
        }

        let mut tree = self.tree.lock();
        // Only erase the record we released; the handle may have been reused
        if tree
            .get(&handle)
            .is_some_and(|current| Arc::ptr_eq(current, &record))
        {
            tree.remove(&handle);
        }
        Ok(Released::Erased)
    }

    /// Remove a zombie occupying `handle`. Returns whether one was removed.
    pub fn purge(&self, handle: Handle) -> bool {
        let mut tree = self.tree.lock();
        let zombie = tree
            .get(&handle)
            .is_some_and(|r| K::is_dynamic(r.extra()) && r.is_zombie());
        if zombie {
            tree.remove(&handle);
        }
        zombie
    }

    /// Records that may have leaked, in handle order.
    ///
    /// Records with references are always included. With zombie retention
    /// every present record is included. `context` restricts the result to
    /// one owning context. Static records are never included.
    pub fn iterate_leaks(&self, context: Option<Handle>) -> Vec<Shared<K>> {
        let tree = self.tree.lock();
        tree.iter()
            .map(|(_, record)| record)
            .filter(|r| K::is_dynamic(r.extra()))
            .filter(|r| context.is_none() || r.context() == context)
            .filter(|r| self.zombies || r.ref_count() > 0)
            .cloned()
            .collect()
    }

    /// Every record in handle order.
    pub fn snapshot(&self) -> Vec<Shared<K>> {
        self.tree.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    /// Check the red-black invariants of the backing tree.
    pub fn check_invariants(&self) -> Result<usize, TreeViolation> {
        check_red_black(&self.tree.lock())
    }
}

impl<K: ObjectKind> core::fmt::Debug for Registry<K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &K::KIND)
            .field("zombies", &self.zombies)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Plain;
    impl ObjectKind for Plain {
        type Extra = ();
        const KIND: KindId = KindId::Event;
    }

    struct Maybe;
    impl ObjectKind for Maybe {
        type Extra = bool;
        const KIND: KindId = KindId::Device;
        fn is_dynamic(extra: &bool) -> bool {
            *extra
        }
    }

    #[test]
    fn test_unknown_handle() {
        let reg = Registry::<Plain>::new(false);
        assert_eq!(
            reg.check_input(Handle(1)),
            Err(UsageViolation::UnknownHandle {
                kind: KindId::Event,
                handle: Handle(1)
            })
        );
    }

    #[test]
    fn test_output_then_input() {
        let reg = Registry::<Plain>::new(false);
        assert_eq!(reg.check_output(Handle(8), Some(Handle(1)), None, ()), Insertion::Inserted);
        assert!(reg.check_input(Handle(8)).is_ok());
        let record = reg.find(Handle(8)).unwrap();
        assert_eq!(record.ref_count(), 1);
        assert_eq!(record.context(), Some(Handle(1)));
    }

    #[test]
    fn test_release_without_zombies_erases() {
        let reg = Registry::<Plain>::new(false);
        reg.check_output(Handle(8), None, None, ());
        assert_eq!(reg.retain(Handle(8)), Ok(2));
        assert_eq!(reg.release(Handle(8)), Ok(Released::Live(1)));
        assert_eq!(reg.release(Handle(8)), Ok(Released::Erased));
        assert!(reg.is_empty());
        assert!(matches!(
            reg.release(Handle(8)),
            Err(UsageViolation::UnknownHandle { .. })
        ));
        assert!(reg.iterate_leaks(None).is_empty());
    }

    #[test]
    fn test_zombie_reports_already_freed() {
        let reg = Registry::<Plain>::new(true);
        reg.check_output(Handle(8), None, Some("at main".into()), ());
        assert_eq!(reg.release(Handle(8)), Ok(Released::Zombie));

        let err = reg.check_input(Handle(8)).unwrap_err();
        assert_eq!(
            err,
            UsageViolation::AlreadyFreed {
                kind: KindId::Event,
                handle: Handle(8),
                stack: Some("at main".into())
            }
        );
        // Releasing a zombie does not push the count negative
        assert!(reg.release(Handle(8)).is_err());
        assert_eq!(reg.find(Handle(8)).unwrap().ref_count(), 0);

        let leaks = reg.iterate_leaks(None);
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].ref_count(), 0);
    }

    #[test]
    fn test_reuse_purges_zombie() {
        let reg = Registry::<Plain>::new(true);
        reg.check_output(Handle(8), None, None, ());
        reg.release(Handle(8)).unwrap();
        assert_eq!(reg.check_output(Handle(8), None, None, ()), Insertion::Inserted);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.find(Handle(8)).unwrap().ref_count(), 1);
        assert!(reg.check_input(Handle(8)).is_ok());
    }

    #[test]
    fn test_purge_only_removes_zombies() {
        let reg = Registry::<Plain>::new(true);
        reg.check_output(Handle(8), None, None, ());
        assert!(!reg.purge(Handle(8)));
        reg.release(Handle(8)).unwrap();
        assert!(reg.purge(Handle(8)));
        assert!(reg.find(Handle(8)).is_none());
        assert!(!reg.purge(Handle(9)));
    }

    #[test]
    fn test_live_duplicate_is_replaced() {
        let reg = Registry::<Plain>::new(false);
        reg.check_output(Handle(8), Some(Handle(1)), None, ());
        reg.retain(Handle(8)).unwrap();
        assert_eq!(reg.check_output(Handle(8), Some(Handle(2)), None, ()), Insertion::Replaced);
        let record = reg.find(Handle(8)).unwrap();
        assert_eq!(record.ref_count(), 1);
        assert_eq!(record.context(), Some(Handle(2)));
    }

    #[test]
    fn test_static_records() {
        let reg = Registry::<Maybe>::new(false);
        assert_eq!(reg.check_output(Handle(1), None, None, false), Insertion::Inserted);
        assert_eq!(reg.check_output(Handle(1), None, None, false), Insertion::Existing);
        assert_eq!(reg.retain(Handle(1)), Ok(1));
        assert_eq!(reg.release(Handle(1)), Ok(Released::Static));
        assert_eq!(reg.release(Handle(1)), Ok(Released::Static));
        assert!(reg.check_input(Handle(1)).is_ok());

        reg.check_output(Handle(2), None, None, true);
        let leaks = reg.iterate_leaks(None);
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].key(), Handle(2));
    }

    #[test]
    fn test_leaks_filter_by_context_in_order() {
        let reg = Registry::<Plain>::new(false);
        for (h, ctx) in [(30, 1), (10, 1), (20, 2)] {
            reg.check_output(Handle(h), Some(Handle(ctx)), None, ());
        }
        let all: Vec<_> = reg.iterate_leaks(None).iter().map(|r| r.key()).collect();
        assert_eq!(all, vec![Handle(10), Handle(20), Handle(30)]);
        let first: Vec<_> = reg
            .iterate_leaks(Some(Handle(1)))
            .iter()
            .map(|r| r.key())
            .collect();
        assert_eq!(first, vec![Handle(10), Handle(30)]);
    }

    #[test]
    fn test_check_inputs_reports_every_violation() {
        let reg = Registry::<Plain>::new(false);
        reg.check_output(Handle(2), None, None, ());
        let mut seen = Vec::new();
        let first = reg
            .check_inputs(&[Handle(1), Handle(2), Handle(3)], |v| seen.push(v.handle()))
            .unwrap_err();
        assert_eq!(first.handle(), Some(Handle(1)));
        assert_eq!(seen, vec![Some(Handle(1)), Some(Handle(3))]);
    }

    #[test]
    fn test_concurrent_outputs_and_releases() {
        let reg = Arc::new(Registry::<Plain>::new(false));
        let handles: Vec<_> = (0..4usize)
            .map(|t| {
                let reg = reg.clone();
                thread::spawn(move || {
                    for i in 0..500usize {
                        let h = Handle(t * 10_000 + i + 1);
                        reg.check_output(h, None, None, ());
                        reg.retain(h).unwrap();
                        reg.release(h).unwrap();
                        if i % 2 == 0 {
                            assert_eq!(reg.release(h), Ok(Released::Erased));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 4 * 250);
        assert!(reg.check_invariants().is_ok());
    }

    #[test]
    fn test_concurrent_last_release_counts_once() {
        let reg = Arc::new(Registry::<Plain>::new(true));
        reg.check_output(Handle(5), None, None, ());
        for _ in 0..7 {
            reg.retain(Handle(5)).unwrap();
        }
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                thread::spawn(move || reg.release(Handle(5)))
            })
            .collect();
        let zombies = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|r| *r == Ok(Released::Zombie))
            .count();
        assert_eq!(zombies, 1);
        assert_eq!(reg.find(Handle(5)).unwrap().ref_count(), 0);
    }
}
