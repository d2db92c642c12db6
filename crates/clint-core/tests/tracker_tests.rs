//! Tracker integration tests
//!
//! Drive the tracker the way the intercept layer does: record handles the
//! "driver" produced, feed inputs back in, and check the diagnostic lines.

use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;

use clint_core::{
    CommandQueue, Context, Event, Handle, Kernel, KindId, MapFlags, MappingMode, Mem, MemFlags,
    MemorySink, Origin, Policy, Program, Scope, Sharing, Tracker, UsageViolation,
};

// ============================================================================
// Helpers
// ============================================================================

fn tracker_with(policy: Policy) -> (Tracker, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let tracker = Tracker::new(policy, sink.clone());
    sink.clear();
    (tracker, sink)
}

fn env_tracker(vars: &[(&str, &str)]) -> (Tracker, Arc<MemorySink>) {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let policy = Policy::from_env_with(|key| vars.get(key).cloned()).unwrap();
    tracker_with(policy)
}

/// A fake driver allocation the tracker can map.
struct DeviceBuffer {
    handle: Handle,
    bytes: Vec<u8>,
}

impl DeviceBuffer {
    fn create(tracker: &Tracker, handle: usize, ctx: Handle, flags: MemFlags, len: usize) -> Self {
        let handle = Handle(handle);
        tracker.check_output_mem(handle, Origin::Context(ctx), flags, Sharing::None, None);
        Self {
            handle,
            bytes: (0..len).map(|i| i as u8).collect(),
        }
    }
}

const CTX: Handle = Handle(0x1000);

// ============================================================================
// Double release
// ============================================================================

#[test]
fn test_double_release_without_zombies_is_unknown() {
    let (t, sink) = env_tracker(&[("CLINT_TRACK", "1")]);
    t.check_output::<Context>(CTX, Origin::None);
    let buf = DeviceBuffer::create(&t, 0x2000, CTX, MemFlags::READ_WRITE, 16);

    t.release::<Mem>(buf.handle).unwrap();
    let err = t.release::<Mem>(buf.handle).unwrap_err();
    assert_eq!(
        err,
        UsageViolation::UnknownHandle {
            kind: KindId::Mem,
            handle: buf.handle
        }
    );
    assert_eq!(sink.lines(), vec!["ERROR: Unknown cl_mem 0x2000"]);
}

#[test]
fn test_double_release_with_zombies_is_previously_freed() {
    let (t, sink) = env_tracker(&[("CLINT_TRACK", "1"), ("CLINT_ZOMBIES", "1")]);
    t.check_output::<Context>(CTX, Origin::None);
    t.check_output::<Program>(Handle(0x3000), Origin::Context(CTX));

    t.release::<Program>(Handle(0x3000)).unwrap();
    assert!(t.release::<Program>(Handle(0x3000)).is_err());
    assert!(t.check_input::<Program>(Handle(0x3000)).is_err());
    assert_eq!(
        sink.count("ERROR: cl_program 0x3000 was previously freed."),
        2
    );
}

#[test]
fn test_reused_handle_replaces_zombie() {
    let (t, sink) = env_tracker(&[("CLINT_TRACK", "1"), ("CLINT_ZOMBIES", "1")]);
    t.check_output::<Event>(Handle(0x40), Origin::None);
    t.release::<Event>(Handle(0x40)).unwrap();

    // The driver hands the same address back for a new event
    t.check_output::<Event>(Handle(0x40), Origin::None);
    assert!(t.check_input::<Event>(Handle(0x40)).is_ok());
    assert_eq!(t.lookup::<Event>(Handle(0x40)).unwrap().ref_count(), 1);
    assert!(sink.is_empty());
}

#[test]
fn test_retain_balances_release() {
    let (t, sink) = env_tracker(&[("CLINT_TRACK", "1")]);
    let q = Handle(0x50);
    t.check_output::<CommandQueue>(q, Origin::Context(CTX));
    t.retain::<CommandQueue>(q).unwrap();
    t.retain::<CommandQueue>(q).unwrap();
    for _ in 0..3 {
        t.release::<CommandQueue>(q).unwrap();
    }
    assert!(t.lookup::<CommandQueue>(q).is_none());
    assert!(t.retain::<CommandQueue>(q).is_err());
    assert_eq!(sink.count("ERROR: Unknown cl_command_queue 0x50"), 1);
}

#[test]
fn test_input_list_reports_every_bad_handle() {
    let (t, sink) = env_tracker(&[("CLINT_TRACK", "1")]);
    t.check_output::<Event>(Handle(0x61), Origin::None);
    let list = [Handle(0x60), Handle(0x61), Handle(0x62)];
    let err = t.check_inputs::<Event>(&list).unwrap_err();
    assert_eq!(err.handle(), Some(Handle(0x60)));
    assert_eq!(
        sink.lines(),
        vec!["ERROR: Unknown cl_event 0x60", "ERROR: Unknown cl_event 0x62"]
    );
}

// ============================================================================
// Threads
// ============================================================================

#[test]
fn test_strict_thread_detects_overlapping_calls() {
    let (t, sink) = env_tracker(&[("CLINT_STRICT_THREAD", "1")]);
    let entered = Barrier::new(2);
    let checked = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            let _guard = t.guard(Scope::Api);
            entered.wait();
            checked.wait();
        });
        entered.wait();
        let second = t.guard(Scope::Api);
        assert!(second.violation().is_some());
        drop(second);
        checked.wait();
    });

    assert_eq!(t.api_entries(), 0);
    assert_eq!(
        sink.count("ERROR: Multiple threads detected calling OpenCL concurrently."),
        1
    );
}

#[test]
fn test_sequential_calls_are_not_flagged() {
    let (t, sink) = env_tracker(&[("CLINT_STRICT_THREAD", "1")]);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..100 {
                    // Serialize the calls; only overlaps are violations
                    let _lock = SERIAL.lock().unwrap();
                    let _guard = t.guard(Scope::Api);
                }
            });
        }
    });
    assert!(sink.is_empty());
}

static SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[test]
fn test_kernel_argument_checks_are_per_kernel() {
    let (t, sink) = env_tracker(&[("CLINT_CHECK_THREAD", "1")]);
    t.check_output::<Kernel>(Handle(0x70), Origin::None);
    t.check_output::<Kernel>(Handle(0x71), Origin::None);

    let _a = t.guard(Scope::Kernel(Handle(0x70)));
    let b = t.guard(Scope::Kernel(Handle(0x71)));
    assert!(b.violation().is_none());
    assert!(sink.is_empty());
}

#[test]
fn test_concurrent_create_release_keeps_registry_consistent() {
    let (t, sink) = env_tracker(&[("CLINT_TRACK", "1")]);
    thread::scope(|s| {
        for worker in 0..4usize {
            let t = &t;
            s.spawn(move || {
                for i in 0..200usize {
                    let h = Handle(0x10_0000 + worker * 0x1000 + i);
                    t.check_output::<Event>(h, Origin::None);
                    t.retain::<Event>(h).unwrap();
                    t.release::<Event>(h).unwrap();
                    if i % 2 == 0 {
                        t.release::<Event>(h).unwrap();
                    }
                }
            });
        }
    });
    let events = t.registry::<Event>();
    assert_eq!(events.len(), 4 * 100);
    assert!(events.check_invariants().is_ok());
    assert!(sink.is_empty());
}

// ============================================================================
// Mapping
// ============================================================================

#[test]
fn test_shadow_copy_writes_back_on_last_unmap() {
    let (t, _) = env_tracker(&[("CLINT_CHECK_MAPPING", "malloc")]);
    let mut buf = DeviceBuffer::create(&t, 0x8000, CTX, MemFlags::READ_WRITE, 64);
    let real = buf.bytes.as_mut_ptr();

    let mapped = t.retain_map(buf.handle, MapFlags::READ | MapFlags::WRITE, real, 64);
    assert_ne!(mapped, real);
    // Nested map of the second half resolves inside the shadow
    let nested = t.retain_map(buf.handle, MapFlags::READ, real.wrapping_add(32), 32);
    assert_eq!(nested, mapped.wrapping_add(32));

    unsafe {
        assert_eq!(*mapped.add(5), 5);
        *mapped.add(5) = 0xEE;
    }
    t.release_map(buf.handle);
    assert_eq!(buf.bytes[5], 5, "nested unmap must not copy back");
    t.release_map(buf.handle);
    assert_eq!(buf.bytes[5], 0xEE);

    let state = t.lookup::<Mem>(buf.handle).unwrap();
    assert_eq!(state.extra().map_count(), 0);
    assert!(!state.extra().is_shadowed());
}

#[test]
fn test_read_only_map_discards_writes() {
    let (t, _) = env_tracker(&[("CLINT_CHECK_MAPPING", "malloc")]);
    let mut buf = DeviceBuffer::create(&t, 0x8100, CTX, MemFlags::READ_WRITE, 8);
    let real = buf.bytes.as_mut_ptr();

    let mapped = t.retain_map(buf.handle, MapFlags::READ, real, 8);
    unsafe { *mapped = 0xAA };
    t.release_map(buf.handle);
    assert_eq!(buf.bytes[0], 0);
}

#[test]
fn test_host_pointer_buffers_are_not_shadowed() {
    let (t, _) = env_tracker(&[("CLINT_CHECK_MAPPING", "protect")]);
    let mut buf = DeviceBuffer::create(
        &t,
        0x8200,
        CTX,
        MemFlags::READ_WRITE | MemFlags::USE_HOST_PTR,
        8,
    );
    let real = buf.bytes.as_mut_ptr();
    assert_eq!(t.retain_map(buf.handle, MapFlags::WRITE, real, 8), real);
    t.release_map(buf.handle);
}

#[test]
fn test_guarded_shadow_copies_back() {
    // Any value other than the named modes selects the after-guard layout
    let (t, _) = env_tracker(&[("CLINT_CHECK_MAPPING", "1")]);
    let mut buf = DeviceBuffer::create(&t, 0x8300, CTX, MemFlags::READ_WRITE, 100);
    let real = buf.bytes.as_mut_ptr();

    let mapped = t.retain_map(buf.handle, MapFlags::READ | MapFlags::WRITE, real, 100);
    assert_ne!(mapped, real);
    unsafe { *mapped.add(99) = 0x42 };
    t.release_map(buf.handle);
    assert_eq!(buf.bytes[99], 0x42);
}

#[test]
fn test_mapping_disabled_passes_pointer_through() {
    let (t, sink) = env_tracker(&[("CLINT_TRACK", "1")]);
    let mut buf = DeviceBuffer::create(&t, 0x8400, CTX, MemFlags::READ_WRITE, 8);
    let real = buf.bytes.as_mut_ptr();
    assert_eq!(t.retain_map(buf.handle, MapFlags::WRITE, real, 8), real);
    assert_eq!(t.lookup::<Mem>(buf.handle).unwrap().extra().map_count(), 1);
    t.release_map(buf.handle);
    // An extra unmap is ignored
    t.release_map(buf.handle);
    assert!(sink.is_empty());
}

#[test]
fn test_map_of_unknown_buffer_is_reported() {
    let (t, sink) = env_tracker(&[("CLINT_CHECK_MAPPING", "1")]);
    let mut bytes = [0u8; 4];
    let real = bytes.as_mut_ptr();
    assert_eq!(t.retain_map(Handle(0x8999), MapFlags::READ, real, 4), real);
    assert!(sink.contains("ERROR: Unknown cl_mem 0x8999"));
}

// ============================================================================
// Leaks
// ============================================================================

#[test]
fn test_leak_report_lists_live_objects() {
    let (t, sink) = env_tracker(&[("CLINT_LEAKS", "1"), ("CLINT_TRACK", "1")]);
    t.check_output::<Context>(CTX, Origin::None);
    t.check_output::<Program>(Handle(0x3000), Origin::Context(CTX));
    t.check_output::<Kernel>(Handle(0x4000), Origin::Program(Handle(0x3000)));
    t.check_output::<Event>(Handle(0x5000), Origin::Context(CTX));
    t.release::<Event>(Handle(0x5000)).unwrap();

    t.shutdown();
    assert_eq!(
        sink.lines(),
        vec![
            "Possible leaked OpenCL objects:",
            "Possibly leaked cl_context: 0x1000",
            "Possibly leaked cl_program: 0x3000",
            "Possibly leaked cl_kernel: 0x4000",
        ]
    );
}

#[test]
fn test_zombies_are_not_leaks() {
    let (t, _) = env_tracker(&[("CLINT_TRACK", "1"), ("CLINT_ZOMBIES", "1")]);
    t.check_output::<Program>(Handle(0x3000), Origin::Context(CTX));
    t.release::<Program>(Handle(0x3000)).unwrap();
    assert!(t.leaks(None).is_empty());
    assert_eq!(t.registry::<Program>().len(), 1);
}

#[test]
fn test_leak_report_includes_creation_stack() {
    let (t, sink) = env_tracker(&[("CLINT_TRACK", "1"), ("CLINT_STACK_LOGGING", "1")]);
    t.check_output::<Program>(Handle(0x3000), Origin::None);
    t.log_leaks_all();
    let lines = sink.lines();
    assert_eq!(lines[1], "Possibly leaked cl_program: 0x3000");
    assert_eq!(lines[2], "Created at:");
    assert_eq!(lines.len(), 4);
}

// ============================================================================
// Policy
// ============================================================================

#[test]
fn test_nothing_enabled_is_inert() {
    let (t, sink) = env_tracker(&[]);
    t.check_output::<Context>(CTX, Origin::None);
    assert!(t.registry::<Context>().is_empty());
    assert!(t.release::<Context>(CTX).is_ok());
    let _g = t.guard(Scope::Api);
    assert!(t.guard(Scope::Api).violation().is_none());
    assert!(sink.is_empty());
}

#[test]
fn test_check_all_turns_on_thread_and_mapping_checks() {
    let (t, _) = env_tracker(&[("CLINT_CHECK_ALL", "1")]);
    let policy = t.policy();
    assert!(policy.is_tracking());
    assert!(policy.checks_threads());
    assert_eq!(policy.mapping(), MappingMode::ShadowCopy);
}

#[test]
fn test_banner_is_logged_at_startup() {
    let sink = Arc::new(MemorySink::new());
    let _t = Tracker::new(Policy::check_all(), sink.clone());
    assert_eq!(sink.lines()[0], "CLINT_ENABLED enabled.");
    assert!(sink.contains("CLINT_CHECK_ALL enabled: full OpenCL checking."));
}
