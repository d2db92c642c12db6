//! CLint Core - OpenCL Usage Checking Behind the Intercept Layer
//!
//! This crate holds everything the CLint interception layer does between
//! forwarding a call to the real driver and returning to the application:
//! handle bookkeeping, double-free and leak detection, thread-misuse checks
//! and checked buffer mapping.
//!
//! # Design Principles
//!
//! 1. **No driver dependency**: handles are opaque addresses, the intercept layer does the FFI
//! 2. **Best-effort**: a failing check is reported, never surfaced as an OpenCL error code
//! 3. **Short locks**: each registry is guarded by a spinlock held only for tree operations
//! 4. **One unsafe module**: only `shadow` touches host memory, through `clint-unsafe-primitives`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    intercept layer                          │
//! │            (exported cl* entry points, FFI)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ calls
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Tracker                              │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │  Registry<K>  │    │ ShadowManager │                   │
//! │   │  one per kind │    │ map / unmap   │                   │
//! │   │  RbTree +     │    │ heap or paged │                   │
//! │   │  SpinLock     │    │ shadows       │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │    Policy     │    │ DiagnosticSink│                   │
//! │   │  CLINT_* env  │    │ tracing/file/ │                   │
//! │   │  config file  │    │ memory        │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ uses
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 clint-unsafe-primitives                     │
//! │      SpinLock, AtomicCounter, GuardedRegion, pages          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Handles, resource kinds, memory and map flags, image formats
//! - `tree` - Arena red-black tree keyed by handle
//! - `invariants` - Red-black structure assertions
//! - `registry` - Per-kind tracking records and reference counting
//! - `monitor` - Concurrent-entry detection
//! - `shadow` - Mapped-buffer shadow copies
//! - `policy` - `CLINT_*` settings
//! - `log` - Diagnostic sinks
//! - `stack` - Creation-site stack capture
//! - `tracker` - The process-wide state tying it all together

#![deny(unsafe_code)]

pub mod error;
pub mod invariants;
pub mod log;
pub mod monitor;
pub mod policy;
pub mod registry;
pub mod shadow;
pub mod stack;
pub mod tracker;
pub mod tree;
pub mod types;

// Re-export all public types for convenient access
pub use error::{PolicyError, ShadowError, TreeViolation, UsageViolation};
pub use invariants::check_red_black;
pub use log::{sink_for, DiagnosticSink, MemorySink, SinkTarget, TracingSink, WriterSink};
pub use monitor::{Scope, ENTRY_BOUND};
pub use policy::{MappingMode, Policy};
pub use registry::{Insertion, ObjectKind, Registry, Released, TrackingRecord};
pub use shadow::{MapOutcome, MemState, ShadowManager, UnmapOutcome};
pub use tracker::{
    CommandQueue, Context, Device, DeviceState, Event, Kernel, KernelState, Leak, Mem, Program,
    Sampler, ScopeGuard, Tracked, Tracker,
};
pub use tree::{NodeId, RbTree};
pub use types::{image_extent, Handle, ImageFormat, KindId, MapFlags, MemFlags, Origin, Sharing};
