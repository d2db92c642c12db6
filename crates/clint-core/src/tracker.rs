//! The process-wide tracker
//!
//! [`Tracker`] owns one [`Registry`] per resource kind together with the
//! policy, the diagnostic sink, the shadow manager and the strict-mode API
//! entry counter. The intercept layer builds one at load time and passes it
//! to every operation.
//!
//! # Dispatch contract
//!
//! ```text
//! check_input(..)      before using an input handle
//! <driver call>
//! check_output(..)     after the driver produced a handle
//! retain / release     around reference-count calls
//! enter / exit         around concurrency-sensitive calls
//! retain_map / release_map  around map and unmap calls
//! ```
//!
//! Violations are reported through the sink before they are returned. With
//! `abort_on_error` the process aborts right after the report. With tracking
//! off every operation is a no-op that logs nothing and hands pointers back
//! unchanged.

use std::sync::Arc;

use clint_unsafe_primitives::AtomicCounter;

use crate::error::{PolicyError, UsageViolation};
use crate::log::{sink_for, DiagnosticSink};
use crate::monitor::{self, Scope};
use crate::policy::Policy;
use crate::registry::{Insertion, ObjectKind, Registry, Released, TrackingRecord};
use crate::shadow::{MapOutcome, MemState, ShadowManager, UnmapOutcome};
use crate::stack;
use crate::types::{image_extent, Handle, ImageFormat, KindId, MapFlags, MemFlags, Origin, Sharing};

// ============================================================================
// Resource kinds
// ============================================================================

/// `cl_context`
pub struct Context;
/// `cl_command_queue`
pub struct CommandQueue;
/// `cl_mem`: buffers, sub-buffers and images
pub struct Mem;
/// `cl_program`
pub struct Program;
/// `cl_kernel`
pub struct Kernel;
/// `cl_event`
pub struct Event;
/// `cl_sampler`
pub struct Sampler;
/// `cl_device_id`
pub struct Device;

/// Kernel-specific record fields.
#[derive(Debug, Default)]
pub struct KernelState {
    /// Threads currently setting arguments
    modifiers: AtomicCounter,
}

impl KernelState {
    pub fn modifiers(&self) -> i32 {
        self.modifiers.get()
    }
}

/// Device-specific record fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceState {
    /// Created by partitioning; root devices are static
    pub sub_device: bool,
}

impl ObjectKind for Context {
    type Extra = ();
    const KIND: KindId = KindId::Context;
}

impl ObjectKind for CommandQueue {
    type Extra = ();
    const KIND: KindId = KindId::CommandQueue;
}

impl ObjectKind for Mem {
    type Extra = MemState;
    const KIND: KindId = KindId::Mem;
}

impl ObjectKind for Program {
    type Extra = ();
    const KIND: KindId = KindId::Program;
}

impl ObjectKind for Kernel {
    type Extra = KernelState;
    const KIND: KindId = KindId::Kernel;
}

impl ObjectKind for Event {
    type Extra = ();
    const KIND: KindId = KindId::Event;
}

impl ObjectKind for Sampler {
    type Extra = ();
    const KIND: KindId = KindId::Sampler;
}

impl ObjectKind for Device {
    type Extra = DeviceState;
    const KIND: KindId = KindId::Device;

    fn is_dynamic(extra: &DeviceState) -> bool {
        extra.sub_device
    }
}

/// A kind the tracker keeps a registry for.
pub trait Tracked: ObjectKind + Sized {
    fn registry(tracker: &Tracker) -> &Registry<Self>;
}

macro_rules! tracked {
    ($($kind:ty => $field:ident),* $(,)?) => {
        $(
            impl Tracked for $kind {
                fn registry(tracker: &Tracker) -> &Registry<Self> {
                    &tracker.$field
                }
            }
        )*
    };
}

tracked! {
    Context => contexts,
    CommandQueue => queues,
    Mem => mems,
    Program => programs,
    Kernel => kernels,
    Event => events,
    Sampler => samplers,
    Device => devices,
}

/// One entry of a leak report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Leak {
    pub kind: KindId,
    pub handle: Handle,
    pub ref_count: i32,
    pub context: Option<Handle>,
    pub stack: Option<String>,
}

impl Leak {
    fn from_record<E>(kind: KindId, record: &TrackingRecord<E>) -> Self {
        Self {
            kind,
            handle: record.key(),
            ref_count: record.ref_count(),
            context: record.context(),
            stack: record.stack().map(str::to_string),
        }
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Process-wide tracking state.
pub struct Tracker {
    policy: Policy,
    sink: Arc<dyn DiagnosticSink>,
    shadows: ShadowManager,
    api_entries: AtomicCounter,
    contexts: Registry<Context>,
    queues: Registry<CommandQueue>,
    mems: Registry<Mem>,
    programs: Registry<Program>,
    kernels: Registry<Kernel>,
    events: Registry<Event>,
    samplers: Registry<Sampler>,
    devices: Registry<Device>,
}

impl Tracker {
    /// Build a tracker. The policy is normalized first; when it is enabled
    /// the active settings are logged once.
    pub fn new(policy: Policy, sink: Arc<dyn DiagnosticSink>) -> Self {
        let policy = policy.normalized();
        let zombies = policy.keeps_zombies();
        let tracker = Self {
            shadows: ShadowManager::new(policy.mapping()),
            api_entries: AtomicCounter::new(0),
            contexts: Registry::new(zombies),
            queues: Registry::new(zombies),
            mems: Registry::new(zombies),
            programs: Registry::new(zombies),
            kernels: Registry::new(zombies),
            events: Registry::new(zombies),
            samplers: Registry::new(zombies),
            devices: Registry::new(zombies),
            policy,
            sink,
        };
        for line in tracker.policy.describe() {
            tracker.sink.log_line(line);
        }
        tracker
    }

    /// Build a tracker from `CLINT_*` variables, logging where `CLINT_LOG_FILE` says.
    pub fn from_env() -> Result<Self, PolicyError> {
        let policy = Policy::from_env()?;
        let sink = sink_for(policy.log_file.as_deref())?;
        Ok(Self::new(policy, sink))
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn sink(&self) -> &Arc<dyn DiagnosticSink> {
        &self.sink
    }

    /// Registry of kind `K`.
    pub fn registry<K: Tracked>(&self) -> &Registry<K> {
        K::registry(self)
    }

    /// Record for `handle`, without validation or reporting.
    pub fn lookup<K: Tracked>(&self, handle: Handle) -> Option<Arc<TrackingRecord<K::Extra>>> {
        K::registry(self).find(handle)
    }

    // ------------------------------------------------------------------
    // Handle validation
    // ------------------------------------------------------------------

    /// Validate an input handle.
    pub fn check_input<K: Tracked>(&self, handle: Handle) -> Result<(), UsageViolation> {
        if !self.policy.is_tracking() {
            return Ok(());
        }
        K::registry(self)
            .check_input(handle)
            .map_err(|v| self.report(v))
    }

    /// Validate each handle of an input list; every violation is reported.
    pub fn check_inputs<K: Tracked>(&self, handles: &[Handle]) -> Result<(), UsageViolation> {
        if !self.policy.is_tracking() {
            return Ok(());
        }
        K::registry(self).check_inputs(handles, |v| self.report_ref(v))
    }

    /// Record a handle produced from `origin`.
    pub fn check_output<K>(&self, handle: Handle, origin: Origin)
    where
        K: Tracked,
        K::Extra: Default,
    {
        self.check_output_with::<K>(handle, origin, K::Extra::default());
    }

    /// Record each handle of an output list.
    pub fn check_outputs<K>(&self, handles: &[Handle], origin: Origin)
    where
        K: Tracked,
        K::Extra: Default,
    {
        for handle in handles {
            self.check_output::<K>(*handle, origin);
        }
    }

    /// Record a handle with explicit kind-specific fields.
    pub fn check_output_with<K: Tracked>(&self, handle: Handle, origin: Origin, extra: K::Extra) {
        if !self.policy.is_tracking() {
            return;
        }
        let context = self.derive_context(origin);
        let stack = stack::capture_if(self.policy.logs_stacks());
        match K::registry(self).check_output(handle, context, stack, extra) {
            Insertion::Replaced => {
                tracing::debug!(kind = K::KIND.name(), %handle, "live record replaced by new handle");
            }
            Insertion::Existing => {
                tracing::trace!(kind = K::KIND.name(), %handle, "static record already known");
            }
            Insertion::Inserted => {}
        }
    }

    /// Record a new memory object (buffer, sub-buffer or image).
    pub fn check_output_mem(
        &self,
        handle: Handle,
        origin: Origin,
        flags: MemFlags,
        sharing: Sharing,
        format: Option<&ImageFormat>,
    ) {
        self.check_output_with::<Mem>(handle, origin, MemState::new(flags, sharing, format));
    }

    /// Record devices; only sub-devices are reference counted.
    pub fn check_output_devices(&self, handles: &[Handle], origin: Origin, sub_device: bool) {
        for handle in handles {
            self.check_output_with::<Device>(*handle, origin, DeviceState { sub_device });
        }
    }

    /// Add a reference.
    pub fn retain<K: Tracked>(&self, handle: Handle) -> Result<(), UsageViolation> {
        if !self.policy.is_tracking() {
            return Ok(());
        }
        K::registry(self)
            .retain(handle)
            .map(|_| ())
            .map_err(|v| self.report(v))
    }

    /// Drop a reference.
    pub fn release<K: Tracked>(&self, handle: Handle) -> Result<(), UsageViolation> {
        if !self.policy.is_tracking() {
            return Ok(());
        }
        match K::registry(self).release(handle) {
            Ok(Released::Zombie) => {
                tracing::trace!(kind = K::KIND.name(), %handle, "record kept as zombie");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(v) => Err(self.report(v)),
        }
    }

    /// Remove a zombie occupying `handle`.
    pub fn purge<K: Tracked>(&self, handle: Handle) -> bool {
        self.policy.is_tracking() && K::registry(self).purge(handle)
    }

    /// Owning context of a handle produced from `origin`.
    fn derive_context(&self, origin: Origin) -> Option<Handle> {
        match origin {
            Origin::None => None,
            Origin::Context(h) => Some(h),
            Origin::CommandQueue(h) => self.queues.find(h)?.context(),
            Origin::Mem(h) => self.mems.find(h)?.context(),
            Origin::Program(h) => self.programs.find(h)?.context(),
            Origin::Kernel(h) => self.kernels.find(h)?.context(),
            Origin::Event(h) => self.events.find(h)?.context(),
            Origin::Sampler(h) => self.samplers.find(h)?.context(),
            Origin::Device(h) => self.devices.find(h)?.context(),
        }
    }

    // ------------------------------------------------------------------
    // Thread checks
    // ------------------------------------------------------------------

    /// Enter a concurrency-checked scope. Pair with [`Tracker::exit`].
    ///
    /// `Scope::Api` is checked in strict-thread mode, `Scope::Kernel` when
    /// thread checking is on.
    pub fn enter(&self, scope: Scope) -> Result<(), UsageViolation> {
        match scope {
            Scope::Api if self.policy.strict_threads() => monitor::enter(&self.api_entries, scope)
                .map(|_| ())
                .map_err(|v| self.report(v)),
            Scope::Kernel(h) if self.policy.checks_threads() => {
                let record = self.kernels.lookup(h).map_err(|v| self.report(v))?;
                monitor::enter(&record.extra().modifiers, scope)
                    .map(|_| ())
                    .map_err(|v| self.report(v))
            }
            _ => Ok(()),
        }
    }

    /// Leave a scope entered with [`Tracker::enter`].
    pub fn exit(&self, scope: Scope) {
        match scope {
            Scope::Api if self.policy.strict_threads() => {
                monitor::exit(&self.api_entries);
            }
            Scope::Kernel(h) if self.policy.checks_threads() => {
                if let Some(record) = self.kernels.find(h) {
                    monitor::exit(&record.extra().modifiers);
                }
            }
            _ => {}
        }
    }

    /// Enter `scope` and exit it when the guard drops.
    pub fn guard(&self, scope: Scope) -> ScopeGuard<'_> {
        let result = self.enter(scope);
        ScopeGuard {
            tracker: self,
            scope,
            violation: result.err(),
        }
    }

    /// Current strict-mode API entry count.
    pub fn api_entries(&self) -> i32 {
        self.api_entries.get()
    }

    // ------------------------------------------------------------------
    // Mapping
    // ------------------------------------------------------------------

    /// Record the image format of a memory object.
    pub fn set_image_format(&self, mem: Handle, format: &ImageFormat) {
        if !self.policy.is_tracking() {
            return;
        }
        if let Ok(record) = self.mems.lookup(mem).map_err(|v| self.report(v)) {
            record.extra().set_image_format(format);
        }
    }

    /// Map `size` bytes of a buffer; returns the pointer for the application.
    ///
    /// `ptr` must stay valid for `size` bytes until the matching
    /// [`Tracker::release_map`].
    pub fn retain_map(&self, mem: Handle, flags: MapFlags, ptr: *mut u8, size: usize) -> *mut u8 {
        if !self.policy.is_tracking() {
            return ptr;
        }
        let record = match self.mems.lookup(mem) {
            Ok(record) => record,
            Err(v) => {
                self.report(v);
                return ptr;
            }
        };
        let outcome = self.shadows.map(record.extra(), flags, ptr, size);
        if let MapOutcome::Fallback { error, .. } = &outcome {
            self.sink.log_line(&format!(
                "WARNING: Checked mapping of cl_mem {} unavailable ({}); using the unchecked pointer.",
                mem, error
            ));
        }
        outcome.ptr()
    }

    /// Map an image region.
    ///
    /// The extent is `(region[2]-1) * slice_pitch + (region[1]-1) * row_pitch
    /// + region[0] * pixel_size`, the slice term only for 3D images.
    pub fn retain_map_image(
        &self,
        mem: Handle,
        flags: MapFlags,
        ptr: *mut u8,
        region: [usize; 3],
        row_pitch: usize,
        slice_pitch: Option<usize>,
    ) -> *mut u8 {
        if !self.policy.is_tracking() {
            return ptr;
        }
        let pixel_size = match self.mems.find(mem) {
            Some(record) => record.extra().pixel_size(),
            None => {
                self.report(UsageViolation::UnknownHandle {
                    kind: KindId::Mem,
                    handle: mem,
                });
                return ptr;
            }
        };
        let size = image_extent(region, row_pitch, slice_pitch, pixel_size);
        self.retain_map(mem, flags, ptr, size)
    }

    /// Unmap; the last unmap copies writes back and drops the shadow.
    pub fn release_map(&self, mem: Handle) {
        if !self.policy.is_tracking() {
            return;
        }
        let record = match self.mems.lookup(mem) {
            Ok(record) => record,
            Err(v) => {
                self.report(v);
                return;
            }
        };
        match self.shadows.unmap(record.extra()) {
            UnmapOutcome::NotMapped => {
                tracing::debug!(%mem, "unmap without a matching map");
            }
            UnmapOutcome::Unmapped { copied_back } => {
                tracing::trace!(%mem, copied_back, "mapping released");
            }
            UnmapOutcome::StillMapped(_) => {}
        }
    }

    // ------------------------------------------------------------------
    // Leaks
    // ------------------------------------------------------------------

    /// Objects still holding references, optionally for one context.
    ///
    /// Contexts themselves are only listed when no context is given.
    pub fn leaks(&self, context: Option<Handle>) -> Vec<Leak> {
        let mut leaks = Vec::new();
        if context.is_none() {
            collect_leaks(&self.contexts, None, &mut leaks);
        }
        collect_leaks(&self.queues, context, &mut leaks);
        collect_leaks(&self.mems, context, &mut leaks);
        collect_leaks(&self.programs, context, &mut leaks);
        collect_leaks(&self.kernels, context, &mut leaks);
        collect_leaks(&self.events, context, &mut leaks);
        collect_leaks(&self.samplers, context, &mut leaks);
        collect_leaks(&self.devices, context, &mut leaks);
        leaks
    }

    /// Log objects that may have leaked, optionally for one context.
    pub fn log_leaks(&self, context: Option<Handle>) {
        if !self.policy.is_tracking() {
            return;
        }
        match context {
            None => self.sink.log_line("Possible leaked OpenCL objects:"),
            Some(ctx) => self.sink.log_line(&format!(
                "Possible leaked OpenCL objects for cl_context {}:",
                ctx
            )),
        }
        for leak in self.leaks(context) {
            self.sink
                .log_line(&format!("Possibly leaked cl_{}: {}", leak.kind, leak.handle));
            if let Some(stack) = &leak.stack {
                self.sink.log_line("Created at:");
                self.sink.log_line(stack);
            }
        }
    }

    /// Log every object that may have leaked.
    pub fn log_leaks_all(&self) {
        self.log_leaks(None);
    }

    /// Tear down, reporting leaks when leak reporting is on.
    pub fn shutdown(self) {
        if self.policy.reports_leaks() {
            self.log_leaks_all();
        }
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    fn report(&self, violation: UsageViolation) -> UsageViolation {
        self.report_ref(&violation);
        violation
    }

    fn report_ref(&self, violation: &UsageViolation) {
        self.sink.log_line(&format!("ERROR: {}", violation));
        if let UsageViolation::AlreadyFreed {
            stack: Some(stack), ..
        } = violation
        {
            self.sink.log_line("Allocated at:");
            self.sink.log_line(stack);
        }
        if self.policy.aborts_on_error() {
            std::process::abort();
        }
    }
}

fn collect_leaks<K: ObjectKind>(registry: &Registry<K>, context: Option<Handle>, out: &mut Vec<Leak>) {
    out.extend(
        registry
            .iterate_leaks(context)
            .iter()
            .filter(|r| r.ref_count() > 0)
            .map(|r| Leak::from_record(K::KIND, r)),
    );
}

impl core::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tracker")
            .field("policy", &self.policy)
            .field("api_entries", &self.api_entries)
            .finish_non_exhaustive()
    }
}

/// Exits its scope on drop. Returned by [`Tracker::guard`].
pub struct ScopeGuard<'a> {
    tracker: &'a Tracker,
    scope: Scope,
    violation: Option<UsageViolation>,
}

impl ScopeGuard<'_> {
    /// The violation reported on entry, if any.
    pub fn violation(&self) -> Option<&UsageViolation> {
        self.violation.as_ref()
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        // A failed kernel lookup never incremented anything
        if matches!(
            self.violation,
            Some(UsageViolation::UnknownHandle { .. } | UsageViolation::AlreadyFreed { .. })
        ) {
            return;
        }
        self.tracker.exit(self.scope);
    }
}
