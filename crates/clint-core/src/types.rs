//! Core tracker types
//!
//! Handles, resource kinds, the OpenCL flag sets the tracker inspects and
//! the image-format table used to size image mappings. All types here are
//! plain data.

use core::fmt;

use bitflags::bitflags;

/// Opaque driver handle (`cl_mem`, `cl_kernel`, ...).
///
/// Only ever compared and ordered, never dereferenced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub usize);

impl Handle {
    /// The null handle.
    pub const NULL: Handle = Handle(0);

    /// Build a handle from a driver pointer.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Handle(ptr as usize)
    }

    /// Whether this is the null handle.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Resource kinds with their own registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KindId {
    Context,
    CommandQueue,
    Mem,
    Program,
    Kernel,
    Event,
    Sampler,
    Device,
}

impl KindId {
    /// Every kind, in leak-report order.
    pub const ALL: [KindId; 8] = [
        KindId::Context,
        KindId::CommandQueue,
        KindId::Mem,
        KindId::Program,
        KindId::Kernel,
        KindId::Event,
        KindId::Sampler,
        KindId::Device,
    ];

    /// Suffix of the OpenCL type name (`cl_<name>`).
    pub fn name(&self) -> &'static str {
        match self {
            KindId::Context => "context",
            KindId::CommandQueue => "command_queue",
            KindId::Mem => "mem",
            KindId::Program => "program",
            KindId::Kernel => "kernel",
            KindId::Event => "event",
            KindId::Sampler => "sampler",
            KindId::Device => "device_id",
        }
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The object a new handle was produced from.
///
/// Decides the owning context of the new record: a context origin is the
/// context itself, any other origin passes on its own record's context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// No originating object (e.g. a new context, platform devices)
    None,
    Context(Handle),
    CommandQueue(Handle),
    /// Buffers, sub-buffers and images
    Mem(Handle),
    Program(Handle),
    Kernel(Handle),
    Event(Handle),
    Sampler(Handle),
    Device(Handle),
}

bitflags! {
    /// `cl_mem_flags` bits the tracker cares about.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemFlags: u64 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        /// The application owns the host memory; the mapped pointer must stay its own.
        const USE_HOST_PTR = 1 << 3;
        const ALLOC_HOST_PTR = 1 << 4;
        const COPY_HOST_PTR = 1 << 5;
    }
}

bitflags! {
    /// `cl_map_flags`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MapFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Prior contents are discarded; nothing is copied into the mapping.
        const WRITE_INVALIDATE_REGION = 1 << 2;
    }
}

impl MapFlags {
    /// Whether the application may write through the mapping.
    pub fn allows_write(&self) -> bool {
        self.intersects(MapFlags::WRITE | MapFlags::WRITE_INVALIDATE_REGION)
    }

    /// Whether the existing contents must be visible in the mapping.
    pub fn preserves_contents(&self) -> bool {
        !self.contains(MapFlags::WRITE_INVALIDATE_REGION)
    }
}

/// Interop sharing mode of a memory object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Sharing {
    #[default]
    None,
    Gl,
    D3d9,
    D3d10,
    D3d11,
}

/// OpenCL image constants used by [`ImageFormat::pixel_size`].
pub mod cl {
    pub const CL_R: u32 = 0x10B0;
    pub const CL_A: u32 = 0x10B1;
    pub const CL_RG: u32 = 0x10B2;
    pub const CL_RA: u32 = 0x10B3;
    pub const CL_RGB: u32 = 0x10B4;
    pub const CL_RGBA: u32 = 0x10B5;
    pub const CL_BGRA: u32 = 0x10B6;
    pub const CL_ARGB: u32 = 0x10B7;
    pub const CL_INTENSITY: u32 = 0x10B8;
    pub const CL_LUMINANCE: u32 = 0x10B9;
    pub const CL_RX: u32 = 0x10BA;
    pub const CL_RGX: u32 = 0x10BB;
    pub const CL_RGBX: u32 = 0x10BC;

    pub const CL_SNORM_INT8: u32 = 0x10D0;
    pub const CL_SNORM_INT16: u32 = 0x10D1;
    pub const CL_UNORM_INT8: u32 = 0x10D2;
    pub const CL_UNORM_INT16: u32 = 0x10D3;
    pub const CL_UNORM_SHORT_565: u32 = 0x10D4;
    pub const CL_UNORM_SHORT_555: u32 = 0x10D5;
    pub const CL_UNORM_INT_101010: u32 = 0x10D6;
    pub const CL_SIGNED_INT8: u32 = 0x10D7;
    pub const CL_SIGNED_INT16: u32 = 0x10D8;
    pub const CL_SIGNED_INT32: u32 = 0x10D9;
    pub const CL_UNSIGNED_INT8: u32 = 0x10DA;
    pub const CL_UNSIGNED_INT16: u32 = 0x10DB;
    pub const CL_UNSIGNED_INT32: u32 = 0x10DC;
    pub const CL_HALF_FLOAT: u32 = 0x10DD;
    pub const CL_FLOAT: u32 = 0x10DE;
}

/// `cl_image_format`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    pub channel_order: u32,
    pub channel_data_type: u32,
}

impl ImageFormat {
    pub fn new(channel_order: u32, channel_data_type: u32) -> Self {
        Self {
            channel_order,
            channel_data_type,
        }
    }

    /// Bytes per pixel, or 0 for formats the table does not know.
    pub fn pixel_size(&self) -> usize {
        use cl::*;

        let channel = channel_size(self.channel_data_type);
        match self.channel_order {
            CL_R | CL_A | CL_INTENSITY | CL_LUMINANCE => channel,
            CL_RG | CL_RA | CL_RX => 2 * channel,
            CL_RGX => 3 * channel,
            // Only the packed formats are legal for RGB orders
            CL_RGB | CL_RGBX => match self.channel_data_type {
                CL_UNORM_SHORT_565 | CL_UNORM_SHORT_555 => 2,
                CL_UNORM_INT_101010 => 4,
                _ => 0,
            },
            CL_RGBA | CL_ARGB | CL_BGRA => 4 * channel,
            _ => 0,
        }
    }
}

fn channel_size(data_type: u32) -> usize {
    use cl::*;

    match data_type {
        CL_SNORM_INT8 | CL_UNORM_INT8 | CL_SIGNED_INT8 | CL_UNSIGNED_INT8 => 1,
        CL_SNORM_INT16 | CL_UNORM_INT16 | CL_SIGNED_INT16 | CL_UNSIGNED_INT16 => 2,
        CL_SIGNED_INT32 | CL_UNSIGNED_INT32 => 4,
        CL_HALF_FLOAT => 2,
        CL_FLOAT => 4,
        _ => 0,
    }
}

/// Host-visible byte extent of an image mapping.
///
/// `(region[2] - 1) * slice_pitch` (3D only) `+ (region[1] - 1) * row_pitch
/// + region[0] * pixel_size`. Zero-sized region dimensions are treated as 1.
pub fn image_extent(
    region: [usize; 3],
    row_pitch: usize,
    slice_pitch: Option<usize>,
    pixel_size: usize,
) -> usize {
    let mut size = 0usize;
    if let Some(slice) = slice_pitch {
        size = size.saturating_add(region[2].saturating_sub(1).saturating_mul(slice));
    }
    size = size.saturating_add(region[1].saturating_sub(1).saturating_mul(row_pitch));
    size.saturating_add(region[0].saturating_mul(pixel_size))
}


#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: The image extent never panics and covers the last row
    #[kani::proof]
    fn image_extent_is_total() {
        let region: [usize; 3] = [kani::any(), kani::any(), kani::any()];
        let row_pitch: usize = kani::any();
        let pixel_size: usize = kani::any();
        let size = image_extent(region, row_pitch, None, pixel_size);
        kani::assert(
            size >= region[0].saturating_mul(pixel_size),
            "Extent covers at least one row of pixels",
        );
    }
}
