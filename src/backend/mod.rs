//! GPU backend abstraction layer.
//!
//! The resolve pipeline is backend-agnostic: it sequences passes, hazards
//! and timestamps through the [`ResolveBackend`] trait and never touches a
//! native API. Three implementations exist:
//!
//! - `dummy` (always compiled): records every call without touching a GPU,
//!   used for testing and development
//! - `wgpu-backend`: cross-platform via wgpu (Vulkan, Metal, DX12)
//! - `vulkan-backend`: native Vulkan via ash

pub mod dummy;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

#[cfg(feature = "vulkan-backend")]
use ash::vk;
#[cfg(feature = "wgpu-backend")]
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pipeline::CreateViewFlags;
use crate::shaders::Kernel;

pub use dummy::{DummyBackend, DummyEvent};

/// Selects the backend a context drives and carries its device objects.
pub enum BackendDescriptor {
    /// Recording backend without GPU requirements.
    Dummy,
    /// wgpu devices are created and owned by the caller.
    #[cfg(feature = "wgpu-backend")]
    Wgpu {
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
    },
    /// Vulkan objects are created and owned by the caller; the instance and
    /// device handles are cloned, not destroyed, by the context.
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
    },
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy => write!(f, "BackendDescriptor::Dummy"),
            #[cfg(feature = "wgpu-backend")]
            Self::Wgpu { .. } => write!(f, "BackendDescriptor::Wgpu"),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { .. } => write!(f, "BackendDescriptor::Vulkan"),
        }
    }
}

/// The caller-provided surfaces a reflection view reads and writes.
///
/// All bindings are required. Depth, motion vectors, normals, roughness and
/// their single-frame history copies are sampled; the output target must be
/// a storage-capable `rgba16float` image.
pub enum ViewBindings {
    /// The dummy backend needs no resources.
    Dummy,
    #[cfg(feature = "wgpu-backend")]
    Wgpu(WgpuViewBindings),
    #[cfg(feature = "vulkan-backend")]
    Vulkan(VulkanViewBindings),
}

impl std::fmt::Debug for ViewBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy => write!(f, "ViewBindings::Dummy"),
            #[cfg(feature = "wgpu-backend")]
            Self::Wgpu(_) => write!(f, "ViewBindings::Wgpu"),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(_) => write!(f, "ViewBindings::Vulkan"),
        }
    }
}

/// Resource bindings for a view resolved through the wgpu backend.
#[cfg(feature = "wgpu-backend")]
#[derive(Clone)]
pub struct WgpuViewBindings {
    /// Rendered scene radiance, sampled on ray hits.
    pub scene: wgpu::TextureView,
    /// Min-reduced depth hierarchy.
    pub depth_hierarchy: wgpu::TextureView,
    /// Per-pixel screen-space motion vectors.
    pub motion_vectors: wgpu::TextureView,
    /// World-space normals, mapped to [0, 1].
    pub normals: wgpu::TextureView,
    /// Squared perceptual roughness.
    pub roughness: wgpu::TextureView,
    /// Last frame's normals.
    pub normals_history: wgpu::TextureView,
    /// Last frame's roughness.
    pub roughness_history: wgpu::TextureView,
    /// Cube map sampled on ray misses.
    pub environment_map: wgpu::TextureView,
    pub environment_sampler: wgpu::Sampler,
    /// Resolved reflections, written as a storage texture.
    pub output: wgpu::TextureView,
}

/// Resource bindings for a view resolved through the Vulkan backend.
///
/// Sampled views are expected in `SHADER_READ_ONLY_OPTIMAL`, the output
/// view in `GENERAL`. `upload_command_buffer` must be in the recording
/// state; initialization commands for the view's internal resources are
/// recorded into it and the caller submits it before the first resolve.
#[cfg(feature = "vulkan-backend")]
#[derive(Clone, Copy)]
pub struct VulkanViewBindings {
    pub scene: vk::ImageView,
    pub depth_hierarchy: vk::ImageView,
    pub motion_vectors: vk::ImageView,
    pub normals: vk::ImageView,
    pub roughness: vk::ImageView,
    pub normals_history: vk::ImageView,
    pub roughness_history: vk::ImageView,
    pub environment_map: vk::ImageView,
    pub environment_sampler: vk::Sampler,
    pub output: vk::ImageView,
    pub upload_command_buffer: vk::CommandBuffer,
}

/// The command stream a resolve is encoded into.
///
/// The library never submits work; the caller owns submission and must keep
/// the fixed pass order of one resolve on a single stream.
pub enum CommandStream<'a> {
    /// No-op stream for the dummy backend.
    Dummy,
    #[cfg(feature = "wgpu-backend")]
    Wgpu(&'a mut wgpu::CommandEncoder),
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vk::CommandBuffer),
    #[doc(hidden)]
    #[cfg(not(feature = "wgpu-backend"))]
    _Lifetime(std::marker::PhantomData<&'a mut ()>),
}

/// One encodable pass of the resolve sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    TileClassification,
    PrepareIndirectArgs,
    Intersect,
    SpatialDenoise,
    TemporalDenoise,
    /// EAW pass writing the final output target.
    EawDenoise,
    /// EAW hop from the temporal result into the intermediate image.
    EawDenoiseToIntermediate,
    /// EAW hop from the intermediate image back into the temporal result.
    EawDenoiseFromIntermediate,
}

impl PassKind {
    /// The kernel this pass runs; the three EAW passes share one kernel and
    /// differ only in their descriptor tables.
    pub(crate) fn kernel(self) -> Kernel {
        match self {
            PassKind::TileClassification => Kernel::TileClassification,
            PassKind::PrepareIndirectArgs => Kernel::PrepareIndirectArgs,
            PassKind::Intersect => Kernel::Intersect,
            PassKind::SpatialDenoise => Kernel::SpatialDenoise,
            PassKind::TemporalDenoise => Kernel::TemporalDenoise,
            PassKind::EawDenoise
            | PassKind::EawDenoiseToIntermediate
            | PassKind::EawDenoiseFromIntermediate => Kernel::EawDenoise,
        }
    }
}

/// How a pass is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Direct { x: u32, y: u32, z: u32 },
    /// Thread group counts read from the intersection argument buffer.
    IndirectIntersect,
    /// Thread group counts read from the denoiser argument buffer.
    IndirectDenoise,
}

/// Ordering points between passes.
///
/// Each value names the writes that must be visible before the next pass
/// runs. The Vulkan backend turns these into pipeline barriers; wgpu tracks
/// the hazards itself and treats them as no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hazard {
    /// Tile/ray lists and counters written by classification, argument
    /// buffers writable.
    ClassificationOutputs,
    /// Indirect argument buffers converted and consumable as dispatch
    /// arguments.
    IndirectArguments,
    /// Intersection radiance and ray lengths written.
    IntersectionOutputs,
    /// Spatial denoiser output written.
    SpatialOutputs,
    /// Temporal denoiser output written.
    TemporalOutputs,
    /// Preceding EAW pass output written.
    EawOutputs,
}

/// Everything a backend needs to build the GPU-side state of one view.
pub struct ViewSetup<'a> {
    /// Registry slot index; stable for the lifetime of the view.
    pub slot: u32,
    pub width: u32,
    pub height: u32,
    pub flags: CreateViewFlags,
    /// Frames in flight, sizing the timestamp query ring.
    pub frames_in_flight: u32,
    pub bindings: &'a ViewBindings,
}

/// The capability set the resolve pipeline requires from a graphics API.
pub trait ResolveBackend {
    fn name(&self) -> &'static str;

    /// Builds the per-view GPU state: intermediate images, compacted list
    /// buffers, indirect argument buffers, both descriptor table sets and,
    /// when requested, timestamp query storage.
    fn create_view(&mut self, setup: &ViewSetup<'_>) -> Result<()>;

    /// Releases everything `create_view` built for the slot. Must tolerate
    /// slots that were never created.
    fn destroy_view(&mut self, slot: u32);

    /// Copies `data` into the scratch buffer at `offset`. The range was
    /// leased from the frame ring, so the GPU no longer reads it.
    fn write_scratch(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Encodes one pass: pipeline, the slot's descriptor table for
    /// `buffer_half`, the constant block at `constants_offset`, then the
    /// dispatch.
    fn encode_pass(
        &mut self,
        stream: &mut CommandStream<'_>,
        slot: u32,
        pass: PassKind,
        buffer_half: u32,
        constants_offset: u64,
        dispatch: DispatchKind,
    ) -> Result<()>;

    /// Records the ordering barrier for the named hazard.
    fn encode_hazard(&mut self, stream: &mut CommandStream<'_>, slot: u32, hazard: Hazard);

    /// Writes one GPU timestamp for the slot's query ring.
    fn write_timestamp(&mut self, stream: &mut CommandStream<'_>, slot: u32, query_index: u32);

    /// Makes the written timestamps of the current frame host-readable.
    fn resolve_timestamps(
        &mut self,
        stream: &mut CommandStream<'_>,
        slot: u32,
        first_query: u32,
        query_count: u32,
    );

    /// Non-blocking readback of previously resolved timestamps. `None`
    /// means the data is not available yet.
    fn read_timestamps(
        &mut self,
        slot: u32,
        first_query: u32,
        query_count: u32,
    ) -> Option<Vec<u64>>;

    fn as_any(&self) -> &dyn std::any::Any;
}

/// Texture/buffer shape of one kernel binding, shared by the backends so
/// their layouts cannot drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindingKind {
    /// Non-filterable 2D float texture, read with `textureLoad`.
    SampledTexture,
    /// Filterable cube map (environment fallback).
    SampledCube,
    FilteringSampler,
    StorageTextureRgba16Write,
    StorageTextureR32Write,
    StorageTextureR32ReadWrite,
    StorageBufferRead,
    StorageBufferReadWrite,
}

/// Binding layout of each kernel, in `@binding` order. Must match the WGSL
/// declarations in `shaders.rs`.
pub(crate) fn kernel_bindings(kernel: Kernel) -> &'static [BindingKind] {
    use BindingKind::*;
    match kernel {
        Kernel::TileClassification => &[
            SampledTexture,             // roughness
            StorageBufferReadWrite,     // tile list
            StorageBufferReadWrite,     // ray list
            StorageBufferReadWrite,     // tile counter
            StorageBufferReadWrite,     // ray counter
            StorageTextureRgba16Write,  // temporal result
            StorageTextureR32Write,     // ray lengths
            StorageTextureR32ReadWrite, // temporal variance
        ],
        Kernel::PrepareIndirectArgs => &[
            StorageBufferReadWrite, // tile counter
            StorageBufferReadWrite, // ray counter
            StorageBufferReadWrite, // intersect args
            StorageBufferReadWrite, // denoiser args
        ],
        Kernel::Intersect => &[
            SampledTexture, // scene
            SampledTexture, // depth hierarchy
            SampledTexture, // normals
            SampledTexture, // roughness
            SampledCube,    // environment map
            FilteringSampler,
            StorageBufferRead,         // sobol
            StorageBufferRead,         // ranking tile
            StorageBufferRead,         // scrambling tile
            StorageBufferRead,         // ray list
            StorageTextureRgba16Write, // intersection result
            StorageTextureR32Write,    // ray lengths
            StorageTextureRgba16Write, // output
        ],
        Kernel::SpatialDenoise => &[
            SampledTexture,             // depth
            SampledTexture,             // normals
            SampledTexture,             // roughness
            SampledTexture,             // intersection result
            SampledTexture,             // variance
            StorageBufferRead,          // tile list
            StorageTextureRgba16Write,  // spatially denoised
            StorageTextureR32ReadWrite, // ray lengths
        ],
        Kernel::TemporalDenoise => &[
            SampledTexture,             // normals
            SampledTexture,             // roughness
            SampledTexture,             // normals history
            SampledTexture,             // roughness history
            SampledTexture,             // depth
            SampledTexture,             // motion vectors
            SampledTexture,             // spatially denoised
            SampledTexture,             // temporal history
            SampledTexture,             // ray lengths
            StorageBufferRead,          // tile list
            StorageTextureRgba16Write,  // temporal result
            StorageTextureR32ReadWrite, // temporal variance
        ],
        Kernel::EawDenoise => &[
            SampledTexture,            // normals
            SampledTexture,            // roughness
            SampledTexture,            // depth
            StorageBufferRead,         // tile list
            SampledTexture,            // input
            StorageTextureRgba16Write, // output
        ],
    }
}

/// Constructs the backend selected by the descriptor.
pub(crate) fn create_backend(
    descriptor: BackendDescriptor,
    scratch_size: u64,
) -> Result<Box<dyn ResolveBackend>> {
    match descriptor {
        BackendDescriptor::Dummy => {
            log::info!("using dummy backend");
            Ok(Box::new(DummyBackend::new(scratch_size)))
        }
        #[cfg(feature = "wgpu-backend")]
        BackendDescriptor::Wgpu { device, queue } => {
            log::info!("using wgpu backend");
            Ok(Box::new(wgpu_backend::WgpuBackend::new(
                device,
                queue,
                scratch_size,
            )?))
        }
        #[cfg(feature = "vulkan-backend")]
        BackendDescriptor::Vulkan {
            instance,
            device,
            physical_device,
        } => {
            log::info!("using Vulkan backend (ash)");
            Ok(Box::new(vulkan::VulkanBackend::new(
                instance,
                device,
                physical_device,
                scratch_size,
            )?))
        }
    }
}

/// Error used by the backends when handed a stream of the wrong flavor.
pub(crate) fn stream_mismatch(backend: &'static str) -> Error {
    Error::InvalidValue(format!(
        "command stream does not target the {backend} backend"
    ))
}
