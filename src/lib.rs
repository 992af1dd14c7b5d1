//! Stochastic screen-space reflections resolver.
//!
//! Resolves denoised reflections for any number of independent "reflection
//! views", each driven through a fixed chain of compute passes every frame:
//! tile classification, indirect-argument preparation, ray intersection and
//! spatial/temporal/edge-aware denoising. The host side owns the hard
//! parts: a generational handle registry, a frame-pipelined scratch ring
//! whose memory is reclaimed only once the GPU can no longer read it, and
//! double-buffered history resources selected by frame parity.
//!
//! Two GPU backends implement the same backend interface and are selected
//! at context creation:
//! - **wgpu**: cross-platform (Vulkan, Metal, DX12)
//! - **Vulkan**: direct API access via ash
//!
//! A recording `dummy` backend is always available for testing.
//!
//! # Usage
//!
//! ```no_run
//! use stochastic_reflections::{
//!     BackendDescriptor, CommandStream, Context, ContextDescriptor,
//!     CreateReflectionViewInfo, CreateViewFlags, ResolveDescriptor, ViewBindings, API_VERSION,
//! };
//!
//! let mut context = Context::new(ContextDescriptor {
//!     api_version: API_VERSION,
//!     max_reflection_view_count: 4,
//!     frame_count_before_reuse: 3,
//!     scratch_buffer_size: 1024 * 1024,
//!     logging_callback: Some(Box::new(|message| eprintln!("{message}"))),
//!     backend: BackendDescriptor::Dummy,
//! })?;
//!
//! let view = context.create_reflection_view(&CreateReflectionViewInfo {
//!     output_width: 1920,
//!     output_height: 1080,
//!     flags: CreateViewFlags::empty(),
//!     bindings: ViewBindings::Dummy,
//! })?;
//!
//! // Once per frame:
//! context.set_camera_parameters(view, glam::Mat4::IDENTITY, glam::Mat4::IDENTITY)?;
//! context.encode_resolve_reflection_view(
//!     view,
//!     &ResolveDescriptor::default(),
//!     &mut CommandStream::Dummy,
//! )?;
//! context.advance_to_next_frame();
//! # Ok::<(), stochastic_reflections::Error>(())
//! ```

pub mod backend;
mod blue_noise;
mod context;
mod error;
mod pipeline;
mod queries;
mod registry;
mod ring;
mod shaders;

pub use backend::{
    BackendDescriptor, CommandStream, DispatchKind, DummyBackend, DummyEvent, Hazard, PassKind,
    ResolveBackend, ViewBindings, ViewSetup,
};
#[cfg(feature = "vulkan-backend")]
pub use backend::VulkanViewBindings;
#[cfg(feature = "wgpu-backend")]
pub use backend::WgpuViewBindings;
pub use context::{Context, ContextDescriptor, CreateReflectionViewInfo, LoggingCallback};
pub use error::{Error, Result, Status};
pub use pipeline::{
    CreateViewFlags, EawPassCount, RaySamplesPerQuad, ResolveDescriptor, ResolveFlags,
};
pub use registry::ReflectionViewId;
pub use ring::{RingBlock, ScratchRing};

/// Packs a semantic version into the format expected by
/// [`ContextDescriptor::api_version`].
pub const fn make_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 22) | (minor << 12) | patch
}

/// The version callers must pass in [`ContextDescriptor::api_version`].
pub const API_VERSION: u32 = make_version(1, 1, 0);
