//! The fixed six-stage resolve sequence.
//!
//! Each `encode_resolve` call drives one reflection view through tile
//! classification, indirect-argument preparation, ray intersection and the
//! three denoising stages, with an explicit hazard point at every pass
//! boundary. History resources are double buffered by `frame_index & 1`:
//! frame F writes slot `F & 1` and reads the other slot, so history is
//! always exactly one frame old no matter how many frames are in flight.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::backend::{CommandStream, DispatchKind, Hazard, PassKind, ResolveBackend};
use crate::error::{Error, Result};
use crate::queries::{TimestampLabel, TimestampQueryRing};
use crate::ring::ScratchRing;

bitflags::bitflags! {
    /// Flags supplied when creating a reflection view.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateViewFlags: u32 {
        /// Capture per-pass GPU timestamps for the elapsed-time queries.
        const ENABLE_PERFORMANCE_COUNTERS = 1 << 0;
        /// The application alternates between the normal surface and its
        /// history copy each frame instead of copying.
        const PING_PONG_NORMAL_BUFFERS = 1 << 1;
        /// Same as above, for the roughness surfaces.
        const PING_PONG_ROUGHNESS_BUFFERS = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Flags supplied per resolve.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResolveFlags: u32 {
        /// Run the denoiser passes on the intersection results.
        const DENOISE = 1 << 0;
        /// Force rays on temporally unstable pixels.
        const ENABLE_VARIANCE_GUIDED_TRACING = 1 << 1;
    }
}

/// Minimum ray samples per 2x2 quad in denoised regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaySamplesPerQuad {
    #[default]
    One,
    Two,
    Four,
}

impl RaySamplesPerQuad {
    pub fn count(self) -> u32 {
        match self {
            RaySamplesPerQuad::One => 1,
            RaySamplesPerQuad::Two => 2,
            RaySamplesPerQuad::Four => 4,
        }
    }
}

/// Number of edge-aware wavelet passes chained at the end of the denoiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EawPassCount {
    #[default]
    One,
    Three,
}

/// Per-resolve parameters.
#[derive(Debug, Clone)]
pub struct ResolveDescriptor {
    pub flags: ResolveFlags,
    /// [0, 1]; high values prioritize temporal stability, low values avoid
    /// ghosting.
    pub temporal_stability_scale: f32,
    /// Maximum depth-hierarchy traversal iterations per ray.
    pub max_traversal_iterations: u32,
    /// Most detailed depth-hierarchy mip used by non-mirror rays.
    pub most_detailed_mip: u32,
    /// Minimum threads per wave to keep the intersection kernel running.
    pub min_traversal_occupancy: u32,
    /// View-space thickness behind the depth buffer that still counts as a
    /// hit.
    pub depth_buffer_thickness: f32,
    pub samples_per_quad: RaySamplesPerQuad,
    pub eaw_pass_count: EawPassCount,
    /// Rays are traced for roughness values below this threshold.
    pub roughness_threshold: f32,
}

impl Default for ResolveDescriptor {
    fn default() -> Self {
        Self {
            flags: ResolveFlags::DENOISE,
            temporal_stability_scale: 0.99,
            max_traversal_iterations: 128,
            most_detailed_mip: 0,
            min_traversal_occupancy: 4,
            depth_buffer_thickness: 0.015,
            samples_per_quad: RaySamplesPerQuad::One,
            eaw_pass_count: EawPassCount::One,
            roughness_threshold: 0.2,
        }
    }
}

/// Constant block uploaded once per resolve into the scratch ring.
///
/// Field order matches the `Constants` struct in `shaders.rs`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub(crate) struct PassConstants {
    pub inv_view_projection: Mat4,
    pub projection: Mat4,
    pub inv_projection: Mat4,
    pub view: Mat4,
    pub inv_view: Mat4,
    pub prev_view_projection: Mat4,
    pub frame_index: u32,
    pub max_traversal_intersections: u32,
    pub min_traversal_occupancy: u32,
    pub most_detailed_mip: u32,
    pub temporal_stability_factor: f32,
    pub depth_buffer_thickness: f32,
    pub samples_per_quad: u32,
    pub temporal_variance_guided_tracing_enabled: u32,
    pub roughness_threshold: f32,
    pub skip_denoiser: u32,
    pub eaw_stride: u32,
    pub _pad0: u32,
}

pub(crate) const PASS_CONSTANTS_SIZE: u64 = std::mem::size_of::<PassConstants>() as u64;
/// Uniform-offset alignment required by both GPU backends.
pub(crate) const CONSTANTS_ALIGNMENT: u64 = 256;

const _: () = assert!(std::mem::size_of::<PassConstants>() == 432);
const _: () = assert!(std::mem::size_of::<PassConstants>() % 16 == 0);

/// Host-side state of one reflection view.
#[derive(Debug)]
pub(crate) struct ReflectionViewState {
    pub width: u32,
    pub height: u32,
    pub flags: CreateViewFlags,
    /// View-projection of the previous resolve, for temporal reprojection.
    pub prev_view_projection: Mat4,
    /// Present iff the view was created with performance counters.
    pub queries: Option<TimestampQueryRing>,
}

impl ReflectionViewState {
    pub fn new(width: u32, height: u32, flags: CreateViewFlags, frames_in_flight: u32) -> Self {
        let queries = flags
            .contains(CreateViewFlags::ENABLE_PERFORMANCE_COUNTERS)
            .then(|| TimestampQueryRing::new(frames_in_flight));
        Self {
            width,
            height,
            flags,
            prev_view_projection: Mat4::IDENTITY,
            queries,
        }
    }
}

fn div_rounded_up(value: u32, divisor: u32) -> u32 {
    (value + divisor - 1) / divisor
}

fn acquire_constants_block(
    ring: &mut ScratchRing,
    frame_index: u32,
    reuse_horizon: u32,
) -> Result<crate::ring::RingBlock> {
    ring.acquire(
        PASS_CONSTANTS_SIZE,
        CONSTANTS_ALIGNMENT,
        frame_index,
        reuse_horizon,
    )
    .ok_or_else(|| {
        Error::OutOfMemory(format!(
            "failed to allocate {PASS_CONSTANTS_SIZE} bytes of scratch memory, \
             consider increasing scratch_buffer_size"
        ))
    })
}

/// Records the resolve sequence for one view into `stream`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn encode_resolve(
    backend: &mut dyn ResolveBackend,
    ring: &mut ScratchRing,
    frame_index: u32,
    reuse_horizon: u32,
    slot: u32,
    state: &mut ReflectionViewState,
    view_matrix: Mat4,
    projection_matrix: Mat4,
    descriptor: &ResolveDescriptor,
    stream: &mut CommandStream<'_>,
) -> Result<()> {
    let denoise = descriptor.flags.contains(ResolveFlags::DENOISE);
    let chained_eaw = denoise && descriptor.eaw_pass_count == EawPassCount::Three;

    // Lease all scratch blocks up front so an exhausted ring fails the call
    // before anything is encoded.
    let constants_block = acquire_constants_block(ring, frame_index, reuse_horizon)?;
    let eaw_blocks = if chained_eaw {
        Some((
            acquire_constants_block(ring, frame_index, reuse_horizon)?,
            acquire_constants_block(ring, frame_index, reuse_horizon)?,
        ))
    } else {
        None
    };

    // Fill the constant block.
    let view_projection = projection_matrix * view_matrix;
    let stability = descriptor.temporal_stability_scale.clamp(0.0, 1.0);
    let mut constants = PassConstants {
        inv_view_projection: view_projection.inverse(),
        projection: projection_matrix,
        inv_projection: projection_matrix.inverse(),
        view: view_matrix,
        inv_view: view_matrix.inverse(),
        prev_view_projection: state.prev_view_projection,
        frame_index,
        max_traversal_intersections: descriptor.max_traversal_iterations,
        min_traversal_occupancy: descriptor.min_traversal_occupancy,
        most_detailed_mip: descriptor.most_detailed_mip,
        temporal_stability_factor: stability * stability,
        depth_buffer_thickness: descriptor.depth_buffer_thickness,
        samples_per_quad: descriptor.samples_per_quad.count(),
        temporal_variance_guided_tracing_enabled: descriptor
            .flags
            .contains(ResolveFlags::ENABLE_VARIANCE_GUIDED_TRACING)
            as u32,
        roughness_threshold: descriptor.roughness_threshold,
        skip_denoiser: !denoise as u32,
        eaw_stride: 1,
        _pad0: 0,
    };
    backend.write_scratch(constants_block.offset, bytemuck::bytes_of(&constants))?;
    if let Some((stride2_block, stride4_block)) = &eaw_blocks {
        constants.eaw_stride = 2;
        backend.write_scratch(stride2_block.offset, bytemuck::bytes_of(&constants))?;
        constants.eaw_stride = 4;
        backend.write_scratch(stride4_block.offset, bytemuck::bytes_of(&constants))?;
    }
    state.prev_view_projection = view_projection;

    // Harvest the timestamps recorded `reuse_horizon` resolves ago, then
    // start this frame's slot.
    if let Some(queries) = &mut state.queries {
        let pending = queries.pending_labels().len() as u32;
        if pending > 0 {
            if let Some(values) = backend.read_timestamps(slot, queries.base_query(), pending) {
                queries.ingest(&values);
            }
        }
        queries.begin_frame();
        backend.write_timestamp(stream, slot, queries.next_query());
        queries.record(TimestampLabel::Init);
    }

    let buffer_half = frame_index & 1;
    let constants_offset = constants_block.offset;
    let pass = |backend: &mut dyn ResolveBackend,
                    stream: &mut CommandStream<'_>,
                    kind: PassKind,
                    offset: u64,
                    dispatch: DispatchKind|
     -> Result<()> {
        backend.encode_pass(stream, slot, kind, buffer_half, offset, dispatch)
    };

    // 1. Tile classification over the full target.
    pass(
        backend,
        stream,
        PassKind::TileClassification,
        constants_offset,
        DispatchKind::Direct {
            x: div_rounded_up(state.width, 8),
            y: div_rounded_up(state.height, 8),
            z: 1,
        },
    )?;
    if let Some(queries) = &mut state.queries {
        backend.write_timestamp(stream, slot, queries.next_query());
        queries.record(TimestampLabel::TileClassification);
    }
    backend.encode_hazard(stream, slot, Hazard::ClassificationOutputs);

    // 2. Convert the counters into dispatch arguments on the GPU; the CPU
    // never sees the tile/ray counts.
    pass(
        backend,
        stream,
        PassKind::PrepareIndirectArgs,
        constants_offset,
        DispatchKind::Direct { x: 1, y: 1, z: 1 },
    )?;
    backend.encode_hazard(stream, slot, Hazard::IndirectArguments);

    // 3. March the compacted rays against the depth hierarchy.
    pass(
        backend,
        stream,
        PassKind::Intersect,
        constants_offset,
        DispatchKind::IndirectIntersect,
    )?;
    if let Some(queries) = &mut state.queries {
        backend.write_timestamp(stream, slot, queries.next_query());
        queries.record(TimestampLabel::Intersection);
    }

    if denoise {
        backend.encode_hazard(stream, slot, Hazard::IntersectionOutputs);

        // 4. Spatial resolve.
        pass(
            backend,
            stream,
            PassKind::SpatialDenoise,
            constants_offset,
            DispatchKind::IndirectDenoise,
        )?;
        backend.encode_hazard(stream, slot, Hazard::SpatialOutputs);

        // 5. Temporal accumulation against the other history slot.
        pass(
            backend,
            stream,
            PassKind::TemporalDenoise,
            constants_offset,
            DispatchKind::IndirectDenoise,
        )?;
        backend.encode_hazard(stream, slot, Hazard::TemporalOutputs);

        // 6. Edge-aware wavelet chain.
        match eaw_blocks {
            None => {
                pass(
                    backend,
                    stream,
                    PassKind::EawDenoise,
                    constants_offset,
                    DispatchKind::IndirectDenoise,
                )?;
            }
            Some((stride2_block, stride4_block)) => {
                pass(
                    backend,
                    stream,
                    PassKind::EawDenoiseToIntermediate,
                    constants_offset,
                    DispatchKind::IndirectDenoise,
                )?;
                backend.encode_hazard(stream, slot, Hazard::EawOutputs);
                pass(
                    backend,
                    stream,
                    PassKind::EawDenoiseFromIntermediate,
                    stride2_block.offset,
                    DispatchKind::IndirectDenoise,
                )?;
                backend.encode_hazard(stream, slot, Hazard::EawOutputs);
                pass(
                    backend,
                    stream,
                    PassKind::EawDenoise,
                    stride4_block.offset,
                    DispatchKind::IndirectDenoise,
                )?;
            }
        }
        if let Some(queries) = &mut state.queries {
            backend.write_timestamp(stream, slot, queries.next_query());
            queries.record(TimestampLabel::Denoising);
        }
    }

    if let Some(queries) = &mut state.queries {
        backend.resolve_timestamps(stream, slot, queries.base_query(), queries.recorded());
        queries.advance();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, DummyEvent};

    fn test_state(flags: CreateViewFlags) -> ReflectionViewState {
        ReflectionViewState::new(128, 128, flags, 3)
    }

    fn resolve(
        backend: &mut DummyBackend,
        ring: &mut ScratchRing,
        frame: u32,
        state: &mut ReflectionViewState,
        descriptor: &ResolveDescriptor,
    ) {
        encode_resolve(
            backend,
            ring,
            frame,
            3,
            0,
            state,
            Mat4::IDENTITY,
            Mat4::IDENTITY,
            descriptor,
            &mut CommandStream::Dummy,
        )
        .unwrap();
    }

    #[test]
    fn test_full_sequence_with_hazards() {
        let mut backend = DummyBackend::new(1 << 20);
        let mut ring = ScratchRing::new(1 << 20);
        let mut state = test_state(CreateViewFlags::empty());

        resolve(
            &mut backend,
            &mut ring,
            0,
            &mut state,
            &ResolveDescriptor::default(),
        );

        assert_eq!(
            backend.passes(),
            vec![
                PassKind::TileClassification,
                PassKind::PrepareIndirectArgs,
                PassKind::Intersect,
                PassKind::SpatialDenoise,
                PassKind::TemporalDenoise,
                PassKind::EawDenoise,
            ]
        );

        let hazards: Vec<Hazard> = backend
            .events()
            .iter()
            .filter_map(|e| match e {
                DummyEvent::Hazard { hazard, .. } => Some(*hazard),
                _ => None,
            })
            .collect();
        assert_eq!(
            hazards,
            vec![
                Hazard::ClassificationOutputs,
                Hazard::IndirectArguments,
                Hazard::IntersectionOutputs,
                Hazard::SpatialOutputs,
                Hazard::TemporalOutputs,
            ]
        );
    }

    #[test]
    fn test_denoise_off_skips_denoiser_stages() {
        let mut backend = DummyBackend::new(1 << 20);
        let mut ring = ScratchRing::new(1 << 20);
        let mut state = test_state(CreateViewFlags::empty());

        let descriptor = ResolveDescriptor {
            flags: ResolveFlags::empty(),
            ..Default::default()
        };
        resolve(&mut backend, &mut ring, 0, &mut state, &descriptor);

        assert_eq!(
            backend.passes(),
            vec![
                PassKind::TileClassification,
                PassKind::PrepareIndirectArgs,
                PassKind::Intersect,
            ]
        );
        // Only one constant block was uploaded.
        let writes = backend
            .events()
            .iter()
            .filter(|e| matches!(e, DummyEvent::WriteScratch { .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[test]
    fn test_three_eaw_passes_chain_through_intermediate() {
        let mut backend = DummyBackend::new(1 << 20);
        let mut ring = ScratchRing::new(1 << 20);
        let mut state = test_state(CreateViewFlags::empty());

        let descriptor = ResolveDescriptor {
            eaw_pass_count: EawPassCount::Three,
            ..Default::default()
        };
        resolve(&mut backend, &mut ring, 0, &mut state, &descriptor);

        let passes = backend.passes();
        assert_eq!(
            &passes[5..],
            &[
                PassKind::EawDenoiseToIntermediate,
                PassKind::EawDenoiseFromIntermediate,
                PassKind::EawDenoise,
            ]
        );

        // The stride-2 and stride-4 passes use their own constant blocks.
        let offsets: Vec<u64> = backend
            .events()
            .iter()
            .filter_map(|e| match e {
                DummyEvent::Pass {
                    constants_offset, ..
                } => Some(*constants_offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets[5], offsets[0]);
        assert_ne!(offsets[6], offsets[0]);
        assert_ne!(offsets[7], offsets[6]);
    }

    #[test]
    fn test_buffer_half_follows_frame_parity() {
        let mut backend = DummyBackend::new(1 << 20);
        let mut ring = ScratchRing::new(1 << 20);
        let mut state = test_state(CreateViewFlags::empty());

        for frame in 0..4 {
            resolve(
                &mut backend,
                &mut ring,
                frame,
                &mut state,
                &ResolveDescriptor::default(),
            );
        }

        let halves: Vec<(u32, PassKind)> = backend
            .events()
            .iter()
            .filter_map(|e| match e {
                DummyEvent::Pass {
                    buffer_half, pass, ..
                } => Some((*buffer_half, *pass)),
                _ => None,
            })
            .collect();

        // Frame F writes slot F & 1; the other slot still holds F-1's data.
        for (i, (half, _)) in halves.iter().enumerate() {
            let frame = (i / 6) as u32;
            assert_eq!(*half, frame & 1);
        }
    }

    #[test]
    fn test_timestamps_wrap_around_the_query_ring() {
        let mut backend = DummyBackend::new(1 << 20);
        let mut ring = ScratchRing::new(1 << 20);
        let mut state = test_state(CreateViewFlags::ENABLE_PERFORMANCE_COUNTERS);

        for frame in 0..4 {
            resolve(
                &mut backend,
                &mut ring,
                frame,
                &mut state,
                &ResolveDescriptor::default(),
            );
        }

        let stamps: Vec<u32> = backend
            .events()
            .iter()
            .filter_map(|e| match e {
                DummyEvent::Timestamp { query_index, .. } => Some(*query_index),
                _ => None,
            })
            .collect();
        // Four timestamps per frame, three slots, wrapping after the third.
        assert_eq!(&stamps[0..4], &[0, 1, 2, 3]);
        assert_eq!(&stamps[4..8], &[4, 5, 6, 7]);
        assert_eq!(&stamps[8..12], &[8, 9, 10, 11]);
        assert_eq!(&stamps[12..16], &[0, 1, 2, 3]);

        // By the fourth resolve the first slot's data was harvested.
        let queries = state.queries.as_ref().unwrap();
        assert_eq!(queries.tile_classification_time(), 100);
        assert_eq!(queries.intersection_time(), 100);
        assert_eq!(queries.denoising_time(), 100);
    }

    #[test]
    fn test_scratch_exhaustion_reports_out_of_memory() {
        let mut backend = DummyBackend::new(512);
        let mut ring = ScratchRing::new(512);
        let mut state = test_state(CreateViewFlags::empty());

        // The constant block no longer fits once a frame is in flight.
        resolve(
            &mut backend,
            &mut ring,
            0,
            &mut state,
            &ResolveDescriptor::default(),
        );
        let err = encode_resolve(
            &mut backend,
            &mut ring,
            1,
            3,
            0,
            &mut state,
            Mat4::IDENTITY,
            Mat4::IDENTITY,
            &ResolveDescriptor::default(),
            &mut CommandStream::Dummy,
        )
        .unwrap_err();
        assert_eq!(err.status(), crate::error::Status::OutOfMemory);
    }

    #[test]
    fn test_previous_view_projection_updates() {
        let mut backend = DummyBackend::new(1 << 20);
        let mut ring = ScratchRing::new(1 << 20);
        let mut state = test_state(CreateViewFlags::empty());
        assert_eq!(state.prev_view_projection, Mat4::IDENTITY);

        let projection = Mat4::from_scale(glam::Vec3::new(1.0, 2.0, 1.0));
        encode_resolve(
            &mut backend,
            &mut ring,
            0,
            3,
            0,
            &mut state,
            Mat4::IDENTITY,
            projection,
            &ResolveDescriptor::default(),
            &mut CommandStream::Dummy,
        )
        .unwrap();
        assert_eq!(state.prev_view_projection, projection);
    }
}
