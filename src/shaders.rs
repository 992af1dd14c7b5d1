//! WGSL sources for the resolve kernels.
//!
//! The kernels are written once in WGSL: the wgpu backend consumes them
//! directly and the Vulkan backend translates them to SPIR-V through naga.
//! Every kernel shares the same constant block layout, bound at group 1
//! binding 0 with a dynamic offset into the scratch ring.

/// Constant block declaration shared by all kernels.
///
/// Must match `pipeline::PassConstants` field for field.
const CONSTANTS: &str = r#"
struct Constants {
    inv_view_projection: mat4x4<f32>,
    projection: mat4x4<f32>,
    inv_projection: mat4x4<f32>,
    view: mat4x4<f32>,
    inv_view: mat4x4<f32>,
    prev_view_projection: mat4x4<f32>,
    frame_index: u32,
    max_traversal_intersections: u32,
    min_traversal_occupancy: u32,
    most_detailed_mip: u32,
    temporal_stability_factor: f32,
    depth_buffer_thickness: f32,
    samples_per_quad: u32,
    temporal_variance_guided_tracing_enabled: u32,
    roughness_threshold: f32,
    skip_denoiser: u32,
    eaw_stride: u32,
    pad0: u32,
}

@group(1) @binding(0) var<uniform> constants: Constants;
"#;

const TILE_CLASSIFICATION_BODY: &str = r#"
@group(0) @binding(0) var roughness_tex: texture_2d<f32>;
@group(0) @binding(1) var<storage, read_write> tile_list: array<u32>;
@group(0) @binding(2) var<storage, read_write> ray_list: array<u32>;
@group(0) @binding(3) var<storage, read_write> tile_counter: atomic<u32>;
@group(0) @binding(4) var<storage, read_write> ray_counter: atomic<u32>;
@group(0) @binding(5) var temporal_result: texture_storage_2d<rgba16float, write>;
@group(0) @binding(6) var ray_lengths: texture_storage_2d<r32float, write>;
@group(0) @binding(7) var temporal_variance: texture_storage_2d<r32float, read_write>;

var<workgroup> tile_ray_count: atomic<u32>;

fn pack_coords(c: vec2<u32>) -> u32 {
    return (c.y << 16u) | (c.x & 0xFFFFu);
}

@compute @workgroup_size(8, 8, 1)
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_index) local_index: u32,
    @builtin(workgroup_id) group_id: vec3<u32>,
) {
    if (local_index == 0u) {
        atomicStore(&tile_ray_count, 0u);
    }
    workgroupBarrier();

    let dims = textureDimensions(roughness_tex);
    let in_bounds = gid.x < dims.x && gid.y < dims.y;
    let coord = vec2<i32>(gid.xy);

    var needs_ray = false;
    if (in_bounds) {
        let roughness = textureLoad(roughness_tex, coord, 0).x;
        needs_ray = roughness < constants.roughness_threshold;
        if (!needs_ray && constants.temporal_variance_guided_tracing_enabled != 0u) {
            // Force a ray where the accumulated history has been unstable.
            needs_ray = textureLoad(temporal_variance, coord).x > 0.1;
        }
    }

    if (needs_ray) {
        _ = atomicAdd(&tile_ray_count, 1u);
        let slot = atomicAdd(&ray_counter, 1u);
        if (slot < arrayLength(&ray_list)) {
            ray_list[slot] = pack_coords(gid.xy);
        }
    } else if (in_bounds) {
        // Pixels that trace no ray this frame restart their history.
        textureStore(temporal_result, coord, vec4<f32>(0.0));
        textureStore(ray_lengths, coord, vec4<f32>(0.0));
        textureStore(temporal_variance, coord, vec4<f32>(0.0));
    }
    workgroupBarrier();

    if (local_index == 0u && atomicLoad(&tile_ray_count) > 0u) {
        let slot = atomicAdd(&tile_counter, 1u);
        if (slot < arrayLength(&tile_list)) {
            tile_list[slot] = pack_coords(group_id.xy);
        }
    }
}
"#;

const PREPARE_INDIRECT_ARGS_BODY: &str = r#"
@group(0) @binding(0) var<storage, read_write> tile_counter: atomic<u32>;
@group(0) @binding(1) var<storage, read_write> ray_counter: atomic<u32>;
@group(0) @binding(2) var<storage, read_write> intersect_args: array<u32>;
@group(0) @binding(3) var<storage, read_write> denoiser_args: array<u32>;

@compute @workgroup_size(1, 1, 1)
fn main() {
    let ray_count = atomicLoad(&ray_counter);
    intersect_args[0] = (ray_count + 63u) / 64u;
    intersect_args[1] = 1u;
    intersect_args[2] = 1u;

    let tile_count = atomicLoad(&tile_counter);
    denoiser_args[0] = tile_count;
    denoiser_args[1] = 1u;
    denoiser_args[2] = 1u;

    // Leave the counters cleared for the next classification pass.
    atomicStore(&tile_counter, 0u);
    atomicStore(&ray_counter, 0u);
}
"#;

const INTERSECT_BODY: &str = r#"
@group(0) @binding(0) var scene_tex: texture_2d<f32>;
@group(0) @binding(1) var depth_hierarchy: texture_2d<f32>;
@group(0) @binding(2) var normal_tex: texture_2d<f32>;
@group(0) @binding(3) var roughness_tex: texture_2d<f32>;
@group(0) @binding(4) var environment_map: texture_cube<f32>;
@group(0) @binding(5) var environment_sampler: sampler;
@group(0) @binding(6) var<storage, read> sobol_buffer: array<u32>;
@group(0) @binding(7) var<storage, read> ranking_tile_buffer: array<u32>;
@group(0) @binding(8) var<storage, read> scrambling_tile_buffer: array<u32>;
@group(0) @binding(9) var<storage, read> ray_list: array<u32>;
@group(0) @binding(10) var intersection_result: texture_storage_2d<rgba16float, write>;
@group(0) @binding(11) var ray_lengths: texture_storage_2d<r32float, write>;
@group(0) @binding(12) var output_tex: texture_storage_2d<rgba16float, write>;

fn unpack_coords(packed: u32) -> vec2<u32> {
    return vec2<u32>(packed & 0xFFFFu, packed >> 16u);
}

// Owen-scrambled Sobol sample, one of the low-discrepancy dimensions
// prepared on the host.
fn blue_noise_sample(pixel: vec2<u32>, sample_index: u32, dimension: u32) -> f32 {
    let tile = ((pixel.y & 127u) * 128u + (pixel.x & 127u)) * 8u + (dimension & 7u);
    let ranked = sample_index ^ ranking_tile_buffer[tile % arrayLength(&ranking_tile_buffer)];
    let raw = sobol_buffer[((ranked & 255u) * 8u + (dimension & 7u)) % arrayLength(&sobol_buffer)];
    let scrambled = raw ^ scrambling_tile_buffer[tile % arrayLength(&scrambling_tile_buffer)];
    return (f32(scrambled & 0xFFFFFFu) + 0.5) / 16777216.0;
}

fn screen_to_view(uv: vec2<f32>, depth: f32) -> vec3<f32> {
    let ndc = vec4<f32>(uv.x * 2.0 - 1.0, 1.0 - uv.y * 2.0, depth, 1.0);
    let view_pos = constants.inv_projection * ndc;
    return view_pos.xyz / view_pos.w;
}

fn sample_reflection_direction(view_dir: vec3<f32>, normal: vec3<f32>, roughness: f32, u1: f32, u2: f32) -> vec3<f32> {
    // Perturb the mirror direction inside a roughness-scaled cone.
    let mirror = reflect(view_dir, normal);
    let phi = 6.28318530718 * u1;
    let cos_theta = pow(1.0 - u2 * roughness, 0.5);
    let sin_theta = sqrt(max(0.0, 1.0 - cos_theta * cos_theta));
    let up = select(vec3<f32>(0.0, 1.0, 0.0), vec3<f32>(1.0, 0.0, 0.0), abs(mirror.y) > 0.99);
    let tangent = normalize(cross(up, mirror));
    let bitangent = cross(mirror, tangent);
    return normalize(
        tangent * (sin_theta * cos(phi)) + bitangent * (sin_theta * sin(phi)) + mirror * cos_theta,
    );
}

@compute @workgroup_size(64, 1, 1)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= arrayLength(&ray_list)) {
        return;
    }
    let pixel = unpack_coords(ray_list[gid.x]);
    let dims = textureDimensions(depth_hierarchy);
    if (pixel.x >= dims.x || pixel.y >= dims.y) {
        return;
    }

    let coord = vec2<i32>(pixel);
    let mip = i32(constants.most_detailed_mip);
    let mip_dims = textureDimensions(depth_hierarchy, mip);
    let uv = (vec2<f32>(pixel) + 0.5) / vec2<f32>(dims);

    let depth = textureLoad(depth_hierarchy, coord >> vec2<u32>(u32(mip)), mip).x;
    let normal = normalize(textureLoad(normal_tex, coord, 0).xyz * 2.0 - 1.0);
    let roughness = textureLoad(roughness_tex, coord, 0).x;

    let origin = screen_to_view(uv, depth);
    let view_dir = normalize(origin);

    let u1 = blue_noise_sample(pixel, constants.frame_index, 0u);
    let u2 = blue_noise_sample(pixel, constants.frame_index, 1u);
    let direction = sample_reflection_direction(view_dir, normal, roughness, u1, u2);

    // March against the depth hierarchy at the requested mip.
    let step_size = max(constants.depth_buffer_thickness, 0.01);
    var position = origin;
    var ray_length = 0.0;
    var hit = false;
    var radiance = vec3<f32>(0.0);
    var iteration = 0u;
    loop {
        if (iteration >= constants.max_traversal_intersections) {
            break;
        }
        iteration = iteration + 1u;

        position = position + direction * step_size;
        ray_length = ray_length + step_size;

        let clip = constants.projection * vec4<f32>(position, 1.0);
        if (clip.w <= 0.0) {
            break;
        }
        let ndc = clip.xyz / clip.w;
        if (abs(ndc.x) > 1.0 || abs(ndc.y) > 1.0) {
            break;
        }
        let sample_uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
        let sample_coord = vec2<i32>(sample_uv * vec2<f32>(mip_dims));
        let scene_depth = textureLoad(depth_hierarchy, sample_coord, mip).x;
        let scene_pos = screen_to_view(sample_uv, scene_depth);

        let delta = scene_pos.z - position.z;
        if (delta >= 0.0 && delta < constants.depth_buffer_thickness) {
            let scene_pixel = vec2<i32>(sample_uv * vec2<f32>(dims));
            radiance = textureLoad(scene_tex, scene_pixel, 0).xyz;
            hit = true;
            break;
        }
    }

    if (!hit) {
        let world_dir = (constants.inv_view * vec4<f32>(direction, 0.0)).xyz;
        radiance = textureSampleLevel(environment_map, environment_sampler, world_dir, 0.0).xyz;
        ray_length = 0.0;
    }

    textureStore(intersection_result, coord, vec4<f32>(radiance, 1.0));
    textureStore(ray_lengths, coord, vec4<f32>(ray_length, 0.0, 0.0, 0.0));
    if (constants.skip_denoiser != 0u) {
        textureStore(output_tex, coord, vec4<f32>(radiance, 1.0));
    }
}
"#;

/// Shared helper for the denoiser kernels: maps a thread in an indirectly
/// dispatched 8x8 group back to the screen pixel of its compacted tile.
const TILE_HELPERS: &str = r#"
fn tile_pixel(packed_tile: u32, local: vec2<u32>) -> vec2<u32> {
    let tile = vec2<u32>(packed_tile & 0xFFFFu, packed_tile >> 16u);
    return tile * 8u + local;
}
"#;

const SPATIAL_DENOISE_BODY: &str = r#"
@group(0) @binding(0) var depth_tex: texture_2d<f32>;
@group(0) @binding(1) var normal_tex: texture_2d<f32>;
@group(0) @binding(2) var roughness_tex: texture_2d<f32>;
@group(0) @binding(3) var intersect_in: texture_2d<f32>;
@group(0) @binding(4) var variance_in: texture_2d<f32>;
@group(0) @binding(5) var<storage, read> tile_list: array<u32>;
@group(0) @binding(6) var spatial_out: texture_storage_2d<rgba16float, write>;
@group(0) @binding(7) var ray_lengths: texture_storage_2d<r32float, read_write>;

@compute @workgroup_size(8, 8, 1)
fn main(
    @builtin(workgroup_id) group_id: vec3<u32>,
    @builtin(local_invocation_id) local_id: vec3<u32>,
) {
    if (group_id.x >= arrayLength(&tile_list)) {
        return;
    }
    let pixel = tile_pixel(tile_list[group_id.x], local_id.xy);
    let dims = textureDimensions(intersect_in);
    if (pixel.x >= dims.x || pixel.y >= dims.y) {
        return;
    }
    let coord = vec2<i32>(pixel);

    let center_normal = textureLoad(normal_tex, coord, 0).xyz;
    let center_depth = textureLoad(depth_tex, coord, 0).x;
    let roughness = textureLoad(roughness_tex, coord, 0).x;

    // Roughness-widened 3x3 resolve around the traced sample. Ray lengths
    // are filtered with the same weights so reprojection stays coherent.
    var sum = vec4<f32>(0.0);
    var length_sum = 0.0;
    var weight_sum = 0.0;
    for (var dy = -1; dy <= 1; dy = dy + 1) {
        for (var dx = -1; dx <= 1; dx = dx + 1) {
            let tap = coord + vec2<i32>(dx, dy);
            if (tap.x < 0 || tap.y < 0 || tap.x >= i32(dims.x) || tap.y >= i32(dims.y)) {
                continue;
            }
            let tap_normal = textureLoad(normal_tex, tap, 0).xyz;
            let tap_depth = textureLoad(depth_tex, tap, 0).x;
            let normal_weight = pow(max(dot(center_normal, tap_normal), 0.0), 8.0);
            let depth_weight = exp(-abs(tap_depth - center_depth) * 32.0);
            let weight = normal_weight * depth_weight * mix(0.3, 1.0, roughness);
            sum = sum + textureLoad(intersect_in, tap, 0) * weight;
            length_sum = length_sum + textureLoad(ray_lengths, tap).x * weight;
            weight_sum = weight_sum + weight;
        }
    }

    let center = textureLoad(intersect_in, coord, 0);
    var resolved = center;
    if (weight_sum > 0.0) {
        resolved = sum / weight_sum;
        textureStore(ray_lengths, coord, vec4<f32>(length_sum / weight_sum, 0.0, 0.0, 0.0));
    }
    let has_ray = textureLoad(variance_in, coord, 0).x;
    textureStore(spatial_out, coord, mix(center, resolved, clamp(has_ray + roughness, 0.0, 1.0)));
}
"#;

const TEMPORAL_DENOISE_BODY: &str = r#"
@group(0) @binding(0) var normal_tex: texture_2d<f32>;
@group(0) @binding(1) var roughness_tex: texture_2d<f32>;
@group(0) @binding(2) var normal_history: texture_2d<f32>;
@group(0) @binding(3) var roughness_history: texture_2d<f32>;
@group(0) @binding(4) var depth_tex: texture_2d<f32>;
@group(0) @binding(5) var motion_vectors: texture_2d<f32>;
@group(0) @binding(6) var spatial_in: texture_2d<f32>;
@group(0) @binding(7) var history_in: texture_2d<f32>;
@group(0) @binding(8) var ray_lengths_in: texture_2d<f32>;
@group(0) @binding(9) var<storage, read> tile_list: array<u32>;
@group(0) @binding(10) var temporal_out: texture_storage_2d<rgba16float, write>;
@group(0) @binding(11) var temporal_variance: texture_storage_2d<r32float, read_write>;

@compute @workgroup_size(8, 8, 1)
fn main(
    @builtin(workgroup_id) group_id: vec3<u32>,
    @builtin(local_invocation_id) local_id: vec3<u32>,
) {
    if (group_id.x >= arrayLength(&tile_list)) {
        return;
    }
    let pixel = tile_pixel(tile_list[group_id.x], local_id.xy);
    let dims = textureDimensions(spatial_in);
    if (pixel.x >= dims.x || pixel.y >= dims.y) {
        return;
    }
    let coord = vec2<i32>(pixel);

    let current = textureLoad(spatial_in, coord, 0);

    // Reproject into last frame through the motion vectors.
    let motion = textureLoad(motion_vectors, coord, 0).xy;
    let uv = (vec2<f32>(pixel) + 0.5) / vec2<f32>(dims);
    let history_uv = uv - motion;
    var history_weight = constants.temporal_stability_factor;
    if (history_uv.x < 0.0 || history_uv.y < 0.0 || history_uv.x > 1.0 || history_uv.y > 1.0) {
        history_weight = 0.0;
    }
    let history_coord = vec2<i32>(history_uv * vec2<f32>(dims));
    let history = textureLoad(history_in, clamp(history_coord, vec2<i32>(0), vec2<i32>(dims) - 1), 0);

    // Disocclusion test against last frame's surface attributes.
    let normal = textureLoad(normal_tex, coord, 0).xyz;
    let prev_normal = textureLoad(normal_history, history_coord, 0).xyz;
    if (dot(normal, prev_normal) < 0.5) {
        history_weight = 0.0;
    }
    let roughness = textureLoad(roughness_tex, coord, 0).x;
    let prev_roughness = textureLoad(roughness_history, history_coord, 0).x;
    if (abs(roughness - prev_roughness) > 0.1) {
        history_weight = history_weight * 0.5;
    }
    let _depth = textureLoad(depth_tex, coord, 0).x;
    let _length = textureLoad(ray_lengths_in, coord, 0).x;

    let blended = mix(current, history, history_weight);
    textureStore(temporal_out, coord, blended);

    // Track how unstable the signal is for variance-guided tracing.
    let instant = length(current.xyz - history.xyz);
    let previous_variance = textureLoad(temporal_variance, coord).x;
    let variance = mix(previous_variance, clamp(instant, 0.0, 1.0), 0.3);
    textureStore(temporal_variance, coord, vec4<f32>(variance, 0.0, 0.0, 0.0));
}
"#;

const EAW_DENOISE_BODY: &str = r#"
@group(0) @binding(0) var normal_tex: texture_2d<f32>;
@group(0) @binding(1) var roughness_tex: texture_2d<f32>;
@group(0) @binding(2) var depth_tex: texture_2d<f32>;
@group(0) @binding(3) var<storage, read> tile_list: array<u32>;
@group(0) @binding(4) var input_tex: texture_2d<f32>;
@group(0) @binding(5) var output_tex: texture_storage_2d<rgba16float, write>;

@compute @workgroup_size(8, 8, 1)
fn main(
    @builtin(workgroup_id) group_id: vec3<u32>,
    @builtin(local_invocation_id) local_id: vec3<u32>,
) {
    if (group_id.x >= arrayLength(&tile_list)) {
        return;
    }
    let pixel = tile_pixel(tile_list[group_id.x], local_id.xy);
    let dims = textureDimensions(input_tex);
    if (pixel.x >= dims.x || pixel.y >= dims.y) {
        return;
    }
    let coord = vec2<i32>(pixel);
    let stride = i32(max(constants.eaw_stride, 1u));

    let center = textureLoad(input_tex, coord, 0);
    let center_normal = textureLoad(normal_tex, coord, 0).xyz;
    let center_depth = textureLoad(depth_tex, coord, 0).x;
    let roughness = textureLoad(roughness_tex, coord, 0).x;

    // Edge-avoiding a-trous wavelet: 3x3 stencil dilated by the stride.
    var sum = center;
    var weight_sum = 1.0;
    for (var dy = -1; dy <= 1; dy = dy + 1) {
        for (var dx = -1; dx <= 1; dx = dx + 1) {
            if (dx == 0 && dy == 0) {
                continue;
            }
            let tap = coord + vec2<i32>(dx, dy) * stride;
            if (tap.x < 0 || tap.y < 0 || tap.x >= i32(dims.x) || tap.y >= i32(dims.y)) {
                continue;
            }
            let tap_normal = textureLoad(normal_tex, tap, 0).xyz;
            let tap_depth = textureLoad(depth_tex, tap, 0).x;
            let normal_weight = pow(max(dot(center_normal, tap_normal), 0.0), 16.0);
            let depth_weight = exp(-abs(tap_depth - center_depth) * 64.0);
            let weight = normal_weight * depth_weight * roughness;
            sum = sum + textureLoad(input_tex, tap, 0) * weight;
            weight_sum = weight_sum + weight;
        }
    }

    textureStore(output_tex, coord, sum / weight_sum);
}
"#;

fn concat(parts: &[&str]) -> String {
    parts.concat()
}

/// The compute kernels, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Kernel {
    TileClassification,
    PrepareIndirectArgs,
    Intersect,
    SpatialDenoise,
    TemporalDenoise,
    EawDenoise,
}

pub(crate) const KERNELS: [Kernel; 6] = [
    Kernel::TileClassification,
    Kernel::PrepareIndirectArgs,
    Kernel::Intersect,
    Kernel::SpatialDenoise,
    Kernel::TemporalDenoise,
    Kernel::EawDenoise,
];

impl Kernel {
    /// Assembles the full WGSL source for the kernel.
    pub fn source(self) -> String {
        match self {
            Kernel::TileClassification => concat(&[CONSTANTS, TILE_CLASSIFICATION_BODY]),
            Kernel::PrepareIndirectArgs => concat(&[CONSTANTS, PREPARE_INDIRECT_ARGS_BODY]),
            Kernel::Intersect => concat(&[CONSTANTS, INTERSECT_BODY]),
            Kernel::SpatialDenoise => concat(&[CONSTANTS, TILE_HELPERS, SPATIAL_DENOISE_BODY]),
            Kernel::TemporalDenoise => concat(&[CONSTANTS, TILE_HELPERS, TEMPORAL_DENOISE_BODY]),
            Kernel::EawDenoise => concat(&[CONSTANTS, TILE_HELPERS, EAW_DENOISE_BODY]),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Kernel::TileClassification => "sssr tile classification",
            Kernel::PrepareIndirectArgs => "sssr prepare indirect args",
            Kernel::Intersect => "sssr intersect",
            Kernel::SpatialDenoise => "sssr spatial denoise",
            Kernel::TemporalDenoise => "sssr temporal denoise",
            Kernel::EawDenoise => "sssr eaw denoise",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_are_assembled() {
        for kernel in KERNELS {
            let source = kernel.source();
            assert!(source.contains("struct Constants"));
            assert!(source.contains("@compute"));
            assert!(source.contains("fn main"));
        }
    }

    #[cfg(feature = "vulkan-backend")]
    #[test]
    fn test_sources_validate_and_translate() {
        for kernel in KERNELS {
            let source = kernel.source();
            let module = naga::front::wgsl::parse_str(&source)
                .unwrap_or_else(|e| panic!("{}: {e}", kernel.label()));
            let info = naga::valid::Validator::new(
                naga::valid::ValidationFlags::all(),
                naga::valid::Capabilities::all(),
            )
            .validate(&module)
            .unwrap_or_else(|e| panic!("{}: {e:?}", kernel.label()));
            let spirv = naga::back::spv::write_vec(
                &module,
                &info,
                &naga::back::spv::Options::default(),
                None,
            )
            .unwrap_or_else(|e| panic!("{}: {e}", kernel.label()));
            assert!(!spirv.is_empty());
        }
    }
}
