//! wgpu backend implementation.
//!
//! Cross-platform backend running the resolve kernels through wgpu, which
//! executes over Vulkan, Metal or DX12. The caller owns the device and
//! queue; resolves are encoded into a caller-provided command encoder and
//! submitted by the caller. Hazard points are no-ops here because wgpu
//! derives barriers from resource usage itself.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::{Arc, Mutex};

use wgpu::util::DeviceExt;

use crate::blue_noise;
use crate::error::{Error, Result};
use crate::pipeline::{CreateViewFlags, PASS_CONSTANTS_SIZE};
use crate::queries::TIMESTAMPS_PER_FRAME;
use crate::shaders::{Kernel, KERNELS};

use super::{
    kernel_bindings, stream_mismatch, BindingKind, CommandStream, DispatchKind, Hazard, PassKind,
    ResolveBackend, ViewBindings, ViewSetup,
};

/// Alignment wgpu requires for `resolve_query_set` destinations.
const QUERY_RESOLVE_ALIGNMENT: u64 = 256;

struct KernelPipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

/// Descriptor tables of one double-buffer half.
struct PassTables {
    tile_classification: wgpu::BindGroup,
    prepare_indirect_args: wgpu::BindGroup,
    intersect: wgpu::BindGroup,
    spatial: wgpu::BindGroup,
    temporal: wgpu::BindGroup,
    eaw_final: wgpu::BindGroup,
    eaw_to_intermediate: wgpu::BindGroup,
    eaw_from_intermediate: wgpu::BindGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapState {
    Idle,
    Pending,
    Ready,
}

/// One frame-in-flight's timestamp readback target.
struct ReadbackSlot {
    buffer: wgpu::Buffer,
    state: Arc<Mutex<MapState>>,
}

struct ViewQueries {
    query_set: wgpu::QuerySet,
    resolve_buffer: wgpu::Buffer,
    readback: Vec<ReadbackSlot>,
}

struct ViewData {
    tables: [PassTables; 2],
    intersect_args: wgpu::Buffer,
    denoiser_args: wgpu::Buffer,
    queries: Option<ViewQueries>,
}

/// wgpu-based resolve backend.
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    scratch: wgpu::Buffer,
    scratch_size: u64,
    constants_bind_group: wgpu::BindGroup,
    pipelines: HashMap<Kernel, KernelPipeline>,
    sobol: wgpu::Buffer,
    ranking_tile: wgpu::Buffer,
    scrambling_tile: wgpu::Buffer,
    views: HashMap<u32, ViewData>,
}

impl WgpuBackend {
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        scratch_size: u64,
    ) -> Result<Self> {
        let scratch = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("sssr scratch ring"),
            size: scratch_size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let constants_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("sssr constants layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(PASS_CONSTANTS_SIZE),
                },
                count: None,
            }],
        });
        let constants_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("sssr constants"),
            layout: &constants_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &scratch,
                    offset: 0,
                    size: NonZeroU64::new(PASS_CONSTANTS_SIZE),
                }),
            }],
        });

        let mut pipelines = HashMap::new();
        for kernel in KERNELS {
            let entries: Vec<wgpu::BindGroupLayoutEntry> = kernel_bindings(kernel)
                .iter()
                .enumerate()
                .map(|(binding, kind)| wgpu::BindGroupLayoutEntry {
                    binding: binding as u32,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: binding_type(*kind),
                    count: None,
                })
                .collect();
            let bind_group_layout =
                device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(kernel.label()),
                    entries: &entries,
                });

            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(kernel.label()),
                source: wgpu::ShaderSource::Wgsl(kernel.source().into()),
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(kernel.label()),
                bind_group_layouts: &[&bind_group_layout, &constants_layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel.label()),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

            pipelines.insert(
                kernel,
                KernelPipeline {
                    bind_group_layout,
                    pipeline,
                },
            );
        }

        let noise_buffer = |label: &str, data: &[u32]| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::STORAGE,
            })
        };
        let sobol = noise_buffer("sssr sobol buffer", &blue_noise::sobol_table());
        let ranking_tile = noise_buffer("sssr ranking tile", &blue_noise::ranking_tile_table());
        let scrambling_tile =
            noise_buffer("sssr scrambling tile", &blue_noise::scrambling_tile_table());

        Ok(Self {
            device,
            queue,
            scratch,
            scratch_size,
            constants_bind_group,
            pipelines,
            sobol,
            ranking_tile,
            scrambling_tile,
            views: HashMap::new(),
        })
    }

    fn create_target(&self, label: &str, width: u32, height: u32, format: wgpu::TextureFormat)
        -> wgpu::TextureView {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    }

    fn create_storage_buffer(&self, label: &str, size: u64, indirect: bool) -> wgpu::Buffer {
        let mut usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        if indirect {
            usage |= wgpu::BufferUsages::INDIRECT;
        }
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    fn layout(&self, kernel: Kernel) -> &wgpu::BindGroupLayout {
        &self.pipelines[&kernel].bind_group_layout
    }
}

fn binding_type(kind: BindingKind) -> wgpu::BindingType {
    match kind {
        BindingKind::SampledTexture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        BindingKind::SampledCube => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::Cube,
            multisampled: false,
        },
        BindingKind::FilteringSampler => {
            wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)
        }
        BindingKind::StorageTextureRgba16Write => wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::Rgba16Float,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        BindingKind::StorageTextureR32Write => wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::R32Float,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        BindingKind::StorageTextureR32ReadWrite => wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::ReadWrite,
            format: wgpu::TextureFormat::R32Float,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        BindingKind::StorageBufferRead => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::StorageBufferReadWrite => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
    }
}

fn tex(binding: u32, view: &wgpu::TextureView) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: wgpu::BindingResource::TextureView(view),
    }
}

fn buf(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: wgpu::BindingResource::Buffer(buffer.as_entire_buffer_binding()),
    }
}

fn samp(binding: u32, sampler: &wgpu::Sampler) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: wgpu::BindingResource::Sampler(sampler),
    }
}

impl ResolveBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu Backend"
    }

    fn create_view(&mut self, setup: &ViewSetup<'_>) -> Result<()> {
        let bindings = match setup.bindings {
            ViewBindings::Wgpu(bindings) => bindings,
            _ => {
                return Err(Error::InvalidValue(
                    "view bindings do not target the wgpu backend".into(),
                ))
            }
        };

        let performance_counters = setup
            .flags
            .contains(CreateViewFlags::ENABLE_PERFORMANCE_COUNTERS);
        let timestamp_features = wgpu::Features::TIMESTAMP_QUERY
            | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS;
        if performance_counters && !self.device.features().contains(timestamp_features) {
            return Err(Error::InvalidOperation(
                "performance counters require a device with TIMESTAMP_QUERY and \
                 TIMESTAMP_QUERY_INSIDE_ENCODERS"
                    .into(),
            ));
        }

        let width = setup.width;
        let height = setup.height;
        let num_pixels = width as u64 * height as u64;
        let num_tiles = num_pixels.div_ceil(64);

        // Double-buffered history plus the single-buffered intermediates.
        let temporal = [
            self.create_target("sssr temporal result 0", width, height, wgpu::TextureFormat::Rgba16Float),
            self.create_target("sssr temporal result 1", width, height, wgpu::TextureFormat::Rgba16Float),
        ];
        let ray_lengths =
            self.create_target("sssr ray lengths", width, height, wgpu::TextureFormat::R32Float);
        let variance =
            self.create_target("sssr temporal variance", width, height, wgpu::TextureFormat::R32Float);
        let intermediate = self.create_target(
            "sssr denoiser intermediate",
            width,
            height,
            wgpu::TextureFormat::Rgba16Float,
        );

        let tile_list = self.create_storage_buffer("sssr tile list", num_tiles * 4, false);
        let ray_list = self.create_storage_buffer("sssr ray list", num_pixels * 4, false);
        let tile_counter = self.create_storage_buffer("sssr tile counter", 4, false);
        let ray_counter = self.create_storage_buffer("sssr ray counter", 4, false);
        let intersect_args = self.create_storage_buffer("sssr intersect indirect args", 12, true);
        let denoiser_args = self.create_storage_buffer("sssr denoiser indirect args", 12, true);

        let ping_normal = setup
            .flags
            .contains(CreateViewFlags::PING_PONG_NORMAL_BUFFERS);
        let ping_roughness = setup
            .flags
            .contains(CreateViewFlags::PING_PONG_ROUGHNESS_BUFFERS);

        let mut tables = Vec::with_capacity(2);
        for half in 0..2usize {
            // With ping-ponged inputs the current/history roles swap with
            // the frame parity; otherwise the application refreshes the
            // history copies itself.
            let (normal, normal_history) = if ping_normal && half == 1 {
                (&bindings.normals_history, &bindings.normals)
            } else {
                (&bindings.normals, &bindings.normals_history)
            };
            let (roughness, roughness_history) = if ping_roughness && half == 1 {
                (&bindings.roughness_history, &bindings.roughness)
            } else {
                (&bindings.roughness, &bindings.roughness_history)
            };
            let temporal_current = &temporal[half];
            let temporal_history = &temporal[1 - half];

            let bind_group = |kernel: Kernel, entries: &[wgpu::BindGroupEntry<'_>]| {
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(kernel.label()),
                    layout: self.layout(kernel),
                    entries,
                })
            };

            tables.push(PassTables {
                tile_classification: bind_group(
                    Kernel::TileClassification,
                    &[
                        tex(0, roughness),
                        buf(1, &tile_list),
                        buf(2, &ray_list),
                        buf(3, &tile_counter),
                        buf(4, &ray_counter),
                        tex(5, temporal_current),
                        tex(6, &ray_lengths),
                        tex(7, &variance),
                    ],
                ),
                prepare_indirect_args: bind_group(
                    Kernel::PrepareIndirectArgs,
                    &[
                        buf(0, &tile_counter),
                        buf(1, &ray_counter),
                        buf(2, &intersect_args),
                        buf(3, &denoiser_args),
                    ],
                ),
                intersect: bind_group(
                    Kernel::Intersect,
                    &[
                        tex(0, &bindings.scene),
                        tex(1, &bindings.depth_hierarchy),
                        tex(2, normal),
                        tex(3, roughness),
                        tex(4, &bindings.environment_map),
                        samp(5, &bindings.environment_sampler),
                        buf(6, &self.sobol),
                        buf(7, &self.ranking_tile),
                        buf(8, &self.scrambling_tile),
                        buf(9, &ray_list),
                        tex(10, temporal_current),
                        tex(11, &ray_lengths),
                        tex(12, &bindings.output),
                    ],
                ),
                spatial: bind_group(
                    Kernel::SpatialDenoise,
                    &[
                        tex(0, &bindings.depth_hierarchy),
                        tex(1, normal),
                        tex(2, roughness),
                        tex(3, temporal_current),
                        tex(4, &variance),
                        buf(5, &tile_list),
                        tex(6, &intermediate),
                        tex(7, &ray_lengths),
                    ],
                ),
                temporal: bind_group(
                    Kernel::TemporalDenoise,
                    &[
                        tex(0, normal),
                        tex(1, roughness),
                        tex(2, normal_history),
                        tex(3, roughness_history),
                        tex(4, &bindings.depth_hierarchy),
                        tex(5, &bindings.motion_vectors),
                        tex(6, &intermediate),
                        tex(7, temporal_history),
                        tex(8, &ray_lengths),
                        buf(9, &tile_list),
                        tex(10, temporal_current),
                        tex(11, &variance),
                    ],
                ),
                eaw_final: bind_group(
                    Kernel::EawDenoise,
                    &[
                        tex(0, normal),
                        tex(1, roughness),
                        tex(2, &bindings.depth_hierarchy),
                        buf(3, &tile_list),
                        tex(4, temporal_current),
                        tex(5, &bindings.output),
                    ],
                ),
                eaw_to_intermediate: bind_group(
                    Kernel::EawDenoise,
                    &[
                        tex(0, normal),
                        tex(1, roughness),
                        tex(2, &bindings.depth_hierarchy),
                        buf(3, &tile_list),
                        tex(4, temporal_current),
                        tex(5, &intermediate),
                    ],
                ),
                eaw_from_intermediate: bind_group(
                    Kernel::EawDenoise,
                    &[
                        tex(0, normal),
                        tex(1, roughness),
                        tex(2, &bindings.depth_hierarchy),
                        buf(3, &tile_list),
                        tex(4, &intermediate),
                        tex(5, temporal_current),
                    ],
                ),
            });
        }
        let tables: [PassTables; 2] = match tables.try_into() {
            Ok(tables) => tables,
            Err(_) => return Err(Error::Internal("descriptor table construction failed".into())),
        };

        let queries = if performance_counters {
            let query_count = setup.frames_in_flight * TIMESTAMPS_PER_FRAME;
            let query_set = self.device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("sssr timestamps"),
                ty: wgpu::QueryType::Timestamp,
                count: query_count,
            });
            let resolve_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("sssr timestamp resolve"),
                size: setup.frames_in_flight as u64 * QUERY_RESOLVE_ALIGNMENT,
                usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });
            let readback = (0..setup.frames_in_flight)
                .map(|_| ReadbackSlot {
                    buffer: self.device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some("sssr timestamp readback"),
                        size: TIMESTAMPS_PER_FRAME as u64 * 8,
                        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                        mapped_at_creation: false,
                    }),
                    state: Arc::new(Mutex::new(MapState::Idle)),
                })
                .collect();
            Some(ViewQueries {
                query_set,
                resolve_buffer,
                readback,
            })
        } else {
            None
        };

        self.views.insert(
            setup.slot,
            ViewData {
                tables,
                intersect_args,
                denoiser_args,
                queries,
            },
        );
        Ok(())
    }

    fn destroy_view(&mut self, slot: u32) {
        // Bind groups keep the underlying resources alive; dropping the
        // view data releases everything.
        self.views.remove(&slot);
    }

    fn write_scratch(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.scratch_size {
            return Err(Error::Internal(format!(
                "scratch write of {} bytes at offset {offset} exceeds buffer size {}",
                data.len(),
                self.scratch_size
            )));
        }
        // Queue writes land before any subsequently submitted encoder.
        self.queue.write_buffer(&self.scratch, offset, data);
        Ok(())
    }

    fn encode_pass(
        &mut self,
        stream: &mut CommandStream<'_>,
        slot: u32,
        pass: PassKind,
        buffer_half: u32,
        constants_offset: u64,
        dispatch: DispatchKind,
    ) -> Result<()> {
        let encoder = match stream {
            CommandStream::Wgpu(encoder) => &mut **encoder,
            _ => return Err(stream_mismatch("wgpu")),
        };
        let view = self
            .views
            .get(&slot)
            .ok_or_else(|| Error::Internal(format!("no view resources for slot {slot}")))?;

        let tables = &view.tables[(buffer_half & 1) as usize];
        let table = match pass {
            PassKind::TileClassification => &tables.tile_classification,
            PassKind::PrepareIndirectArgs => &tables.prepare_indirect_args,
            PassKind::Intersect => &tables.intersect,
            PassKind::SpatialDenoise => &tables.spatial,
            PassKind::TemporalDenoise => &tables.temporal,
            PassKind::EawDenoise => &tables.eaw_final,
            PassKind::EawDenoiseToIntermediate => &tables.eaw_to_intermediate,
            PassKind::EawDenoiseFromIntermediate => &tables.eaw_from_intermediate,
        };
        let pipeline = &self.pipelines[&pass.kernel()].pipeline;

        let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(pass.kernel().label()),
            timestamp_writes: None,
        });
        cpass.set_pipeline(pipeline);
        cpass.set_bind_group(0, table, &[]);
        cpass.set_bind_group(1, &self.constants_bind_group, &[constants_offset as u32]);
        match dispatch {
            DispatchKind::Direct { x, y, z } => cpass.dispatch_workgroups(x, y, z),
            DispatchKind::IndirectIntersect => {
                cpass.dispatch_workgroups_indirect(&view.intersect_args, 0)
            }
            DispatchKind::IndirectDenoise => {
                cpass.dispatch_workgroups_indirect(&view.denoiser_args, 0)
            }
        }
        Ok(())
    }

    fn encode_hazard(&mut self, _stream: &mut CommandStream<'_>, _slot: u32, hazard: Hazard) {
        // wgpu inserts barriers from tracked usage; the ordering point is
        // satisfied by pass boundaries.
        log::trace!("WgpuBackend: hazard {hazard:?} handled by usage tracking");
    }

    fn write_timestamp(&mut self, stream: &mut CommandStream<'_>, slot: u32, query_index: u32) {
        let CommandStream::Wgpu(encoder) = stream else {
            return;
        };
        if let Some(queries) = self.views.get(&slot).and_then(|v| v.queries.as_ref()) {
            encoder.write_timestamp(&queries.query_set, query_index);
        }
    }

    fn resolve_timestamps(
        &mut self,
        stream: &mut CommandStream<'_>,
        slot: u32,
        first_query: u32,
        query_count: u32,
    ) {
        let CommandStream::Wgpu(encoder) = stream else {
            return;
        };
        let Some(queries) = self.views.get(&slot).and_then(|v| v.queries.as_ref()) else {
            return;
        };
        let cursor = (first_query / TIMESTAMPS_PER_FRAME) as u64;
        let resolve_offset = cursor * QUERY_RESOLVE_ALIGNMENT;
        encoder.resolve_query_set(
            &queries.query_set,
            first_query..first_query + query_count,
            &queries.resolve_buffer,
            resolve_offset,
        );
        encoder.copy_buffer_to_buffer(
            &queries.resolve_buffer,
            resolve_offset,
            &queries.readback[cursor as usize].buffer,
            0,
            query_count as u64 * 8,
        );
    }

    fn read_timestamps(
        &mut self,
        slot: u32,
        first_query: u32,
        query_count: u32,
    ) -> Option<Vec<u64>> {
        let queries = self.views.get(&slot).and_then(|v| v.queries.as_ref())?;
        let cursor = (first_query / TIMESTAMPS_PER_FRAME) as usize;
        let readback = &queries.readback[cursor];

        {
            let mut state = readback
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if *state == MapState::Idle {
                *state = MapState::Pending;
                let shared = readback.state.clone();
                readback
                    .buffer
                    .slice(..)
                    .map_async(wgpu::MapMode::Read, move |result| {
                        let mut state = shared
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        *state = if result.is_ok() {
                            MapState::Ready
                        } else {
                            MapState::Idle
                        };
                    });
            }
        }

        // Drive the callback without blocking on unfinished GPU work.
        let _ = self.device.poll(wgpu::PollType::Poll);

        let mut state = readback
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != MapState::Ready {
            return None;
        }
        let values = {
            let mapped = readback.buffer.slice(..).get_mapped_range();
            let ticks: &[u64] = bytemuck::cast_slice(&mapped);
            ticks[..query_count as usize].to_vec()
        };
        readback.buffer.unmap();
        *state = MapState::Idle;
        Some(values)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
