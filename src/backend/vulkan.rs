//! Vulkan backend implementation using ash.
//!
//! The caller owns the instance, device and command buffers; this backend
//! creates the per-view images, buffers, descriptor sets and pipelines, and
//! records passes and barriers into the caller's command buffer. Kernels
//! are translated from WGSL to SPIR-V through naga at context creation.

use std::collections::HashMap;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::blue_noise;
use crate::error::{Error, Result};
use crate::pipeline::{CreateViewFlags, PASS_CONSTANTS_SIZE};
use crate::queries::TIMESTAMPS_PER_FRAME;
use crate::shaders::{Kernel, KERNELS};

use super::{
    kernel_bindings, stream_mismatch, BindingKind, CommandStream, DispatchKind, Hazard, PassKind,
    ResolveBackend, ViewBindings, ViewSetup, VulkanViewBindings,
};

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
}

struct VkImage {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
}

struct KernelPipeline {
    module: vk::ShaderModule,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

/// Descriptor sets of one double-buffer half.
#[derive(Clone, Copy)]
struct PassTables {
    tile_classification: vk::DescriptorSet,
    prepare_indirect_args: vk::DescriptorSet,
    intersect: vk::DescriptorSet,
    spatial: vk::DescriptorSet,
    temporal: vk::DescriptorSet,
    eaw_final: vk::DescriptorSet,
    eaw_to_intermediate: vk::DescriptorSet,
    eaw_from_intermediate: vk::DescriptorSet,
}

struct ViewData {
    descriptor_pool: vk::DescriptorPool,
    tables: [PassTables; 2],
    temporal: [VkImage; 2],
    ray_lengths: VkImage,
    variance: VkImage,
    intermediate: VkImage,
    tile_list: VkBuffer,
    ray_list: VkBuffer,
    tile_counter: VkBuffer,
    ray_counter: VkBuffer,
    intersect_args: VkBuffer,
    denoiser_args: VkBuffer,
    query_pool: vk::QueryPool,
}

/// What a descriptor write points at.
enum Resource {
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    Sampler(vk::Sampler),
    Buffer(vk::Buffer),
}

fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::SampledTexture | BindingKind::SampledCube => vk::DescriptorType::SAMPLED_IMAGE,
        BindingKind::FilteringSampler => vk::DescriptorType::SAMPLER,
        BindingKind::StorageTextureRgba16Write
        | BindingKind::StorageTextureR32Write
        | BindingKind::StorageTextureR32ReadWrite => vk::DescriptorType::STORAGE_IMAGE,
        BindingKind::StorageBufferRead | BindingKind::StorageBufferReadWrite => {
            vk::DescriptorType::STORAGE_BUFFER
        }
    }
}

fn compile_kernel(kernel: Kernel) -> Result<Vec<u32>> {
    let source = kernel.source();
    let module = naga::front::wgsl::parse_str(&source)
        .map_err(|e| Error::Internal(format!("{}: WGSL parse error: {e}", kernel.label())))?;
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| Error::Internal(format!("{}: validation error: {e:?}", kernel.label())))?;
    naga::back::spv::write_vec(&module, &info, &naga::back::spv::Options::default(), None)
        .map_err(|e| Error::Internal(format!("{}: SPIR-V translation error: {e}", kernel.label())))
}

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Vulkan-based resolve backend.
pub struct VulkanBackend {
    device: ash::Device,
    allocator: Mutex<Allocator>,
    pipelines: HashMap<Kernel, KernelPipeline>,
    constants_set_layout: vk::DescriptorSetLayout,
    constants_pool: vk::DescriptorPool,
    constants_set: vk::DescriptorSet,
    scratch: VkBuffer,
    scratch_size: u64,
    sobol: VkBuffer,
    ranking_tile: VkBuffer,
    scrambling_tile: VkBuffer,
    views: HashMap<u32, ViewData>,
}

impl VulkanBackend {
    pub fn new(
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        scratch_size: u64,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance,
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| Error::Internal(format!("failed to create Vulkan allocator: {e}")))?;

        let mut backend = Self {
            device,
            allocator: Mutex::new(allocator),
            pipelines: HashMap::new(),
            constants_set_layout: vk::DescriptorSetLayout::null(),
            constants_pool: vk::DescriptorPool::null(),
            constants_set: vk::DescriptorSet::null(),
            scratch: VkBuffer {
                buffer: vk::Buffer::null(),
                allocation: None,
            },
            scratch_size,
            sobol: VkBuffer {
                buffer: vk::Buffer::null(),
                allocation: None,
            },
            ranking_tile: VkBuffer {
                buffer: vk::Buffer::null(),
                allocation: None,
            },
            scrambling_tile: VkBuffer {
                buffer: vk::Buffer::null(),
                allocation: None,
            },
            views: HashMap::new(),
        };

        backend.scratch = backend.create_buffer(
            "sssr scratch ring",
            scratch_size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;
        backend.sobol = backend.create_noise_buffer("sssr sobol buffer", &blue_noise::sobol_table())?;
        backend.ranking_tile =
            backend.create_noise_buffer("sssr ranking tile", &blue_noise::ranking_tile_table())?;
        backend.scrambling_tile = backend
            .create_noise_buffer("sssr scrambling tile", &blue_noise::scrambling_tile_table())?;

        backend.create_constants_set()?;
        backend.create_pipelines()?;

        Ok(backend)
    }

    fn create_buffer(
        &self,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<VkBuffer> {
        let info = vk::BufferCreateInfo {
            size,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe { self.device.create_buffer(&info, None) }
            .map_err(|e| Error::Internal(format!("failed to create buffer {name}: {e}")))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| Error::OutOfMemory(format!("failed to allocate {name}: {e}")))?;
        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .map_err(|e| Error::Internal(format!("failed to bind memory for {name}: {e}")))?;
        Ok(VkBuffer {
            buffer,
            allocation: Some(allocation),
        })
    }

    fn create_noise_buffer(&self, name: &str, data: &[u32]) -> Result<VkBuffer> {
        let mut buffer = self.create_buffer(
            name,
            (data.len() * 4) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;
        let allocation = buffer
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| Error::Internal(format!("{name} is not host-visible")))?;
        allocation[..data.len() * 4].copy_from_slice(bytemuck::cast_slice(data));
        Ok(buffer)
    }

    fn create_image(&self, name: &str, width: u32, height: u32, format: vk::Format)
        -> Result<VkImage> {
        let info = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = unsafe { self.device.create_image(&info, None) }
            .map_err(|e| Error::Internal(format!("failed to create image {name}: {e}")))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| Error::OutOfMemory(format!("failed to allocate {name}: {e}")))?;
        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .map_err(|e| Error::Internal(format!("failed to bind memory for {name}: {e}")))?;

        let view_info = vk::ImageViewCreateInfo {
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            subresource_range: COLOR_RANGE,
            ..Default::default()
        };
        let view = unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(|e| Error::Internal(format!("failed to create view for {name}: {e}")))?;

        Ok(VkImage {
            image,
            view,
            allocation: Some(allocation),
        })
    }

    fn create_constants_set(&mut self) -> Result<()> {
        let binding = vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            ..Default::default()
        };
        let layout_info = vk::DescriptorSetLayoutCreateInfo {
            binding_count: 1,
            p_bindings: &binding,
            ..Default::default()
        };
        self.constants_set_layout =
            unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
                .map_err(|e| Error::Internal(format!("failed to create constants layout: {e}")))?;

        let pool_size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            descriptor_count: 1,
        };
        let pool_info = vk::DescriptorPoolCreateInfo {
            max_sets: 1,
            pool_size_count: 1,
            p_pool_sizes: &pool_size,
            ..Default::default()
        };
        self.constants_pool = unsafe { self.device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| Error::Internal(format!("failed to create constants pool: {e}")))?;

        let alloc_info = vk::DescriptorSetAllocateInfo {
            descriptor_pool: self.constants_pool,
            descriptor_set_count: 1,
            p_set_layouts: &self.constants_set_layout,
            ..Default::default()
        };
        self.constants_set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| Error::Internal(format!("failed to allocate constants set: {e}")))?[0];

        let buffer_info = vk::DescriptorBufferInfo {
            buffer: self.scratch.buffer,
            offset: 0,
            range: PASS_CONSTANTS_SIZE,
        };
        let write = vk::WriteDescriptorSet {
            dst_set: self.constants_set,
            dst_binding: 0,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            p_buffer_info: &buffer_info,
            ..Default::default()
        };
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn create_pipelines(&mut self) -> Result<()> {
        let entry_point = c"main";
        for kernel in KERNELS {
            let spirv = compile_kernel(kernel)?;
            let module_info = vk::ShaderModuleCreateInfo {
                code_size: spirv.len() * 4,
                p_code: spirv.as_ptr(),
                ..Default::default()
            };
            let module = unsafe { self.device.create_shader_module(&module_info, None) }
                .map_err(|e| {
                    Error::Internal(format!("{}: shader module creation failed: {e}", kernel.label()))
                })?;

            let bindings: Vec<vk::DescriptorSetLayoutBinding> = kernel_bindings(kernel)
                .iter()
                .enumerate()
                .map(|(i, kind)| vk::DescriptorSetLayoutBinding {
                    binding: i as u32,
                    descriptor_type: descriptor_type(*kind),
                    descriptor_count: 1,
                    stage_flags: vk::ShaderStageFlags::COMPUTE,
                    ..Default::default()
                })
                .collect();
            let layout_info = vk::DescriptorSetLayoutCreateInfo {
                binding_count: bindings.len() as u32,
                p_bindings: bindings.as_ptr(),
                ..Default::default()
            };
            let set_layout =
                unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }.map_err(
                    |e| Error::Internal(format!("{}: set layout creation failed: {e}", kernel.label())),
                )?;

            let set_layouts = [set_layout, self.constants_set_layout];
            let pipeline_layout_info = vk::PipelineLayoutCreateInfo {
                set_layout_count: set_layouts.len() as u32,
                p_set_layouts: set_layouts.as_ptr(),
                ..Default::default()
            };
            let pipeline_layout =
                unsafe { self.device.create_pipeline_layout(&pipeline_layout_info, None) }.map_err(
                    |e| Error::Internal(format!("{}: pipeline layout creation failed: {e}", kernel.label())),
                )?;

            let stage = vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::COMPUTE,
                module,
                p_name: entry_point.as_ptr(),
                ..Default::default()
            };
            let pipeline_info = vk::ComputePipelineCreateInfo {
                stage,
                layout: pipeline_layout,
                ..Default::default()
            };
            let pipeline = unsafe {
                self.device.create_compute_pipelines(
                    vk::PipelineCache::null(),
                    &[pipeline_info],
                    None,
                )
            }
            .map_err(|(_, e)| {
                Error::Internal(format!("{}: pipeline creation failed: {e}", kernel.label()))
            })?[0];

            self.pipelines.insert(
                kernel,
                KernelPipeline {
                    module,
                    set_layout,
                    pipeline_layout,
                    pipeline,
                },
            );
        }
        Ok(())
    }

    /// Points every binding of `set` at its resource.
    fn write_set(&self, set: vk::DescriptorSet, kernel: Kernel, resources: &[Resource]) {
        let kinds = kernel_bindings(kernel);
        debug_assert_eq!(kinds.len(), resources.len());

        // Preallocated so the pointers handed to the writes stay stable.
        let mut image_infos = Vec::with_capacity(kinds.len());
        let mut buffer_infos = Vec::with_capacity(kinds.len());
        let mut writes = Vec::with_capacity(kinds.len());

        for (binding, (kind, resource)) in kinds.iter().zip(resources).enumerate() {
            let mut write = vk::WriteDescriptorSet {
                dst_set: set,
                dst_binding: binding as u32,
                descriptor_count: 1,
                descriptor_type: descriptor_type(*kind),
                ..Default::default()
            };
            match resource {
                Resource::Image { view, layout } => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: *view,
                        image_layout: *layout,
                    });
                    write.p_image_info = &image_infos[image_infos.len() - 1];
                }
                Resource::Sampler(sampler) => {
                    image_infos.push(vk::DescriptorImageInfo {
                        sampler: *sampler,
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    });
                    write.p_image_info = &image_infos[image_infos.len() - 1];
                }
                Resource::Buffer(buffer) => {
                    buffer_infos.push(vk::DescriptorBufferInfo {
                        buffer: *buffer,
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    });
                    write.p_buffer_info = &buffer_infos[buffer_infos.len() - 1];
                }
            }
            writes.push(write);
        }

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }

    fn destroy_buffer(&self, buffer: &mut VkBuffer) {
        if let Some(allocation) = buffer.allocation.take() {
            let _ = self.allocator.lock().free(allocation);
        }
        if buffer.buffer != vk::Buffer::null() {
            unsafe { self.device.destroy_buffer(buffer.buffer, None) };
            buffer.buffer = vk::Buffer::null();
        }
    }

    fn destroy_image(&self, image: &mut VkImage) {
        if let Some(allocation) = image.allocation.take() {
            let _ = self.allocator.lock().free(allocation);
        }
        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.image, None);
        }
    }

    fn destroy_view_data(&self, data: &mut ViewData) {
        for image in &mut data.temporal {
            self.destroy_image(image);
        }
        self.destroy_image(&mut data.ray_lengths);
        self.destroy_image(&mut data.variance);
        self.destroy_image(&mut data.intermediate);
        self.destroy_buffer(&mut data.tile_list);
        self.destroy_buffer(&mut data.ray_list);
        self.destroy_buffer(&mut data.tile_counter);
        self.destroy_buffer(&mut data.ray_counter);
        self.destroy_buffer(&mut data.intersect_args);
        self.destroy_buffer(&mut data.denoiser_args);
        unsafe {
            // Frees all sets allocated from it.
            self.device.destroy_descriptor_pool(data.descriptor_pool, None);
            if data.query_pool != vk::QueryPool::null() {
                self.device.destroy_query_pool(data.query_pool, None);
            }
        }
    }
}

impl ResolveBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan Backend"
    }

    fn create_view(&mut self, setup: &ViewSetup<'_>) -> Result<()> {
        let bindings = match setup.bindings {
            ViewBindings::Vulkan(bindings) => *bindings,
            _ => {
                return Err(Error::InvalidValue(
                    "view bindings do not target the Vulkan backend".into(),
                ))
            }
        };
        validate_bindings(&bindings)?;

        let width = setup.width;
        let height = setup.height;
        let num_pixels = width as u64 * height as u64;
        let num_tiles = num_pixels.div_ceil(64);

        let temporal = [
            self.create_image("sssr temporal result 0", width, height, vk::Format::R16G16B16A16_SFLOAT)?,
            self.create_image("sssr temporal result 1", width, height, vk::Format::R16G16B16A16_SFLOAT)?,
        ];
        let ray_lengths =
            self.create_image("sssr ray lengths", width, height, vk::Format::R32_SFLOAT)?;
        let variance =
            self.create_image("sssr temporal variance", width, height, vk::Format::R32_SFLOAT)?;
        let intermediate = self.create_image(
            "sssr denoiser intermediate",
            width,
            height,
            vk::Format::R16G16B16A16_SFLOAT,
        )?;

        let storage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;
        let tile_list =
            self.create_buffer("sssr tile list", num_tiles * 4, storage, MemoryLocation::GpuOnly)?;
        let ray_list =
            self.create_buffer("sssr ray list", num_pixels * 4, storage, MemoryLocation::GpuOnly)?;
        let tile_counter =
            self.create_buffer("sssr tile counter", 4, storage, MemoryLocation::GpuOnly)?;
        let ray_counter =
            self.create_buffer("sssr ray counter", 4, storage, MemoryLocation::GpuOnly)?;
        let indirect = storage | vk::BufferUsageFlags::INDIRECT_BUFFER;
        let intersect_args =
            self.create_buffer("sssr intersect indirect args", 12, indirect, MemoryLocation::GpuOnly)?;
        let denoiser_args =
            self.create_buffer("sssr denoiser indirect args", 12, indirect, MemoryLocation::GpuOnly)?;

        // Bring the internal images into GENERAL and clear every counter
        // before the first resolve touches them.
        unsafe {
            let image_barrier = |image: vk::Image| vk::ImageMemoryBarrier {
                src_access_mask: vk::AccessFlags::empty(),
                dst_access_mask: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::GENERAL,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image,
                subresource_range: COLOR_RANGE,
                ..Default::default()
            };
            let barriers = [
                image_barrier(temporal[0].image),
                image_barrier(temporal[1].image),
                image_barrier(ray_lengths.image),
                image_barrier(variance.image),
                image_barrier(intermediate.image),
            ];
            self.device.cmd_pipeline_barrier(
                bindings.upload_command_buffer,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
            for buffer in [
                tile_list.buffer,
                ray_list.buffer,
                tile_counter.buffer,
                ray_counter.buffer,
                intersect_args.buffer,
                denoiser_args.buffer,
            ] {
                self.device.cmd_fill_buffer(
                    bindings.upload_command_buffer,
                    buffer,
                    0,
                    vk::WHOLE_SIZE,
                    0,
                );
            }
        }

        // One pool per view so destruction frees all of its sets at once.
        let table_kernels = [
            Kernel::TileClassification,
            Kernel::PrepareIndirectArgs,
            Kernel::Intersect,
            Kernel::SpatialDenoise,
            Kernel::TemporalDenoise,
            Kernel::EawDenoise,
            Kernel::EawDenoise,
            Kernel::EawDenoise,
        ];
        let mut type_counts: HashMap<vk::DescriptorType, u32> = HashMap::new();
        for kernel in table_kernels {
            for kind in kernel_bindings(kernel) {
                *type_counts.entry(descriptor_type(*kind)).or_default() += 2;
            }
        }
        let pool_sizes: Vec<vk::DescriptorPoolSize> = type_counts
            .into_iter()
            .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo {
            max_sets: table_kernels.len() as u32 * 2,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        let descriptor_pool = unsafe { self.device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| Error::OutOfMemory(format!("failed to create descriptor pool: {e}")))?;

        let set_layouts: Vec<vk::DescriptorSetLayout> = table_kernels
            .iter()
            .chain(table_kernels.iter())
            .map(|kernel| self.pipelines[kernel].set_layout)
            .collect();
        let alloc_info = vk::DescriptorSetAllocateInfo {
            descriptor_pool,
            descriptor_set_count: set_layouts.len() as u32,
            p_set_layouts: set_layouts.as_ptr(),
            ..Default::default()
        };
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| Error::OutOfMemory(format!("failed to allocate descriptor sets: {e}")))?;

        let ping_normal = setup
            .flags
            .contains(CreateViewFlags::PING_PONG_NORMAL_BUFFERS);
        let ping_roughness = setup
            .flags
            .contains(CreateViewFlags::PING_PONG_ROUGHNESS_BUFFERS);

        let sampled = |view: vk::ImageView| Resource::Image {
            view,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        // Internal images live in GENERAL for their whole lifetime, whether
        // a pass samples or stores them; the caller's output does too.
        let internal_image = |view: vk::ImageView| Resource::Image {
            view,
            layout: vk::ImageLayout::GENERAL,
        };

        let mut tables = [PassTables {
            tile_classification: vk::DescriptorSet::null(),
            prepare_indirect_args: vk::DescriptorSet::null(),
            intersect: vk::DescriptorSet::null(),
            spatial: vk::DescriptorSet::null(),
            temporal: vk::DescriptorSet::null(),
            eaw_final: vk::DescriptorSet::null(),
            eaw_to_intermediate: vk::DescriptorSet::null(),
            eaw_from_intermediate: vk::DescriptorSet::null(),
        }; 2];

        for half in 0..2usize {
            let base = half * table_kernels.len();
            let table = &mut tables[half];
            table.tile_classification = sets[base];
            table.prepare_indirect_args = sets[base + 1];
            table.intersect = sets[base + 2];
            table.spatial = sets[base + 3];
            table.temporal = sets[base + 4];
            table.eaw_final = sets[base + 5];
            table.eaw_to_intermediate = sets[base + 6];
            table.eaw_from_intermediate = sets[base + 7];

            let (normal, normal_history) = if ping_normal && half == 1 {
                (bindings.normals_history, bindings.normals)
            } else {
                (bindings.normals, bindings.normals_history)
            };
            let (roughness, roughness_history) = if ping_roughness && half == 1 {
                (bindings.roughness_history, bindings.roughness)
            } else {
                (bindings.roughness, bindings.roughness_history)
            };
            let temporal_current = temporal[half].view;
            let temporal_history = temporal[1 - half].view;

            self.write_set(
                table.tile_classification,
                Kernel::TileClassification,
                &[
                    sampled(roughness),
                    Resource::Buffer(tile_list.buffer),
                    Resource::Buffer(ray_list.buffer),
                    Resource::Buffer(tile_counter.buffer),
                    Resource::Buffer(ray_counter.buffer),
                    internal_image(temporal_current),
                    internal_image(ray_lengths.view),
                    internal_image(variance.view),
                ],
            );
            self.write_set(
                table.prepare_indirect_args,
                Kernel::PrepareIndirectArgs,
                &[
                    Resource::Buffer(tile_counter.buffer),
                    Resource::Buffer(ray_counter.buffer),
                    Resource::Buffer(intersect_args.buffer),
                    Resource::Buffer(denoiser_args.buffer),
                ],
            );
            self.write_set(
                table.intersect,
                Kernel::Intersect,
                &[
                    sampled(bindings.scene),
                    sampled(bindings.depth_hierarchy),
                    sampled(normal),
                    sampled(roughness),
                    sampled(bindings.environment_map),
                    Resource::Sampler(bindings.environment_sampler),
                    Resource::Buffer(self.sobol.buffer),
                    Resource::Buffer(self.ranking_tile.buffer),
                    Resource::Buffer(self.scrambling_tile.buffer),
                    Resource::Buffer(ray_list.buffer),
                    internal_image(temporal_current),
                    internal_image(ray_lengths.view),
                    internal_image(bindings.output),
                ],
            );
            self.write_set(
                table.spatial,
                Kernel::SpatialDenoise,
                &[
                    sampled(bindings.depth_hierarchy),
                    sampled(normal),
                    sampled(roughness),
                    internal_image(temporal_current),
                    internal_image(variance.view),
                    Resource::Buffer(tile_list.buffer),
                    internal_image(intermediate.view),
                    internal_image(ray_lengths.view),
                ],
            );
            self.write_set(
                table.temporal,
                Kernel::TemporalDenoise,
                &[
                    sampled(normal),
                    sampled(roughness),
                    sampled(normal_history),
                    sampled(roughness_history),
                    sampled(bindings.depth_hierarchy),
                    sampled(bindings.motion_vectors),
                    internal_image(intermediate.view),
                    internal_image(temporal_history),
                    internal_image(ray_lengths.view),
                    Resource::Buffer(tile_list.buffer),
                    internal_image(temporal_current),
                    internal_image(variance.view),
                ],
            );
            let eaw = |input: vk::ImageView, output: vk::ImageView| {
                [
                    sampled(normal),
                    sampled(roughness),
                    sampled(bindings.depth_hierarchy),
                    Resource::Buffer(tile_list.buffer),
                    internal_image(input),
                    internal_image(output),
                ]
            };
            self.write_set(
                table.eaw_final,
                Kernel::EawDenoise,
                &eaw(temporal_current, bindings.output),
            );
            self.write_set(
                table.eaw_to_intermediate,
                Kernel::EawDenoise,
                &eaw(temporal_current, intermediate.view),
            );
            self.write_set(
                table.eaw_from_intermediate,
                Kernel::EawDenoise,
                &eaw(intermediate.view, temporal_current),
            );
        }

        let query_pool = if setup
            .flags
            .contains(CreateViewFlags::ENABLE_PERFORMANCE_COUNTERS)
        {
            let query_count = setup.frames_in_flight * TIMESTAMPS_PER_FRAME;
            let pool_info = vk::QueryPoolCreateInfo {
                query_type: vk::QueryType::TIMESTAMP,
                query_count,
                ..Default::default()
            };
            let pool = unsafe { self.device.create_query_pool(&pool_info, None) }
                .map_err(|e| Error::OutOfMemory(format!("failed to create query pool: {e}")))?;
            // The whole pool must be reset before its first use.
            unsafe {
                self.device.cmd_reset_query_pool(
                    bindings.upload_command_buffer,
                    pool,
                    0,
                    query_count,
                );
            }
            pool
        } else {
            vk::QueryPool::null()
        };

        self.views.insert(
            setup.slot,
            ViewData {
                descriptor_pool,
                tables,
                temporal,
                ray_lengths,
                variance,
                intermediate,
                tile_list,
                ray_list,
                tile_counter,
                ray_counter,
                intersect_args,
                denoiser_args,
                query_pool,
            },
        );
        Ok(())
    }

    fn destroy_view(&mut self, slot: u32) {
        if let Some(mut data) = self.views.remove(&slot) {
            self.destroy_view_data(&mut data);
        }
    }

    fn write_scratch(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.scratch_size {
            return Err(Error::Internal(format!(
                "scratch write of {} bytes at offset {offset} exceeds buffer size {}",
                data.len(),
                self.scratch_size
            )));
        }
        let mapped = self
            .scratch
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| Error::Internal("scratch buffer is not host-visible".into()))?;
        mapped[offset as usize..offset as usize + data.len()].copy_from_slice(data);
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
        let cmd = match stream {
            CommandStream::Vulkan(cmd) => *cmd,
            _ => return Err(stream_mismatch("Vulkan")),
        };
        let view = self
            .views
            .get(&slot)
            .ok_or_else(|| Error::Internal(format!("no view resources for slot {slot}")))?;

        let tables = &view.tables[(buffer_half & 1) as usize];
        let table = match pass {
            PassKind::TileClassification => tables.tile_classification,
            PassKind::PrepareIndirectArgs => tables.prepare_indirect_args,
            PassKind::Intersect => tables.intersect,
            PassKind::SpatialDenoise => tables.spatial,
            PassKind::TemporalDenoise => tables.temporal,
            PassKind::EawDenoise => tables.eaw_final,
            PassKind::EawDenoiseToIntermediate => tables.eaw_to_intermediate,
            PassKind::EawDenoiseFromIntermediate => tables.eaw_from_intermediate,
        };
        let pipeline = &self.pipelines[&pass.kernel()];

        unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.pipeline_layout,
                0,
                &[table, self.constants_set],
                &[constants_offset as u32],
            );
            match dispatch {
                DispatchKind::Direct { x, y, z } => self.device.cmd_dispatch(cmd, x, y, z),
                DispatchKind::IndirectIntersect => {
                    self.device
                        .cmd_dispatch_indirect(cmd, view.intersect_args.buffer, 0)
                }
                DispatchKind::IndirectDenoise => {
                    self.device
                        .cmd_dispatch_indirect(cmd, view.denoiser_args.buffer, 0)
                }
            }
        }
        Ok(())
    }

    fn encode_hazard(&mut self, stream: &mut CommandStream<'_>, _slot: u32, hazard: Hazard) {
        let CommandStream::Vulkan(cmd) = stream else {
            return;
        };
        let (src_access, dst_access, dst_stage) = match hazard {
            Hazard::ClassificationOutputs => (
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                vk::PipelineStageFlags::COMPUTE_SHADER,
            ),
            Hazard::IndirectArguments => (
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::INDIRECT_COMMAND_READ | vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::COMPUTE_SHADER,
            ),
            Hazard::IntersectionOutputs
            | Hazard::SpatialOutputs
            | Hazard::TemporalOutputs
            | Hazard::EawOutputs => (
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::COMPUTE_SHADER,
            ),
        };
        let barrier = vk::MemoryBarrier {
            src_access_mask: src_access,
            dst_access_mask: dst_access,
            ..Default::default()
        };
        unsafe {
            self.device.cmd_pipeline_barrier(
                *cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    fn write_timestamp(&mut self, stream: &mut CommandStream<'_>, slot: u32, query_index: u32) {
        let CommandStream::Vulkan(cmd) = stream else {
            return;
        };
        let Some(view) = self.views.get(&slot) else {
            return;
        };
        if view.query_pool == vk::QueryPool::null() {
            return;
        }
        unsafe {
            // Re-recording a slot implies its previous results were already
            // harvested, so the range can be reset in place.
            if query_index % TIMESTAMPS_PER_FRAME == 0 {
                self.device.cmd_reset_query_pool(
                    *cmd,
                    view.query_pool,
                    query_index,
                    TIMESTAMPS_PER_FRAME,
                );
            }
            self.device.cmd_write_timestamp(
                *cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                view.query_pool,
                query_index,
            );
        }
    }

    fn resolve_timestamps(
        &mut self,
        _stream: &mut CommandStream<'_>,
        _slot: u32,
        _first_query: u32,
        _query_count: u32,
    ) {
        // Results are fetched straight from the query pool on readback.
    }

    fn read_timestamps(
        &mut self,
        slot: u32,
        first_query: u32,
        query_count: u32,
    ) -> Option<Vec<u64>> {
        let view = self.views.get(&slot)?;
        if view.query_pool == vk::QueryPool::null() {
            return None;
        }
        let mut data = vec![0u64; query_count as usize];
        let result = unsafe {
            self.device.get_query_pool_results(
                view.query_pool,
                first_query,
                &mut data,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        match result {
            Ok(()) => Some(data),
            // Not ready yet; the caller treats this as "no data".
            Err(_) => None,
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn validate_bindings(bindings: &VulkanViewBindings) -> Result<()> {
    let required = [
        ("scene", bindings.scene == vk::ImageView::null()),
        ("depth_hierarchy", bindings.depth_hierarchy == vk::ImageView::null()),
        ("motion_vectors", bindings.motion_vectors == vk::ImageView::null()),
        ("normals", bindings.normals == vk::ImageView::null()),
        ("roughness", bindings.roughness == vk::ImageView::null()),
        ("normals_history", bindings.normals_history == vk::ImageView::null()),
        ("roughness_history", bindings.roughness_history == vk::ImageView::null()),
        ("environment_map", bindings.environment_map == vk::ImageView::null()),
        ("output", bindings.output == vk::ImageView::null()),
    ];
    for (name, missing) in required {
        if missing {
            return Err(Error::InvalidValue(format!(
                "required view binding {name} is null"
            )));
        }
    }
    if bindings.environment_sampler == vk::Sampler::null() {
        return Err(Error::InvalidValue(
            "required view binding environment_sampler is null".into(),
        ));
    }
    if bindings.upload_command_buffer == vk::CommandBuffer::null() {
        return Err(Error::InvalidValue(
            "upload_command_buffer must be a recording command buffer".into(),
        ));
    }
    Ok(())
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let slots: Vec<u32> = self.views.keys().copied().collect();
        for slot in slots {
            if let Some(mut data) = self.views.remove(&slot) {
                self.destroy_view_data(&mut data);
            }
        }

        let mut scratch = std::mem::replace(
            &mut self.scratch,
            VkBuffer {
                buffer: vk::Buffer::null(),
                allocation: None,
            },
        );
        self.destroy_buffer(&mut scratch);
        let mut sobol = std::mem::replace(
            &mut self.sobol,
            VkBuffer {
                buffer: vk::Buffer::null(),
                allocation: None,
            },
        );
        self.destroy_buffer(&mut sobol);
        let mut ranking = std::mem::replace(
            &mut self.ranking_tile,
            VkBuffer {
                buffer: vk::Buffer::null(),
                allocation: None,
            },
        );
        self.destroy_buffer(&mut ranking);
        let mut scrambling = std::mem::replace(
            &mut self.scrambling_tile,
            VkBuffer {
                buffer: vk::Buffer::null(),
                allocation: None,
            },
        );
        self.destroy_buffer(&mut scrambling);

        unsafe {
            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device
                    .destroy_pipeline_layout(pipeline.pipeline_layout, None);
                self.device
                    .destroy_descriptor_set_layout(pipeline.set_layout, None);
                self.device.destroy_shader_module(pipeline.module, None);
            }
            self.device.destroy_descriptor_pool(self.constants_pool, None);
            self.device
                .destroy_descriptor_set_layout(self.constants_set_layout, None);
        }
    }
}
