//! wgpu smoke tests.
//!
//! These create a headless wgpu device and drive a real resolve through the
//! wgpu backend, exercising pipeline creation, bind group layouts and the
//! full encode path. They skip when no compatible adapter is available so
//! CI machines without a GPU still pass.

#![cfg(feature = "wgpu-backend")]

use std::sync::Arc;

use stochastic_reflections::{
    BackendDescriptor, CommandStream, Context, ContextDescriptor, CreateReflectionViewInfo,
    CreateViewFlags, EawPassCount, ResolveDescriptor, ResolveFlags, ViewBindings,
    WgpuViewBindings, API_VERSION,
};

struct Gpu {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

fn request_gpu() -> Option<Gpu> {
    let _ = env_logger::builder().is_test(true).try_init();

    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        flags: wgpu::InstanceFlags::default(),
        backend_options: wgpu::BackendOptions::default(),
        memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
    .ok()?;
    let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("sssr smoke test device"),
        required_features: wgpu::Features::empty(),
        required_limits: wgpu::Limits::default(),
        memory_hints: wgpu::MemoryHints::default(),
        trace: wgpu::Trace::Off,
    }))
    .ok()?;
    Some(Gpu {
        device: Arc::new(device),
        queue: Arc::new(queue),
    })
}

fn color_target(gpu: &Gpu, label: &str, format: wgpu::TextureFormat, storage: bool)
    -> wgpu::TextureView {
    let mut usage = wgpu::TextureUsages::TEXTURE_BINDING;
    if storage {
        usage |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    gpu.device
        .create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: 128,
                height: 128,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        })
        .create_view(&wgpu::TextureViewDescriptor::default())
}

fn cube_map(gpu: &Gpu) -> wgpu::TextureView {
    gpu.device
        .create_texture(&wgpu::TextureDescriptor {
            label: Some("smoke environment map"),
            size: wgpu::Extent3d {
                width: 32,
                height: 32,
                depth_or_array_layers: 6,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba16Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        })
        .create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(wgpu::TextureViewDimension::Cube),
            ..Default::default()
        })
}

fn view_bindings(gpu: &Gpu) -> WgpuViewBindings {
    WgpuViewBindings {
        scene: color_target(gpu, "smoke scene", wgpu::TextureFormat::Rgba16Float, false),
        depth_hierarchy: color_target(gpu, "smoke depth", wgpu::TextureFormat::R32Float, false),
        motion_vectors: color_target(gpu, "smoke motion", wgpu::TextureFormat::Rg16Float, false),
        normals: color_target(gpu, "smoke normals", wgpu::TextureFormat::Rgba16Float, false),
        roughness: color_target(gpu, "smoke roughness", wgpu::TextureFormat::R32Float, false),
        normals_history: color_target(
            gpu,
            "smoke normals history",
            wgpu::TextureFormat::Rgba16Float,
            false,
        ),
        roughness_history: color_target(
            gpu,
            "smoke roughness history",
            wgpu::TextureFormat::R32Float,
            false,
        ),
        environment_map: cube_map(gpu),
        environment_sampler: gpu.device.create_sampler(&wgpu::SamplerDescriptor::default()),
        output: color_target(gpu, "smoke output", wgpu::TextureFormat::Rgba16Float, true),
    }
}

fn smoke_context(gpu: &Gpu) -> Context {
    Context::new(ContextDescriptor {
        api_version: API_VERSION,
        max_reflection_view_count: 2,
        frame_count_before_reuse: 2,
        scratch_buffer_size: 64 * 1024,
        logging_callback: Some(Box::new(|message| eprintln!("{message}"))),
        backend: BackendDescriptor::Wgpu {
            device: gpu.device.clone(),
            queue: gpu.queue.clone(),
        },
    })
    .unwrap()
}

fn resolve_frames(gpu: &Gpu, context: &mut Context, descriptor: &ResolveDescriptor, frames: u32) {
    let view = context
        .create_reflection_view(&CreateReflectionViewInfo {
            output_width: 128,
            output_height: 128,
            flags: CreateViewFlags::empty(),
            bindings: ViewBindings::Wgpu(view_bindings(gpu)),
        })
        .unwrap();

    for _ in 0..frames {
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("smoke resolve"),
            });
        context
            .encode_resolve_reflection_view(view, descriptor, &mut CommandStream::Wgpu(&mut encoder))
            .unwrap();
        gpu.queue.submit(std::iter::once(encoder.finish()));
        context.advance_to_next_frame();
    }
    let _ = gpu.device.poll(wgpu::PollType::Wait);

    context.destroy_reflection_view(view).unwrap();
}

#[test]
fn test_resolve_with_denoising() {
    let Some(gpu) = request_gpu() else {
        eprintln!("no compatible GPU adapter, skipping");
        return;
    };
    let mut context = smoke_context(&gpu);
    resolve_frames(&gpu, &mut context, &ResolveDescriptor::default(), 3);
}

#[test]
fn test_resolve_with_three_eaw_passes() {
    let Some(gpu) = request_gpu() else {
        eprintln!("no compatible GPU adapter, skipping");
        return;
    };
    let mut context = smoke_context(&gpu);
    let descriptor = ResolveDescriptor {
        eaw_pass_count: EawPassCount::Three,
        ..Default::default()
    };
    resolve_frames(&gpu, &mut context, &descriptor, 3);
}

#[test]
fn test_resolve_without_denoising() {
    let Some(gpu) = request_gpu() else {
        eprintln!("no compatible GPU adapter, skipping");
        return;
    };
    let mut context = smoke_context(&gpu);
    let descriptor = ResolveDescriptor {
        flags: ResolveFlags::empty(),
        ..Default::default()
    };
    resolve_frames(&gpu, &mut context, &descriptor, 2);
}
