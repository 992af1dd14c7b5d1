//! Public API tests for the reflections context.
//!
//! These run against the recording dummy backend, so they exercise the
//! handle registry, the scratch ring, the camera state and the resolve
//! sequencing without requiring GPU hardware.

use glam::Mat4;
use rstest::rstest;
use stochastic_reflections::{
    BackendDescriptor, CommandStream, Context, ContextDescriptor, CreateReflectionViewInfo,
    CreateViewFlags, ResolveDescriptor, Status, ViewBindings, API_VERSION,
};

fn context_descriptor() -> ContextDescriptor {
    ContextDescriptor {
        api_version: API_VERSION,
        max_reflection_view_count: 4,
        frame_count_before_reuse: 2,
        scratch_buffer_size: 1 << 20,
        logging_callback: None,
        backend: BackendDescriptor::Dummy,
    }
}

fn view_info(flags: CreateViewFlags) -> CreateReflectionViewInfo {
    CreateReflectionViewInfo {
        output_width: 1280,
        output_height: 720,
        flags,
        bindings: ViewBindings::Dummy,
    }
}

// ============================================================================
// Context creation
// ============================================================================

#[test]
fn test_create_and_destroy_context() {
    let context = Context::new(context_descriptor()).unwrap();
    assert_eq!(context.reflection_view_count(), 0);
    assert_eq!(context.max_reflection_view_count(), 4);
    assert_eq!(context.frame_index(), 0);
}

#[test]
fn test_api_version_mismatch() {
    let err = Context::new(ContextDescriptor {
        api_version: 0xDEAD,
        ..context_descriptor()
    })
    .unwrap_err();
    assert_eq!(err.status(), Status::IncompatibleApi);
}

#[rstest]
#[case::zero_views(0, 2, 1 << 20)]
#[case::zero_reuse_horizon(4, 0, 1 << 20)]
#[case::scratch_too_small(4, 2, 16)]
fn test_invalid_configuration_is_rejected(
    #[case] max_reflection_view_count: u32,
    #[case] frame_count_before_reuse: u32,
    #[case] scratch_buffer_size: u64,
) {
    let err = Context::new(ContextDescriptor {
        max_reflection_view_count,
        frame_count_before_reuse,
        scratch_buffer_size,
        ..context_descriptor()
    })
    .unwrap_err();
    assert_eq!(err.status(), Status::InvalidValue);
}

// ============================================================================
// View lifecycle
// ============================================================================

#[test]
fn test_view_capacity_is_enforced() {
    let mut context = Context::new(ContextDescriptor {
        max_reflection_view_count: 1,
        ..context_descriptor()
    })
    .unwrap();

    let first = context
        .create_reflection_view(&view_info(CreateViewFlags::empty()))
        .unwrap();
    let err = context
        .create_reflection_view(&view_info(CreateViewFlags::empty()))
        .unwrap_err();
    assert_eq!(err.status(), Status::OutOfMemory);

    // Destroying the first view frees the capacity again.
    context.destroy_reflection_view(first).unwrap();
    context
        .create_reflection_view(&view_info(CreateViewFlags::empty()))
        .unwrap();
}

#[test]
fn test_destroy_is_idempotent() {
    let mut context = Context::new(context_descriptor()).unwrap();
    let view = context
        .create_reflection_view(&view_info(CreateViewFlags::empty()))
        .unwrap();

    context.destroy_reflection_view(view).unwrap();
    context.destroy_reflection_view(view).unwrap();
    assert_eq!(context.reflection_view_count(), 0);
}

#[test]
fn test_stale_handle_is_rejected_after_recycle() {
    let mut context = Context::new(ContextDescriptor {
        max_reflection_view_count: 1,
        ..context_descriptor()
    })
    .unwrap();

    let stale = context
        .create_reflection_view(&view_info(CreateViewFlags::empty()))
        .unwrap();
    context.destroy_reflection_view(stale).unwrap();

    // The replacement occupies the same slot with a new generation.
    let fresh = context
        .create_reflection_view(&view_info(CreateViewFlags::empty()))
        .unwrap();
    assert_ne!(stale, fresh);
    assert!(!context.is_reflection_view_valid(stale));
    assert!(context.is_reflection_view_valid(fresh));

    let err = context
        .encode_resolve_reflection_view(
            stale,
            &ResolveDescriptor::default(),
            &mut CommandStream::Dummy,
        )
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidValue);
}

#[test]
fn test_zero_sized_view_is_rejected() {
    let mut context = Context::new(context_descriptor()).unwrap();
    let err = context
        .create_reflection_view(&CreateReflectionViewInfo {
            output_width: 0,
            output_height: 720,
            flags: CreateViewFlags::empty(),
            bindings: ViewBindings::Dummy,
        })
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidValue);
    assert_eq!(context.reflection_view_count(), 0);
}

// ============================================================================
// Camera parameters
// ============================================================================

#[test]
fn test_camera_parameters_round_trip() {
    let mut context = Context::new(context_descriptor()).unwrap();
    let view = context
        .create_reflection_view(&view_info(CreateViewFlags::empty()))
        .unwrap();

    let (view_matrix, projection_matrix) = context.camera_parameters(view).unwrap();
    assert_eq!(view_matrix, Mat4::IDENTITY);
    assert_eq!(projection_matrix, Mat4::IDENTITY);

    let new_view = Mat4::from_cols_array(&[
        0.5, -1.25, 3.0, 0.0, //
        7.5, 0.125, -2.0, 0.0, //
        -0.75, 4.5, 1.0, 0.0, //
        10.0, -20.0, 30.0, 1.0,
    ]);
    let new_projection = Mat4::perspective_lh(1.2, 16.0 / 9.0, 0.1, 1000.0);
    context
        .set_camera_parameters(view, new_view, new_projection)
        .unwrap();

    let (read_view, read_projection) = context.camera_parameters(view).unwrap();
    assert_eq!(read_view.to_cols_array(), new_view.to_cols_array());
    assert_eq!(
        read_projection.to_cols_array(),
        new_projection.to_cols_array()
    );
}

#[test]
fn test_camera_parameters_on_invalid_handle() {
    let mut context = Context::new(context_descriptor()).unwrap();
    let view = context
        .create_reflection_view(&view_info(CreateViewFlags::empty()))
        .unwrap();
    context.destroy_reflection_view(view).unwrap();

    assert_eq!(
        context.camera_parameters(view).unwrap_err().status(),
        Status::InvalidValue
    );
    assert_eq!(
        context
            .set_camera_parameters(view, Mat4::IDENTITY, Mat4::IDENTITY)
            .unwrap_err()
            .status(),
        Status::InvalidValue
    );
}

// ============================================================================
// Performance counters
// ============================================================================

#[test]
fn test_elapsed_times_require_creation_flag() {
    let mut context = Context::new(context_descriptor()).unwrap();
    let view = context
        .create_reflection_view(&view_info(CreateViewFlags::empty()))
        .unwrap();

    assert_eq!(
        context
            .tile_classification_elapsed_time(view)
            .unwrap_err()
            .status(),
        Status::InvalidOperation
    );
    assert_eq!(
        context.intersection_elapsed_time(view).unwrap_err().status(),
        Status::InvalidOperation
    );
    assert_eq!(
        context.denoising_elapsed_time(view).unwrap_err().status(),
        Status::InvalidOperation
    );
}

#[test]
fn test_elapsed_times_publish_after_reuse_horizon() {
    let mut context = Context::new(context_descriptor()).unwrap();
    let view = context
        .create_reflection_view(&view_info(CreateViewFlags::ENABLE_PERFORMANCE_COUNTERS))
        .unwrap();

    // The first resolves have no harvested data yet; the counters read as
    // zero instead of garbage.
    context
        .encode_resolve_reflection_view(
            view,
            &ResolveDescriptor::default(),
            &mut CommandStream::Dummy,
        )
        .unwrap();
    assert_eq!(context.tile_classification_elapsed_time(view).unwrap(), 0);

    // After cycling past the reuse horizon the oldest slot is harvested.
    for _ in 0..2 {
        context.advance_to_next_frame();
        context
            .encode_resolve_reflection_view(
                view,
                &ResolveDescriptor::default(),
                &mut CommandStream::Dummy,
            )
            .unwrap();
    }
    assert!(context.tile_classification_elapsed_time(view).unwrap() > 0);
    assert!(context.intersection_elapsed_time(view).unwrap() > 0);
    assert!(context.denoising_elapsed_time(view).unwrap() > 0);
}

// ============================================================================
// Scratch ring reuse
// ============================================================================

#[test]
fn test_scratch_block_becomes_reusable_after_horizon() {
    // Room for exactly one constant block.
    let mut context = Context::new(ContextDescriptor {
        scratch_buffer_size: 512,
        frame_count_before_reuse: 2,
        ..context_descriptor()
    })
    .unwrap();
    let view = context
        .create_reflection_view(&view_info(CreateViewFlags::empty()))
        .unwrap();
    let resolve = ResolveDescriptor::default();

    context
        .encode_resolve_reflection_view(view, &resolve, &mut CommandStream::Dummy)
        .unwrap();

    // One frame later the block is still in flight.
    context.advance_to_next_frame();
    let err = context
        .encode_resolve_reflection_view(view, &resolve, &mut CommandStream::Dummy)
        .unwrap_err();
    assert_eq!(err.status(), Status::OutOfMemory);

    // After the full reuse horizon the same range is handed out again.
    context.advance_to_next_frame();
    context
        .encode_resolve_reflection_view(view, &resolve, &mut CommandStream::Dummy)
        .unwrap();
}

#[test]
fn test_frame_counter_advances() {
    let mut context = Context::new(context_descriptor()).unwrap();
    for expected in 0..5 {
        assert_eq!(context.frame_index(), expected);
        context.advance_to_next_frame();
    }
}
