//! Execution context owning every other piece of the resolver.
//!
//! A [`Context`] holds the handle registry, the scratch ring, the per-view
//! camera state and the selected backend. All per-view operations validate
//! the handle first; a stale or foreign handle is reported, never followed.
//! The frame counter advanced by [`Context::advance_to_next_frame`] is the
//! single clock the scratch ring and the timestamp rings run on.

use glam::Mat4;

use crate::backend::{
    create_backend, BackendDescriptor, CommandStream, ResolveBackend, ViewBindings, ViewSetup,
};
use crate::error::{Error, Result};
use crate::pipeline::{self, CreateViewFlags, ReflectionViewState, ResolveDescriptor};
use crate::queries::TimestampQueryRing;
use crate::registry::{IdDispenser, ReflectionViewId, ResourceKind};
use crate::ring::ScratchRing;
use crate::API_VERSION;

/// Receives formatted diagnostics for every reported error.
pub type LoggingCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Parameters for creating a [`Context`].
pub struct ContextDescriptor {
    /// Must equal [`API_VERSION`](crate::API_VERSION).
    pub api_version: u32,
    /// Fixed capacity of the reflection view registry.
    pub max_reflection_view_count: u32,
    /// Frames that must elapse before scratch memory and query slots tied
    /// to a frame may be reused. Choose at least the swapchain's frames in
    /// flight.
    pub frame_count_before_reuse: u32,
    /// Size of the scratch upload buffer in bytes.
    pub scratch_buffer_size: u64,
    /// Optional sink for formatted error messages.
    pub logging_callback: Option<LoggingCallback>,
    pub backend: BackendDescriptor,
}

/// Parameters for creating a reflection view.
pub struct CreateReflectionViewInfo {
    pub output_width: u32,
    pub output_height: u32,
    pub flags: CreateViewFlags,
    pub bindings: ViewBindings,
}

/// Scoped marker for a public API call; traces entry and every exit path.
struct ApiCall {
    name: &'static str,
}

impl ApiCall {
    fn new(name: &'static str) -> Self {
        log::trace!("{name}: enter");
        Self { name }
    }
}

impl Drop for ApiCall {
    fn drop(&mut self) {
        log::trace!("{}: exit", self.name);
    }
}

/// Process-wide state for one resolver instance.
pub struct Context {
    frame_index: u32,
    frame_count_before_reuse: u32,
    dispenser: IdDispenser,
    views: Vec<Option<ReflectionViewState>>,
    view_matrices: Vec<Mat4>,
    projection_matrices: Vec<Mat4>,
    ring: ScratchRing,
    backend: Box<dyn ResolveBackend>,
    logging: Option<LoggingCallback>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("frame_index", &self.frame_index)
            .field("frame_count_before_reuse", &self.frame_count_before_reuse)
            .field("views", &self.views)
            .field("view_matrices", &self.view_matrices)
            .field("projection_matrices", &self.projection_matrices)
            .field("ring", &self.ring)
            .field("logging", &self.logging.as_ref().map(|_| "..."))
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Creates a context for the selected backend.
    pub fn new(descriptor: ContextDescriptor) -> Result<Self> {
        let _call = ApiCall::new("Context::new");

        match Self::new_impl(descriptor) {
            Ok(context) => Ok(context),
            Err((err, logging)) => {
                report(logging.as_ref(), "Context::new", &err);
                Err(err)
            }
        }
    }

    fn new_impl(
        descriptor: ContextDescriptor,
    ) -> std::result::Result<Self, (Error, Option<LoggingCallback>)> {
        let ContextDescriptor {
            api_version,
            max_reflection_view_count,
            frame_count_before_reuse,
            scratch_buffer_size,
            logging_callback,
            backend,
        } = descriptor;

        let fail = |err: Error, logging: &mut Option<LoggingCallback>| (err, logging.take());
        let mut logging = logging_callback;

        if api_version != API_VERSION {
            return Err(fail(
                Error::IncompatibleApi {
                    expected: API_VERSION,
                    requested: api_version,
                },
                &mut logging,
            ));
        }
        if max_reflection_view_count == 0 {
            return Err(fail(
                Error::InvalidValue("max_reflection_view_count must be non-zero".into()),
                &mut logging,
            ));
        }
        if frame_count_before_reuse == 0 {
            return Err(fail(
                Error::InvalidValue("frame_count_before_reuse must be non-zero".into()),
                &mut logging,
            ));
        }
        if scratch_buffer_size < pipeline::PASS_CONSTANTS_SIZE {
            return Err(fail(
                Error::InvalidValue(format!(
                    "scratch_buffer_size must hold at least one {}-byte constant block",
                    pipeline::PASS_CONSTANTS_SIZE
                )),
                &mut logging,
            ));
        }

        let backend = match create_backend(backend, scratch_buffer_size) {
            Ok(backend) => backend,
            Err(err) => return Err(fail(err, &mut logging)),
        };

        let capacity = max_reflection_view_count as usize;
        let mut views = Vec::with_capacity(capacity);
        views.resize_with(capacity, || None);

        Ok(Self {
            frame_index: 0,
            frame_count_before_reuse,
            dispenser: IdDispenser::new(max_reflection_view_count),
            views,
            view_matrices: vec![Mat4::IDENTITY; capacity],
            projection_matrices: vec![Mat4::IDENTITY; capacity],
            ring: ScratchRing::new(scratch_buffer_size),
            backend,
            logging,
        })
    }

    /// Creates a reflection view with identity camera matrices.
    pub fn create_reflection_view(
        &mut self,
        info: &CreateReflectionViewInfo,
    ) -> Result<ReflectionViewId> {
        let _call = ApiCall::new("create_reflection_view");
        self.reported("create_reflection_view", |ctx| {
            ctx.create_reflection_view_impl(info)
        })
    }

    fn create_reflection_view_impl(
        &mut self,
        info: &CreateReflectionViewInfo,
    ) -> Result<ReflectionViewId> {
        if info.output_width == 0 || info.output_height == 0 {
            return Err(Error::InvalidValue(
                "output dimensions must be non-zero".into(),
            ));
        }

        let raw = self.dispenser.allocate().ok_or_else(|| {
            Error::OutOfMemory(format!(
                "unable to create a new reflection view, the configured capacity of {} is reached",
                self.dispenser.capacity()
            ))
        })?;
        let id = ReflectionViewId::compose(ResourceKind::ReflectionView, raw);
        let index = id.index();

        let setup = ViewSetup {
            slot: index,
            width: info.output_width,
            height: info.output_height,
            flags: info.flags,
            frames_in_flight: self.frame_count_before_reuse,
            bindings: &info.bindings,
        };
        if let Err(err) = self.backend.create_view(&setup) {
            // Tear down whatever the failed call left behind.
            self.backend.destroy_view(index);
            self.dispenser.free(raw);
            return Err(err);
        }

        self.views[index as usize] = Some(ReflectionViewState::new(
            info.output_width,
            info.output_height,
            info.flags,
            self.frame_count_before_reuse,
        ));
        self.view_matrices[index as usize] = Mat4::IDENTITY;
        self.projection_matrices[index as usize] = Mat4::IDENTITY;

        Ok(id)
    }

    /// Destroys the view. Destroying an already-invalid handle is a no-op
    /// that reports success.
    ///
    /// The caller must sequence this after the GPU has finished all work
    /// that references the view's resources.
    pub fn destroy_reflection_view(&mut self, view: ReflectionViewId) -> Result<()> {
        let _call = ApiCall::new("destroy_reflection_view");

        let Ok(index) = self.validate(view) else {
            return Ok(());
        };
        self.backend.destroy_view(index);
        self.views[index as usize] = None;
        self.view_matrices[index as usize] = Mat4::IDENTITY;
        self.projection_matrices[index as usize] = Mat4::IDENTITY;
        self.dispenser.free(view.raw());
        Ok(())
    }

    /// Encodes the resolve sequence for the view into the command stream.
    pub fn encode_resolve_reflection_view(
        &mut self,
        view: ReflectionViewId,
        descriptor: &ResolveDescriptor,
        stream: &mut CommandStream<'_>,
    ) -> Result<()> {
        let _call = ApiCall::new("encode_resolve_reflection_view");
        self.reported("encode_resolve_reflection_view", |ctx| {
            ctx.encode_resolve_impl(view, descriptor, stream)
        })
    }

    fn encode_resolve_impl(
        &mut self,
        view: ReflectionViewId,
        descriptor: &ResolveDescriptor,
        stream: &mut CommandStream<'_>,
    ) -> Result<()> {
        let index = self.validate(view)?;
        let view_matrix = self.view_matrices[index as usize];
        let projection_matrix = self.projection_matrices[index as usize];
        let state = self.views[index as usize]
            .as_mut()
            .ok_or_else(|| Error::Internal("view state missing for a live handle".into()))?;

        pipeline::encode_resolve(
            self.backend.as_mut(),
            &mut self.ring,
            self.frame_index,
            self.frame_count_before_reuse,
            index,
            state,
            view_matrix,
            projection_matrix,
            descriptor,
            stream,
        )
    }

    /// Advances the frame counter.
    ///
    /// Call exactly once per displayed frame; the scratch ring and the
    /// timestamp rings rely on it to decide what is safe to reuse.
    pub fn advance_to_next_frame(&mut self) {
        let _call = ApiCall::new("advance_to_next_frame");
        self.frame_index = self.frame_index.wrapping_add(1);
    }

    /// The current frame index.
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Number of live reflection views.
    pub fn reflection_view_count(&self) -> u32 {
        self.dispenser.live_count()
    }

    /// Capacity configured at creation.
    pub fn max_reflection_view_count(&self) -> u32 {
        self.dispenser.capacity()
    }

    /// GPU ticks spent in tile classification, `frame_count_before_reuse`
    /// frames ago.
    pub fn tile_classification_elapsed_time(&self, view: ReflectionViewId) -> Result<u64> {
        let _call = ApiCall::new("tile_classification_elapsed_time");
        self.reported_ref("tile_classification_elapsed_time", |ctx| {
            Ok(ctx.perf_queries(view)?.tile_classification_time())
        })
    }

    /// GPU ticks spent intersecting rays, `frame_count_before_reuse` frames
    /// ago.
    pub fn intersection_elapsed_time(&self, view: ReflectionViewId) -> Result<u64> {
        let _call = ApiCall::new("intersection_elapsed_time");
        self.reported_ref("intersection_elapsed_time", |ctx| {
            Ok(ctx.perf_queries(view)?.intersection_time())
        })
    }

    /// GPU ticks spent denoising, `frame_count_before_reuse` frames ago.
    pub fn denoising_elapsed_time(&self, view: ReflectionViewId) -> Result<u64> {
        let _call = ApiCall::new("denoising_elapsed_time");
        self.reported_ref("denoising_elapsed_time", |ctx| {
            Ok(ctx.perf_queries(view)?.denoising_time())
        })
    }

    /// The view and projection matrices of the view.
    pub fn camera_parameters(&self, view: ReflectionViewId) -> Result<(Mat4, Mat4)> {
        let _call = ApiCall::new("camera_parameters");
        self.reported_ref("camera_parameters", |ctx| {
            let index = ctx.validate(view)?;
            Ok((
                ctx.view_matrices[index as usize],
                ctx.projection_matrices[index as usize],
            ))
        })
    }

    /// Sets the view and projection matrices used by the next resolve.
    pub fn set_camera_parameters(
        &mut self,
        view: ReflectionViewId,
        view_matrix: Mat4,
        projection_matrix: Mat4,
    ) -> Result<()> {
        let _call = ApiCall::new("set_camera_parameters");
        self.reported("set_camera_parameters", |ctx| {
            let index = ctx.validate(view)?;
            ctx.view_matrices[index as usize] = view_matrix;
            ctx.projection_matrices[index as usize] = projection_matrix;
            Ok(())
        })
    }

    /// Checks whether the handle refers to a live view.
    pub fn is_reflection_view_valid(&self, view: ReflectionViewId) -> bool {
        self.validate(view).is_ok()
    }

    fn validate(&self, view: ReflectionViewId) -> Result<u32> {
        if view.is_kind(ResourceKind::ReflectionView) && self.dispenser.is_valid(view.raw()) {
            Ok(view.index())
        } else {
            Err(Error::InvalidValue(
                "invalid or stale reflection view handle".into(),
            ))
        }
    }

    fn perf_queries(&self, view: ReflectionViewId) -> Result<&TimestampQueryRing> {
        let index = self.validate(view)?;
        let state = self.views[index as usize]
            .as_ref()
            .ok_or_else(|| Error::Internal("view state missing for a live handle".into()))?;
        state.queries.as_ref().ok_or_else(|| {
            Error::InvalidOperation(
                "the view was created without ENABLE_PERFORMANCE_COUNTERS".into(),
            )
        })
    }

    fn reported<T>(
        &mut self,
        api_call: &str,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                report(self.logging.as_ref(), api_call, &err);
                Err(err)
            }
        }
    }

    fn reported_ref<T>(&self, api_call: &str, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                report(self.logging.as_ref(), api_call, &err);
                Err(err)
            }
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Release any views the caller leaked so backend resources are not
        // left dangling.
        for index in 0..self.views.len() {
            if self.views[index].is_some() {
                self.backend.destroy_view(index as u32);
            }
        }
    }
}

/// Formats and delivers an error to the diagnostic sinks.
fn report(logging: Option<&LoggingCallback>, api_call: &str, err: &Error) {
    let status = err.status();
    let message = format!("{api_call}: {err} ({}: {})", status as i32, status.name());
    log::warn!("{message}");
    if let Some(callback) = logging {
        callback(&message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, DummyEvent, PassKind};
    use crate::pipeline::ResolveFlags;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_context(max_views: u32) -> Context {
        Context::new(ContextDescriptor {
            api_version: API_VERSION,
            max_reflection_view_count: max_views,
            frame_count_before_reuse: 3,
            scratch_buffer_size: 1 << 20,
            logging_callback: None,
            backend: BackendDescriptor::Dummy,
        })
        .unwrap()
    }

    fn test_view(context: &mut Context, flags: CreateViewFlags) -> ReflectionViewId {
        context
            .create_reflection_view(&CreateReflectionViewInfo {
                output_width: 256,
                output_height: 128,
                flags,
                bindings: ViewBindings::Dummy,
            })
            .unwrap()
    }

    fn dummy_events(context: &Context) -> Vec<DummyEvent> {
        context
            .backend
            .as_any()
            .downcast_ref::<DummyBackend>()
            .unwrap()
            .events()
            .to_vec()
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let err = Context::new(ContextDescriptor {
            api_version: API_VERSION + 1,
            max_reflection_view_count: 1,
            frame_count_before_reuse: 2,
            scratch_buffer_size: 1 << 16,
            logging_callback: None,
            backend: BackendDescriptor::Dummy,
        })
        .unwrap_err();
        assert_eq!(err.status(), crate::Status::IncompatibleApi);
    }

    #[test]
    fn test_logging_callback_receives_errors() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let mut context = Context::new(ContextDescriptor {
            api_version: API_VERSION,
            max_reflection_view_count: 1,
            frame_count_before_reuse: 2,
            scratch_buffer_size: 1 << 16,
            logging_callback: Some(Box::new(move |message| {
                assert!(message.contains("Invalid value"));
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })),
            backend: BackendDescriptor::Dummy,
        })
        .unwrap();

        let err = context
            .create_reflection_view(&CreateReflectionViewInfo {
                output_width: 0,
                output_height: 128,
                flags: CreateViewFlags::empty(),
                bindings: ViewBindings::Dummy,
            })
            .unwrap_err();
        assert_eq!(err.status(), crate::Status::InvalidValue);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_denoise_off_never_binds_denoiser_tables() {
        let mut context = test_context(1);
        let view = test_view(&mut context, CreateViewFlags::empty());

        context
            .encode_resolve_reflection_view(
                view,
                &ResolveDescriptor {
                    flags: ResolveFlags::empty(),
                    ..Default::default()
                },
                &mut CommandStream::Dummy,
            )
            .unwrap();

        let denoiser_passes = [
            PassKind::SpatialDenoise,
            PassKind::TemporalDenoise,
            PassKind::EawDenoise,
            PassKind::EawDenoiseToIntermediate,
            PassKind::EawDenoiseFromIntermediate,
        ];
        for event in dummy_events(&context) {
            if let DummyEvent::Pass { pass, .. } = event {
                assert!(!denoiser_passes.contains(&pass), "unexpected pass {pass:?}");
            }
        }
    }

    #[test]
    fn test_destroy_releases_backend_state() {
        let mut context = test_context(2);
        let view = test_view(&mut context, CreateViewFlags::empty());
        context.destroy_reflection_view(view).unwrap();

        let events = dummy_events(&context);
        assert!(events.contains(&DummyEvent::DestroyView { slot: 0 }));
    }

    #[test]
    fn test_resolve_on_destroyed_view_fails() {
        let mut context = test_context(1);
        let view = test_view(&mut context, CreateViewFlags::empty());
        context.destroy_reflection_view(view).unwrap();

        let err = context
            .encode_resolve_reflection_view(
                view,
                &ResolveDescriptor::default(),
                &mut CommandStream::Dummy,
            )
            .unwrap_err();
        assert_eq!(err.status(), crate::Status::InvalidValue);
    }
}
