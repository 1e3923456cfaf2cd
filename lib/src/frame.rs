use tracing::{debug, error, warn};

use crate::error::InitError;
use crate::projection;
use crate::renderer::{DepthAttachment, MatrixMode, Rect, Renderer};
use crate::runtime::{DepthInfo, FrameTiming, ProjectionLayer, ProjectionView, Runtime, SwapchainInfo, SwapchainUsage, View, ViewConfig};
use crate::session::Session;

const IMAGE_WAIT_TIMEOUT: i64 = i64::MAX; // [ns]

enum DepthTarget<R: Runtime, G: Renderer> {
    Swapchain { chain: R::Swapchain, images: Vec<R::Image> },
    Local(G::DepthBuffer), // Attached once, at creation.
}

struct ViewResource<R: Runtime, G: Renderer<Image = R::Image>> {
    config: ViewConfig,
    color: R::Swapchain,
    color_images: Vec<R::Image>,
    depth: DepthTarget<R, G>,
    framebuffer: G::Framebuffer,
}

struct ActiveFrame {
    timing: FrameTiming,
    count: usize,
    clip: Vec<(f32, f32)>, // Near/far each view was rendered with.
    open: Option<OpenView>,
}

struct OpenView {
    index: usize,
}

pub(crate) struct ViewPipeline<R: Runtime, G: Renderer<Image = R::Image>> {
    views: Vec<ViewResource<R, G>>,
    located: Vec<View>,
    frame: Option<ActiveFrame>,
}

impl<R: Runtime, G: Renderer<Image = R::Image>> ViewResource<R, G> {
    fn new(runtime: &mut R, renderer: &mut G, config: &ViewConfig, depth_chains: bool) -> Result<Self, InitError> {
        let (color, color_images) = runtime
            .create_swapchain(&SwapchainInfo::new(SwapchainUsage::Color, config))
            .map_err(InitError::resource("unable to create color swapchain"))?;

        // Depth swapchain before the framebuffer, nothing to unload if it fails.

        let depth_chain = if depth_chains {
            Some(runtime
                .create_swapchain(&SwapchainInfo::new(SwapchainUsage::Depth, config))
                .map_err(InitError::resource("unable to create depth swapchain"))?)
        } else {
            None
        };

        let mut framebuffer = renderer.load_framebuffer(config.width, config.height);

        let depth = match depth_chain {
            Some((chain, images)) => DepthTarget::Swapchain { chain, images },
            None => {
                let buffer = renderer.load_depth_buffer(config.width, config.height);
                renderer.attach_depth(&mut framebuffer, DepthAttachment::Buffer(&buffer));

                DepthTarget::Local(buffer)
            },
        };

        Ok(Self {
            config: *config,
            color,
            color_images,
            depth,
            framebuffer,
        })
    }
}

impl<R: Runtime, G: Renderer<Image = R::Image>> ViewPipeline<R, G> {
    pub fn new(runtime: &mut R, renderer: &mut G, view_configs: &[ViewConfig], depth_submission: bool) -> Result<Self, InitError> {
        // Depth strategy is picked once, every view uses the same one.

        let depth_chains = depth_submission && runtime.supports_depth();
        if depth_submission && !depth_chains {
            warn!("depth submission not supported, falling back to local depth buffers");
        }

        let mut pipeline = Self {
            views: Vec::with_capacity(view_configs.len()),
            located: Vec::new(),
            frame: None,
        };

        for config in view_configs {
            match ViewResource::new(runtime, renderer, config, depth_chains) {
                Ok(view) => {
                    debug!("view {}: {} x {}, {} color images", pipeline.views.len(), config.width, config.height, view.color_images.len());
                    pipeline.views.push(view);
                },
                Err(err) => {
                    pipeline.release(renderer);
                    return Err(err);
                },
            }
        }

        Ok(pipeline)
    }

    // Hands framebuffers and local depth buffers back to the renderer. Runtime
    // handles go with the views.

    pub fn release(&mut self, renderer: &mut G) {
        self.frame = None;
        self.located.clear();

        for view in self.views.drain(..) {
            if let DepthTarget::Local(buffer) = view.depth {
                renderer.unload_depth_buffer(buffer);
            }
            renderer.unload_framebuffer(view.framebuffer);
        }
    }

    pub fn view_config(&self, index: usize) -> Option<&ViewConfig> {
        self.views.get(index).map(|view| &view.config)
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn is_frame_active(&self) -> bool {
        self.frame.is_some()
    }

    pub fn uses_depth_chains(&self) -> bool {
        self.views.iter().any(|view| matches!(view.depth, DepthTarget::Swapchain { .. }))
    }
}

fn acquire<R: Runtime>(runtime: &mut R, chain: &mut R::Swapchain) -> usize {
    let index = runtime.acquire_image(chain).unwrap_or_else(|err| {
        error!("unable to acquire swapchain image: {}", err);
        0
    });

    if let Err(err) = runtime.wait_image(chain, IMAGE_WAIT_TIMEOUT) {
        error!("unable to wait for swapchain image: {}", err);
    }

    index
}

fn release<R: Runtime>(runtime: &mut R, chain: &mut R::Swapchain) {
    if let Err(err) = runtime.release_image(chain) {
        error!("unable to release swapchain image: {}", err);
    }
}

impl<R: Runtime, G: Renderer<Image = R::Image>> Session<R, G> {
    pub fn begin_frame(&mut self) -> usize {
        let (runtime, renderer, _, conn) = self.parts();

        // Disconnected by a fatal event: nothing to render, is_connected() tells the app.

        let Some(conn) = conn else {
            return 0;
        };
        let pipeline = &mut conn.pipeline;

        assert!(pipeline.frame.is_none(), "begin_frame() called twice without end_frame()");

        // No pending timing: not running yet, or the frame wait failed.

        let Some(timing) = conn.pending.take() else {
            return 0;
        };

        if let Err(err) = runtime.begin_frame() {
            error!("unable to begin frame: {}", err);
            return 0;
        }

        pipeline.located = match runtime.locate_views(&conn.world_space, timing.predicted_display_time) {
            Ok(views) => views,
            Err(err) => {
                error!("unable to locate views: {}", err);
                Vec::new()
            },
        };

        if pipeline.located.len() != pipeline.views.len() && !pipeline.located.is_empty() {
            warn!("runtime located {} views, expected {}", pipeline.located.len(), pipeline.views.len());
        }

        let count = if timing.should_render {
            pipeline.views.len().min(pipeline.located.len())
        } else {
            0
        };

        pipeline.frame = Some(ActiveFrame {
            timing,
            count,
            clip: vec![renderer.clip_distances(); pipeline.views.len()],
            open: None,
        });

        count
    }

    pub fn begin_view(&mut self, index: usize) {
        let (runtime, renderer, reference_frame, conn) = self.parts();
        let pipeline = &mut conn.expect("session is not connected").pipeline;

        let frame = pipeline.frame.as_mut().expect("begin_view() outside of a frame");
        assert!(frame.open.is_none(), "begin_view() while another view is open");
        assert!(index < frame.count, "view index {} out of range [0, {})", index, frame.count);

        let view = &mut pipeline.views[index];
        let located = pipeline.located[index];

        let color_index = acquire(runtime, &mut view.color);
        let depth_index = match &mut view.depth {
            DepthTarget::Swapchain { chain, .. } => Some(acquire(runtime, chain)),
            DepthTarget::Local(_) => None,
        };

        // Whatever was batched so far belongs to the previous target.

        renderer.flush_batch();

        let rect = Rect::from_size(view.config.width, view.config.height);
        renderer.viewport(rect);
        renderer.scissor(rect);

        match view.color_images.get(color_index) {
            Some(image) => renderer.attach_color(&mut view.framebuffer, image),
            None => error!("swapchain image index {} out of range", color_index),
        }

        if let (DepthTarget::Swapchain { images, .. }, Some(depth_index)) = (&view.depth, depth_index) {
            match images.get(depth_index) {
                Some(image) => renderer.attach_depth(&mut view.framebuffer, DepthAttachment::Image(image)),
                None => error!("depth swapchain image index {} out of range", depth_index),
            }
        }

        renderer.enable_framebuffer(&view.framebuffer);
        renderer.enable_depth_test();

        // Camera.

        let (near, far) = renderer.clip_distances();
        frame.clip[index] = (near, far);

        let proj = projection::perspective(&located.fov, near, far, renderer.clip_space());
        renderer.push_matrix(MatrixMode::Projection);
        renderer.set_matrix(MatrixMode::Projection, proj);

        let view_m = projection::view_matrix(&reference_frame.compose(&located.pose));
        renderer.push_matrix(MatrixMode::ModelView);
        renderer.set_matrix(MatrixMode::ModelView, view_m);

        frame.open = Some(OpenView { index });
    }

    pub fn end_view(&mut self) {
        let (runtime, renderer, _, conn) = self.parts();
        let pipeline = &mut conn.expect("session is not connected").pipeline;

        let frame = pipeline.frame.as_mut().expect("end_view() outside of a frame");
        let OpenView { index } = frame.open.take().expect("end_view() without begin_view()");
        let view = &mut pipeline.views[index];

        renderer.flush_batch();

        release(runtime, &mut view.color);
        if let DepthTarget::Swapchain { chain, .. } = &mut view.depth {
            release(runtime, chain);
        }

        renderer.pop_matrix(MatrixMode::ModelView);
        renderer.pop_matrix(MatrixMode::Projection);
        renderer.disable_framebuffer();
        renderer.disable_depth_test();
        renderer.reset_viewport();
    }

    // No-op without an active frame.
    pub fn end_frame(&mut self) {
        let (runtime, _, _, conn) = self.parts();

        let Some(conn) = conn else {
            return;
        };
        let pipeline = &mut conn.pipeline;

        let Some(frame) = &pipeline.frame else {
            return;
        };
        assert!(frame.open.is_none(), "end_frame() while a view is open");

        let Some(frame) = pipeline.frame.take() else {
            return;
        };

        let complete = !pipeline.views.is_empty() && pipeline.located.len() == pipeline.views.len();

        let layer = (frame.timing.should_render && complete).then(|| ProjectionLayer {
            space: &conn.world_space,
            views: pipeline
                .views
                .iter()
                .zip(&pipeline.located)
                .zip(&frame.clip)
                .map(|((view, located), (near, far))| ProjectionView {
                    pose: located.pose,
                    fov: located.fov,
                    swapchain: &view.color,
                    width: view.config.width,
                    height: view.config.height,
                    depth: match &view.depth {
                        DepthTarget::Swapchain { chain, .. } => Some(DepthInfo {
                            swapchain: chain,
                            min_depth: 0.0,
                            max_depth: 1.0,
                            near_z: *near,
                            far_z: *far,
                        }),
                        DepthTarget::Local(_) => None,
                    },
                })
                .collect(),
        });

        if let Err(err) = runtime.end_frame(frame.timing.predicted_display_time, layer.as_ref()) {
            error!("unable to end frame: {}", err);
        }
    }
}
