use cgmath::{Quaternion, Vector3};
use tracing::{debug, error, info, warn};

use crate::action::Input;
use crate::config::Config;
use crate::error::InitError;
use crate::frame::ViewPipeline;
use crate::pose::{Pose, ReferenceFrame};
use crate::renderer::Renderer;
use crate::runtime::{FrameTiming, Runtime, RuntimeEvent, SessionState, SystemInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XrState {
    Unknown,      // Not connected, or no state reported yet.
    Idle,         // Connected, not running (also while ready/stopping).
    Synchronized, // Frame loop running, nothing displayed.
    Visible,      // Frames are displayed, no input focus.
    Focused,      // Frames are displayed and input is routed to us.
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Connected,
    Disconnected, // Closed by a fatal runtime event.
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceType {
    Local,      // Origin at the initial/recentered headset position.
    LocalFloor, // As Local, y = 0 is the estimated floor.
    Stage,      // Center of the play space boundary, on the floor.
}

// Per tick: update(), begin_frame(), begin_view()/end_view() per view, end_frame().
pub struct Session<R: Runtime, G: Renderer<Image = R::Image>> {
    runtime: R,
    renderer: G,
    config: Config,
    lifecycle: Lifecycle,
    reference_frame: ReferenceFrame,
    conn: Option<Connection<R, G>>,
}

pub(crate) struct Connection<R: Runtime, G: Renderer<Image = R::Image>> {
    pub system: SystemInfo,
    pub state: SessionState,
    pub running: bool,
    pub reference: ReferenceType,
    pub timing: Option<FrameTiming>,   // Last successful frame wait.
    pub pending: Option<FrameTiming>,  // Frame waited for, not yet begun.
    pub pipeline: ViewPipeline<R, G>,
    pub input: Input<R>,
    pub view_space: R::Space,
    pub world_space: R::Space,
}

impl<R: Runtime, G: Renderer<Image = R::Image>> Session<R, G> {
    pub fn new(runtime: R, renderer: G, config: Config) -> Self {
        Self {
            runtime,
            renderer,
            config,
            lifecycle: Lifecycle::Uninitialized,
            reference_frame: ReferenceFrame::identity(),
            conn: None,
        }
    }

    pub fn init(&mut self) -> Result<(), InitError> {
        if self.conn.is_some() {
            return Ok(());
        }

        let system = self.runtime.connect(&self.config)?;

        match self.create_connection(system) {
            Ok(conn) => {
                info!("session initialized");
                info!("  system: {}", conn.system.name);
                if let Some(view) = conn.pipeline.view_config(0) {
                    info!("  view size: {} x {}", view.width, view.height);
                }
                info!("  view count: {}", conn.pipeline.view_count());
                info!("  depth: {}", if conn.pipeline.uses_depth_chains() { "swapchain" } else { "local" });

                self.conn = Some(conn);
                self.lifecycle = Lifecycle::Connected;
                self.reference_frame = ReferenceFrame::identity();

                Ok(())
            },
            Err(err) => {
                self.runtime.disconnect();
                Err(err)
            },
        }
    }

    fn create_connection(&mut self, system: SystemInfo) -> Result<Connection<R, G>, InitError> {
        let runtime = &mut self.runtime;

        // Prefer the configured reference, Local is always available.

        let mut reference = self.config.preferred_reference;
        if !runtime.supports_reference(reference) {
            warn!("reference type {:?} not supported, falling back to {:?}", reference, ReferenceType::Local);
            reference = ReferenceType::Local;
        }

        let world_space = runtime.create_reference_space(reference).map_err(InitError::resource("unable to create reference space"))?;
        let view_space = runtime.create_view_space().map_err(InitError::resource("unable to create view space"))?;

        let view_configs = runtime.view_configs().map_err(InitError::resource("unable to enumerate views"))?;
        let pipeline = ViewPipeline::new(runtime, &mut self.renderer, &view_configs, self.config.depth_submission)?;

        Ok(Connection {
            system,
            state: SessionState::Unknown,
            running: false,
            reference,
            timing: None,
            pending: None,
            pipeline,
            input: Input::new(),
            view_space,
            world_space,
        })
    }

    pub fn close(&mut self) {
        self.release(Lifecycle::Closed);
    }

    fn release(&mut self, lifecycle: Lifecycle) {
        if let Some(mut conn) = self.conn.take() {
            // Renderer resources and handles first, then the connection they belong to.

            conn.pipeline.release(&mut self.renderer);
            drop(conn);
            self.runtime.disconnect();

            self.lifecycle = lifecycle;
            debug!("session released ({:?})", lifecycle);
        }
    }

    pub fn update(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        if !conn.input.is_attached() {
            conn.input.attach(&mut self.runtime);
        }

        // Drain the whole queue, otherwise the runtime starts dropping events.

        loop {
            let event = match self.runtime.poll_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(err) => {
                    error!("unable to poll events: {}", err);
                    break;
                },
            };

            match event {
                RuntimeEvent::EventsLost(count) => {
                    warn!("event queue overflow, {} events lost; update() might be getting called too little", count);
                },
                RuntimeEvent::InstanceLossPending => {
                    error!("instance loss pending, disconnected");
                    self.release(Lifecycle::Disconnected);
                    return;
                },
                RuntimeEvent::ReferenceSpaceChangePending => {
                    debug!("reference space change pending");
                },
                RuntimeEvent::InteractionProfileChanged => {
                    info!("interaction profile changed");
                },
                RuntimeEvent::SessionStateChanged(state) => {
                    debug!("session state changed to {:?}", state);

                    match state {
                        SessionState::Ready => {
                            if let Err(err) = self.runtime.begin_session() {
                                error!("unable to begin session: {}", err);
                            }
                            conn.running = true;
                        },
                        SessionState::Stopping => {
                            if let Err(err) = self.runtime.end_session() {
                                error!("unable to end session: {}", err);
                            }
                            conn.running = false;
                            conn.pending = None;
                        },
                        SessionState::Exiting => {
                            error!("session exiting, disconnected");
                            self.release(Lifecycle::Disconnected);
                            return;
                        },
                        SessionState::LossPending => {
                            error!("session loss pending, disconnected");
                            self.release(Lifecycle::Disconnected);
                            return;
                        },
                        _ => (),
                    }

                    conn.state = state;
                },
            }
        }

        if conn.running {
            // Frame pacing: this blocks until the runtime wants the next frame.
            // A waited frame that was never begun is still pending, waiting
            // again before begin_frame() would block forever.

            if conn.pending.is_none() {
                match self.runtime.wait_frame() {
                    Ok(timing) => {
                        conn.timing = Some(timing);
                        conn.pending = Some(timing);
                    },
                    Err(err) => error!("unable to wait for a frame: {}", err),
                }
            }

            if let Err(err) = self.runtime.sync_actions() {
                error!("unable to sync actions: {}", err);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn is_focused(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| conn.state == SessionState::Focused)
    }

    pub fn state(&self) -> XrState {
        let Some(conn) = &self.conn else {
            return XrState::Unknown;
        };

        match conn.state {
            SessionState::Idle | SessionState::Ready | SessionState::Stopping => XrState::Idle,
            SessionState::Synchronized => XrState::Synchronized,
            SessionState::Visible => XrState::Visible,
            SessionState::Focused => XrState::Focused,
            _ => XrState::Unknown,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn system_info(&self) -> Option<&SystemInfo> {
        self.conn.as_ref().map(|conn| &conn.system)
    }

    // Reference frame.

    pub fn reference_frame(&self) -> ReferenceFrame {
        self.reference_frame
    }

    pub fn set_reference_frame(&mut self, reference_frame: ReferenceFrame) {
        self.reference_frame = reference_frame;
    }

    pub fn set_position(&mut self, position: Vector3<f32>) {
        self.reference_frame.position = position;
    }

    pub fn set_orientation(&mut self, orientation: Quaternion<f32>) {
        self.reference_frame.orientation = orientation;
    }

    pub fn set_reference(&mut self, ty: ReferenceType) -> bool {
        let conn = self.conn.as_mut().expect("session is not connected");
        assert!(!conn.pipeline.is_frame_active(), "reference type can't change during a frame");

        if conn.reference == ty {
            return true;
        }

        if !self.runtime.supports_reference(ty) {
            return false;
        }

        match self.runtime.create_reference_space(ty) {
            Ok(space) => {
                conn.world_space = space;
                conn.reference = ty;
                true
            },
            Err(err) => {
                error!("unable to create reference space: {}", err);
                false
            },
        }
    }

    pub fn reference(&self) -> ReferenceType {
        self.conn.as_ref().expect("session is not connected").reference
    }

    pub fn view_pose(&mut self) -> Pose {
        let Some(conn) = &self.conn else {
            return Pose::invalid();
        };

        let Some(timing) = conn.timing else {
            return Pose::invalid();
        };

        match self.runtime.locate_space(&conn.view_space, &conn.world_space, timing.predicted_display_time) {
            Ok(raw) => self.reference_frame.compose(&raw),
            Err(err) => {
                error!("unable to locate view space: {}", err);
                Pose::invalid()
            },
        }
    }

    // Collaborators.

    pub fn renderer(&self) -> &G {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut G {
        &mut self.renderer
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub(crate) fn parts(&mut self) -> (&mut R, &mut G, &ReferenceFrame, Option<&mut Connection<R, G>>) {
        (&mut self.runtime, &mut self.renderer, &self.reference_frame, self.conn.as_mut())
    }
}

impl<R: Runtime, G: Renderer<Image = R::Image>> Drop for Session<R, G> {
    fn drop(&mut self) {
        self.close();
    }
}
