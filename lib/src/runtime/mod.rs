use cfg_if::cfg_if;
use cgmath::Vector2;

use crate::action::{ActionState, ActionType, Hand};
use crate::config::Config;
use crate::error::{InitError, RuntimeError};
use crate::pose::Pose;
use crate::projection::Fov;
use crate::session::ReferenceType;

cfg_if! {
    if #[cfg(feature = "xr")] {
        pub(crate) mod openxr;
        pub use self::openxr::OpenXrRuntime;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unknown,
    Idle,
    Ready,
    Synchronized,
    Visible,
    Focused,
    Stopping,
    LossPending,
    Exiting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeEvent {
    EventsLost(u32),
    InstanceLossPending,
    SessionStateChanged(SessionState),
    ReferenceSpaceChangePending,
    InteractionProfileChanged,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SystemInfo {
    pub name: String,
    pub vendor_id: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewConfig {
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainUsage {
    Color,
    Depth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub usage: SwapchainUsage,
    pub width: u32,
    pub height: u32,
    pub sample_count: u32,
}

impl SwapchainInfo {
    pub fn new(usage: SwapchainUsage, view_config: &ViewConfig) -> Self {
        Self {
            usage,
            width: view_config.width,
            height: view_config.height,
            sample_count: view_config.sample_count,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTiming {
    pub predicted_display_time: i64, // [ns]
    pub should_render: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct View {
    pub pose: Pose,
    pub fov: Fov,
}

pub struct DepthInfo<'a, R: Runtime + ?Sized> {
    pub swapchain: &'a R::Swapchain,
    pub min_depth: f32,
    pub max_depth: f32,
    pub near_z: f32,
    pub far_z: f32,
}

pub struct ProjectionView<'a, R: Runtime + ?Sized> {
    pub pose: Pose,
    pub fov: Fov,
    pub swapchain: &'a R::Swapchain,
    pub width: u32,
    pub height: u32,
    pub depth: Option<DepthInfo<'a, R>>,
}

pub struct ProjectionLayer<'a, R: Runtime + ?Sized> {
    pub space: &'a R::Space,
    pub views: Vec<ProjectionView<'a, R>>,
}

// Handles are released by dropping them, all before disconnect().
pub trait Runtime {
    type Space;
    type Swapchain;
    type Image;
    type Action;

    // Lifecycle.

    fn connect(&mut self, config: &Config) -> Result<SystemInfo, InitError>;
    fn disconnect(&mut self);
    fn view_configs(&mut self) -> Result<Vec<ViewConfig>, RuntimeError>;
    fn supports_depth(&self) -> bool;
    fn supports_reference(&mut self, ty: ReferenceType) -> bool;

    // Spaces and swapchains.

    fn create_reference_space(&mut self, ty: ReferenceType) -> Result<Self::Space, RuntimeError>;
    fn create_view_space(&mut self) -> Result<Self::Space, RuntimeError>;
    fn create_swapchain(&mut self, info: &SwapchainInfo) -> Result<(Self::Swapchain, Vec<Self::Image>), RuntimeError>;

    // Events and frame loop.

    fn poll_event(&mut self) -> Result<Option<RuntimeEvent>, RuntimeError>;
    fn begin_session(&mut self) -> Result<(), RuntimeError>;
    fn end_session(&mut self) -> Result<(), RuntimeError>;
    fn wait_frame(&mut self) -> Result<FrameTiming, RuntimeError>;
    fn begin_frame(&mut self) -> Result<(), RuntimeError>;
    fn end_frame(&mut self, display_time: i64, layer: Option<&ProjectionLayer<'_, Self>>) -> Result<(), RuntimeError>;
    fn locate_views(&mut self, space: &Self::Space, time: i64) -> Result<Vec<View>, RuntimeError>;
    fn locate_space(&mut self, space: &Self::Space, base: &Self::Space, time: i64) -> Result<Pose, RuntimeError>;
    fn acquire_image(&mut self, swapchain: &mut Self::Swapchain) -> Result<usize, RuntimeError>;
    fn wait_image(&mut self, swapchain: &mut Self::Swapchain, timeout: i64) -> Result<(), RuntimeError>;
    fn release_image(&mut self, swapchain: &mut Self::Swapchain) -> Result<(), RuntimeError>;

    // Input.

    fn create_action(&mut self, name: &str, ty: ActionType, hands: &[Hand]) -> Result<Self::Action, RuntimeError>;
    fn create_action_space(&mut self, action: &Self::Action, hand: Hand) -> Result<Self::Space, RuntimeError>;
    fn suggest_bindings(&mut self, profile: &str, bindings: &[(&Self::Action, String)]) -> Result<(), RuntimeError>;
    fn attach_action_set(&mut self) -> Result<(), RuntimeError>;
    fn sync_actions(&mut self) -> Result<(), RuntimeError>;
    fn bool_state(&mut self, action: &Self::Action, hand: Hand) -> Result<ActionState<bool>, RuntimeError>;
    fn float_state(&mut self, action: &Self::Action, hand: Hand) -> Result<ActionState<f32>, RuntimeError>;
    fn vector2_state(&mut self, action: &Self::Action, hand: Hand) -> Result<ActionState<Vector2<f32>>, RuntimeError>;
    fn pose_active(&mut self, action: &Self::Action, hand: Hand) -> Result<bool, RuntimeError>;
    fn apply_haptic(&mut self, action: &Self::Action, hand: Hand, duration: Option<i64>, amplitude: f32) -> Result<(), RuntimeError>;
}
