use std::collections::HashSet;
use std::ffi::{CStr, CString, c_void};
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk::Handle;
use cgmath::{One, Quaternion, Vector2, Vector3, Zero};
use tracing::{debug, info, warn};
use wgpu::{Device, DeviceDescriptor, Extent3d, Features, Instance, Queue, TextureDescriptor, TextureDimension, TextureFormat, TextureUsages, TextureView};

#[cfg(target_os = "android")]
use android_activity::AndroidApp;

use crate::action::{ActionState, ActionType, Hand};
use crate::config::Config;
use crate::error::{InitError, RuntimeError};
use crate::pose::Pose;
use crate::projection::Fov;
use crate::session::ReferenceType;
use super::{FrameTiming, ProjectionLayer, Runtime, RuntimeEvent, SessionState, SwapchainInfo, SwapchainUsage, SystemInfo, View, ViewConfig};

const VIEW_CONFIGURATION: openxr::ViewConfigurationType = openxr::ViewConfigurationType::PRIMARY_STEREO;
const COLOR_FORMATS: [TextureFormat; 2] = [TextureFormat::Bgra8UnormSrgb, TextureFormat::Rgba8UnormSrgb];
const DEPTH_FORMATS: [TextureFormat; 2] = [TextureFormat::Depth32Float, TextureFormat::Depth24PlusStencil8];
const LOCAL_FLOOR: openxr::ReferenceSpaceType = openxr::ReferenceSpaceType::from_raw(1000426000); // XR_REFERENCE_SPACE_TYPE_LOCAL_FLOOR(_EXT)

fn xr<T>(call: &'static str, result: openxr::Result<T>) -> Result<T, RuntimeError> {
    result.map_err(|err| RuntimeError::new(call, err))
}

fn gfx<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> InitError {
    move |err| InitError::Graphics(format!("{}: {}", what, err))
}

pub enum OpenXrAction {
    Boolean(openxr::Action<bool>),
    Float(openxr::Action<f32>),
    Vector2(openxr::Action<openxr::Vector2f>),
    Pose(openxr::Action<openxr::Posef>),
    Vibration(openxr::Action<openxr::Haptic>),
}

impl OpenXrAction {
    fn binding(&self, path: openxr::Path) -> openxr::Binding<'_> {
        match self {
            Self::Boolean(action) => openxr::Binding::new(action, path),
            Self::Float(action) => openxr::Binding::new(action, path),
            Self::Vector2(action) => openxr::Binding::new(action, path),
            Self::Pose(action) => openxr::Binding::new(action, path),
            Self::Vibration(action) => openxr::Binding::new(action, path),
        }
    }
}

pub struct OpenXrSwapchain {
    inner: openxr::Swapchain<openxr::Vulkan>,
    usage: SwapchainUsage,
}

pub struct OpenXrRuntime {
    entry: openxr::Entry,
    conn: Option<Connection>,
}

struct Connection {
    action_set: openxr::ActionSet,
    session: openxr::Session<openxr::Vulkan>,
    waiter: openxr::FrameWaiter,
    stream: openxr::FrameStream<openxr::Vulkan>,
    event_buf: openxr::EventDataBuffer,
    device: Device,
    queue: Queue,
    color_format: SwapchainFormat,
    depth_format: Option<SwapchainFormat>,
    reference_spaces: Vec<openxr::ReferenceSpaceType>,
    hand_paths: [openxr::Path; 2],
    system: openxr::SystemId,
    inst: openxr::Instance,
}

#[derive(Clone, Copy)]
struct SwapchainFormat {
    raw: u32,
    wgpu: TextureFormat,
}

impl OpenXrRuntime {
    pub fn new(entry: openxr::Entry) -> Self {
        Self {
            entry,
            conn: None,
        }
    }

    pub fn device(&self) -> Option<&Device> {
        self.conn.as_ref().map(|conn| &conn.device)
    }

    pub fn queue(&self) -> Option<&Queue> {
        self.conn.as_ref().map(|conn| &conn.queue)
    }

    pub fn color_format(&self) -> Option<TextureFormat> {
        self.conn.as_ref().map(|conn| conn.color_format.wgpu)
    }

    pub fn depth_format(&self) -> Option<TextureFormat> {
        self.conn.as_ref().and_then(|conn| conn.depth_format).map(|format| format.wgpu)
    }

    fn conn(&self) -> &Connection {
        self.conn.as_ref().expect("runtime is not connected")
    }

    fn conn_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("runtime is not connected")
    }

    fn hand_path(&self, hand: Hand) -> openxr::Path {
        match hand {
            Hand::Left => self.conn().hand_paths[0],
            Hand::Right => self.conn().hand_paths[1],
            Hand::Both => openxr::Path::NULL,
        }
    }

    fn wrap_images(&self, chain: &openxr::Swapchain<openxr::Vulkan>, info: &SwapchainInfo, format: TextureFormat) -> Result<Vec<TextureView>, RuntimeError> {
        let device = &self.conn().device;
        let images = xr("enumerate_images", chain.enumerate_images())?;

        let (hal_uses, usage) = match info.usage {
            SwapchainUsage::Color => (wgpu::wgt::TextureUses::COLOR_TARGET, TextureUsages::RENDER_ATTACHMENT),
            SwapchainUsage::Depth => (wgpu::wgt::TextureUses::DEPTH_STENCIL_WRITE, TextureUsages::RENDER_ATTACHMENT),
        };

        let size = Extent3d {
            width: info.width,
            height: info.height,
            depth_or_array_layers: 1,
        };

        let descr_hal = wgpu::hal::TextureDescriptor {
            label: None,
            size,
            mip_level_count: 1,
            sample_count: info.sample_count,
            dimension: TextureDimension::D2,
            format,
            usage: hal_uses,
            memory_flags: wgpu::hal::MemoryFlags::empty(),
            view_formats: vec![],
        };

        let descr = TextureDescriptor {
            label: None,
            size,
            mip_level_count: 1,
            sample_count: info.sample_count,
            dimension: TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        };

        let hal_device = unsafe { device.as_hal::<wgpu::hal::vulkan::Api>() }.ok_or_else(|| RuntimeError::new("as_hal", "not a vulkan device"))?;

        let views = images.into_iter().map(|image_raw| {
            let image = ash::vk::Image::from_raw(image_raw);
            let texture_hal = unsafe { hal_device.texture_from_raw(image, &descr_hal, Some(Box::new(|| {})), wgpu::hal::vulkan::TextureMemory::External) }; // The swapchain owns the image.
            let texture = unsafe { device.create_texture_from_hal::<wgpu::hal::vulkan::Api>(texture_hal, &descr) };
            texture.create_view(&Default::default())
        }).collect();

        Ok(views)
    }
}

impl Connection {
    fn new(entry: &openxr::Entry, config: &Config) -> Result<Self, InitError> {
        // This code is based on:
        // - https://openxr-tutorial.com/index.html
        // - https://github.com/rust-mobile/rust-android-examples/blob/main/na-openxr-wgpu/src/lib.rs

        let wgpu_hal_flags = wgpu::InstanceFlags::default();

        // Load Vulkan.

        let vk_entry = unsafe { ash::Entry::load() }.map_err(gfx("unable to load vulkan"))?;
        let drop_guard = Arc::new(Mutex::new(DropGuard::new(vk_entry.clone())));

        // Create OpenXR instance. The Vulkan instance and device are created
        // here (khr_vulkan_enable), since wgpu needs to know which extensions
        // are actually enabled.

        let xr_app_info = openxr::ApplicationInfo {
            application_name: &config.app_name,
            application_version: config.app_version,
            engine_name: &config.engine_name,
            engine_version: config.engine_version,
            ..Default::default()
        };

        let xr_ext_avail = entry.enumerate_extensions().map_err(|err| InitError::NoRuntime(err.to_string()))?;

        let mut xr_ext = openxr::ExtensionSet::default();
        xr_ext.khr_vulkan_enable = true;
        xr_ext.khr_composition_layer_depth = xr_ext_avail.khr_composition_layer_depth;
        xr_ext.ext_local_floor = xr_ext_avail.ext_local_floor;
        xr_ext.fb_display_refresh_rate = xr_ext_avail.fb_display_refresh_rate;

        #[cfg(target_os = "android")]
        {
            xr_ext.khr_android_create_instance = true;
        }

        let xr_inst = entry.create_instance(&xr_app_info, &xr_ext, &[]).map_err(|err| InitError::NoRuntime(err.to_string()))?;
        let xr_system = xr_inst.system(openxr::FormFactor::HEAD_MOUNTED_DISPLAY).map_err(|err| InitError::NoDevice(RuntimeError::new("system", err)))?;

        // Check Vulkan/OpenXR compatibility.

        let xr_gfx_req = xr(
            "graphics_requirements",
            xr_inst.graphics_requirements::<openxr::Vulkan>(xr_system),
        ).map_err(InitError::resource("unable to query graphics requirements"))?;
        let vk_version = unsafe { vk_entry.try_enumerate_instance_version() }.map_err(gfx("unable to query vulkan version"))?.unwrap_or(ash::vk::API_VERSION_1_0);
        let vk_version_conv = openxr::Version::new(
            ash::vk::api_version_major(vk_version) as u16,
            ash::vk::api_version_minor(vk_version) as u16,
            ash::vk::api_version_patch(vk_version),
        );

        // Runtimes tend to report a max_api_version_supported below what
        // works fine, only the minimum is checked.

        if vk_version_conv < xr_gfx_req.min_api_version_supported {
            return Err(InitError::Graphics(format!("vulkan version {} mismatch, openxr min supported version = {}", vk_version_conv, xr_gfx_req.min_api_version_supported)));
        }

        // Create Vulkan instance with the extensions wgpu and OpenXR ask for.

        let vk_app_name = CString::new(config.app_name.as_str()).map_err(gfx("invalid application name"))?;
        let vk_engine_name = CString::new(config.engine_name.as_str()).map_err(gfx("invalid engine name"))?;

        let vk_app_info = ash::vk::ApplicationInfo::default()
            .application_name(&vk_app_name)
            .application_version(config.app_version)
            .engine_name(&vk_engine_name)
            .engine_version(config.engine_version);

        let wgpu_exts = wgpu::hal::vulkan::Instance::desired_extensions(&vk_entry, vk_version, wgpu_hal_flags).map_err(gfx("unable to query wgpu instance extensions"))?;
        let xr_exts_str = xr("vulkan_legacy_instance_extensions", xr_inst.vulkan_legacy_instance_extensions(xr_system))
            .map_err(InitError::resource("unable to query instance extensions"))?;

        let exts_c = dedup_extensions(wgpu_exts.iter().filter_map(|s| s.to_str().ok()).chain(xr_exts_str.split_ascii_whitespace()))?;
        let exts_c_ptr: Box<[_]> = exts_c.iter().map(|s| s.as_ptr()).collect();

        let vk_inst_create_info = ash::vk::InstanceCreateInfo::default()
            .application_info(&vk_app_info)
            .enabled_extension_names(&exts_c_ptr);

        let vk_inst = unsafe { vk_entry.create_instance(&vk_inst_create_info, None) }.map_err(gfx("unable to create vulkan instance"))?;
        drop_guard.lock().map_err(gfx("drop guard poisoned"))?.set_vk_inst(vk_inst.clone());

        // Physical device picked by the runtime.

        let vk_phys_dev_handle = unsafe { xr_inst.vulkan_graphics_device(xr_system, vk_inst.handle().as_raw() as _) }
            .map_err(|err| InitError::NoDevice(RuntimeError::new("vulkan_graphics_device", err)))?;
        let vk_phys_dev = ash::vk::PhysicalDevice::from_raw(vk_phys_dev_handle as _);

        let vk_queue_families = unsafe { vk_inst.get_physical_device_queue_family_properties(vk_phys_dev) };
        let vk_queue_family_index = vk_queue_families
            .into_iter()
            .position(|family| family.queue_flags.contains(ash::vk::QueueFlags::GRAPHICS))
            .ok_or_else(|| InitError::Graphics("no graphics queue".to_string()))? as u32;

        let vk_queue_create_info = ash::vk::DeviceQueueCreateInfo::default()
            .queue_family_index(vk_queue_family_index)
            .queue_priorities(&[1.0]);
        let vk_queue_create_infos = [vk_queue_create_info];

        // Init wgpu.

        let wgpu_hal_exts: Vec<_> = exts_c.into_iter().map(intern_extension).collect();

        #[allow(unused_assignments)]
        #[allow(unused_mut)]
        let mut android_sdk_version = 0;
        #[cfg(target_os = "android")]
        {
            android_sdk_version = AndroidApp::sdk_version() as u32;
        }

        let wgpu_hal_inst = unsafe {
            wgpu::hal::vulkan::Instance::from_raw(vk_entry, vk_inst.clone(), vk_version, android_sdk_version, None, wgpu_hal_exts, wgpu_hal_flags, Default::default(), false, guard_callback(&drop_guard))
        }.map_err(gfx("unable to wrap vulkan instance"))?;
        let wgpu_hal_adapter = wgpu_hal_inst.expose_adapter(vk_phys_dev).ok_or_else(|| InitError::Graphics("unable to expose adapter".to_string()))?;

        // Create Vulkan device with the extensions wgpu and OpenXR ask for.

        let wgpu_features = Features::default();

        let wgpu_exts = wgpu_hal_adapter.adapter.required_device_extensions(wgpu_features);
        let xr_exts_str = xr("vulkan_legacy_device_extensions", xr_inst.vulkan_legacy_device_extensions(xr_system))
            .map_err(InitError::resource("unable to query device extensions"))?;

        let exts_c = dedup_extensions(wgpu_exts.iter().filter_map(|s| s.to_str().ok()).chain(xr_exts_str.split_ascii_whitespace()))?;
        let exts_c_ptr: Box<[_]> = exts_c.iter().map(|s| s.as_ptr()).collect();

        let vk_dev_create_info = ash::vk::DeviceCreateInfo::default()
            .queue_create_infos(&vk_queue_create_infos)
            .enabled_extension_names(&exts_c_ptr);

        let wgpu_phys_exts: Box<[_]> = exts_c.into_iter().map(intern_extension).collect();
        let mut wgpu_phys_features = wgpu_hal_adapter.adapter.physical_device_features(&wgpu_phys_exts, wgpu_features);
        let vk_dev_create_info2 = wgpu_phys_features.add_to_device_create(vk_dev_create_info);

        let vk_dev = unsafe { vk_inst.create_device(vk_phys_dev, &vk_dev_create_info2, None) }.map_err(gfx("unable to create vulkan device"))?;
        drop_guard.lock().map_err(gfx("drop guard poisoned"))?.set_vk_dev(vk_dev.clone());

        // Create OpenXR session.

        let xr_session_create_info = openxr::vulkan::SessionCreateInfo {
            instance: vk_inst.handle().as_raw() as _,
            physical_device: vk_phys_dev_handle,
            device: vk_dev.handle().as_raw() as _,
            queue_family_index: vk_queue_family_index,
            queue_index: 0,
        };

        let (xr_session, xr_waiter, xr_stream) = xr(
            "create_session",
            unsafe { xr_inst.create_session_with_guard::<openxr::Vulkan>(xr_system, &xr_session_create_info, Box::new(Arc::clone(&drop_guard))) },
        ).map_err(InitError::resource("unable to create session"))?;

        if xr_ext.fb_display_refresh_rate {
            set_max_refresh_rate(&xr_session);
        }

        // Swapchain formats, first color format wgpu knows wins.

        let xr_formats = xr("enumerate_swapchain_formats", xr_session.enumerate_swapchain_formats())
            .map_err(InitError::resource("unable to enumerate swapchain formats"))?;

        let find_format = |candidates: &[TextureFormat]| {
            xr_formats.iter().find_map(|xr_format| {
                candidates.iter().find(|wgpu_format| wgpu_hal_adapter.adapter.texture_format_as_raw(**wgpu_format).as_raw() == *xr_format as i32).map(|wgpu_format| SwapchainFormat {
                    raw: *xr_format,
                    wgpu: *wgpu_format,
                })
            })
        };

        let color_format = find_format(&COLOR_FORMATS).ok_or(InitError::NoColorFormat)?;
        let depth_format = if xr_ext.khr_composition_layer_depth { find_format(&DEPTH_FORMATS) } else { None };

        if depth_format.is_none() {
            warn!("no depth swapchain support");
        }

        // Create wgpu device.

        let wgpu_hal_dev = unsafe {
            wgpu_hal_adapter.adapter.device_from_raw(vk_dev.clone(), guard_callback(&drop_guard), &wgpu_phys_exts, wgpu_features, &Default::default(), vk_queue_family_index, 0)
        }.map_err(gfx("unable to wrap vulkan device"))?;

        let wgpu_inst = unsafe { Instance::from_hal::<wgpu::hal::vulkan::Api>(wgpu_hal_inst) };
        let wgpu_adapter = unsafe { wgpu_inst.create_adapter_from_hal(wgpu_hal_adapter) };

        let device_desc = DeviceDescriptor {
            required_features: wgpu_features,
            ..Default::default()
        };
        let (device, queue) = unsafe { wgpu_adapter.create_device_from_hal(wgpu_hal_dev, &device_desc) }.map_err(gfx("unable to create wgpu device"))?;

        // Input: one action set, hand paths resolved once.

        let action_set = xr("create_action_set", xr_inst.create_action_set("input", "Input", 0))
            .map_err(InitError::resource("unable to create action set"))?;

        let hand_paths = [
            xr("string_to_path", xr_inst.string_to_path(Hand::Left.user_path().unwrap_or_default())).map_err(InitError::resource("unable to create hand path"))?,
            xr("string_to_path", xr_inst.string_to_path(Hand::Right.user_path().unwrap_or_default())).map_err(InitError::resource("unable to create hand path"))?,
        ];

        let reference_spaces = xr("enumerate_reference_spaces", xr_session.enumerate_reference_spaces())
            .map_err(InitError::resource("unable to enumerate reference spaces"))?;

        debug!("color format {:?}, depth format {:?}", color_format.wgpu, depth_format.map(|format| format.wgpu));

        Ok(Self {
            action_set,
            session: xr_session,
            waiter: xr_waiter,
            stream: xr_stream,
            event_buf: openxr::EventDataBuffer::new(),
            device,
            queue,
            color_format,
            depth_format,
            reference_spaces,
            hand_paths,
            system: xr_system,
            inst: xr_inst,
        })
    }
}

fn dedup_extensions<'a>(exts: impl Iterator<Item = &'a str>) -> Result<Box<[CString]>, InitError> {
    let exts: HashSet<_> = exts.collect();
    exts.into_iter().map(|s| CString::new(s).map_err(gfx("invalid extension name"))).collect()
}

// wgpu-hal keeps extension names as &'static CStr. Each distinct name is
// leaked once per process, reconnects reuse it.

pub(crate) fn intern_extension(name: CString) -> &'static CStr {
    static INTERNED: Mutex<Vec<&'static CStr>> = Mutex::new(Vec::new());

    let mut interned = INTERNED.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(ext) = interned.iter().copied().find(|ext| *ext == name.as_c_str()) {
        return ext;
    }

    let ext: &'static CStr = Box::leak(name.into_boxed_c_str());
    interned.push(ext);
    ext
}

fn guard_callback(drop_guard: &Arc<Mutex<DropGuard>>) -> Option<wgpu::hal::DropCallback> {
    // Dummy closure is created to hold drop_guard.

    let drop_guard = Arc::clone(drop_guard);
    Some(Box::new(move || { let _ = Arc::strong_count(&drop_guard); }))
}

fn set_max_refresh_rate(session: &openxr::Session<openxr::Vulkan>) {
    let rate = session.enumerate_display_refresh_rates().map(|rates| rates.into_iter().reduce(f32::max));

    match rate {
        Ok(Some(rate)) => match session.request_display_refresh_rate(rate) {
            Ok(()) => info!("display refresh rate set to {} Hz", rate),
            Err(err) => warn!("unable to set display refresh rate: {}", err),
        },
        Ok(None) => (),
        Err(err) => warn!("unable to query display refresh rates: {}", err),
    }
}

fn to_pose(pose: &openxr::Posef, position_valid: bool, orientation_valid: bool) -> Pose {
    let mut result = Pose::invalid();

    if position_valid {
        let pos = pose.position;
        result.position = Vector3::new(pos.x, pos.y, pos.z);
        result.position_valid = true;
    }

    if orientation_valid {
        let rot = pose.orientation;
        result.orientation = Quaternion::new(rot.w, rot.x, rot.y, rot.z);
        result.orientation_valid = true;
    }

    result
}

fn from_pose(pose: &Pose) -> openxr::Posef {
    let pos = if pose.position_valid { pose.position } else { Vector3::zero() };
    let rot = if pose.orientation_valid { pose.orientation } else { Quaternion::one() };

    openxr::Posef {
        orientation: openxr::Quaternionf { x: rot.v.x, y: rot.v.y, z: rot.v.z, w: rot.s },
        position: openxr::Vector3f { x: pos.x, y: pos.y, z: pos.z },
    }
}

fn from_fov(fov: &Fov) -> openxr::Fovf {
    openxr::Fovf {
        angle_left: fov.angle_left,
        angle_right: fov.angle_right,
        angle_up: fov.angle_up,
        angle_down: fov.angle_down,
    }
}

fn to_state<T>(state: openxr::ActionState<T>) -> ActionState<T> {
    ActionState {
        value: state.current_state,
        active: state.is_active,
        changed: state.changed_since_last_sync,
    }
}

fn to_session_state(state: openxr::SessionState) -> SessionState {
    match state {
        openxr::SessionState::IDLE => SessionState::Idle,
        openxr::SessionState::READY => SessionState::Ready,
        openxr::SessionState::SYNCHRONIZED => SessionState::Synchronized,
        openxr::SessionState::VISIBLE => SessionState::Visible,
        openxr::SessionState::FOCUSED => SessionState::Focused,
        openxr::SessionState::STOPPING => SessionState::Stopping,
        openxr::SessionState::LOSS_PENDING => SessionState::LossPending,
        openxr::SessionState::EXITING => SessionState::Exiting,
        _ => SessionState::Unknown,
    }
}

fn reference_space_type(ty: ReferenceType) -> openxr::ReferenceSpaceType {
    match ty {
        ReferenceType::Local => openxr::ReferenceSpaceType::LOCAL,
        ReferenceType::LocalFloor => LOCAL_FLOOR,
        ReferenceType::Stage => openxr::ReferenceSpaceType::STAGE,
    }
}

// Lowercase letters, digits, '-', '_' and '.' only.
fn action_name(name: &str) -> String {
    name.chars().map(|c| match c.to_ascii_lowercase() {
        c @ ('a'..='z' | '0'..='9' | '-' | '_' | '.') => c,
        _ => '_',
    }).collect()
}

impl Runtime for OpenXrRuntime {
    type Space = openxr::Space;
    type Swapchain = OpenXrSwapchain;
    type Image = TextureView;
    type Action = OpenXrAction;

    fn connect(&mut self, config: &Config) -> Result<SystemInfo, InitError> {
        assert!(self.conn.is_none(), "runtime is already connected");

        let conn = Connection::new(&self.entry, config)?;

        let props = xr("system_properties", conn.inst.system_properties(conn.system))
            .map_err(InitError::resource("unable to query system properties"))?;

        self.conn = Some(conn);

        Ok(SystemInfo {
            name: props.system_name,
            vendor_id: props.vendor_id,
        })
    }

    fn disconnect(&mut self) {
        // Session, wgpu device, Vulkan device and instance go in this order (see DropGuard).

        self.conn = None;
    }

    fn view_configs(&mut self) -> Result<Vec<ViewConfig>, RuntimeError> {
        let conn = self.conn();
        let views = xr("enumerate_view_configuration_views", conn.inst.enumerate_view_configuration_views(conn.system, VIEW_CONFIGURATION))?;

        Ok(views.into_iter().map(|view| ViewConfig {
            width: view.recommended_image_rect_width,
            height: view.recommended_image_rect_height,
            sample_count: 1, // The host renderer resolves MSAA itself.
        }).collect())
    }

    fn supports_depth(&self) -> bool {
        self.conn().depth_format.is_some()
    }

    fn supports_reference(&mut self, ty: ReferenceType) -> bool {
        self.conn().reference_spaces.contains(&reference_space_type(ty))
    }

    fn create_reference_space(&mut self, ty: ReferenceType) -> Result<Self::Space, RuntimeError> {
        xr("create_reference_space", self.conn().session.create_reference_space(reference_space_type(ty), openxr::Posef::IDENTITY))
    }

    fn create_view_space(&mut self) -> Result<Self::Space, RuntimeError> {
        xr("create_reference_space", self.conn().session.create_reference_space(openxr::ReferenceSpaceType::VIEW, openxr::Posef::IDENTITY))
    }

    fn create_swapchain(&mut self, info: &SwapchainInfo) -> Result<(Self::Swapchain, Vec<Self::Image>), RuntimeError> {
        let conn = self.conn();

        let (format, usage_flags) = match info.usage {
            SwapchainUsage::Color => (conn.color_format, openxr::SwapchainUsageFlags::COLOR_ATTACHMENT),
            SwapchainUsage::Depth => {
                let format = conn.depth_format.ok_or_else(|| RuntimeError::new("create_swapchain", "no depth format"))?;
                (format, openxr::SwapchainUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            },
        };

        let create_info = openxr::SwapchainCreateInfo {
            create_flags: openxr::SwapchainCreateFlags::EMPTY,
            usage_flags,
            format: format.raw,
            sample_count: info.sample_count,
            width: info.width,
            height: info.height,
            face_count: 1,
            array_size: 1,
            mip_count: 1,
        };

        let chain = xr("create_swapchain", conn.session.create_swapchain(&create_info))?;
        let images = self.wrap_images(&chain, info, format.wgpu)?;

        Ok((OpenXrSwapchain { inner: chain, usage: info.usage }, images))
    }

    fn poll_event(&mut self) -> Result<Option<RuntimeEvent>, RuntimeError> {
        let conn = self.conn_mut();

        loop {
            let Some(event) = xr("poll_event", conn.inst.poll_event(&mut conn.event_buf))? else {
                return Ok(None);
            };

            let event = match event {
                openxr::Event::EventsLost(event) => RuntimeEvent::EventsLost(event.lost_event_count()),
                openxr::Event::InstanceLossPending(_) => RuntimeEvent::InstanceLossPending,
                openxr::Event::SessionStateChanged(event) => RuntimeEvent::SessionStateChanged(to_session_state(event.state())),
                openxr::Event::ReferenceSpaceChangePending(_) => RuntimeEvent::ReferenceSpaceChangePending,
                openxr::Event::InteractionProfileChanged(_) => RuntimeEvent::InteractionProfileChanged,
                _ => continue,
            };

            return Ok(Some(event));
        }
    }

    fn begin_session(&mut self) -> Result<(), RuntimeError> {
        xr("begin", self.conn().session.begin(VIEW_CONFIGURATION)).map(|_| ())
    }

    fn end_session(&mut self) -> Result<(), RuntimeError> {
        xr("end", self.conn().session.end()).map(|_| ())
    }

    fn wait_frame(&mut self) -> Result<FrameTiming, RuntimeError> {
        let state = xr("wait", self.conn_mut().waiter.wait())?;

        Ok(FrameTiming {
            predicted_display_time: state.predicted_display_time.as_nanos(),
            should_render: state.should_render,
        })
    }

    fn begin_frame(&mut self) -> Result<(), RuntimeError> {
        xr("begin", self.conn_mut().stream.begin()).map(|_| ())
    }

    fn end_frame(&mut self, display_time: i64, layer: Option<&ProjectionLayer<'_, Self>>) -> Result<(), RuntimeError> {
        let conn = self.conn_mut();
        let display_time = openxr::Time::from_nanos(display_time);

        let Some(layer) = layer else {
            return xr("end", conn.stream.end(display_time, openxr::EnvironmentBlendMode::OPAQUE, &[]));
        };

        let sub_image = |chain: &OpenXrSwapchain, width: u32, height: u32| openxr::sys::SwapchainSubImage {
            swapchain: chain.inner.as_raw(),
            image_rect: openxr::Rect2Di {
                offset: openxr::Offset2Di { x: 0, y: 0 },
                extent: openxr::Extent2Di { width: width as i32, height: height as i32 },
            },
            image_array_index: 0,
        };

        // Depth infos are referenced by pointer from the projection views,
        // the vector must not reallocate from here on.

        let depth_infos: Vec<_> = layer.views.iter().map(|view| view.depth.as_ref().map(|depth| {
            debug_assert!(depth.swapchain.usage == SwapchainUsage::Depth);

            openxr::sys::CompositionLayerDepthInfoKHR {
                ty: openxr::sys::CompositionLayerDepthInfoKHR::TYPE,
                next: ptr::null(),
                sub_image: sub_image(depth.swapchain, view.width, view.height),
                min_depth: depth.min_depth,
                max_depth: depth.max_depth,
                near_z: depth.near_z,
                far_z: depth.far_z,
            }
        })).collect();

        let views: Vec<_> = layer.views.iter().zip(&depth_infos).map(|(view, depth_info)| {
            let raw = openxr::sys::CompositionLayerProjectionView {
                ty: openxr::sys::CompositionLayerProjectionView::TYPE,
                next: depth_info.as_ref().map_or(ptr::null(), |info| info as *const _ as *const c_void),
                pose: from_pose(&view.pose),
                fov: from_fov(&view.fov),
                sub_image: sub_image(view.swapchain, view.width, view.height),
            };

            unsafe { openxr::CompositionLayerProjectionView::<openxr::Vulkan>::from_raw(raw) }
        }).collect();

        let projection = openxr::CompositionLayerProjection::new()
            .space(layer.space)
            .views(&views);

        xr("end", conn.stream.end(display_time, openxr::EnvironmentBlendMode::OPAQUE, &[&projection]))
    }

    fn locate_views(&mut self, space: &Self::Space, time: i64) -> Result<Vec<View>, RuntimeError> {
        let (flags, views) = xr("locate_views", self.conn().session.locate_views(VIEW_CONFIGURATION, openxr::Time::from_nanos(time), space))?;

        let position_valid = flags.contains(openxr::ViewStateFlags::POSITION_VALID);
        let orientation_valid = flags.contains(openxr::ViewStateFlags::ORIENTATION_VALID);

        Ok(views.iter().map(|view| View {
            pose: to_pose(&view.pose, position_valid, orientation_valid),
            fov: Fov {
                angle_left: view.fov.angle_left,
                angle_right: view.fov.angle_right,
                angle_up: view.fov.angle_up,
                angle_down: view.fov.angle_down,
            },
        }).collect())
    }

    fn locate_space(&mut self, space: &Self::Space, base: &Self::Space, time: i64) -> Result<Pose, RuntimeError> {
        let location = xr("locate", space.locate(base, openxr::Time::from_nanos(time)))?;

        Ok(to_pose(
            &location.pose,
            location.location_flags.contains(openxr::SpaceLocationFlags::POSITION_VALID),
            location.location_flags.contains(openxr::SpaceLocationFlags::ORIENTATION_VALID),
        ))
    }

    fn acquire_image(&mut self, swapchain: &mut Self::Swapchain) -> Result<usize, RuntimeError> {
        xr("acquire_image", swapchain.inner.acquire_image()).map(|index| index as usize)
    }

    fn wait_image(&mut self, swapchain: &mut Self::Swapchain, timeout: i64) -> Result<(), RuntimeError> {
        xr("wait_image", swapchain.inner.wait_image(openxr::Duration::from_nanos(timeout)))
    }

    fn release_image(&mut self, swapchain: &mut Self::Swapchain) -> Result<(), RuntimeError> {
        xr("release_image", swapchain.inner.release_image())
    }

    fn create_action(&mut self, name: &str, ty: ActionType, hands: &[Hand]) -> Result<Self::Action, RuntimeError> {
        let paths: Vec<_> = hands.iter().map(|hand| self.hand_path(*hand)).collect();
        let set = &self.conn().action_set;
        let id = action_name(name);

        let action = match ty {
            ActionType::Boolean => OpenXrAction::Boolean(xr("create_action", set.create_action(&id, name, &paths))?),
            ActionType::Float => OpenXrAction::Float(xr("create_action", set.create_action(&id, name, &paths))?),
            ActionType::Vector2 => OpenXrAction::Vector2(xr("create_action", set.create_action(&id, name, &paths))?),
            ActionType::Pose => OpenXrAction::Pose(xr("create_action", set.create_action(&id, name, &paths))?),
            ActionType::Vibration => OpenXrAction::Vibration(xr("create_action", set.create_action(&id, name, &paths))?),
        };

        Ok(action)
    }

    fn create_action_space(&mut self, action: &Self::Action, hand: Hand) -> Result<Self::Space, RuntimeError> {
        let OpenXrAction::Pose(action) = action else {
            return Err(RuntimeError::new("create_space", "not a pose action"));
        };

        let path = self.hand_path(hand);
        xr("create_space", action.create_space(self.conn().session.clone(), path, openxr::Posef::IDENTITY))
    }

    fn suggest_bindings(&mut self, profile: &str, bindings: &[(&Self::Action, String)]) -> Result<(), RuntimeError> {
        let inst = &self.conn().inst;
        let profile = xr("string_to_path", inst.string_to_path(profile))?;

        let bindings = bindings
            .iter()
            .map(|(action, path)| Ok(action.binding(xr("string_to_path", inst.string_to_path(path))?)))
            .collect::<Result<Vec<_>, RuntimeError>>()?;

        xr("suggest_interaction_profile_bindings", inst.suggest_interaction_profile_bindings(profile, &bindings))
    }

    fn attach_action_set(&mut self) -> Result<(), RuntimeError> {
        let conn = self.conn();
        xr("attach_action_sets", conn.session.attach_action_sets(&[&conn.action_set]))
    }

    fn sync_actions(&mut self) -> Result<(), RuntimeError> {
        let conn = self.conn();
        xr("sync_actions", conn.session.sync_actions(&[(&conn.action_set).into()]))
    }

    fn bool_state(&mut self, action: &Self::Action, hand: Hand) -> Result<ActionState<bool>, RuntimeError> {
        let OpenXrAction::Boolean(action) = action else {
            return Err(RuntimeError::new("get_action_state_boolean", "not a boolean action"));
        };

        xr("get_action_state_boolean", action.state(&self.conn().session, self.hand_path(hand))).map(to_state)
    }

    fn float_state(&mut self, action: &Self::Action, hand: Hand) -> Result<ActionState<f32>, RuntimeError> {
        let OpenXrAction::Float(action) = action else {
            return Err(RuntimeError::new("get_action_state_float", "not a float action"));
        };

        xr("get_action_state_float", action.state(&self.conn().session, self.hand_path(hand))).map(to_state)
    }

    fn vector2_state(&mut self, action: &Self::Action, hand: Hand) -> Result<ActionState<Vector2<f32>>, RuntimeError> {
        let OpenXrAction::Vector2(action) = action else {
            return Err(RuntimeError::new("get_action_state_vector2f", "not a vector2 action"));
        };

        let state = xr("get_action_state_vector2f", action.state(&self.conn().session, self.hand_path(hand)))?;

        Ok(ActionState {
            value: Vector2::new(state.current_state.x, state.current_state.y),
            active: state.is_active,
            changed: state.changed_since_last_sync,
        })
    }

    fn pose_active(&mut self, action: &Self::Action, hand: Hand) -> Result<bool, RuntimeError> {
        let OpenXrAction::Pose(action) = action else {
            return Err(RuntimeError::new("get_action_state_pose", "not a pose action"));
        };

        xr("get_action_state_pose", action.is_active(&self.conn().session, self.hand_path(hand)))
    }

    fn apply_haptic(&mut self, action: &Self::Action, hand: Hand, duration: Option<i64>, amplitude: f32) -> Result<(), RuntimeError> {
        let OpenXrAction::Vibration(action) = action else {
            return Err(RuntimeError::new("apply_haptic_feedback", "not a vibration action"));
        };

        let duration = duration.map_or(openxr::Duration::MIN_HAPTIC, openxr::Duration::from_nanos);
        let event = openxr::HapticVibration::new().duration(duration).frequency(openxr::FREQUENCY_UNSPECIFIED).amplitude(amplitude);

        xr("apply_haptic_feedback", action.apply_feedback(&self.conn().session, self.hand_path(hand), &event))
    }
}

struct DropGuard {
    vk_inst: Option<ash::Instance>,
    vk_dev: Option<ash::Device>,
    _vk_entry: ash::Entry, // Make sure it is dropped last.
}

impl DropGuard {
    fn new(vk_entry: ash::Entry) -> Self {
        Self {
            vk_inst: None,
            vk_dev: None,
            _vk_entry: vk_entry,
        }
    }

    fn set_vk_inst(&mut self, vk_inst: ash::Instance) {
        assert!(self.vk_inst.is_none());
        self.vk_inst = Some(vk_inst);
    }

    fn set_vk_dev(&mut self, vk_dev: ash::Device) {
        assert!(self.vk_dev.is_none());
        self.vk_dev = Some(vk_dev);
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        // OpenXR/wgpu don't own the Vulkan handles created in Connection::new().
        // DropGuard sits in an Arc referenced by their drop guards, the handles
        // go once the last of them is dropped. A failed init drops the guard
        // right away, with whatever it got so far.

        if let Some(vk_dev) = &self.vk_dev {
            // The parent Instance must outlive the Device, which only goes via destroy_device().

            unsafe { vk_dev.destroy_device(None) };
        }

        if let Some(vk_inst) = &self.vk_inst {
            unsafe { vk_inst.destroy_instance(None) };
        }

        // No Vulkan functions loaded from _vk_entry may be called after this.
    }
}
