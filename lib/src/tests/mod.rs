use cgmath::{Deg, InnerSpace, Matrix4, One, Quaternion, Rotation3, SquareMatrix, Vector2, Vector3, Vector4};

use crate::action::{ActionId, ActionState, ActionType, Component, Hand, BASELINE_PROFILE};
use crate::config::Config;
use crate::error::InitError;
use crate::pose::{Pose, ReferenceFrame};
use crate::projection::{self, ClipSpace, Fov};
use crate::renderer::{MatrixMode, Rect};
use crate::runtime::{RuntimeEvent, SessionState};
use crate::session::{Lifecycle, ReferenceType, Session, XrState};


use mock::{DISPLAY_TIME, MockDepth, MockRenderer, MockRuntime, MockState, StateRc};

type MockSession = Session<MockRuntime, MockRenderer>;

const EPS: f32 = 1e-5;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();
}

fn new_session(state: &StateRc) -> MockSession {
    init_tracing();
    Session::new(MockRuntime::new(state), MockRenderer::new(), Config::default())
}

fn connected(state: &StateRc) -> MockSession {
    let mut session = new_session(state);
    session.init().expect("Unable to init session");
    session
}

// Connected session which went through READY, so frames can be rendered.
fn running(state: &StateRc) -> MockSession {
    let mut session = connected(state);

    push_state(state, SessionState::Ready);
    push_state(state, SessionState::Synchronized);
    push_state(state, SessionState::Visible);
    push_state(state, SessionState::Focused);
    session.update();

    session
}

fn push_state(state: &StateRc, session_state: SessionState) {
    state.borrow_mut().events.push_back(RuntimeEvent::SessionStateChanged(session_state));
}

fn assert_vec3(a: Vector3<f32>, b: Vector3<f32>) {
    assert!((a - b).magnitude() < EPS, "{:?} != {:?}", a, b);
}

fn render_frame(session: &mut MockSession) -> usize {
    let count = session.begin_frame();

    for i in 0..count {
        session.begin_view(i);
        session.end_view();
    }

    session.end_frame();
    count
}

// Pose and projection math.

#[test]
fn test_compose() {
    let frame = ReferenceFrame {
        position: Vector3::new(1.0, 0.0, -2.0),
        orientation: Quaternion::from_angle_y(Deg(90.0)),
    };

    let raw = Pose::new(Vector3::new(0.0, 1.5, 0.0), Quaternion::from_angle_x(Deg(10.0)));
    let pose = frame.compose(&raw);

    assert!(pose.is_valid());
    assert_vec3(pose.position, Vector3::new(1.0, 1.5, -2.0));
    assert!((pose.orientation - frame.orientation * raw.orientation).magnitude() < EPS);

    assert_eq!(ReferenceFrame::identity().compose(&raw), raw);
}

#[test]
fn test_compose_keeps_validity() {
    let frame = ReferenceFrame {
        position: Vector3::new(5.0, 5.0, 5.0),
        orientation: Quaternion::from_angle_z(Deg(45.0)),
    };

    let mut raw = Pose::new(Vector3::new(1.0, 2.0, 3.0), Quaternion::one());
    raw.position_valid = false;

    let pose = frame.compose(&raw);
    assert!(!pose.position_valid);
    assert!(pose.orientation_valid);
    assert_eq!(pose.position, Vector3::new(0.0, 0.0, 0.0));

    let mut raw = Pose::new(Vector3::new(1.0, 2.0, 3.0), Quaternion::from_angle_x(Deg(30.0)));
    raw.orientation_valid = false;

    let pose = frame.compose(&raw);
    assert!(pose.position_valid);
    assert!(!pose.orientation_valid);
    assert_eq!(pose.orientation, Quaternion::one());

    assert_eq!(frame.compose(&Pose::invalid()), Pose::invalid());
}

#[test]
fn test_perspective() {
    let angle = 45f32.to_radians();

    let fov = Fov {
        angle_left: -angle,
        angle_right: angle,
        angle_up: angle,
        angle_down: -angle,
    };

    let (near, far) = (0.1, 100.0);

    // A point on the near plane maps to z = -1 (OpenGL) or 0 (wgpu), far plane to 1.

    let project = |clip, z: f32| {
        let p = projection::perspective(&fov, near, far, clip) * Vector4::new(0.0, -z, -z, 1.0);
        p.truncate() / p.w
    };

    let p = project(ClipSpace::OpenGl, near);
    assert!((p.z + 1.0).abs() < 1e-4 && (p.y + 1.0).abs() < 1e-4);
    assert!((project(ClipSpace::OpenGl, far).z - 1.0).abs() < 1e-4);

    let p = project(ClipSpace::Wgpu, near);
    assert!(p.z.abs() < 1e-4 && (p.y + 1.0).abs() < 1e-4);
    assert!((project(ClipSpace::Wgpu, far).z - 1.0).abs() < 1e-4);

    // Vulkan: y down.

    let p = project(ClipSpace::Vulkan, near);
    assert!(p.z.abs() < 1e-4 && (p.y - 1.0).abs() < 1e-4);

    // Infinite far plane.

    let m = projection::perspective(&fov, near, 0.0, ClipSpace::Wgpu);
    assert_eq!(m.z.z, -1.0);
    assert!((m.w.z + near).abs() < EPS);
}

#[test]
fn test_view_matrix() {
    let pose = Pose::new(Vector3::new(1.0, 2.0, 3.0), Quaternion::from_angle_y(Deg(90.0)));
    let m = projection::view_matrix(&pose);

    // The camera position ends up in the origin, its forward (-z) stays -z.

    assert_vec3((m * Vector4::new(1.0, 2.0, 3.0, 1.0)).truncate(), Vector3::new(0.0, 0.0, 0.0));

    let forward = pose.orientation * Vector3::new(0.0, 0.0, -1.0);
    assert_vec3((m * forward.extend(0.0)).truncate(), Vector3::new(0.0, 0.0, -1.0));

    let camera = Matrix4::from_translation(pose.position) * Matrix4::from(pose.orientation);
    let id = m * camera;
    assert!((id - Matrix4::identity()).x.magnitude() < EPS);
}

// Session lifecycle.

#[test]
fn test_init_close() {
    let state = MockState::new();
    let mut session = new_session(&state);

    assert_eq!(session.lifecycle(), Lifecycle::Uninitialized);
    assert!(!session.is_connected());
    assert_eq!(session.state(), XrState::Unknown);

    session.init().expect("Unable to init session");
    session.init().expect("Unable to init session"); // Already initialized, nothing happens.

    assert_eq!(state.borrow().connect_count, 1);
    assert!(session.is_connected());
    assert_eq!(session.lifecycle(), Lifecycle::Connected);
    assert_eq!(session.system_info().map(|info| info.name.as_str()), Some("Mock HMD"));
    assert_eq!(session.reference(), ReferenceType::LocalFloor);

    // 2 spaces, color and depth swapchain per view.

    assert_eq!(state.borrow().live, 6);

    session.close();
    session.close();

    let s = state.borrow();
    assert_eq!(s.live, 0);
    assert!(!s.connected);
    assert_eq!(s.called("disconnect"), 1);
    assert_eq!(session.lifecycle(), Lifecycle::Closed);
    assert!(!session.is_connected());
}

#[test]
fn test_close_unloads_renderer_resources() {
    let state = MockState::new();
    state.borrow_mut().depth = false;

    let mut session = running(&state);

    assert_eq!(session.renderer().live, (2, 2));
    assert_eq!(render_frame(&mut session), 2);

    session.close();
    assert_eq!(session.renderer().live, (0, 0));

    // Every init/close cycle gives back what it loaded.

    session.init().expect("Unable to init session");
    assert_eq!(session.renderer().live, (2, 2));
    session.close();

    let renderer = session.renderer();
    assert_eq!(renderer.live, (0, 0));
    assert_eq!((renderer.framebuffers, renderer.depth_buffers), (4, 4));
}

#[test]
fn test_init_no_device() {
    let state = MockState::new();
    state.borrow_mut().fail_connect = true;

    let mut session = new_session(&state);

    assert!(matches!(session.init(), Err(InitError::NoDevice(_))));
    assert!(!session.is_connected());
    assert_eq!(state.borrow().called("disconnect"), 0);
}

#[test]
fn test_init_resource_failure() {
    let state = MockState::new();
    state.borrow_mut().fail_swapchain = true;

    let mut session = new_session(&state);

    assert!(matches!(session.init(), Err(InitError::Resource { .. })));
    assert!(!session.is_connected());

    let s = state.borrow();
    assert_eq!(s.live, 0);
    assert!(!s.connected);
    drop(s);

    assert_eq!(session.renderer().live, (0, 0));
}

#[test]
fn test_init_partial_failure_unloads() {
    let state = MockState::new();
    {
        let mut s = state.borrow_mut();
        s.depth = false;
        s.fail_swapchain_after = Some(1);
    }

    let mut session = new_session(&state);

    assert!(matches!(session.init(), Err(InitError::Resource { .. })));
    assert_eq!(state.borrow().live, 0);

    // First view was fully built before the second one failed.

    let renderer = session.renderer();
    assert_eq!((renderer.framebuffers, renderer.depth_buffers), (1, 1));
    assert_eq!(renderer.live, (0, 0));
}

#[test]
fn test_drop_closes() {
    let state = MockState::new();

    {
        let mut session = running(&state);
        session.load_action("select", ActionType::Boolean, Hand::Both);
    }

    let s = state.borrow();
    assert_eq!(s.live, 0);
    assert!(!s.connected);
}

#[test]
fn test_state_transitions() {
    let state = MockState::new();
    let mut session = connected(&state);

    push_state(&state, SessionState::Idle);
    session.update();
    assert_eq!(session.state(), XrState::Idle);
    assert_eq!(session.begin_frame(), 0); // Not running yet.

    push_state(&state, SessionState::Ready);
    session.update();
    assert_eq!(session.state(), XrState::Idle);
    assert_eq!(state.borrow().called("begin_session"), 1);
    assert_eq!(state.borrow().called("wait_frame"), 1);
    session.end_frame();

    push_state(&state, SessionState::Synchronized);
    push_state(&state, SessionState::Visible);
    push_state(&state, SessionState::Focused);
    session.update();
    assert_eq!(session.state(), XrState::Focused);
    assert!(session.is_focused());

    // Whole queue is drained within one update, each state only once.

    assert!(state.borrow().events.is_empty());

    push_state(&state, SessionState::Visible);
    push_state(&state, SessionState::Stopping);
    session.update();

    let waits = state.borrow().called("wait_frame");
    assert_eq!(session.state(), XrState::Idle);
    assert!(!session.is_focused());
    assert_eq!(state.borrow().called("end_session"), 1);
    assert_eq!(session.begin_frame(), 0);

    session.update();
    assert_eq!(state.borrow().called("wait_frame"), waits); // Stopped: no more frame waits.
}

#[test]
fn test_events_lost_not_fatal() {
    let state = MockState::new();
    let mut session = running(&state);

    state.borrow_mut().events.push_back(RuntimeEvent::EventsLost(12));
    state.borrow_mut().events.push_back(RuntimeEvent::ReferenceSpaceChangePending);
    state.borrow_mut().events.push_back(RuntimeEvent::InteractionProfileChanged);
    session.update();

    assert!(session.is_connected());
    assert_eq!(session.state(), XrState::Focused);
}

#[test]
fn test_exiting_disconnects() {
    let state = MockState::new();
    let mut session = running(&state);

    push_state(&state, SessionState::Stopping);
    push_state(&state, SessionState::Exiting);
    push_state(&state, SessionState::Idle); // Never seen.
    session.update();

    assert!(!session.is_connected());
    assert!(!session.is_focused());
    assert_eq!(session.state(), XrState::Unknown);
    assert_eq!(session.lifecycle(), Lifecycle::Disconnected);

    let s = state.borrow();
    assert_eq!(s.live, 0);
    assert!(!s.connected);
    assert_eq!(s.events.len(), 1);
    drop(s);

    // No-op while disconnected.

    session.update();
    session.close();
    assert_eq!(session.lifecycle(), Lifecycle::Disconnected);
}

#[test]
fn test_instance_loss_disconnects() {
    let state = MockState::new();
    let mut session = running(&state);

    state.borrow_mut().events.push_back(RuntimeEvent::InstanceLossPending);
    session.update();

    assert!(!session.is_connected());
    assert_eq!(session.lifecycle(), Lifecycle::Disconnected);
}

#[test]
fn test_frame_loop_survives_exit() {
    let state = MockState::new();
    let mut session = running(&state);

    let mut rendered = Vec::new();

    for tick in 0..3 {
        if tick == 1 {
            push_state(&state, SessionState::Exiting);
        }

        session.update();

        let count = session.begin_frame();
        for i in 0..count {
            session.begin_view(i);
            session.end_view();
        }
        session.end_frame();

        rendered.push(count);
    }

    assert_eq!(rendered, vec![2, 0, 0]);
    assert!(!session.is_connected());
    assert_eq!(session.lifecycle(), Lifecycle::Disconnected);
    assert_eq!(session.view_pose(), Pose::invalid());

    let s = state.borrow();
    assert_eq!(s.called("end_frame"), 1);
    assert_eq!(s.live, 0);
    drop(s);

    let renderer = session.renderer();
    assert_eq!(renderer.live, (0, 0));
    assert!(renderer.is_default());
}

#[test]
#[should_panic(expected = "session is not connected")]
fn test_begin_view_after_exiting() {
    let state = MockState::new();
    let mut session = running(&state);

    push_state(&state, SessionState::LossPending);
    session.update();

    assert_eq!(session.begin_frame(), 0);
    session.begin_view(0);
}

#[test]
#[should_panic(expected = "session is not connected")]
fn test_query_after_exiting() {
    let state = MockState::new();
    let mut session = running(&state);

    let select = session.load_action("select", ActionType::Boolean, Hand::Both);

    push_state(&state, SessionState::Exiting);
    session.update();

    session.get_bool_state(select, Hand::Left);
}

// Reference frame and spaces.

#[test]
fn test_reference_frame_round_trip() {
    let state = MockState::new();
    let mut session = new_session(&state);

    assert_eq!(session.reference_frame(), ReferenceFrame::identity());

    let frame = ReferenceFrame {
        position: Vector3::new(0.25, -1.0, 7.5),
        orientation: Quaternion::from_angle_y(Deg(33.0)),
    };

    session.set_reference_frame(frame);
    assert_eq!(session.reference_frame(), frame);

    session.set_position(Vector3::new(1.0, 2.0, 3.0));
    session.set_orientation(Quaternion::one());
    assert_eq!(session.reference_frame().position, Vector3::new(1.0, 2.0, 3.0));
    assert_eq!(session.reference_frame().orientation, Quaternion::one());

    assert!(state.borrow().calls.is_empty());
}

#[test]
fn test_reference_fallback() {
    let state = MockState::new();
    state.borrow_mut().references = vec![ReferenceType::Local];

    let mut session = connected(&state);
    assert_eq!(session.reference(), ReferenceType::Local);

    assert!(!session.set_reference(ReferenceType::Stage));
    assert_eq!(session.reference(), ReferenceType::Local);

    state.borrow_mut().references.push(ReferenceType::Stage);
    let live = state.borrow().live;

    assert!(session.set_reference(ReferenceType::Stage));
    assert_eq!(session.reference(), ReferenceType::Stage);
    assert_eq!(state.borrow().live, live); // Old space released.
}

#[test]
fn test_view_pose() {
    let state = MockState::new();
    let mut session = connected(&state);

    state.borrow_mut().located_pose = Pose::new(Vector3::new(0.0, 1.7, 0.0), Quaternion::one());

    // No frame timing yet.

    assert_eq!(session.view_pose(), Pose::invalid());
    assert_eq!(state.borrow().locate_calls, 0);

    drop(session);
    let mut session = running(&state);
    session.set_position(Vector3::new(10.0, 0.0, 0.0));

    let pose = session.view_pose();
    assert!(pose.is_valid());
    assert_vec3(pose.position, Vector3::new(10.0, 1.7, 0.0));
}

// Frame and view pipeline.

#[test]
fn test_frame() {
    let state = MockState::new();
    let mut session = running(&state);

    session.set_position(Vector3::new(0.0, 0.0, 5.0));

    assert_eq!(session.begin_frame(), 2);

    for i in 0..2 {
        session.begin_view(i);

        let renderer = session.renderer();
        assert_eq!(renderer.viewport, Some(Rect::from_size(1000, 1100)));
        assert_eq!(renderer.scissor, Some(Rect::from_size(1000, 1100)));
        assert!(renderer.depth_test);
        assert_eq!(renderer.stack, [1, 1]);

        let (_, color, depth) = renderer.enabled.expect("No framebuffer bound");
        assert!(color.is_some());
        assert!(matches!(depth, Some(MockDepth::Image(_))));
        assert_eq!(state.borrow().acquired, 2);

        // Camera at the composed pose: the eye position maps to the origin.

        let view_m = renderer.matrices.iter().rev().find(|(mode, _)| *mode == MatrixMode::ModelView).expect("No view matrix").1;
        assert_vec3((view_m * Vector4::new(0.0, 1.6, 5.0, 1.0)).truncate(), Vector3::new(0.0, 0.0, 0.0));

        session.end_view();

        assert!(session.renderer().is_default());
        assert_eq!(state.borrow().acquired, 0);
    }

    session.end_frame();

    let s = state.borrow();
    let frame = s.frames.last().expect("No frame submitted");
    assert_eq!(frame.display_time, DISPLAY_TIME);

    let views = frame.views.as_ref().expect("No layer submitted");
    assert_eq!(views.len(), 2);

    for view in views {
        // Raw pose goes to the compositor, not the composed one.

        assert_vec3(view.pose.position, Vector3::new(0.0, 1.6, 0.0));
        assert_eq!((view.width, view.height), (1000, 1100));
        assert_eq!(view.depth, Some((0.01, 1000.0)));
    }

    assert!(s.position("begin_frame") < s.position("end_frame"));
}

#[test]
fn test_frame_flushes_batch() {
    let state = MockState::new();
    let mut session = running(&state);

    assert_eq!(render_frame(&mut session), 2);

    // Before binding and after drawing, per view.

    assert_eq!(session.renderer().flushes, 4);
}

#[test]
fn test_depth_fallback() {
    let state = MockState::new();
    state.borrow_mut().depth = false;

    let mut session = running(&state);

    // Color swapchains and 2 spaces only, depth is local.

    assert_eq!(state.borrow().live, 4);
    assert_eq!(session.renderer().depth_buffers, 2);

    assert_eq!(render_frame(&mut session), 2);

    for (_, _, depth) in &session.renderer().bound {
        assert!(matches!(depth, Some(MockDepth::Buffer(_))));
    }

    let s = state.borrow();
    let views = s.frames[0].views.as_ref().expect("No layer submitted");
    assert!(views.iter().all(|view| view.depth.is_none()));
}

#[test]
fn test_depth_disabled_by_config() {
    let state = MockState::new();
    init_tracing();

    let config = Config {
        depth_submission: false,
        ..Default::default()
    };

    let mut session = Session::new(MockRuntime::new(&state), MockRenderer::new(), config);
    session.init().expect("Unable to init session");

    assert_eq!(session.renderer().depth_buffers, 2);
}

#[test]
fn test_should_not_render() {
    let state = MockState::new();
    state.borrow_mut().should_render = false;

    let mut session = running(&state);

    assert_eq!(session.begin_frame(), 0);
    session.end_frame();

    let s = state.borrow();
    assert_eq!(s.frames.len(), 1);
    assert_eq!(s.frames[0].views, None);
}

#[test]
fn test_zero_views() {
    let state = MockState::new();
    {
        let mut s = state.borrow_mut();
        s.view_configs.clear();
        s.views.clear();
    }

    let mut session = running(&state);

    assert_eq!(render_frame(&mut session), 0);
    assert_eq!(state.borrow().frames[0].views, None);
}

#[test]
fn test_end_frame_without_frame() {
    let state = MockState::new();
    let mut session = running(&state);

    session.end_frame();
    assert_eq!(state.borrow().called("end_frame"), 0);

    // One frame per update.

    assert_eq!(render_frame(&mut session), 2);
    assert_eq!(render_frame(&mut session), 0);
    assert_eq!(state.borrow().called("end_frame"), 1);
}

#[test]
#[should_panic(expected = "begin_frame() called twice")]
fn test_begin_frame_twice() {
    let state = MockState::new();
    let mut session = running(&state);

    session.begin_frame();
    session.begin_frame();
}

#[test]
#[should_panic(expected = "view index 2 out of range")]
fn test_begin_view_out_of_range() {
    let state = MockState::new();
    let mut session = running(&state);

    let count = session.begin_frame();
    session.begin_view(count);
}

#[test]
#[should_panic(expected = "begin_view() while another view is open")]
fn test_begin_view_nested() {
    let state = MockState::new();
    let mut session = running(&state);

    session.begin_frame();
    session.begin_view(0);
    session.begin_view(1);
}

#[test]
#[should_panic(expected = "end_view() without begin_view()")]
fn test_end_view_without_begin() {
    let state = MockState::new();
    let mut session = running(&state);

    session.begin_frame();
    session.end_view();
}

#[test]
#[should_panic(expected = "end_frame() while a view is open")]
fn test_end_frame_with_open_view() {
    let state = MockState::new();
    let mut session = running(&state);

    session.begin_frame();
    session.begin_view(0);
    session.end_frame();
}

#[test]
#[should_panic(expected = "reference type can't change during a frame")]
fn test_set_reference_during_frame() {
    let state = MockState::new();
    let mut session = running(&state);

    session.begin_frame();
    session.set_reference(ReferenceType::Stage);
}

// Actions and bindings.

#[test]
fn test_both_hands_binding() {
    let state = MockState::new();
    let mut session = connected(&state);

    let menu = session.load_action("menu", ActionType::Boolean, Hand::Both);
    session.select_profile("/interaction_profiles/valve/index_controller");
    session.suggest_binding_pro(menu, Hand::Both, "/input/b/click");
    session.update();

    let s = state.borrow();
    assert_eq!(s.suggestions, vec![(
        "/interaction_profiles/valve/index_controller".to_string(),
        vec![
            ("menu".to_string(), "/user/hand/left/input/b/click".to_string()),
            ("menu".to_string(), "/user/hand/right/input/b/click".to_string()),
        ],
    )]);
}

#[test]
fn test_component_binding() {
    let state = MockState::new();
    let mut session = connected(&state);

    let aim = session.load_action("aim", ActionType::Pose, Hand::Right);
    let menu = session.load_action("menu", ActionType::Boolean, Hand::Both);
    session.suggest_binding(aim, Component::AimPose);
    session.suggest_binding(menu, Component::Menu);
    session.update();

    let s = state.borrow();
    assert_eq!(s.suggestions.len(), 1);

    let (profile, bindings) = &s.suggestions[0];
    assert_eq!(profile, BASELINE_PROFILE);
    assert_eq!(bindings, &vec![
        ("aim".to_string(), "/user/hand/right/input/aim/pose".to_string()),
        ("menu".to_string(), "/user/hand/left/input/menu/click".to_string()),
        ("menu".to_string(), "/user/hand/right/input/menu/click".to_string()),
    ]);

    assert_eq!(s.called("create_action_space:aim"), 1);
}

#[test]
fn test_binding_outside_mask() {
    let state = MockState::new();
    let mut session = connected(&state);

    let grip = session.load_action("grip", ActionType::Pose, Hand::Left);
    session.select_profile("/interaction_profiles/htc/vive_controller");
    session.suggest_binding_pro(grip, Hand::Both, "/input/grip/pose");
    session.update();

    let s = state.borrow();
    assert_eq!(s.suggestions[0].1, vec![("grip".to_string(), "/user/hand/left/input/grip/pose".to_string())]);
}

#[test]
fn test_profiles_flushed_before_attach() {
    let state = MockState::new();
    let mut session = connected(&state);

    let select = session.load_action("select", ActionType::Boolean, Hand::Both);

    session.select_profile("A");
    session.suggest_binding_pro(select, Hand::Left, "/input/trigger/click");
    assert_eq!(state.borrow().called("suggest:A"), 0); // Buffered.

    session.select_profile("B");
    assert_eq!(state.borrow().called("suggest:A"), 1);

    session.suggest_binding_pro(select, Hand::Right, "/input/a/click");
    session.suggest_binding(select, Component::Select);
    session.update();

    let s = state.borrow();
    let profiles: Vec<_> = s.suggestions.iter().map(|(profile, _)| profile.as_str()).collect();
    assert_eq!(profiles, vec!["A", "B", BASELINE_PROFILE]);

    assert_eq!(s.suggestions[0].1, vec![("select".to_string(), "/user/hand/left/input/trigger/click".to_string())]);
    assert_eq!(s.suggestions[1].1, vec![("select".to_string(), "/user/hand/right/input/a/click".to_string())]);

    let attach = s.position("attach").expect("Action set not attached");
    assert!(s.position(&format!("suggest:{}", BASELINE_PROFILE)) < Some(attach));
    assert_eq!(s.called("attach"), 1);
    drop(s);

    session.update();
    assert_eq!(state.borrow().called("attach"), 1);
}

#[test]
fn test_empty_profile_not_flushed() {
    let state = MockState::new();
    let mut session = connected(&state);

    session.load_action("select", ActionType::Boolean, Hand::Both);
    session.select_profile("A");
    session.update();

    let s = state.borrow();
    assert!(s.suggestions.is_empty());
    assert_eq!(s.called("attach"), 1);
}

#[test]
#[should_panic(expected = "interaction profile A selected twice")]
fn test_profile_selected_twice() {
    let state = MockState::new();
    let mut session = connected(&state);

    session.select_profile("A");
    session.select_profile("B");
    session.select_profile("A");
}

#[test]
#[should_panic(expected = "select_profile() after the action set was attached")]
fn test_profile_selected_after_attach() {
    let state = MockState::new();
    let mut session = connected(&state);

    let select = session.load_action("select", ActionType::Boolean, Hand::Both);
    session.select_profile("A");
    session.suggest_binding_pro(select, Hand::Both, "/input/x/click");
    session.select_profile("B");
    session.update();

    session.select_profile("A");
}

#[test]
#[should_panic(expected = "binding suggested after the action set was attached")]
fn test_binding_after_attach() {
    let state = MockState::new();
    let mut session = connected(&state);

    let select = session.load_action("select", ActionType::Boolean, Hand::Both);
    session.update();

    session.suggest_binding(select, Component::Select);
}

#[test]
#[should_panic(expected = "action state queried before the action set was attached")]
fn test_query_before_attach() {
    let state = MockState::new();
    let mut session = connected(&state);

    let select = session.load_action("select", ActionType::Boolean, Hand::Both);
    session.get_bool_state(select, Hand::Left);
}

#[test]
#[should_panic(expected = "action select is Boolean, queried as Float")]
fn test_query_wrong_type() {
    let state = MockState::new();
    let mut session = connected(&state);

    let select = session.load_action("select", ActionType::Boolean, Hand::Both);
    session.update();

    session.get_float_state(select, Hand::Left);
}

#[test]
fn test_load_action_after_attach() {
    let state = MockState::new();
    let mut session = running(&state);

    let late = session.load_action("late", ActionType::Boolean, Hand::Both);
    assert!(late.is_null());
    assert_eq!(state.borrow().called("create_action:late"), 0);

    // The null action is accepted everywhere after attachment.

    assert_eq!(session.get_bool_state(late, Hand::Left), ActionState::inactive(false));
    assert_eq!(session.get_pose(late, Hand::Right), Pose::invalid());
    session.apply_haptic(late, Hand::Both, -1, 1.0);
    assert!(state.borrow().haptics.is_empty());
}

#[test]
fn test_null_action_before_attach() {
    let state = MockState::new();
    let mut session = connected(&state);

    session.suggest_binding(ActionId::NULL, Component::Menu);
    session.select_profile("A");
    session.suggest_binding_pro(ActionId::NULL, Hand::Left, "/input/x/click");
    session.update();

    assert!(state.borrow().suggestions.is_empty());
}

#[test]
fn test_bool_state() {
    let state = MockState::new();
    let mut session = connected(&state);

    let select = session.load_action("select", ActionType::Boolean, Hand::Both);
    session.suggest_binding(select, Component::Select);
    session.update();

    let pressed = ActionState {
        value: true,
        active: true,
        changed: true,
    };
    state.borrow_mut().bool_states.insert(("select".to_string(), Hand::Right), pressed);

    assert_eq!(session.get_bool_state(select, Hand::Right), pressed);
    assert!(session.get_bool(select, Hand::Right));
    assert_eq!(session.get_bool_state(select, Hand::Left), ActionState::inactive(false));
}

#[test]
fn test_neutral_values() {
    let state = MockState::new();
    let mut session = connected(&state);

    let trigger = session.load_action("trigger", ActionType::Float, Hand::Both);
    let stick = session.load_action("stick", ActionType::Vector2, Hand::Left);
    let select = session.load_action("select", ActionType::Boolean, Hand::Both);
    session.update();

    // Runtime failure.

    assert_eq!(session.get_float_state(trigger, Hand::Left), ActionState::inactive(0.0));
    assert_eq!(session.get_float(trigger, Hand::Right), 0.0);

    // Inactive, stale value dropped.

    assert_eq!(session.get_vector2_state(stick, Hand::Left), ActionState::inactive(Vector2::new(0.0, 0.0)));

    // Not queryable: both hands at once, or a hand outside the mask.

    let calls = state.borrow().state_calls;
    assert_eq!(session.get_bool_state(select, Hand::Both), ActionState::inactive(false));
    assert_eq!(session.get_vector2(stick, Hand::Right), Vector2::new(0.0, 0.0));
    assert_eq!(state.borrow().state_calls, calls);
}

#[test]
fn test_inactive_pose() {
    let state = MockState::new();
    let mut session = running(&state);

    let aim = session.load_action("aim", ActionType::Pose, Hand::Both);
    assert!(aim.is_null()); // Attached already.

    drop(session);
    let mut session = connected(&state);

    let aim = session.load_action("aim", ActionType::Pose, Hand::Both);
    session.suggest_binding(aim, Component::AimPose);
    push_state(&state, SessionState::Ready);
    session.update();

    state.borrow_mut().located_pose = Pose::new(Vector3::new(1.0, 1.0, 1.0), Quaternion::one());
    let locates = state.borrow().locate_calls;

    let pose = session.get_pose_state(aim, Hand::Left);
    assert!(!pose.active);
    assert_eq!(pose.value, Pose::invalid());
    assert_eq!(state.borrow().locate_calls, locates);
}

#[test]
fn test_active_pose() {
    let state = MockState::new();
    let mut session = connected(&state);

    let grip = session.load_action("grip", ActionType::Pose, Hand::Both);
    session.suggest_binding(grip, Component::GripPose);
    push_state(&state, SessionState::Ready);
    session.update();

    state.borrow_mut().pose_active.insert(("grip".to_string(), Hand::Left), true);
    session.set_reference_frame(ReferenceFrame {
        position: Vector3::new(0.0, 0.0, -3.0),
        orientation: Quaternion::one(),
    });

    // Active but untracked.

    let pose = session.get_pose_state(grip, Hand::Left);
    assert!(pose.active);
    assert_eq!(pose.value, Pose::invalid());

    // Tracked, composed with the reference frame.

    let mut located = Pose::new(Vector3::new(0.2, 1.0, -0.3), Quaternion::one());
    located.orientation_valid = false;
    state.borrow_mut().located_pose = located;

    let pose = session.get_pose(grip, Hand::Left);
    assert!(pose.position_valid);
    assert!(!pose.orientation_valid);
    assert_vec3(pose.position, Vector3::new(0.2, 1.0, -3.3));
}

#[test]
fn test_haptic() {
    let state = MockState::new();
    let mut session = connected(&state);

    let buzz = session.load_action("buzz", ActionType::Vibration, Hand::Both);
    let left = session.load_action("left_buzz", ActionType::Vibration, Hand::Left);
    session.suggest_binding(buzz, Component::Haptic);
    session.suggest_binding(left, Component::Haptic);
    session.update();

    session.apply_haptic(buzz, Hand::Both, -1, 0.5);
    session.apply_haptic(buzz, Hand::Right, 20_000_000, 2.0);
    session.apply_haptic(left, Hand::Both, 1, 1.0);

    let s = state.borrow();
    assert_eq!(s.haptics, vec![
        ("buzz".to_string(), Hand::Left, None, 0.5),
        ("buzz".to_string(), Hand::Right, None, 0.5),
        ("buzz".to_string(), Hand::Right, Some(20_000_000), 2.0), // Passed as-is.
        ("left_buzz".to_string(), Hand::Left, Some(1), 1.0),
    ]);
}

#[test]
#[should_panic(expected = "haptic applied before the action set was attached")]
fn test_haptic_before_attach() {
    let state = MockState::new();
    let mut session = connected(&state);

    let buzz = session.load_action("buzz", ActionType::Vibration, Hand::Both);
    session.apply_haptic(buzz, Hand::Left, -1, 1.0);
}

#[test]
fn test_sync_after_events() {
    let state = MockState::new();
    let mut session = running(&state);

    render_frame(&mut session);
    push_state(&state, SessionState::Visible);
    session.update();

    let s = state.borrow();
    let calls: Vec<_> = s.calls.iter().rev().take(2).map(|c| c.as_str()).collect();
    assert_eq!(calls, vec!["sync", "wait_frame"]);
}

#[test]
fn test_no_wait_while_frame_pending() {
    let state = MockState::new();
    let mut session = running(&state);

    assert_eq!(state.borrow().called("wait_frame"), 1);

    // Waited frame never begun: the next update must not wait again.

    session.update();
    session.update();
    assert_eq!(state.borrow().called("wait_frame"), 1);
    assert_eq!(state.borrow().called("sync"), 3);

    assert_eq!(render_frame(&mut session), 2);
    session.update();
    assert_eq!(state.borrow().called("wait_frame"), 2);
}

#[test]
fn test_config_default() {
    let config = Config::default().with_app_name("hello_xr");

    assert_eq!(config.app_name, "hello_xr");
    assert_eq!(config.engine_name, "xrlink");
    assert_eq!(config.preferred_reference, ReferenceType::LocalFloor);
    assert!(config.depth_submission);
    assert_eq!(config.app_version >> 24, env!("CARGO_PKG_VERSION_MAJOR").parse::<u32>().unwrap());
}

#[cfg(feature = "xr")]
#[test]
fn test_extension_names_interned() {
    use std::ffi::CString;

    use crate::runtime::openxr::intern_extension;

    let first = intern_extension(CString::new("VK_KHR_external_memory").unwrap());
    let again = intern_extension(CString::new("VK_KHR_external_memory").unwrap());
    let other = intern_extension(CString::new("VK_KHR_swapchain").unwrap());

    assert!(std::ptr::eq(first, again));
    assert!(!std::ptr::eq(first, other));
    assert_eq!(first.to_str(), Ok("VK_KHR_external_memory"));
}
