use cgmath::{Vector2, Zero};
use tracing::{error, warn};

use crate::pose::Pose;
use crate::renderer::Renderer;
use crate::runtime::Runtime;
use crate::session::Session;
use crate::util::IndexMap;

pub const BASELINE_PROFILE: &str = "/interaction_profiles/khr/simple_controller";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hand {
    Left,
    Right,
    Both,
}

impl Hand {
    pub fn user_path(self) -> Option<&'static str> {
        match self {
            Self::Left => Some("/user/hand/left"),
            Self::Right => Some("/user/hand/right"),
            Self::Both => None,
        }
    }

    pub fn hands(self) -> &'static [Hand] {
        match self {
            Self::Left => &[Self::Left],
            Self::Right => &[Self::Right],
            Self::Both => &[Self::Left, Self::Right],
        }
    }

    pub fn contains(self, hand: Hand) -> bool {
        self == Self::Both || self == hand
    }

    fn slot(self) -> usize {
        match self {
            Self::Left => 0,
            Self::Right => 1,
            Self::Both => unreachable!("Hand::Both has no slot"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionType {
    Boolean,
    Float,
    Vector2,
    Pose,
    Vibration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    Select,
    Menu,
    GripPose,
    AimPose,
    Haptic,
}

impl Component {
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Select => "/input/select/click",
            Self::Menu => "/input/menu/click",
            Self::GripPose => "/input/grip/pose",
            Self::AimPose => "/input/aim/pose",
            Self::Haptic => "/output/haptic",
        }
    }
}

// NULL is what a failed load_action() returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ActionId(usize);

impl ActionId {
    pub const NULL: Self = Self(usize::MAX);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActionState<T> {
    pub value: T,
    pub active: bool,  // A live binding drives the action.
    pub changed: bool, // Value changed since the last sync.
}

impl<T> ActionState<T> {
    pub fn inactive(value: T) -> Self {
        Self {
            value,
            active: false,
            changed: false,
        }
    }
}

pub(crate) struct ActionEntry<R: Runtime> {
    pub name: String,
    pub ty: ActionType,
    pub hands: Hand,
    pub handle: R::Action,
    pub spaces: [Option<R::Space>; 2], // Pose actions only, indexed by Hand::slot().
    pub bound: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Binding {
    pub action: ActionId,
    pub path: String,
}

// Index 0 is the baseline profile, flushed last, at attach time.
pub(crate) struct BindingBuffer {
    profiles: IndexMap<String>,
    pending: Vec<Vec<Binding>>,
    selected: Vec<bool>,
    current: usize,
}

impl BindingBuffer {
    fn new() -> Self {
        let mut profiles = IndexMap::default();
        profiles.add(BASELINE_PROFILE.to_string());

        Self {
            profiles,
            pending: vec![Vec::new()],
            selected: vec![false],
            current: 0,
        }
    }

    fn select(&mut self, profile: &str) {
        let profile = profile.to_string();

        match self.profiles.index_of(&profile) {
            Some(index) => {
                assert!(!self.selected[index], "interaction profile {} selected twice", profile);
                self.selected[index] = true;
                self.current = index;
            },
            None => {
                let index = self.profiles.add(profile);
                self.pending.push(Vec::new());
                self.selected.push(true);
                self.current = index;
            },
        }
    }

    fn push(&mut self, index: usize, binding: Binding) {
        self.pending[index].push(binding);
    }

    fn take(&mut self, index: usize) -> (String, Vec<Binding>) {
        let profile = self.profiles.get(index).cloned().unwrap_or_default();
        (profile, std::mem::take(&mut self.pending[index]))
    }
}

pub(crate) struct Input<R: Runtime> {
    actions: Vec<ActionEntry<R>>,
    bindings: BindingBuffer,
    attached: bool,
}

impl<R: Runtime> Input<R> {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            bindings: BindingBuffer::new(),
            attached: false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    fn entry(&self, action: ActionId) -> Option<&ActionEntry<R>> {
        if action.is_null() {
            return None;
        }

        Some(self.actions.get(action.0).expect("unknown action id"))
    }

    fn load(&mut self, runtime: &mut R, name: &str, ty: ActionType, hands: Hand) -> ActionId {
        if self.attached {
            error!("unable to load action {}: action set is already attached", name);
            return ActionId::NULL;
        }

        let handle = match runtime.create_action(name, ty, hands.hands()) {
            Ok(handle) => handle,
            Err(err) => {
                error!("unable to load action {}: {}", name, err);
                return ActionId::NULL;
            },
        };

        let mut spaces = [None, None];

        if ty == ActionType::Pose {
            for hand in hands.hands() {
                match runtime.create_action_space(&handle, *hand) {
                    Ok(space) => spaces[hand.slot()] = Some(space),
                    Err(err) => {
                        error!("unable to create {:?} space for action {}: {}", hand, name, err);
                        return ActionId::NULL;
                    },
                }
            }
        }

        self.actions.push(ActionEntry {
            name: name.to_string(),
            ty,
            hands,
            handle,
            spaces,
            bound: false,
        });

        ActionId(self.actions.len() - 1)
    }

    fn select_profile(&mut self, runtime: &mut R, profile: &str) {
        assert!(!self.attached, "select_profile() after the action set was attached");

        // Baseline is flushed at attach time.

        if self.bindings.current != 0 {
            self.flush(runtime, self.bindings.current);
        }

        self.bindings.select(profile);
    }

    fn suggest(&mut self, profile: usize, action: ActionId, hand: Hand, suffix: &str) {
        assert!(!self.attached, "binding suggested after the action set was attached");

        if action.is_null() {
            return;
        }

        let entry = self.actions.get_mut(action.0).expect("unknown action id");

        for hand in hand.hands() {
            if !entry.hands.contains(*hand) {
                warn!("action {} is not available for {:?}, binding {} skipped", entry.name, hand, suffix);
                continue;
            }

            let path = format!("{}{}", hand.user_path().unwrap_or_default(), suffix);

            entry.bound = true;
            self.bindings.push(profile, Binding {
                action,
                path,
            });
        }
    }

    fn flush(&mut self, runtime: &mut R, index: usize) {
        let (profile, bindings) = self.bindings.take(index);

        if bindings.is_empty() {
            return;
        }

        let suggested: Vec<_> = bindings.into_iter().map(|binding| (&self.actions[binding.action.0].handle, binding.path)).collect();

        if let Err(err) = runtime.suggest_bindings(&profile, &suggested) {
            error!("unable to suggest bindings for {}: {}", profile, err);
        }
    }

    pub fn attach(&mut self, runtime: &mut R) {
        assert!(!self.attached, "action set attached twice");

        if self.bindings.current != 0 {
            self.flush(runtime, self.bindings.current);
        }
        self.flush(runtime, 0);

        for entry in self.actions.iter().filter(|entry| !entry.bound) {
            warn!("action {} has no suggested binding", entry.name);
        }

        if let Err(err) = runtime.attach_action_set() {
            error!("unable to attach action set: {}", err);
        }

        // Irreversible, also when the runtime rejected it.
        self.attached = true;
    }

    fn query(&self, action: ActionId, hand: Hand, ty: ActionType) -> Option<&ActionEntry<R>> {
        assert!(self.attached, "action state queried before the action set was attached");

        let entry = self.entry(action)?;
        assert!(entry.ty == ty, "action {} is {:?}, queried as {:?}", entry.name, entry.ty, ty);

        if hand == Hand::Both {
            warn!("action {} queried for both hands, query each hand separately", entry.name);
            return None;
        }

        if !entry.hands.contains(hand) {
            warn!("action {} is not available for {:?}", entry.name, hand);
            return None;
        }

        Some(entry)
    }
}

fn neutral<T>(result: Result<ActionState<T>, crate::error::RuntimeError>, name: &str, value: T) -> ActionState<T> {
    match result {
        Ok(state) if state.active => state,
        Ok(_) => ActionState::inactive(value),
        Err(err) => {
            error!("unable to get state of action {}: {}", name, err);
            ActionState::inactive(value)
        },
    }
}

impl<R: Runtime, G: Renderer<Image = R::Image>> Session<R, G> {
    fn input(&mut self) -> (&mut R, &mut Input<R>) {
        let (runtime, _, _, conn) = self.parts();
        let conn = conn.expect("session is not connected");

        (runtime, &mut conn.input)
    }

    pub fn load_action(&mut self, name: &str, ty: ActionType, hands: Hand) -> ActionId {
        let (runtime, input) = self.input();
        input.load(runtime, name, ty, hands)
    }

    pub fn select_profile(&mut self, profile: &str) {
        let (runtime, input) = self.input();
        input.select_profile(runtime, profile);
    }

    pub fn suggest_binding(&mut self, action: ActionId, component: Component) {
        let (_, input) = self.input();

        let Some(entry) = input.entry(action) else {
            assert!(!input.attached, "binding suggested after the action set was attached");
            return;
        };

        let hands = entry.hands;
        input.suggest(0, action, hands, component.suffix());
    }

    pub fn suggest_binding_pro(&mut self, action: ActionId, hand: Hand, suffix: &str) {
        let (_, input) = self.input();
        let current = input.bindings.current;

        input.suggest(current, action, hand, suffix);
    }

    pub fn get_bool_state(&mut self, action: ActionId, hand: Hand) -> ActionState<bool> {
        let (runtime, input) = self.input();

        match input.query(action, hand, ActionType::Boolean) {
            Some(entry) => neutral(runtime.bool_state(&entry.handle, hand), &entry.name, false),
            None => ActionState::inactive(false),
        }
    }

    pub fn get_float_state(&mut self, action: ActionId, hand: Hand) -> ActionState<f32> {
        let (runtime, input) = self.input();

        match input.query(action, hand, ActionType::Float) {
            Some(entry) => neutral(runtime.float_state(&entry.handle, hand), &entry.name, 0.0),
            None => ActionState::inactive(0.0),
        }
    }

    pub fn get_vector2_state(&mut self, action: ActionId, hand: Hand) -> ActionState<Vector2<f32>> {
        let (runtime, input) = self.input();

        match input.query(action, hand, ActionType::Vector2) {
            Some(entry) => neutral(runtime.vector2_state(&entry.handle, hand), &entry.name, Vector2::zero()),
            None => ActionState::inactive(Vector2::zero()),
        }
    }

    pub fn get_pose_state(&mut self, action: ActionId, hand: Hand) -> ActionState<Pose> {
        let (runtime, _, reference_frame, conn) = self.parts();
        let conn = conn.expect("session is not connected");

        let Some(entry) = conn.input.query(action, hand, ActionType::Pose) else {
            return ActionState::inactive(Pose::invalid());
        };

        match runtime.pose_active(&entry.handle, hand) {
            Ok(true) => (),
            Ok(false) => return ActionState::inactive(Pose::invalid()),
            Err(err) => {
                error!("unable to get state of action {}: {}", entry.name, err);
                return ActionState::inactive(Pose::invalid());
            },
        }

        let mut state = ActionState {
            value: Pose::invalid(),
            active: true,
            changed: false,
        };

        let (Some(space), Some(timing)) = (&entry.spaces[hand.slot()], conn.timing) else {
            return state;
        };

        match runtime.locate_space(space, &conn.world_space, timing.predicted_display_time) {
            Ok(raw) => state.value = reference_frame.compose(&raw),
            Err(err) => error!("unable to locate action {}: {}", entry.name, err),
        }

        state
    }

    pub fn get_bool(&mut self, action: ActionId, hand: Hand) -> bool {
        self.get_bool_state(action, hand).value
    }

    pub fn get_float(&mut self, action: ActionId, hand: Hand) -> f32 {
        self.get_float_state(action, hand).value
    }

    pub fn get_vector2(&mut self, action: ActionId, hand: Hand) -> Vector2<f32> {
        self.get_vector2_state(action, hand).value
    }

    pub fn get_pose(&mut self, action: ActionId, hand: Hand) -> Pose {
        self.get_pose_state(action, hand).value
    }

    // duration_ns == -1 asks for the shortest pulse the runtime supports.
    pub fn apply_haptic(&mut self, action: ActionId, hand: Hand, duration_ns: i64, amplitude: f32) {
        let (runtime, input) = self.input();
        assert!(input.attached, "haptic applied before the action set was attached");

        let Some(entry) = input.entry(action) else {
            return;
        };
        assert!(entry.ty == ActionType::Vibration, "action {} is {:?}, not a vibration output", entry.name, entry.ty);

        let duration = if duration_ns == -1 { None } else { Some(duration_ns) };

        for hand in hand.hands().iter().filter(|hand| entry.hands.contains(**hand)) {
            if let Err(err) = runtime.apply_haptic(&entry.handle, *hand, duration, amplitude) {
                error!("unable to apply haptic of action {}: {}", entry.name, err);
            }
        }
    }
}
