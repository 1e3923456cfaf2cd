use cgmath::{One, Quaternion, Vector3, Zero};

// Invalid halves hold zero/identity and must not be interpreted.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub position: Vector3<f32>,
    pub orientation: Quaternion<f32>,
    pub position_valid: bool,
    pub orientation_valid: bool,
}

impl Pose {
    pub fn new(position: Vector3<f32>, orientation: Quaternion<f32>) -> Self {
        Self {
            position,
            orientation,
            position_valid: true,
            orientation_valid: true,
        }
    }

    pub fn invalid() -> Self {
        Self {
            position: Vector3::zero(),
            orientation: Quaternion::one(),
            position_valid: false,
            orientation_valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.position_valid && self.orientation_valid
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::invalid()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReferenceFrame {
    pub position: Vector3<f32>,
    pub orientation: Quaternion<f32>,
}

impl ReferenceFrame {
    pub fn identity() -> Self {
        Self {
            position: Vector3::zero(),
            orientation: Quaternion::one(),
        }
    }

    pub fn compose(&self, raw: &Pose) -> Pose {
        let mut pose = Pose::invalid();

        // Validity is copied as-is, never upgraded.

        if raw.position_valid {
            pose.position = self.position + raw.position;
            pose.position_valid = true;
        }

        if raw.orientation_valid {
            pose.orientation = self.orientation * raw.orientation;
            pose.orientation_valid = true;
        }

        pose
    }
}

impl Default for ReferenceFrame {
    fn default() -> Self {
        Self::identity()
    }
}
