use cgmath::{Angle, Matrix4, Rad, Vector3};

use crate::pose::Pose;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClipSpace {
    OpenGl, // y up, z in [-1, 1]
    Vulkan, // y down, z in [0, 1]
    Wgpu,   // y up, z in [0, 1] (also D3D/Metal)
}

impl ClipSpace {
    fn y_down(self) -> bool {
        matches!(self, Self::Vulkan)
    }

    fn z_minus_one(self) -> bool {
        matches!(self, Self::OpenGl)
    }
}

pub fn perspective(fov: &Fov, near: f32, far: f32, clip: ClipSpace) -> Matrix4<f32> {
    // Calculate projection matrix.
    // Taken from https://github.com/KhronosGroup/OpenXR-SDK/blob/main/src/common/xr_linear.h->XrMatrix4x4f_CreateProjectionFov.

    let tan_left = Rad(fov.angle_left).tan();
    let tan_right = Rad(fov.angle_right).tan();
    let tan_up = Rad(fov.angle_up).tan();
    let tan_down = Rad(fov.angle_down).tan();

    let tan_width = tan_right - tan_left;
    let tan_height = if clip.y_down() {
        tan_down - tan_up
    } else {
        tan_up - tan_down
    };

    let offset_z = if clip.z_minus_one() { near } else { 0.0 };

    let (m10, m14) = if far <= near {
        // Far plane at infinity.

        (-1.0, -(near + offset_z))
    } else {
        (-(far + offset_z) / (far - near), -(far * (near + offset_z)) / (far - near))
    };

    Matrix4::new(
        2.0 / tan_width, 0.0, 0.0, 0.0,
        0.0, 2.0 / tan_height, 0.0, 0.0,
        (tan_right + tan_left) / tan_width, (tan_up + tan_down) / tan_height, m10, -1.0,
        0.0, 0.0, m14, 0.0
    )
}

pub fn view_matrix(pose: &Pose) -> Matrix4<f32> {
    // We are doing the pose matrix inversion manually, since it is trivial.

    let pos = pose.position;
    let pos_m = Matrix4::from_translation(Vector3::new(-pos.x, -pos.y, -pos.z));
    let rot_m = Matrix4::from(pose.orientation.conjugate());

    rot_m * pos_m
}
