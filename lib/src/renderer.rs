use cgmath::Matrix4;

use crate::projection::ClipSpace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatrixMode {
    Projection,
    ModelView,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn from_size(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

pub enum DepthAttachment<'a, G: Renderer + ?Sized> {
    Image(&'a G::Image),
    Buffer(&'a G::DepthBuffer),
}

// Ambient state (viewport, scissor, framebuffer, depth test, matrices) is left as
// found once end_view() returns.
pub trait Renderer {
    type Image;
    type Framebuffer;
    type DepthBuffer;

    fn load_framebuffer(&mut self, width: u32, height: u32) -> Self::Framebuffer;
    fn load_depth_buffer(&mut self, width: u32, height: u32) -> Self::DepthBuffer;
    fn unload_framebuffer(&mut self, framebuffer: Self::Framebuffer);
    fn unload_depth_buffer(&mut self, depth: Self::DepthBuffer);
    fn attach_color(&mut self, framebuffer: &mut Self::Framebuffer, image: &Self::Image);
    fn attach_depth(&mut self, framebuffer: &mut Self::Framebuffer, depth: DepthAttachment<'_, Self>);
    fn enable_framebuffer(&mut self, framebuffer: &Self::Framebuffer);
    fn disable_framebuffer(&mut self);

    fn viewport(&mut self, rect: Rect);
    fn scissor(&mut self, rect: Rect);
    fn reset_viewport(&mut self); // Default (window) viewport, scissor covering it again.
    fn enable_depth_test(&mut self);
    fn disable_depth_test(&mut self);

    fn push_matrix(&mut self, mode: MatrixMode);
    fn pop_matrix(&mut self, mode: MatrixMode);
    fn set_matrix(&mut self, mode: MatrixMode, m: Matrix4<f32>);

    fn flush_batch(&mut self);

    fn clip_distances(&self) -> (f32, f32); // (near, far)
    fn clip_space(&self) -> ClipSpace;
}
