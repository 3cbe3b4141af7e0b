//! Perspective camera
//!
//! Produces Vulkan-convention matrices: right-handed view space, Y down in
//! clip space, depth in [0, 1].

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::{to_column_array, Mat4, Point3, Vec3};

/// Camera data pushed as vertex-stage push constants
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraPushConstants {
    /// Projection * view, column-major
    pub view_projection: [[f32; 4]; 4],
}

/// Perspective camera looking at a target
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    /// Eye position
    pub position: Point3,
    /// Look-at target
    pub target: Point3,
    /// Up direction
    pub up: Vec3,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Width / height
    pub aspect: f32,
    /// Near plane
    pub near: f32,
    /// Far plane
    pub far: f32,
}

impl Camera {
    /// Camera at `position` looking at `target` with Y up
    pub fn perspective(position: Point3, target: Point3, fov_y_degrees: f32, aspect: f32) -> Self {
        Self {
            position,
            target,
            up: Vec3::y(),
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near: 0.1,
            far: 100.0,
        }
    }

    /// Update the aspect ratio from a surface size; ignores empty sizes
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    /// World to view transform
    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(&self.position, &self.target, &self.up)
    }

    /// View to clip transform
    pub fn projection(&self) -> Mat4 {
        let f = 1.0 / (self.fov_y * 0.5).tan();
        let depth = self.far / (self.near - self.far);
        #[rustfmt::skip]
        let projection = Mat4::new(
            f / self.aspect, 0.0, 0.0,   0.0,
            0.0,             -f,  0.0,   0.0,
            0.0,             0.0, depth, depth * self.near,
            0.0,             0.0, -1.0,  0.0,
        );
        projection
    }

    /// Projection * view
    pub fn view_projection(&self) -> Mat4 {
        self.projection() * self.view()
    }

    /// Push constant block for the current state
    pub fn push_constants(&self) -> CameraPushConstants {
        CameraPushConstants {
            view_projection: to_column_array(&self.view_projection()),
        }
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::perspective(Point3::new(0.0, 2.0, 8.0), Point3::origin(), 45.0, 16.0 / 9.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec4;
    use approx::assert_relative_eq;

    #[test]
    fn test_depth_range() {
        let camera = Camera::perspective(Point3::origin(), Point3::new(0.0, 0.0, -1.0), 90.0, 1.0);
        let near = camera.view_projection() * Vec4::new(0.0, 0.0, -camera.near, 1.0);
        let far = camera.view_projection() * Vec4::new(0.0, 0.0, -camera.far, 1.0);

        assert_relative_eq!(near.z / near.w, 0.0, epsilon = 1e-5);
        assert_relative_eq!(far.z / far.w, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_y_points_down_in_clip_space() {
        let camera = Camera::perspective(Point3::origin(), Point3::new(0.0, 0.0, -1.0), 90.0, 1.0);
        let above = camera.view_projection() * Vec4::new(0.0, 1.0, -2.0, 1.0);
        assert!(above.y / above.w < 0.0);
    }

    #[test]
    fn test_viewport_updates_aspect() {
        let mut camera = Camera::default();
        camera.set_viewport(800, 400);
        assert_relative_eq!(camera.aspect, 2.0);
        camera.set_viewport(0, 400);
        assert_relative_eq!(camera.aspect, 2.0);
    }
}
