//! Camera
//!
//! Perspective camera producing the view-projection transform used to
//! project the textured plane onto the screen.

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

/// Perspective camera
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    /// Eye position
    pub position: Vec3,
    /// Point the camera looks at
    pub target: Vec3,
    /// Up direction
    pub up: Vec3,
    /// Vertical field of view in degrees
    pub fov_y_degrees: f32,
    /// Near clip plane
    pub near: f32,
    /// Far clip plane
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 50.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y_degrees: 60.0,
            near: 0.1,
            far: 512.0,
        }
    }
}

impl Camera {
    /// Camera looking at the origin from `distance` along +Z
    pub fn looking_at_origin(distance: f32) -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, distance),
            ..Default::default()
        }
    }

    /// Move the eye and keep the target
    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    /// Override the clip planes
    pub fn with_clip_planes(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    /// View matrix
    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Projection matrix for a viewport aspect ratio
    pub fn projection(&self, aspect: f32) -> Mat4 {
        Mat4::perspective_rh(self.fov_y_degrees.to_radians(), aspect, self.near, self.far)
    }

    /// Combined view-projection matrix
    pub fn view_projection(&self, aspect: f32) -> Mat4 {
        self.projection(aspect) * self.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn test_origin_projects_to_center() {
        let camera = Camera::default();
        let clip = camera.view_projection(16.0 / 9.0) * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!(clip.w > 0.0);
        assert!((clip.x / clip.w).abs() < 1e-5);
        assert!((clip.y / clip.w).abs() < 1e-5);
    }

    #[test]
    fn test_behind_camera_has_negative_w() {
        let camera = Camera::default();
        let clip = camera.view_projection(1.0) * Vec4::new(0.0, 0.0, 100.0, 1.0);
        assert!(clip.w < 0.0);
    }

    #[test]
    fn test_builder_overrides() {
        let camera = Camera::looking_at_origin(3000.0).with_clip_planes(1.0, 10_000.0);
        assert_eq!(camera.position.z, 3000.0);
        assert_eq!(camera.far, 10_000.0);
    }
}
