//! Camera and view management.

use glam::{Mat4, Vec3};

/// Pinhole camera that primary rays are generated from.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    /// Create a camera at `position` looking at `target`.
    pub fn looking_at(position: Vec3, target: Vec3, fov: f32, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).normalize(),
            fov,
            aspect,
            ..Self::default()
        }
    }

    /// Look at a target position.
    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize();
    }

    /// Set the aspect ratio.
    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    /// Place the camera on a circle of `radius` around `center`, `height`
    /// above it, at `angle` radians, looking at the center.
    pub fn orbit(&mut self, center: Vec3, radius: f32, height: f32, angle: f32) {
        self.position = center + Vec3::new(radius * angle.cos(), height, radius * angle.sin());
        self.look_at(center);
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far)
    }

    /// Get camera uniforms for the trace kernel.
    pub fn uniforms(&self) -> CameraUniforms {
        CameraUniforms::from(self)
    }
}

/// Camera uniform buffer data for GPU.
///
/// The kernel unprojects each pixel through the inverse matrices to build its
/// primary ray.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniforms {
    pub inverse_view: [[f32; 4]; 4],
    pub inverse_projection: [[f32; 4]; 4],
    pub position: [f32; 4],
    pub direction: [f32; 4],
    /// `near`, `far`, `fov`, `aspect`.
    pub lens: [f32; 4],
}

impl From<&Camera> for CameraUniforms {
    fn from(camera: &Camera) -> Self {
        Self {
            inverse_view: camera.view_matrix().inverse().to_cols_array_2d(),
            inverse_projection: camera.projection_matrix().inverse().to_cols_array_2d(),
            position: camera.position.extend(1.0).to_array(),
            direction: camera.direction.extend(0.0).to_array(),
            lens: [camera.near, camera.far, camera.fov, camera.aspect],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4;

    #[test]
    fn uniforms_are_std140_sized() {
        assert_eq!(std::mem::size_of::<CameraUniforms>(), 176);
    }

    #[test]
    fn center_ray_follows_direction() {
        let camera = Camera::looking_at(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO, 1.0, 1.5);
        let u = camera.uniforms();

        let inv_proj = Mat4::from_cols_array_2d(&u.inverse_projection);
        let inv_view = Mat4::from_cols_array_2d(&u.inverse_view);

        // NDC center on the far plane, back to world space.
        let view_point = inv_proj * Vec4::new(0.0, 0.0, 1.0, 1.0);
        let world_point = inv_view * (view_point / view_point.w);
        let ray = (world_point.truncate() - camera.position).normalize();

        assert_relative_eq!(ray.x, camera.direction.x, epsilon = 1e-4);
        assert_relative_eq!(ray.y, camera.direction.y, epsilon = 1e-4);
        assert_relative_eq!(ray.z, camera.direction.z, epsilon = 1e-4);
    }

    #[test]
    fn orbit_keeps_radius_and_target() {
        let mut camera = Camera::default();
        camera.orbit(Vec3::ZERO, 4.0, 1.0, 0.7);

        let flat = Vec3::new(camera.position.x, 0.0, camera.position.z);
        assert_relative_eq!(flat.length(), 4.0, epsilon = 1e-5);
        assert_relative_eq!(camera.position.y, 1.0);

        let to_center = (Vec3::ZERO - camera.position).normalize();
        assert_relative_eq!(camera.direction.dot(to_center), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn lens_packs_projection_parameters() {
        let camera = Camera::default();
        let u = camera.uniforms();
        assert_relative_eq!(u.lens[0], 0.1);
        assert_relative_eq!(u.lens[1], 1000.0);
        assert_relative_eq!(u.lens[3], 16.0 / 9.0);
        assert_relative_eq!(u.position[3], 1.0);
        assert_relative_eq!(u.direction[3], 0.0);
    }
}
