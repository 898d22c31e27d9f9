use ash::vk;
use profiling::scope;

use crate::renderer::shaders::CameraParams;

pub(crate) fn up_vector() -> na::Unit<na::Vector3<f32>> {
    na::Unit::new_unchecked(na::Vector3::y())
}
pub(crate) fn forward_vector() -> na::Unit<na::Vector3<f32>> {
    na::Unit::new_unchecked(na::Vector3::z())
}
pub(crate) fn right_vector() -> na::Unit<na::Vector3<f32>> {
    na::Unit::new_unchecked(na::Vector3::x())
}

/// Movement requested for one frame. Axes are in `-1.0..=1.0`, turns in radians per second.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct CameraInput {
    pub(crate) forward: f32,
    pub(crate) right: f32,
    pub(crate) up: f32,
    pub(crate) yaw: f32,
    pub(crate) pitch: f32,
}

pub(crate) struct FpsCamera {
    pub(crate) position: na::Point3<f32>,
    pub(crate) rotation: na::UnitQuaternion<f32>,
    /// World units per second.
    pub(crate) speed: f32,
}

impl Default for FpsCamera {
    fn default() -> FpsCamera {
        FpsCamera {
            position: na::Point3::new(0.0, 0.0, -3.4),
            rotation: na::UnitQuaternion::identity(),
            speed: 1.5,
        }
    }
}

impl FpsCamera {
    pub(crate) fn advance(&mut self, input: &CameraInput, time_delta: f32) {
        scope!("camera::advance");

        if input.yaw != 0.0 || input.pitch != 0.0 {
            let yaw = na::UnitQuaternion::from_axis_angle(&up_vector(), input.yaw * time_delta);
            let pitch = na::UnitQuaternion::from_axis_angle(&right_vector(), input.pitch * time_delta);
            self.rotation = yaw * self.rotation * pitch;
        }

        let speed = self.speed * time_delta;
        let mut increment: na::Vector3<f32> = na::zero();
        increment += speed * input.forward * self.rotation.transform_vector(&forward_vector());
        increment += speed * input.right * self.rotation.transform_vector(&right_vector());
        increment += speed * input.up * self.rotation.transform_vector(&up_vector());
        self.position += increment;
    }

    pub(crate) fn params(&self, extent: vk::Extent2D) -> CameraParams {
        let near = 0.1;
        let far = 100.0;
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let fov_y = glm::radians(&glm::vec1(70.0));

        let projection = glm::perspective_lh_zo(aspect, fov_y.x, near, far);

        let dir = self.rotation.transform_vector(&forward_vector());
        let extended_forward = self.position + dir;
        let up = self.rotation.transform_vector(&up_vector());

        let view = glm::look_at_lh(&self.position.coords, &extended_forward.coords, &up);

        CameraParams {
            inv_view: glm::inverse(&view).into(),
            inv_proj: glm::inverse(&projection).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 1280,
        height: 720,
    };

    #[test]
    fn inverse_view_places_the_eye() {
        let camera = FpsCamera::default();
        let params = camera.params(EXTENT);
        let eye = glm::Mat4::from(params.inv_view) * glm::vec4(0.0, 0.0, 0.0, 1.0);
        assert!((eye.xyz() - camera.position.coords).norm() < 1e-5);

        // the far plane center lies straight ahead
        let target = glm::Mat4::from(params.inv_proj) * glm::vec4(0.0, 0.0, 1.0, 1.0);
        let target = target.xyz() / target.w;
        let dir = glm::Mat4::from(params.inv_view) * glm::vec4(target.x, target.y, target.z, 0.0);
        assert!((dir.xyz().normalize() - glm::vec3(0.0, 0.0, 1.0)).norm() < 1e-4);
    }

    #[test]
    fn advances_along_its_axes() {
        let mut camera = FpsCamera::default();
        camera.advance(
            &CameraInput {
                forward: 1.0,
                ..Default::default()
            },
            2.0,
        );
        assert!((camera.position.z - (-3.4 + 3.0)).abs() < 1e-5);

        camera.advance(
            &CameraInput {
                yaw: std::f32::consts::FRAC_PI_2,
                ..Default::default()
            },
            1.0,
        );
        let forward = camera.rotation.transform_vector(&forward_vector());
        assert!((forward - na::Vector3::x()).norm() < 1e-5);
    }
}
