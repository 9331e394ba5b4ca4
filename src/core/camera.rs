// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

use nalgebra::{ Rotation3, Vector2, Vector3 };
use std::f64::consts::{ FRAC_PI_2, PI };
use crate::calibration::CameraParams;

lazy_static::lazy_static! {
    // Equirectangular sphere frame (z up, y towards longitude 0) to the output frame (x right, y down, z forward).
    // Inverse of the Z-Y-Z rotation by 90°, 90°, -90°.
    static ref SPHERE_ROTATION: Rotation3<f64> = {
        let zyz = Rotation3::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2)
                * Rotation3::from_axis_angle(&Vector3::y_axis(), FRAC_PI_2)
                * Rotation3::from_axis_angle(&Vector3::z_axis(), -FRAC_PI_2);
        zyz.inverse()
    };
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projection {
    pub x: f64,
    pub y: f64,
    /// Angle between the ray and the optical axis, radians
    pub theta: f64,
}

/// Calibrated fisheye camera. Immutable after construction.
#[derive(Clone, Debug)]
pub struct CameraModel {
    rotation: Rotation3<f64>,
    translation: Vector3<f64>,
    center: Vector2<f64>,
    focal: f64,
    k: [f64; 4],
    image_size: (usize, usize),
    max_fov: f64,
    sphere_radius: f64,
}

impl CameraModel {
    pub fn new(params: &CameraParams, max_fov_deg: f64, sphere_radius: f64) -> Self {
        let [yaw, pitch, roll] = params.rotation;
        // Orientation of the camera in the output frame, rotation is world -> camera
        let orientation = Rotation3::from_axis_angle(&Vector3::y_axis(), yaw.to_radians())
                        * Rotation3::from_axis_angle(&Vector3::x_axis(), pitch.to_radians())
                        * Rotation3::from_axis_angle(&Vector3::z_axis(), roll.to_radians());
        Self {
            rotation: orientation.inverse(),
            translation: Vector3::from(params.translation),
            center: Vector2::from(params.center),
            focal: params.focal,
            k: params.distortion,
            image_size: (params.image_width, params.image_height),
            max_fov: max_fov_deg.to_radians(),
            sphere_radius,
        }
    }

    pub fn image_size(&self) -> (usize, usize) { self.image_size }
    pub fn max_fov(&self) -> f64 { self.max_fov }
    pub fn sphere_radius(&self) -> f64 { self.sphere_radius }

    /// Unit ray in the output frame for a continuous panorama coordinate.
    pub fn sphere_direction(u: f64, v: f64, pano_width: usize, pano_height: usize) -> Vector3<f64> {
        let lon = u / pano_width.max(1) as f64 * 2.0 * PI - PI;
        let lat = FRAC_PI_2 - v / pano_height.max(1) as f64 * PI;
        let p = Vector3::new(lat.cos() * lon.sin(), lat.cos() * lon.cos(), lat.sin());
        *SPHERE_ROTATION * p
    }

    fn distort(&self, theta: f64) -> f64 {
        let theta2 = theta * theta;
        let theta4 = theta2 * theta2;
        let theta6 = theta4 * theta2;
        let theta8 = theta4 * theta4;
        theta * (1.0 + self.k[0] * theta2 + self.k[1] * theta4 + self.k[2] * theta6 + self.k[3] * theta8)
    }

    /// Projects a ray of the output frame onto the sensor. The ray is scaled to the sphere radius
    /// before the camera translation is applied.
    pub fn project(&self, ray: &Vector3<f64>) -> Projection {
        let p = self.rotation * (ray * self.sphere_radius - self.translation);

        let rho = (p.x * p.x + p.y * p.y).sqrt();
        let theta = rho.atan2(p.z);
        if rho < 1e-12 {
            return Projection { x: self.center.x, y: self.center.y, theta };
        }
        let scale = self.focal * self.distort(theta) / rho;
        Projection {
            x: self.center.x + p.x * scale,
            y: self.center.y + p.y * scale,
            theta
        }
    }

    pub fn is_on_sensor(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x <= self.image_size.0 as f64 && y <= self.image_size.1 as f64
    }

    /// Nearest edge pixel centre.
    pub fn clamp_to_sensor(&self, x: f64, y: f64) -> (f64, f64) {
        let max_x = (self.image_size.0 as f64 - 0.5).max(0.5);
        let max_y = (self.image_size.1 as f64 - 0.5).max(0.5);
        (
            if x.is_finite() { x.max(0.5).min(max_x) } else { max_x * 0.5 },
            if y.is_finite() { y.max(0.5).min(max_y) } else { max_y * 0.5 }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn params(yaw: f64) -> CameraParams {
        CameraParams {
            image_width: 200,
            image_height: 200,
            center: [100.0, 100.0],
            focal: 100.0 / 96.0f64.to_radians(),
            rotation: [yaw, 0.0, 0.0],
            ..Default::default()
        }
    }

    #[test]
    fn sphere_frame() {
        // Front, up and right of the panorama
        let fwd = CameraModel::sphere_direction(360.0, 180.0, 720, 360);
        let up  = CameraModel::sphere_direction(360.0, 0.0, 720, 360);
        let rgt = CameraModel::sphere_direction(540.0, 180.0, 720, 360);
        assert!((fwd - Vector3::new(0.0, 0.0, 1.0)).norm() < 1e-12);
        assert!((up  - Vector3::new(0.0, -1.0, 0.0)).norm() < 1e-12);
        assert!((rgt - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-12);
    }

    #[test_case(0.0,   360.0, 180.0 ; "front camera looks at longitude 0")]
    #[test_case(180.0, 0.0,   180.0 ; "back camera looks at longitude -180")]
    #[test_case(180.0, 720.0, 180.0 ; "back camera looks at longitude 180")]
    fn optical_axis_hits_center(yaw: f64, u: f64, v: f64) {
        let cam = CameraModel::new(&params(yaw), 96.0, 1.0);
        let p = cam.project(&CameraModel::sphere_direction(u, v, 720, 360));
        assert!(p.theta.abs() < 1e-9);
        assert!((p.x - 100.0).abs() < 1e-6 && (p.y - 100.0).abs() < 1e-6);
    }

    #[test]
    fn equidistant_radius() {
        let cam = CameraModel::new(&params(0.0), 96.0, 1.0);
        // Longitude 90 on the equator is 90° off axis, to the right of the centre
        let p = cam.project(&CameraModel::sphere_direction(540.0, 180.0, 720, 360));
        assert!((p.theta - FRAC_PI_2).abs() < 1e-9);
        assert!((p.x - (100.0 + 100.0 * 90.0 / 96.0)).abs() < 1e-6);
        assert!((p.y - 100.0).abs() < 1e-6);

        // Upper hemisphere lands in the upper half of the image
        let p = cam.project(&CameraModel::sphere_direction(360.0, 100.0, 720, 360));
        assert!(p.y < 100.0);
    }

    #[test]
    fn distortion_pushes_outwards() {
        let mut pr = params(0.0);
        let plain = CameraModel::new(&pr, 96.0, 1.0);
        pr.distortion = [0.05, 0.0, 0.0, 0.0];
        let distorted = CameraModel::new(&pr, 96.0, 1.0);
        let ray = CameraModel::sphere_direction(450.0, 180.0, 720, 360);
        assert!(distorted.project(&ray).x > plain.project(&ray).x);
    }

    #[test]
    fn clamping() {
        let cam = CameraModel::new(&params(0.0), 96.0, 1.0);
        assert_eq!(cam.clamp_to_sensor(-20.0, 250.0), (0.5, 199.5));
        assert_eq!(cam.clamp_to_sensor(f64::NAN, 3.0), (99.75, 3.0));
        assert!(!cam.is_on_sensor(201.0, 10.0));
    }
}
