//! Math utilities and types
//!
//! Provides the fundamental math types used by the scene and the GPU-facing structs.

pub use nalgebra::{
    Vector2, Vector3, Vector4,
    Matrix3, Matrix4,
};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// 3D point type
pub type Point3 = nalgebra::Point3<f32>;

/// Compose a model matrix from euler rotation (radians)
///
/// The order is fixed: translate * rotate_x * rotate_y * rotate_z * scale.
pub fn euler_model_matrix(position: &Vec3, rotation: &Vec3, scale: &Vec3) -> Mat4 {
    let rotate_x = Mat4::from_axis_angle(&Vec3::x_axis(), rotation.x);
    let rotate_y = Mat4::from_axis_angle(&Vec3::y_axis(), rotation.y);
    let rotate_z = Mat4::from_axis_angle(&Vec3::z_axis(), rotation.z);

    Mat4::new_translation(position)
        * rotate_x
        * rotate_y
        * rotate_z
        * Mat4::new_nonuniform_scaling(scale)
}

/// Convert a matrix into the column-major array layout shaders expect
pub fn to_column_array(matrix: &Mat4) -> [[f32; 4]; 4] {
    let mut columns = [[0.0_f32; 4]; 4];
    for (c, column) in columns.iter_mut().enumerate() {
        for (r, value) in column.iter_mut().enumerate() {
            *value = matrix[(r, c)];
        }
    }
    columns
}

/// Transform a position by a model matrix
pub fn transform_position(matrix: &Mat4, position: [f32; 3]) -> [f32; 3] {
    let p = matrix.transform_point(&Point3::new(position[0], position[1], position[2]));
    [p.x, p.y, p.z]
}

/// Transform a normal by the inverse-transpose of a model matrix
pub fn transform_normal(matrix: &Mat4, normal: [f32; 3]) -> [f32; 3] {
    let linear: Mat3 = matrix.fixed_view::<3, 3>(0, 0).into_owned();
    let normal_matrix = linear
        .try_inverse()
        .map(|inverse| inverse.transpose())
        .unwrap_or(linear);
    let n = normal_matrix * Vec3::new(normal[0], normal[1], normal[2]);
    let length = n.norm();
    if length > f32::EPSILON {
        [n.x / length, n.y / length, n.z / length]
    } else {
        normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_identity_components_give_identity_matrix() {
        let m = euler_model_matrix(&Vec3::zeros(), &Vec3::zeros(), &Vec3::new(1.0, 1.0, 1.0));
        assert_relative_eq!(m, Mat4::identity());
    }

    #[test]
    fn test_scale_applies_before_translation() {
        let m = euler_model_matrix(
            &Vec3::new(10.0, 0.0, 0.0),
            &Vec3::zeros(),
            &Vec3::new(2.0, 2.0, 2.0),
        );
        let p = transform_position(&m, [1.0, 0.0, 0.0]);
        assert_relative_eq!(p[0], 12.0);
    }

    #[test]
    fn test_rotation_order_is_x_then_y_then_z() {
        // Z is applied to the point first, then Y, then X.
        let rotation = Vec3::new(FRAC_PI_2, 0.0, FRAC_PI_2);
        let m = euler_model_matrix(&Vec3::zeros(), &rotation, &Vec3::new(1.0, 1.0, 1.0));
        let p = transform_position(&m, [1.0, 0.0, 0.0]);
        // Rz(90) maps +X to +Y, Rx(90) then maps +Y to +Z.
        assert_relative_eq!(p[0], 0.0, epsilon = 1e-5);
        assert_relative_eq!(p[1], 0.0, epsilon = 1e-5);
        assert_relative_eq!(p[2], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_column_array_layout() {
        let m = Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0));
        let columns = to_column_array(&m);
        assert_eq!(columns[3], [1.0, 2.0, 3.0, 1.0]);
    }

    #[test]
    fn test_normals_stay_unit_length_under_scale() {
        let m = euler_model_matrix(&Vec3::zeros(), &Vec3::zeros(), &Vec3::new(4.0, 1.0, 1.0));
        let n = transform_normal(&m, [1.0, 0.0, 0.0]);
        assert_relative_eq!(n[0], 1.0, epsilon = 1e-5);
    }
}
