//! Geometric normalization and augmentation of line geometries.
//!
//! All functions operate on a [`GeometryMatrix`] whose rows follow the frame
//! layout (start, end, start normal, end normal, open flags, optional length).
//! The pipeline applied to an accepted frame is:
//!
//! 1. [`subtract_mean`] and [`normalize`] the endpoints
//! 2. [`add_length`] from the normalized endpoints
//! 3. optionally [`augment_flip`] and [`augment_global`]
//! 4. optionally reorder with [`sort_order_by_min_x`]

use std::f64::consts::PI;

use nalgebra::{Matrix3, Vector3};
use rand::Rng;
use rand_distr::StandardNormal;

use super::loaders::{
    GeometryMatrix, END, END_NORMAL, GEOMETRY_WIDTH, OPEN_END, OPEN_START, START, START_NORMAL,
};

#[inline]
fn vector_at(row: &[f64], offset: usize) -> Vector3<f64> {
    Vector3::new(row[offset], row[offset + 1], row[offset + 2])
}

#[inline]
fn store_at(row: &mut [f64], offset: usize, v: &Vector3<f64>) {
    row[offset] = v.x;
    row[offset + 1] = v.y;
    row[offset + 2] = v.z;
}

/// Subtract a fixed 3-vector from the start and end points.
///
/// Normals and openness flags are untouched.
pub fn subtract_mean(geometries: &mut GeometryMatrix, mean: &[f64; 3]) {
    debug_assert!(geometries.width() >= GEOMETRY_WIDTH);

    for row in geometries.iter_rows_mut() {
        for axis in 0..3 {
            row[START.start + axis] -= mean[axis];
            row[END.start + axis] -= mean[axis];
        }
    }
}

/// Divide the start and end points by `scale`.
///
/// Normals and openness flags keep their original range.
pub fn normalize(geometries: &mut GeometryMatrix, scale: f64) {
    debug_assert!(geometries.width() >= GEOMETRY_WIDTH);

    for row in geometries.iter_rows_mut() {
        for value in &mut row[START.start..END.end] {
            *value /= scale;
        }
    }
}

/// Append a column holding the Euclidean length of each segment.
///
/// # Returns
///
/// A new matrix one column wider than the input.
pub fn add_length(geometries: &GeometryMatrix) -> GeometryMatrix {
    let width = geometries.width();
    let mut out = GeometryMatrix::with_capacity(geometries.rows(), width + 1);
    let mut buffer = vec![0.0f64; width + 1];

    for row in geometries.iter_rows() {
        let length = (vector_at(row, END.start) - vector_at(row, START.start)).norm();
        buffer[..width].copy_from_slice(row);
        buffer[width] = length;
        out.push_row(&buffer);
    }

    out
}

/// Reverse the direction of one line.
///
/// Swaps start and end points, the two normals and the two openness flags.
/// Applying it twice restores the row.
pub fn flip_line(geometries: &mut GeometryMatrix, index: usize) {
    let row = geometries.row_mut(index);
    for axis in 0..3 {
        row.swap(START.start + axis, END.start + axis);
        row.swap(START_NORMAL.start + axis, END_NORMAL.start + axis);
    }
    row.swap(OPEN_START, OPEN_END);
}

/// Flip each line independently with probability 0.5.
pub fn augment_flip<R: Rng + ?Sized>(geometries: &mut GeometryMatrix, rng: &mut R) {
    for index in 0..geometries.rows() {
        if rng.random_bool(0.5) {
            flip_line(geometries, index);
        }
    }
}

/// Rotation about a unit `axis` by `angle` radians (Rodrigues' formula).
pub fn rotation_matrix(axis: &Vector3<f64>, angle: f64) -> Matrix3<f64> {
    let (x, y, z) = (axis.x, axis.y, axis.z);
    let s = angle.sin();
    let c = angle.cos();
    let t = 1.0 - c;

    Matrix3::new(
        x * x * t + c,
        x * y * t - z * s,
        x * z * t + y * s,
        x * y * t + z * s,
        y * y * t + c,
        y * z * t - x * s,
        x * z * t - y * s,
        y * z * t + x * s,
        z * z * t + c,
    )
}

/// Draw an axis uniformly distributed on the unit sphere.
pub fn random_axis<R: Rng + ?Sized>(rng: &mut R) -> Vector3<f64> {
    let theta = rng.random_range(-1.0f64..=1.0).acos();
    let psi = rng.random_range(0.0..2.0 * PI);

    Vector3::new(theta.sin() * psi.cos(), theta.sin() * psi.sin(), theta.cos())
}

/// Rotate and translate the whole scene by one small random rigid motion.
///
/// One axis is drawn uniformly on the sphere and one angle from
/// N(0, `angle_deviation`). The rotation is applied to both endpoints and
/// both normals of every line; a single offset drawn per axis from
/// N(0, `offset_deviation`) is then added to the endpoints only.
///
/// # Arguments
///
/// * `geometries` - Geometry rows, modified in place
/// * `angle_deviation` - Standard deviation of the rotation angle in radians
/// * `offset_deviation` - Standard deviation of the translation per axis
/// * `rng` - Random source
pub fn augment_global<R: Rng + ?Sized>(
    geometries: &mut GeometryMatrix,
    angle_deviation: f64,
    offset_deviation: f64,
    rng: &mut R,
) {
    let axis = random_axis(rng);
    let angle = angle_deviation * rng.sample::<f64, _>(StandardNormal);
    let rotation = rotation_matrix(&axis, angle);

    let offset = Vector3::new(
        offset_deviation * rng.sample::<f64, _>(StandardNormal),
        offset_deviation * rng.sample::<f64, _>(StandardNormal),
        offset_deviation * rng.sample::<f64, _>(StandardNormal),
    );

    apply_rigid_motion(geometries, &rotation, &offset);
}

/// Apply a rotation to points and normals and a translation to points.
pub fn apply_rigid_motion(
    geometries: &mut GeometryMatrix,
    rotation: &Matrix3<f64>,
    offset: &Vector3<f64>,
) {
    for row in geometries.iter_rows_mut() {
        for point in [START.start, END.start] {
            let moved = rotation * vector_at(row, point) + offset;
            store_at(row, point, &moved);
        }
        for normal in [START_NORMAL.start, END_NORMAL.start] {
            let turned = rotation * vector_at(row, normal);
            store_at(row, normal, &turned);
        }
    }
}

/// Row order that sorts lines by the smaller x coordinate of their endpoints.
///
/// The sort is stable, so lines with equal keys keep their relative order.
pub fn sort_order_by_min_x(geometries: &GeometryMatrix) -> Vec<usize> {
    let keys: Vec<f64> = geometries
        .iter_rows()
        .map(|row| row[START.start].min(row[END.start]))
        .collect();

    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
    order
}
