use std::f32::consts::{FRAC_PI_2, PI};

/// Absolute difference of two directed angles, in `[0, π]`.
pub fn angle_diff_abs(a: f32, b: f32) -> f32 {
    let d = (b - a).rem_euclid(2.0 * PI);
    d.min(2.0 * PI - d)
}

/// Angle between an undirected axis (modulo π) and a directed angle, in `[0, π/2]`.
pub fn axis_diff_abs(axis: f32, angle: f32) -> f32 {
    let d = angle_diff_abs(axis, angle);
    d.min(PI - d)
}

/// Whether two orientations (modulo π) are orthogonal within `tolerance`.
pub fn is_orthogonal(a: f32, b: f32, tolerance: f32) -> bool {
    (FRAC_PI_2 - axis_diff_abs(a, b)).abs() <= tolerance.abs()
}
