//! Distance between a voxel and a label center.
//!
//! Distances are squared on the hot path; roots are only taken once per iteration when the
//! adaptive weights of labels are refreshed.
use crate::common::COLOR_NORMALIZATION;
use static_init::dynamic;

/// Squared normalized color distance indexed by `voxel - center + 255`.
#[dynamic]
pub static COLOR_DISTANCE_TBL: [f64; 511] = core::array::from_fn(|i| {
    let difference = (i as f64 - 255.0) * COLOR_NORMALIZATION;
    difference * difference
});

/// Result of `distance()`, all parts squared.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distance {
    pub total: f64,
    pub color: f64,
    pub spatial: f64,
}

#[inline(always)]
pub fn color_distance(table: &[f64; 511], voxel_color: u8, center_color: u8) -> f64 {
    table[voxel_color as usize + 255 - center_color as usize]
}

/// Squared physical distance of two voxel positions.
#[inline(always)]
pub fn spatial_distance(voxel: [usize; 3], center: [usize; 3], spacing: &[f64; 3]) -> f64 {
    let dx = voxel[0].abs_diff(center[0]) as f64 * spacing[0];
    let dy = voxel[1].abs_diff(center[1]) as f64 * spacing[1];
    let dz = voxel[2].abs_diff(center[2]) as f64 * spacing[2];
    dx * dx + dy * dy + dz * dz
}

/// Combined distance `color + norm_quotient * spatial`.
///
/// With `spatial_only` the total is the spatial part alone and the color part is not computed
/// (used for center displacements).
#[inline(always)]
pub fn distance(
    voxel_position: [usize; 3],
    voxel_color: u8,
    center_position: [usize; 3],
    center_color: u8,
    norm_quotient: f64,
    spacing: &[f64; 3],
    spatial_only: bool,
) -> Distance {
    let spatial = spatial_distance(voxel_position, center_position, spacing);
    if spatial_only {
        return Distance {
            total: spatial,
            color: 0.0,
            spatial,
        };
    }
    let color = color_distance(&COLOR_DISTANCE_TBL, voxel_color, center_color);
    Distance {
        total: color + norm_quotient * spatial,
        color,
        spatial,
    }
}
