use crate::arrays::{Region, Volume};
use crate::common::Config;
use crate::edges::SliceRegions;
use crate::error::{Error, Result};
use crate::label::Label;
use log::info;
use rayon::prelude::*;

/// Places the initial labels on a regular grid.
///
/// The grid step is `spatial_size` converted to voxels on every axis and the first grid point is
/// offset by half a step, so seeds sit in the middle of their grid cells. Grid points outside the
/// valid region of their slice are skipped and every remaining seed is moved to the voxel of
/// lowest gradient in its 3x3x3 neighbourhood. Label indices follow the grid order (x fastest).
pub fn init_seeds(
    volume: &Volume,
    regions: &dyn SliceRegions,
    config: &Config,
) -> Result<Vec<Label>> {
    if !volume.is_valid() {
        return Err(Error::InvalidInputVolume(format!(
            "cannot seed supervoxels in {:?}",
            volume
        )));
    }
    let step = volume.voxel_extent(config.spatial_size as f64);
    let dims = volume.dims();

    let mut grid_points: Vec<[usize; 3]> = Vec::new();
    for z in (step[2] / 2..dims[2]).step_by(step[2]) {
        let Some(slice_region) = regions.slice_region(z) else {
            continue;
        };
        for y in (step[1] / 2..dims[1]).step_by(step[1]) {
            for x in (step[0] / 2..dims[0]).step_by(step[0]) {
                if slice_region.contains([x, y, z]) {
                    grid_points.push([x, y, z]);
                }
            }
        }
    }

    let labels: Vec<Label> = grid_points
        .par_iter()
        .map(|seed| lowest_gradient_position(volume, regions, *seed))
        .collect::<Vec<[usize; 3]>>()
        .into_iter()
        .enumerate()
        .map(|(index, center)| Label::new(index as u32, center, volume.get_voxel(center), config))
        .collect();

    info!(
        "Created {} supervoxel seeds (grid step {:?} voxels)",
        labels.len(),
        step
    );
    Ok(labels)
}

/// Squared gradient magnitude by central differences, neighbours are clamped to the volume.
pub(crate) fn gradient_magnitude(volume: &Volume, position: [usize; 3]) -> u32 {
    let dims = volume.dims();
    let mut magnitude = 0u32;
    for axis in 0..3 {
        let mut before = position;
        let mut after = position;
        before[axis] = position[axis].saturating_sub(1);
        after[axis] = (position[axis] + 1).min(dims[axis] - 1);
        let difference = volume.get_voxel(after).abs_diff(volume.get_voxel(before)) as u32;
        magnitude += difference * difference;
    }
    magnitude
}

/// Voxel of the 3x3x3 neighbourhood of `seed` with the lowest gradient, staying inside the valid
/// region. Ties go to the voxel closest to the seed, then to the first one in memory order.
fn lowest_gradient_position(
    volume: &Volume,
    regions: &dyn SliceRegions,
    seed: [usize; 3],
) -> [usize; 3] {
    let offset = |candidate: [usize; 3]| -> usize {
        (0..3).map(|axis| candidate[axis].abs_diff(seed[axis])).sum()
    };
    let mut best = seed;
    let mut best_key = (gradient_magnitude(volume, seed), 0);
    for candidate in Region::around(seed, [1, 1, 1], volume.dims()).positions() {
        if !regions.is_inside(candidate) {
            continue;
        }
        let key = (gradient_magnitude(volume, candidate), offset(candidate));
        if key < best_key {
            best_key = key;
            best = candidate;
        }
    }
    best
}
