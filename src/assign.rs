use crate::arrays::{Region, Volume};
use crate::atomic_arrays::Ownership;
use crate::common::UNASSIGNED;
use crate::distance::{color_distance, distance, spatial_distance, COLOR_DISTANCE_TBL};
use crate::edges::SliceRegions;
use crate::label::{Label, ObservedMaxima};
use crate::slic::AbortFlag;
use assume::assume;
use multiversion::multiversion;
use rayon::prelude::*;
use std::sync::atomic::Ordering;

/// This function implements the assign step.
///
/// Labels are processed in parallel, every worker scans the candidate region of one label (`half`
/// voxels around its center, cropped slice by slice to the valid region) and claims the voxels
/// which are strictly closer to its label than to their current owner.
///
/// With `track_maxima` the returned vector holds, for every label, the maximum squared spatial and
/// color distance of the voxels it owns after its scan. Returns `None` when aborted, the
/// ownership is then in an undefined state and should be discarded.
pub fn assign(
    volume: &Volume,
    regions: &dyn SliceRegions,
    labels: &[Label],
    ownership: &Ownership,
    half: [usize; 3],
    track_maxima: bool,
    abort: &AbortFlag,
) -> Option<Vec<ObservedMaxima>> {
    debug_assert_eq!(volume.dims(), ownership.dims());
    labels
        .par_iter()
        .map(|label| {
            if abort.is_aborted() {
                return None;
            }
            assign_label(
                volume,
                regions,
                labels,
                label,
                ownership,
                half,
                track_maxima,
                abort,
            )
        })
        .collect()
}

#[multiversion(targets = "simd")]
fn assign_label(
    volume: &Volume,
    regions: &dyn SliceRegions,
    labels: &[Label],
    label: &Label,
    ownership: &Ownership,
    half: [usize; 3],
    track_maxima: bool,
    abort: &AbortFlag,
) -> Option<ObservedMaxima> {
    let region = label.candidate_region(half, volume.dims());
    let spacing = &volume.spacing;
    let color_table: &[f64; 511] = &COLOR_DISTANCE_TBL;
    let mut maxima = ObservedMaxima::default();

    // Distance of a voxel to its current owner, infinite when the voxel is free or already ours.
    let incumbent_distance = |owner: u32, position: [usize; 3], voxel_color: u8| -> f64 {
        if owner == UNASSIGNED || owner == label.index {
            return f64::INFINITY;
        }
        assume!(unsafe: (owner as usize) < labels.len(), "owner {owner} >= {}", labels.len());
        let owner_label = &labels[owner as usize];
        distance(
            position,
            voxel_color,
            owner_label.center,
            owner_label.color,
            owner_label.norm_quotient,
            spacing,
            false,
        )
        .total
    };

    let [x, y, _] = region.origin;
    let [width, height, _] = region.size;
    for z in region.origin[2]..region.end()[2] {
        if abort.is_aborted() {
            return None;
        }
        // Slices outside the sample are skipped, there is no assignment across background.
        let Some(slice_region) = regions.slice_region(z) else {
            continue;
        };
        let Some(cropped) = Region::slice_rect(x, y, width, height, z).crop(&slice_region) else {
            continue;
        };
        let left = cropped.origin[0];
        let right = cropped.end()[0] - 1;

        for row in cropped.origin[1]..cropped.end()[1] {
            let image_row = volume.get_row_part(row, z, left, right);
            let owner_row = ownership.get_row_part(row, z, left, right);
            debug_assert_eq!(image_row.len(), owner_row.len());

            for ((column, voxel_color), owner) in (left..).zip(image_row).zip(owner_row) {
                let position = [column, row, z];
                let spatial = spatial_distance(position, label.center, spacing);
                let color = color_distance(color_table, *voxel_color, label.color);
                let candidate = color + label.norm_quotient * spatial;
                let current = owner.load(Ordering::Relaxed);
                if current == label.index {
                    if track_maxima {
                        maxima.observe(spatial, color);
                    }
                    continue;
                }
                if candidate >= incumbent_distance(current, position, *voxel_color) {
                    continue;
                }
                // The owner may have changed since the read above, the commit recomputes the
                // incumbent distance with the owner seen under the lock.
                let index = ownership.get_index(column, row, z);
                let committed = ownership.commit_if(index, label.index, |current| {
                    candidate < incumbent_distance(current, position, *voxel_color)
                });
                if committed && track_maxima {
                    maxima.observe(spatial, color);
                }
            }
        }
    }
    Some(maxima)
}
