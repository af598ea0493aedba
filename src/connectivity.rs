//! Connectivity repair.
//!
//! The local search of the assignment can leave a label owning fragments which are not connected
//! to the rest of the supervoxel. After the last iteration every label keeps only the 6-connected
//! component of its center, the other voxels (islands) join the most frequent neighbouring label.
use crate::arrays::{Region, Volume};
use crate::atomic_arrays::Ownership;
use crate::common::UNASSIGNED;
use crate::distance::spatial_distance;
use crate::edges::SliceRegions;
use crate::label::Label;
use assume::assume;
use log::debug;
use rayon::prelude::*;

/// Makes every supervoxel a single 6-connected component containing its center and assigns
/// in-region voxels left unassigned. Returns the number of relabeled voxels.
///
/// Labels are processed in index order. The main component of a label is flood filled from its
/// center, if the center voxel belongs to another label the fill starts at the nearest voxel the
/// label owns within `max(m_s, 2 * search_half)` voxels and the center moves there. A label owning
/// nothing around its center keeps all its voxels as islands.
///
/// Islands and orphans are then relabeled in passes, each one takes the most frequent label
/// among its already settled neighbours (ties go to the first one in `-x, +x, -y, +y, -z, +z`
/// order). Passes repeat until every voxel is settled or a pass changes nothing.
pub fn repair_connectivity(
    labels: &mut [Label],
    ownership: &Ownership,
    volume: &Volume,
    regions: &dyn SliceRegions,
    search_half: [usize; 3],
) -> usize {
    debug_assert_eq!(volume.dims(), ownership.dims());
    let mut settled = vec![false; ownership.len()];
    let mut stack: Vec<usize> = Vec::new();

    for label in labels.iter_mut() {
        let Some(start) = start_position(label, ownership, volume, search_half) else {
            continue;
        };
        if start != label.center {
            debug!(
                "Label {} does not own its center {:?}, moving it to {:?}",
                label.index, label.center, start
            );
            label.center = start;
        }
        let start = ownership.get_index(start[0], start[1], start[2]);
        settled[start] = true;
        stack.push(start);
        while let Some(index) = stack.pop() {
            for neighbour in neighbours(ownership, index).into_iter().flatten() {
                if !settled[neighbour] && ownership.get(neighbour) == label.index {
                    settled[neighbour] = true;
                    stack.push(neighbour);
                }
            }
        }
    }

    let mut pending: Vec<usize> = (0..ownership.depth)
        .into_par_iter()
        .flat_map_iter(|z| {
            let settled = &settled;
            let slice_start = ownership.get_index(0, 0, z);
            let slice_end = slice_start + ownership.width * ownership.height;
            (slice_start..slice_end).filter(move |index| {
                if settled[*index] {
                    return false;
                }
                ownership.get(*index) != UNASSIGNED
                    || regions.is_inside(ownership.get_coords(*index))
            })
        })
        .collect();
    let num_pending = pending.len();

    let mut relabeled = 0;
    loop {
        let before = pending.len();
        pending.retain(|index| {
            let index = *index;
            let current = ownership.get(index);
            match settled_neighbour_label(ownership, &settled, index, current) {
                NeighbourLabel::Same => {
                    settled[index] = true;
                    false
                }
                NeighbourLabel::Other(label) => {
                    ownership.set(index, label);
                    settled[index] = true;
                    relabeled += 1;
                    false
                }
                NeighbourLabel::None => true,
            }
        });
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }
    debug!(
        "Connectivity repair relabeled {} of {} disconnected voxels ({} left unchanged)",
        relabeled,
        num_pending,
        pending.len()
    );
    relabeled
}

/// Center of `label` if it owns it, otherwise the nearest owned voxel around the center.
fn start_position(
    label: &Label,
    ownership: &Ownership,
    volume: &Volume,
    search_half: [usize; 3],
) -> Option<[usize; 3]> {
    if ownership.owner_at(label.center) == label.index {
        return Some(label.center);
    }
    let extent = volume.voxel_extent(label.m_s);
    let half: [usize; 3] = std::array::from_fn(|axis| extent[axis].max(2 * search_half[axis]));
    let mut nearest = None;
    let mut nearest_distance = f64::INFINITY;
    for position in Region::around(label.center, half, volume.dims()).positions() {
        if ownership.owner_at(position) != label.index {
            continue;
        }
        let distance = spatial_distance(position, label.center, &volume.spacing);
        if distance < nearest_distance {
            nearest_distance = distance;
            nearest = Some(position);
        }
    }
    nearest
}

/// 6-connected neighbours in `-x, +x, -y, +y, -z, +z` order.
#[inline]
fn neighbours(ownership: &Ownership, index: usize) -> [Option<usize>; 6] {
    let [x, y, z] = ownership.get_coords(index);
    let row = ownership.width;
    let slice = ownership.width * ownership.height;
    [
        (x > 0).then(|| index - 1),
        (x + 1 < ownership.width).then(|| index + 1),
        (y > 0).then(|| index - row),
        (y + 1 < ownership.height).then(|| index + row),
        (z > 0).then(|| index - slice),
        (z + 1 < ownership.depth).then(|| index + slice),
    ]
}

enum NeighbourLabel {
    /// A settled neighbour has the same label, the voxel is already connected.
    Same,
    Other(u32),
    None,
}

fn settled_neighbour_label(
    ownership: &Ownership,
    settled: &[bool],
    index: usize,
    current: u32,
) -> NeighbourLabel {
    let mut counts: [(u32, u8); 6] = [(UNASSIGNED, 0); 6];
    let mut num_counts = 0;
    for neighbour in neighbours(ownership, index).into_iter().flatten() {
        if !settled[neighbour] {
            continue;
        }
        let label = ownership.get(neighbour);
        if label == current {
            return NeighbourLabel::Same;
        }
        match counts[..num_counts].iter_mut().find(|(l, _)| *l == label) {
            Some((_, count)) => *count += 1,
            None => {
                assume!(unsafe: num_counts < 6, "more than 6 neighbours");
                counts[num_counts] = (label, 1);
                num_counts += 1;
            }
        }
    }
    // max_by_key returns the last maximum, the first encountered one is wanted
    let mut best: Option<(u32, u8)> = None;
    for (label, count) in &counts[..num_counts] {
        if best.map_or(true, |(_, best_count)| *count > best_count) {
            best = Some((*label, *count));
        }
    }
    match best {
        Some((label, _)) => NeighbourLabel::Other(label),
        None => NeighbourLabel::None,
    }
}
