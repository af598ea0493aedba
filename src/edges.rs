//! Valid regions of the stack slices.
//!
//! Stacks of registered slices are usually surrounded by background (out-of-stack) voxels. Seeding,
//! assignment and connectivity repair only touch voxels inside the region returned for their
//! slice.
use crate::arrays::{Region, Volume};
use rayon::prelude::*;

pub trait SliceRegions: Send + Sync {
    /// Region of slice `z` inside the sample, `None` when the slice has no valid voxel.
    fn slice_region(&self, z: usize) -> Option<Region>;

    #[inline]
    fn is_inside(&self, position: [usize; 3]) -> bool {
        self.slice_region(position[2])
            .is_some_and(|region| region.contains(position))
    }
}

/// Every slice is valid in its full extent.
#[derive(Debug, Clone, Copy)]
pub struct WholeStack {
    dims: [usize; 3],
}

impl WholeStack {
    pub fn new(dims: [usize; 3]) -> Self {
        Self { dims }
    }
}

impl SliceRegions for WholeStack {
    fn slice_region(&self, z: usize) -> Option<Region> {
        (z < self.dims[2] && self.dims[0] > 0 && self.dims[1] > 0)
            .then(|| Region::slice_rect(0, 0, self.dims[0], self.dims[1], z))
    }
}

/// Per-slice rectangles of the stack content.
#[derive(Debug, Clone)]
pub struct ChannelEdges {
    regions: Vec<Option<Region>>,
}

impl ChannelEdges {
    /// Uses the given rectangles (one per slice, the slice index of a rectangle is ignored) cropped
    /// to the stack extent. Missing slices have no valid region.
    pub fn from_regions(dims: [usize; 3], regions: &[Option<Region>]) -> Self {
        let regions = (0..dims[2])
            .map(|z| {
                regions.get(z).copied().flatten().and_then(|rect| {
                    let [x, y, _] = rect.origin;
                    let rect = Region::slice_rect(x, y, rect.size[0], rect.size[1], z);
                    rect.crop(&Region::slice_rect(0, 0, dims[0], dims[1], z))
                })
            })
            .collect();
        Self { regions }
    }

    /// Detects the edges of the stack content: for every slice, the bounding rectangle of voxels
    /// which differ from `background` by more than `threshold`.
    pub fn detect(volume: &Volume, background: u8, threshold: u8) -> Self {
        let lower = background.saturating_sub(threshold);
        let upper = background.saturating_add(threshold);
        let regions = (0..volume.depth)
            .into_par_iter()
            .map(|z| {
                let mut min = [usize::MAX; 2];
                let mut max = [0usize; 2];
                for y in 0..volume.height {
                    let row = volume.get_row_part(y, z, 0, volume.width - 1);
                    let first = row.iter().position(|v| *v < lower || *v > upper);
                    let last = row.iter().rposition(|v| *v < lower || *v > upper);
                    if let (Some(first), Some(last)) = (first, last) {
                        min[0] = min[0].min(first);
                        max[0] = max[0].max(last);
                        min[1] = min[1].min(y);
                        max[1] = max[1].max(y);
                    }
                }
                (min[0] != usize::MAX).then(|| {
                    Region::slice_rect(min[0], min[1], max[0] - min[0] + 1, max[1] - min[1] + 1, z)
                })
            })
            .collect();
        Self { regions }
    }

    pub fn num_slices(&self) -> usize {
        self.regions.len()
    }
}

impl SliceRegions for ChannelEdges {
    fn slice_region(&self, z: usize) -> Option<Region> {
        self.regions.get(z).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelEdges, SliceRegions, WholeStack};
    use crate::arrays::{Region, Volume};

    #[test]
    fn whole_stack_regions() {
        let regions = WholeStack::new([4, 3, 2]);
        assert_eq!(regions.slice_region(1), Some(Region::new([0, 0, 1], [4, 3, 1])));
        assert_eq!(regions.slice_region(2), None);
        assert!(regions.is_inside([3, 2, 1]));
        assert!(!regions.is_inside([4, 2, 1]));
    }

    #[test]
    fn detect_content_edges() {
        // content moves by one voxel per slice, last slice is pure background
        let volume = Volume::from_fn([8, 6, 3], [1.0; 3], |[x, y, z]| {
            if z < 2 && (2 + z..5 + z).contains(&x) && (1..4).contains(&y) {
                200
            } else {
                3
            }
        });
        let edges = ChannelEdges::detect(&volume, 0, 10);
        assert_eq!(edges.num_slices(), 3);
        assert_eq!(edges.slice_region(0), Some(Region::slice_rect(2, 1, 3, 3, 0)));
        assert_eq!(edges.slice_region(1), Some(Region::slice_rect(3, 1, 3, 3, 1)));
        assert_eq!(edges.slice_region(2), None);
        assert!(edges.is_inside([4, 2, 1]));
        assert!(!edges.is_inside([2, 2, 1]));
    }

    #[test]
    fn explicit_regions_are_cropped() {
        let edges = ChannelEdges::from_regions(
            [4, 4, 3],
            &[Some(Region::slice_rect(2, 2, 10, 10, 7)), None],
        );
        assert_eq!(edges.slice_region(0), Some(Region::slice_rect(2, 2, 2, 2, 0)));
        assert_eq!(edges.slice_region(1), None);
        assert_eq!(edges.slice_region(2), None);
    }
}
