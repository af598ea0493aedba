use crate::error::{Error, Result};
use aligned_vec::{AVec, ConstAlign};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Index;

pub(crate) const ALIGN: usize = 64;

/// Axis-aligned box of voxels given by its first voxel and its size per axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub origin: [usize; 3],
    pub size: [usize; 3],
}

impl Region {
    pub fn new(origin: [usize; 3], size: [usize; 3]) -> Self {
        Self { origin, size }
    }

    /// Rectangle `width`x`height` starting at (`x`, `y`) on slice `z`.
    pub fn slice_rect(x: usize, y: usize, width: usize, height: usize, z: usize) -> Self {
        Self {
            origin: [x, y, z],
            size: [width, height, 1],
        }
    }

    /// Box `[center - half, center + half]` per axis, clamped to `dims`.
    pub fn around(center: [usize; 3], half: [usize; 3], dims: [usize; 3]) -> Self {
        let mut origin = [0; 3];
        let mut size = [0; 3];
        for axis in 0..3 {
            origin[axis] = center[axis].saturating_sub(half[axis]);
            let end = (center[axis] + half[axis] + 1).min(dims[axis]);
            size[axis] = end.saturating_sub(origin[axis]);
        }
        Self { origin, size }
    }

    /// Exclusive end per axis.
    #[inline(always)]
    pub fn end(&self) -> [usize; 3] {
        [
            self.origin[0] + self.size[0],
            self.origin[1] + self.size[1],
            self.origin[2] + self.size[2],
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.size.iter().any(|s| *s == 0)
    }

    pub fn num_voxels(&self) -> usize {
        self.size.iter().product()
    }

    #[inline(always)]
    pub fn contains(&self, position: [usize; 3]) -> bool {
        let end = self.end();
        (0..3).all(|axis| self.origin[axis] <= position[axis] && position[axis] < end[axis])
    }

    /// Intersection of both regions, `None` if they do not overlap.
    pub fn crop(&self, other: &Region) -> Option<Region> {
        let end = self.end();
        let other_end = other.end();
        let mut cropped = Region::default();
        for axis in 0..3 {
            let start = self.origin[axis].max(other.origin[axis]);
            let stop = end[axis].min(other_end[axis]);
            if start >= stop {
                return None;
            }
            cropped.origin[axis] = start;
            cropped.size[axis] = stop - start;
        }
        Some(cropped)
    }

    /// Voxel positions in memory order (x fastest, then y, then z).
    pub fn positions(&self) -> impl Iterator<Item = [usize; 3]> {
        let [x0, y0, z0] = self.origin;
        let [x1, y1, z1] = self.end();
        (z0..z1).flat_map(move |z| (y0..y1).flat_map(move |y| (x0..x1).map(move |x| [x, y, z])))
    }
}

/// Grayscale image stack.
///
/// Voxels are stored slice after slice, row after row, so the index of (x, y, z) is
/// `x + y * width + z * width * height`.
pub struct Volume {
    pub data: AVec<u8, ConstAlign<ALIGN>>,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    /// Size of a voxel along every axis (usually nm).
    pub spacing: [f64; 3],
}

impl Volume {
    pub fn from_slice(data: &[u8], dims: [usize; 3], spacing: [f64; 3]) -> Result<Self> {
        let expected = dims.iter().product();
        if data.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: data.len(),
            });
        }
        let volume = Self {
            data: AVec::from_slice(ALIGN, data),
            width: dims[0],
            height: dims[1],
            depth: dims[2],
            spacing,
        };
        volume.check()?;
        Ok(volume)
    }

    pub fn from_fill(value: u8, dims: [usize; 3], spacing: [f64; 3]) -> Self {
        Self::from_fn(dims, spacing, |_| value)
    }

    /// Builds the volume by evaluating `f` at every voxel position.
    pub fn from_fn<F>(dims: [usize; 3], spacing: [f64; 3], f: F) -> Self
    where
        F: Fn([usize; 3]) -> u8,
    {
        let data = AVec::from_iter(
            ALIGN,
            Region::new([0; 3], dims).positions().map(f),
        );
        Self {
            data,
            width: dims[0],
            height: dims[1],
            depth: dims[2],
            spacing,
        }
    }

    fn check(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(Error::InvalidInputVolume("the volume is empty".to_string()));
        }
        if self.spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(Error::InvalidInputVolume(format!(
                "spacing must be positive, got {:?}",
                self.spacing
            )));
        }
        Ok(())
    }

    /// Readable, non-empty volume with a usable spacing.
    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    #[inline(always)]
    pub fn dims(&self) -> [usize; 3] {
        [self.width, self.height, self.depth]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bounds(&self) -> Region {
        Region::new([0; 3], self.dims())
    }

    /// Physical extent `[x0, x1, y0, y1, z0, z1]` with voxel centers on the spacing grid.
    pub fn physical_bounds(&self) -> [f64; 6] {
        let mut bounds = [0f64; 6];
        for (axis, length) in self.dims().into_iter().enumerate() {
            let half = self.spacing[axis] / 2.0;
            bounds[2 * axis] = -half;
            bounds[2 * axis + 1] = length as f64 * self.spacing[axis] - half;
        }
        bounds
    }

    /// Number of voxels covering `length` spacing units along every axis (at least one).
    pub fn voxel_extent(&self, length: f64) -> [usize; 3] {
        self.spacing
            .map(|spacing| ((length / spacing).round() as usize).max(1))
    }

    #[inline(always)]
    pub fn get_index(&self, x: usize, y: usize, z: usize) -> usize {
        debug_assert!(
            x < self.width && y < self.height && z < self.depth,
            "Index ({x}, {y}, {z}) is out of bounds ({}, {}, {})",
            self.width,
            self.height,
            self.depth
        );
        x + self.width * (y + self.height * z)
    }

    #[inline(always)]
    pub fn get_voxel(&self, [x, y, z]: [usize; 3]) -> u8 {
        self.data[self.get_index(x, y, z)]
    }

    /// Voxels `left..=right` of row `y` in slice `z`.
    #[inline(always)]
    pub fn get_row_part(&self, y: usize, z: usize, left: usize, right: usize) -> &[u8] {
        debug_assert!(left <= right, "{left} <= {right}");
        &self.data[self.get_index(left, y, z)..=self.get_index(right, y, z)]
    }
}

impl Index<[usize; 3]> for Volume {
    type Output = u8;
    fn index(&self, [x, y, z]: [usize; 3]) -> &Self::Output {
        &self.data[self.get_index(x, y, z)]
    }
}

impl fmt::Debug for Volume {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Volume")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("depth", &self.depth)
            .field("spacing", &self.spacing)
            .field("data", &"Omitted...")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Region, Volume};
    use crate::error::Error;

    #[test]
    fn region_around_is_clamped() {
        let region = Region::around([1, 5, 9], [3, 3, 3], [10, 10, 10]);
        assert_eq!(region.origin, [0, 2, 6]);
        assert_eq!(region.size, [5, 7, 4]);
        assert_eq!(region.end(), [5, 9, 10]);
        assert_eq!(region.num_voxels(), 5 * 7 * 4);
    }

    #[test]
    fn region_crop() {
        let region = Region::new([2, 2, 0], [6, 6, 4]);
        let slice = Region::slice_rect(4, 0, 10, 3, 1);
        assert_eq!(region.crop(&slice), Some(Region::new([4, 2, 1], [4, 1, 1])));
        let outside = Region::slice_rect(0, 0, 2, 2, 1);
        assert_eq!(region.crop(&outside), None);
        assert!(region.contains([7, 7, 3]));
        assert!(!region.contains([8, 7, 3]));
    }

    #[test]
    fn region_positions_in_memory_order() {
        let positions: Vec<[usize; 3]> = Region::new([1, 1, 1], [2, 1, 2]).positions().collect();
        assert_eq!(positions, vec![[1, 1, 1], [2, 1, 1], [1, 1, 2], [2, 1, 2]]);
    }

    #[test]
    fn volume_indexing() {
        let volume = Volume::from_fn([4, 3, 2], [1.0, 1.0, 2.0], |[x, y, z]| {
            (x + 10 * y + 100 * z) as u8
        });
        assert_eq!(volume.len(), 24);
        assert_eq!(volume.get_voxel([3, 2, 1]), 123);
        assert_eq!(volume[[1, 0, 1]], 101);
        assert_eq!(volume.get_row_part(1, 1, 1, 3), &[111, 112, 113]);
        assert_eq!(volume.voxel_extent(4.0), [4, 4, 2]);
        assert_eq!(volume.physical_bounds(), [-0.5, 3.5, -0.5, 2.5, -1.0, 3.0]);
    }

    #[test]
    fn volume_validation() {
        assert!(matches!(
            Volume::from_slice(&[0; 5], [2, 2, 2], [1.0; 3]),
            Err(Error::DimensionMismatch {
                expected: 8,
                actual: 5
            })
        ));
        assert!(matches!(
            Volume::from_slice(&[], [0, 2, 2], [1.0; 3]),
            Err(Error::InvalidInputVolume(_))
        ));
        assert!(matches!(
            Volume::from_slice(&[0; 8], [2, 2, 2], [1.0, 0.0, 1.0]),
            Err(Error::InvalidInputVolume(_))
        ));
        assert!(Volume::from_fill(7, [2, 2, 2], [1.0; 3]).is_valid());
        assert!(!Volume::from_fill(7, [0, 2, 2], [1.0; 3]).is_valid());
    }
}
