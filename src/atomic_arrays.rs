use crate::arrays::{Region, ALIGN};
use crate::common::UNASSIGNED;
use crate::error::{Error, Result};
use aligned_vec::{AVec, ConstAlign};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// For every voxel this stores the index of the owning label (or `UNASSIGNED`).
///
/// Workers of the assignment pass read entries without locking, but every write goes through
/// `commit_if()`, which re-reads the entry under one lock shared by the whole array and only
/// stores when the caller still agrees with the current owner.
pub struct Ownership {
    pub data: AVec<AtomicU32, ConstAlign<ALIGN>>,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    commit_lock: Mutex<()>,
}

impl Ownership {
    pub fn new(dims: [usize; 3]) -> Self {
        Self::from_fill(UNASSIGNED, dims)
    }

    pub fn from_fill(value: u32, dims: [usize; 3]) -> Self {
        let len = dims.iter().product();
        Self {
            data: AVec::from_iter(ALIGN, (0..len).map(|_| AtomicU32::new(value))),
            width: dims[0],
            height: dims[1],
            depth: dims[2],
            commit_lock: Mutex::new(()),
        }
    }

    pub fn from_slice(labels: &[u32], dims: [usize; 3]) -> Result<Self> {
        let expected = dims.iter().product();
        if labels.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: labels.len(),
            });
        }
        Ok(Self {
            data: AVec::from_iter(ALIGN, labels.iter().map(|label| AtomicU32::new(*label))),
            width: dims[0],
            height: dims[1],
            depth: dims[2],
            commit_lock: Mutex::new(()),
        })
    }

    pub fn fill(&mut self, value: u32) {
        self.data
            .iter_mut()
            .for_each(|entry| *entry.get_mut() = value)
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

    pub fn get_coords(&self, index: usize) -> [usize; 3] {
        debug_assert!(index < self.data.len());
        let slice_len = self.width * self.height;
        let z = index / slice_len;
        let rem = index % slice_len;
        [rem % self.width, rem / self.width, z]
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> u32 {
        self.data[index].load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn owner_at(&self, [x, y, z]: [usize; 3]) -> u32 {
        self.get(self.get_index(x, y, z))
    }

    /// Plain store for phases with a single writer (connectivity repair).
    #[inline(always)]
    pub fn set(&self, index: usize, label: u32) {
        self.data[index].store(label, Ordering::Relaxed)
    }

    /// Entries `left..=right` of row `y` in slice `z`.
    #[inline(always)]
    pub fn get_row_part(&self, y: usize, z: usize, left: usize, right: usize) -> &[AtomicU32] {
        &self.data[self.get_index(left, y, z)..=self.get_index(right, y, z)]
    }

    /// Validate-then-commit: under the commit lock, re-reads the current owner of `index` and
    /// stores `label` only if `still_closer(current_owner)` holds. Returns whether it stored.
    #[inline]
    pub fn commit_if<F>(&self, index: usize, label: u32, still_closer: F) -> bool
    where
        F: FnOnce(u32) -> bool,
    {
        let _guard = self.commit_lock.lock();
        let current = self.get(index);
        if current == label {
            return true;
        }
        if still_closer(current) {
            self.set(index, label);
            true
        } else {
            false
        }
    }

    /// Number of voxels of `region` owned by `label`.
    pub fn count_in(&self, region: &Region, label: u32) -> usize {
        region
            .positions()
            .filter(|position| self.owner_at(*position) == label)
            .count()
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.data
            .iter()
            .map(|entry| entry.load(Ordering::Relaxed))
            .collect()
    }
}

impl fmt::Debug for Ownership {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Ownership")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("depth", &self.depth)
            .field("data", &"Omitted...")
            .finish()
    }
}
