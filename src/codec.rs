//! Encoded result of a computation.
//!
//! The ownership of every slice is stored row by row as runs of equal labels. A run is 6 bytes,
//! the little-endian `u32` label (`UNASSIGNED` for voxels without a supervoxel) followed by the
//! little-endian `u16` run length. Runs never cross rows and longer runs are split.
//!
//! The label table (final center and color of every label) and the run metadata are serialized
//! with bincode. Persisted results are three kinds of blobs sharing the channel prefix, see
//! `FileNames`.
use crate::arrays::Volume;
use crate::atomic_arrays::Ownership;
use crate::common::{Config, UNASSIGNED};
use crate::error::{Error, Result};
use crate::label::Label;
use crate::storage::BlobStorage;
use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;

/// Version of the persisted layout, other versions are treated as corrupt.
pub const FORMAT_VERSION: u32 = 1;

const RUN_SIZE: usize = 6;

/// Names of the persisted blobs, every name is prefixed by `"{channel}/"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNames {
    /// One blob per slice, `{}` is replaced by the slice index.
    pub voxels_file_pattern: String,
    pub labels_file_name: String,
    pub metadata_file_name: String,
}

impl Default for FileNames {
    fn default() -> Self {
        Self {
            voxels_file_pattern: "slic_voxels_{}.rle".to_string(),
            labels_file_name: "slic_labels.bin".to_string(),
            metadata_file_name: "slic_metadata.bin".to_string(),
        }
    }
}

impl FileNames {
    pub fn voxels(&self, channel: &str, z: usize) -> String {
        format!(
            "{channel}/{}",
            self.voxels_file_pattern.replace("{}", &z.to_string())
        )
    }

    pub fn labels(&self, channel: &str) -> String {
        format!("{channel}/{}", self.labels_file_name)
    }

    pub fn metadata(&self, channel: &str) -> String {
        format!("{channel}/{}", self.metadata_file_name)
    }
}

/// Final state of one label.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelRecord {
    pub center: [u32; 3],
    pub color: u8,
}

/// Everything needed to interpret the slices and the label table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunMetadata {
    pub version: u32,
    pub dims: [u32; 3],
    pub spacing: [f64; 3],
    /// Physical bounds `[x0, x1, y0, y1, z0, z1]` of the volume.
    pub bounds: [f64; 6],
    pub supervoxel_count: u32,
    /// Iterations done before convergence or the iteration limit.
    pub iterations: u32,
    pub config: Config,
}

/// Run-length encodes slice `z` of the ownership.
pub fn encode_slice(ownership: &Ownership, z: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    if ownership.width == 0 {
        return bytes;
    }
    let mut push_run = |label: u32, length: u16| {
        bytes.extend_from_slice(&label.to_le_bytes());
        bytes.extend_from_slice(&length.to_le_bytes());
    };
    for y in 0..ownership.height {
        let row = ownership.get_row_part(y, z, 0, ownership.width - 1);
        let mut run_label = row[0].load(Ordering::Relaxed);
        let mut run_length: u16 = 0;
        for entry in row {
            let label = entry.load(Ordering::Relaxed);
            if label != run_label || run_length == u16::MAX {
                push_run(run_label, run_length);
                run_label = label;
                run_length = 0;
            }
            run_length += 1;
        }
        push_run(run_label, run_length);
    }
    bytes
}

/// Decodes one slice encoded by `encode_slice()`.
///
/// Fails with `Error::Corrupt` unless the runs exactly cover `width * height` voxels without
/// crossing rows and every label is `UNASSIGNED` or below `num_labels`.
pub fn decode_slice(
    bytes: &[u8],
    width: usize,
    height: usize,
    num_labels: u32,
) -> Result<Vec<u32>> {
    if bytes.len() % RUN_SIZE != 0 {
        return Err(Error::Corrupt(format!(
            "slice of {} bytes is not made of {RUN_SIZE} byte runs",
            bytes.len()
        )));
    }
    let mut labels = Vec::with_capacity(width * height);
    let mut column = 0;
    for (label, length) in runs(bytes) {
        if label != UNASSIGNED && label >= num_labels {
            return Err(Error::Corrupt(format!(
                "label {label} out of {num_labels} supervoxels"
            )));
        }
        if length == 0 || column + length > width {
            return Err(Error::Corrupt(format!(
                "run of {length} voxels at column {column} of a {width} voxel row"
            )));
        }
        if labels.len() + length > width * height {
            return Err(Error::Corrupt("runs exceed the slice".to_string()));
        }
        labels.extend(std::iter::repeat(label).take(length));
        column = (column + length) % width;
    }
    if labels.len() != width * height {
        return Err(Error::Corrupt(format!(
            "runs cover {} of {} voxels",
            labels.len(),
            width * height
        )));
    }
    Ok(labels)
}

#[inline]
fn runs(bytes: &[u8]) -> impl Iterator<Item = (u32, usize)> + '_ {
    bytes.chunks_exact(RUN_SIZE).map(|run| {
        let label = u32::from_le_bytes([run[0], run[1], run[2], run[3]]);
        let length = u16::from_le_bytes([run[4], run[5]]);
        (label, length as usize)
    })
}

/// Immutable result of a finished computation.
#[derive(Debug, Clone, PartialEq)]
pub struct SlicResult {
    labels: Vec<LabelRecord>,
    slices: Vec<Vec<u8>>,
    metadata: RunMetadata,
}

impl SlicResult {
    pub fn encode(
        labels: &[Label],
        ownership: &Ownership,
        volume: &Volume,
        config: &Config,
        iterations: u32,
    ) -> Self {
        debug_assert_eq!(volume.dims(), ownership.dims());
        let slices = (0..ownership.depth)
            .into_par_iter()
            .map(|z| encode_slice(ownership, z))
            .collect();
        let labels = labels
            .iter()
            .map(|label| LabelRecord {
                center: label.center.map(|c| c as u32),
                color: label.color,
            })
            .collect::<Vec<_>>();
        let metadata = RunMetadata {
            version: FORMAT_VERSION,
            dims: volume.dims().map(|d| d as u32),
            spacing: volume.spacing,
            bounds: volume.physical_bounds(),
            supervoxel_count: labels.len() as u32,
            iterations,
            config: config.clone(),
        };
        Self {
            labels,
            slices,
            metadata,
        }
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn dims(&self) -> [usize; 3] {
        self.metadata.dims.map(|d| d as usize)
    }

    pub fn supervoxel_count(&self) -> usize {
        self.labels.len()
    }

    pub fn parameters_used(&self) -> &Config {
        &self.metadata.config
    }

    pub fn labels(&self) -> &[LabelRecord] {
        &self.labels
    }

    pub fn color_of(&self, label: u32) -> Option<u8> {
        self.labels.get(label as usize).map(|record| record.color)
    }

    pub fn center_of(&self, label: u32) -> Option<[usize; 3]> {
        self.labels
            .get(label as usize)
            .map(|record| record.center.map(|c| c as usize))
    }

    /// Supervoxel of a voxel, `None` outside the volume or for unassigned voxels.
    pub fn supervoxel_at(&self, x: usize, y: usize, z: usize) -> Option<u32> {
        let [width, height, depth] = self.dims();
        if x >= width || y >= height || z >= depth {
            return None;
        }
        let target = y * width + x;
        let mut position = 0;
        for (label, length) in runs(&self.slices[z]) {
            position += length;
            if position > target {
                return (label != UNASSIGNED).then_some(label);
            }
        }
        None
    }

    /// Decoded labels of slice `z` (row-major, `UNASSIGNED` for unassigned voxels).
    pub fn slice_labels(&self, z: usize) -> Option<Vec<u32>> {
        let [width, height, _] = self.dims();
        let mut labels = Vec::with_capacity(width * height);
        for (label, length) in runs(self.slices.get(z)?) {
            labels.extend(std::iter::repeat(label).take(length));
        }
        Some(labels)
    }

    /// Color of the supervoxel of every voxel of slice `z`, 0 for unassigned voxels.
    pub fn slice_colors(&self, z: usize) -> Option<Vec<u8>> {
        let [width, height, _] = self.dims();
        let mut colors = Vec::with_capacity(width * height);
        for (label, length) in runs(self.slices.get(z)?) {
            let color = self.color_of(label).unwrap_or(0);
            colors.extend(std::iter::repeat(color).take(length));
        }
        Some(colors)
    }

    /// Rebuilds the whole ownership array.
    pub fn decode(&self) -> Result<Ownership> {
        let [width, height, depth] = self.dims();
        let mut labels = Vec::with_capacity(width * height * depth);
        for slice in &self.slices {
            labels.extend(decode_slice(
                slice,
                width,
                height,
                self.metadata.supervoxel_count,
            )?);
        }
        Ownership::from_slice(&labels, [width, height, depth])
    }

    /// Writes the slices, the label table and finally the metadata.
    ///
    /// The metadata blob is emptied before anything else is written. A save which fails midway
    /// leaves a result that loads as not computed, never the slices of one run next to the
    /// label table of another.
    pub fn save(&self, storage: &dyn BlobStorage, channel: &str, names: &FileNames) -> Result<()> {
        storage.save(&names.metadata(channel), &[])?;
        for (z, slice) in self.slices.iter().enumerate() {
            storage.save(&names.voxels(channel, z), slice)?;
        }
        let labels = bincode::serde::encode_to_vec(&self.labels, bincode::config::standard())?;
        storage.save(&names.labels(channel), &labels)?;
        let metadata = bincode::serde::encode_to_vec(&self.metadata, bincode::config::standard())?;
        storage.save(&names.metadata(channel), &metadata)?;
        debug!(
            "Saved {} supervoxels of {} slices to {channel}",
            self.labels.len(),
            self.slices.len()
        );
        Ok(())
    }

    /// Loads a persisted result, `None` when nothing is stored or the stored data is incomplete
    /// or corrupt.
    pub fn load(storage: &dyn BlobStorage, channel: &str, names: &FileNames) -> Option<Self> {
        match Self::try_load(storage, channel, names) {
            Ok(result) => result,
            Err(err) => {
                warn!("Ignoring persisted supervoxels of {channel}: {err}");
                None
            }
        }
    }

    fn try_load(
        storage: &dyn BlobStorage,
        channel: &str,
        names: &FileNames,
    ) -> Result<Option<Self>> {
        let Some(metadata) = storage.load(&names.metadata(channel))? else {
            debug!("No persisted supervoxels for {channel}");
            return Ok(None);
        };
        if metadata.is_empty() {
            return Err(Error::Corrupt("the last save did not finish".to_string()));
        }
        let (metadata, _): (RunMetadata, usize) =
            bincode::serde::decode_from_slice(&metadata, bincode::config::standard())?;
        if metadata.version != FORMAT_VERSION {
            return Err(Error::Corrupt(format!(
                "format version {} is not {FORMAT_VERSION}",
                metadata.version
            )));
        }

        let missing = |name: String| Error::Corrupt(format!("missing blob {name}"));
        let labels_name = names.labels(channel);
        let labels = storage.load(&labels_name)?.ok_or_else(|| missing(labels_name))?;
        let (labels, _): (Vec<LabelRecord>, usize) =
            bincode::serde::decode_from_slice(&labels, bincode::config::standard())?;
        if labels.len() != metadata.supervoxel_count as usize {
            return Err(Error::Corrupt(format!(
                "{} labels stored for {} supervoxels",
                labels.len(),
                metadata.supervoxel_count
            )));
        }
        let dims = metadata.dims;
        if labels
            .iter()
            .any(|label| (0..3).any(|axis| label.center[axis] >= dims[axis]))
        {
            return Err(Error::Corrupt("label center out of the volume".to_string()));
        }

        let [width, height, depth] = dims.map(|d| d as usize);
        let mut slices = Vec::with_capacity(depth);
        for z in 0..depth {
            let name = names.voxels(channel, z);
            let slice = storage.load(&name)?.ok_or_else(|| missing(name))?;
            decode_slice(&slice, width, height, metadata.supervoxel_count)?;
            slices.push(slice);
        }
        Ok(Some(Self {
            labels,
            slices,
            metadata,
        }))
    }
}
