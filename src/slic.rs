use crate::arrays::Volume;
use crate::assign::assign;
use crate::atomic_arrays::Ownership;
use crate::codec::SlicResult;
use crate::common::{Config, UNASSIGNED};
use crate::connectivity::repair_connectivity;
use crate::distance::distance;
use crate::edges::SliceRegions;
use crate::error::{Error, Result};
use crate::label::{Label, ObservedMaxima};
use crate::seeds::init_seeds;
use assume::assume;
use log::{debug, info, trace};
use multiversion::multiversion;
use rayon::current_num_threads;
use std::array;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared cancellation flag of one computation.
///
/// Checked at the start of every iteration, of every label scan and of every slice of a scan.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Runs the whole computation on the calling thread.
///
/// The steps are:
/// - seeding
/// - N iterations (or until converged)
///     - assign
///     - update
/// - connectivity repair
/// - encoding of the result
///
/// `progress` receives `iteration * 100 / max_iterations` at the start of every iteration, it
/// never receives 100 (publishing the result is up to the caller). Returns `Ok(None)` when
/// cancelled through `abort`, nothing of the run is kept in that case.
pub fn run_slic(
    volume: &Volume,
    regions: &dyn SliceRegions,
    config: &Config,
    abort: &AbortFlag,
    progress: &dyn Fn(u8),
) -> Result<Option<SlicResult>> {
    config.validate()?;
    if !volume.is_valid() {
        return Err(Error::InvalidInputVolume(format!(
            "cannot compute supervoxels of {:?}",
            volume
        )));
    }
    let start = Instant::now();
    info!(
        "Computing {:?} supervoxels of {}x{}x{} voxels (size {}, color weight {}, max {} \
         iterations, tolerance {})",
        config.variant,
        volume.width,
        volume.height,
        volume.depth,
        config.spatial_size,
        config.color_weight,
        config.max_iterations,
        config.tolerance
    );

    let mut labels = init_seeds(volume, regions, config)?;
    let ownership = Ownership::new(volume.dims());
    let iterations = iterate(volume, regions, config, &mut labels, &ownership, abort, progress);
    let Some(iterations) = iterations.filter(|_| !abort.is_aborted()) else {
        info!("Supervoxel computation cancelled");
        return Ok(None);
    };
    let search_half = volume.voxel_extent(config.spatial_size as f64);
    repair_connectivity(&mut labels, &ownership, volume, regions, search_half);

    let result = SlicResult::encode(&labels, &ownership, volume, config, iterations);
    info!(
        "Computed {} supervoxels in {} iterations ({:.2?})",
        labels.len(),
        iterations,
        start.elapsed()
    );
    Ok(Some(result))
}

/// This function is the main loop, it returns the number of iterations done or `None` when
/// aborted.
///
/// The weights of adaptive variants are refreshed after every update except the first one, the
/// first assignment claims voxels which were unassigned and its maxima are meaningless.
pub fn iterate(
    volume: &Volume,
    regions: &dyn SliceRegions,
    config: &Config,
    labels: &mut [Label],
    ownership: &Ownership,
    abort: &AbortFlag,
    progress: &dyn Fn(u8),
) -> Option<u32> {
    let search_half = volume.voxel_extent(config.spatial_size as f64);
    for iteration in 0..config.max_iterations {
        if abort.is_aborted() {
            return None;
        }
        progress((iteration as u64 * 100 / config.max_iterations as u64) as u8);
        let adapt = iteration > 0 && config.variant.adapts_spatial();
        let observed = assign(volume, regions, labels, ownership, search_half, adapt, abort)?;
        let converged = update(
            labels,
            ownership,
            volume,
            config,
            adapt.then_some(observed.as_slice()),
        );
        debug!(
            "Iteration {}/{} done, converged: {}",
            iteration + 1,
            config.max_iterations,
            converged
        );
        if converged {
            return Some(iteration + 1);
        }
    }
    Some(config.max_iterations)
}

/// This function does the update step and returns whether the run converged.
///
/// Centers move to the rounded mean position of the owned voxels and colors to their mean
/// intensity. A label owning nothing keeps its center and color. With `observed` the weights of
/// the labels adapt to it afterwards (`Label::adapt_weights()`).
///
/// Convergence needs a positive tolerance and every center displacement within it.
#[multiversion(targets = "simd")]
pub fn update(
    labels: &mut [Label],
    ownership: &Ownership,
    volume: &Volume,
    config: &Config,
    observed: Option<&[ObservedMaxima]>,
) -> bool {
    let num_labels = labels.len();
    let num_label_members: Vec<AtomicU64> =
        Vec::from_iter((0..num_labels).map(|_| AtomicU64::new(0)));
    let label_acc_vec: Vec<[AtomicU64; 4]> =
        Vec::from_iter((0..num_labels).map(|_| array::from_fn(|_| AtomicU64::new(0))));
    let slices: Vec<usize> = (0..volume.depth).collect();
    let chunk_size = volume.depth.div_ceil(current_num_threads()).max(1);

    fn update_part_generic(
        slices: &[usize],
        volume: &Volume,
        ownership: &Ownership,
        num_label_members: &[AtomicU64],
        label_acc_vec: &[[AtomicU64; 4]],
    ) {
        let num_labels = num_label_members.len();
        let mut num_label_members_local: Vec<u64> = vec![0; num_labels];
        let mut label_acc_local: Vec<[u64; 4]> = vec![[0; 4]; num_labels];
        for z in slices {
            for y in 0..volume.height {
                let image_row = volume.get_row_part(y, *z, 0, volume.width - 1);
                let owner_row = ownership.get_row_part(y, *z, 0, volume.width - 1);
                for (x, (voxel, owner)) in image_row.iter().zip(owner_row).enumerate() {
                    let label_n = owner.load(Ordering::Relaxed);
                    if label_n == UNASSIGNED {
                        continue;
                    }
                    let label_n = label_n as usize;
                    assume!(unsafe: label_n < num_labels, "owner {label_n} >= {num_labels}");
                    num_label_members_local[label_n] += 1;
                    label_acc_local[label_n][0] += x as u64;
                    label_acc_local[label_n][1] += y as u64;
                    label_acc_local[label_n][2] += *z as u64;
                    label_acc_local[label_n][3] += *voxel as u64;
                }
            }
        }
        for (label_n, num_members) in num_label_members_local
            .into_iter()
            .enumerate()
            .filter(|(_, x)| *x != 0)
        {
            num_label_members[label_n].fetch_add(num_members, Ordering::Relaxed);
            for (acc, local) in label_acc_vec[label_n].iter().zip(label_acc_local[label_n]) {
                acc.fetch_add(local, Ordering::Relaxed);
            }
        }
    }

    {
        let num_label_members = &num_label_members;
        let label_acc_vec = &label_acc_vec;
        rayon::scope(|s| {
            for chunk in slices.chunks(chunk_size) {
                s.spawn(move |_| {
                    update_part_generic(
                        chunk,
                        volume,
                        ownership,
                        num_label_members,
                        label_acc_vec,
                    )
                })
            }
        });
    }

    let squared_tolerance = config.squared_tolerance();
    let mut converged = squared_tolerance.is_some();
    for label in labels.iter_mut() {
        let label_n = label.index as usize;
        if let Some(observed) = observed {
            label.adapt_weights(config.variant, observed[label_n]);
        }
        let label_members = num_label_members[label_n].load(Ordering::Relaxed);
        if label_members == 0 {
            continue;
        }
        let label_members_half = label_members / 2;
        let mean = |acc: &AtomicU64| {
            (acc.load(Ordering::Relaxed) + label_members_half) / label_members
        };
        let acc = &label_acc_vec[label_n];
        let next_center: [usize; 3] = array::from_fn(|axis| mean(&acc[axis]) as usize);
        debug_assert!(
            volume.bounds().contains(next_center),
            "{:?} trying to move out of bounds to {:?}",
            label,
            next_center
        );
        let displacement =
            distance(label.center, 0, next_center, 0, 0.0, &volume.spacing, true).total;
        trace!(
            "Label {} moved from {:?} to {:?} (squared displacement {})",
            label.index,
            label.center,
            next_center,
            displacement
        );
        if squared_tolerance.is_some_and(|tolerance| displacement > tolerance) {
            converged = false;
        }
        label.center = next_center;
        label.color = mean(&acc[3]) as u8;
    }
    converged
}

#[cfg(test)]
mod tests {
    use super::{iterate, run_slic, update, AbortFlag};
    use crate::arrays::Volume;
    use crate::atomic_arrays::Ownership;
    use crate::common::{Config, SlicVariant, UNASSIGNED};
    use crate::edges::WholeStack;
    use crate::label::{Label, ObservedMaxima};
    use parking_lot::Mutex;

    fn half_split_volume() -> Volume {
        Volume::from_fn([8, 4, 4], [1.0; 3], |[x, _, _]| if x < 4 { 0 } else { 255 })
    }

    fn slic_config(spatial_size: u8, color_weight: u8) -> Config {
        Config {
            spatial_size,
            color_weight,
            variant: SlicVariant::Slic,
            max_iterations: 10,
            tolerance: 0.5,
        }
    }

    #[test]
    fn flat_volume_single_label() {
        let _ = env_logger::builder().is_test(true).try_init();
        let volume = Volume::from_fill(128, [4, 4, 4], [1.0; 3]);
        let config = slic_config(4, 10);
        let mut labels = vec![Label::new(0, [2, 2, 2], 128, &config)];
        let ownership = Ownership::new(volume.dims());
        let iterations = iterate(
            &volume,
            &WholeStack::new(volume.dims()),
            &config,
            &mut labels,
            &ownership,
            &AbortFlag::new(),
            &|_| {},
        );
        assert_eq!(iterations, Some(1));
        assert_eq!(labels[0].center, [2, 2, 2]);
        assert_eq!(ownership.to_vec(), vec![0; 64]);
    }

    #[test]
    fn half_split_volume_converges_to_halves() {
        let volume = half_split_volume();
        let config = slic_config(4, 40);
        let mut labels = vec![
            Label::new(0, [1, 2, 2], 0, &config),
            Label::new(1, [5, 2, 2], 255, &config),
        ];
        let ownership = Ownership::new(volume.dims());
        let iterations = iterate(
            &volume,
            &WholeStack::new(volume.dims()),
            &config,
            &mut labels,
            &ownership,
            &AbortFlag::new(),
            &|_| {},
        )
        .unwrap();
        assert!(iterations <= config.max_iterations);
        let owners = ownership.to_vec();
        assert_eq!(owners.iter().filter(|o| **o == 0).count(), 64);
        assert_eq!(owners.iter().filter(|o| **o == 1).count(), 64);
        for index in 0..ownership.len() {
            let [x, _, _] = ownership.get_coords(index);
            assert_eq!(owners[index], if x < 4 { 0 } else { 1 });
        }
        assert_eq!(labels[0].color, 0);
        assert_eq!(labels[1].color, 255);
    }

    #[test]
    fn update_moves_to_rounded_mean() {
        let volume = Volume::from_fn([4, 1, 1], [1.0; 3], |[x, _, _]| (x * 10) as u8);
        let config = slic_config(2, 10);
        let mut labels = vec![
            Label::new(0, [0, 0, 0], 0, &config),
            Label::new(1, [3, 0, 0], 0, &config),
        ];
        // label 1 owns nothing and stays where it is
        let ownership = Ownership::from_slice(&[0, 0, 0, UNASSIGNED], [4, 1, 1]).unwrap();
        let converged = update(&mut labels, &ownership, &volume, &config, None);
        assert!(!converged);
        assert_eq!(labels[0].center, [1, 0, 0]);
        assert_eq!(labels[0].color, 10);
        assert_eq!(labels[1].center, [3, 0, 0]);
        // second update does not move anything
        assert!(update(&mut labels, &ownership, &volume, &config, None));
    }

    #[test]
    fn zero_tolerance_never_converges() {
        let volume = Volume::from_fill(0, [2, 2, 2], [1.0; 3]);
        let config = Config {
            tolerance: 0.0,
            ..slic_config(2, 10)
        };
        let mut labels = vec![Label::new(0, [0, 0, 0], 0, &config)];
        let ownership = Ownership::from_fill(0, volume.dims());
        assert!(!update(&mut labels, &ownership, &volume, &config, None));
        assert!(!update(&mut labels, &ownership, &volume, &config, None));
    }

    #[test]
    fn update_adapts_weights() {
        let volume = Volume::from_fill(0, [2, 1, 1], [1.0; 3]);
        let config = Config {
            variant: SlicVariant::Aslic,
            ..slic_config(2, 10)
        };
        let mut labels = vec![Label::new(0, [0, 0, 0], 0, &config)];
        let ownership = Ownership::from_fill(0, volume.dims());
        let observed = [ObservedMaxima {
            spatial: 9.0,
            color: 4.0,
        }];
        update(&mut labels, &ownership, &volume, &config, Some(&observed));
        assert_eq!(labels[0].m_s, 3.0);
        assert_eq!(labels[0].m_c, 2.0);
    }

    #[test]
    fn run_half_split_volume() {
        let volume = half_split_volume();
        let config = slic_config(4, 40);
        let result = run_slic(
            &volume,
            &WholeStack::new(volume.dims()),
            &config,
            &AbortFlag::new(),
            &|_| {},
        )
        .unwrap()
        .unwrap();
        // one seed per 4x4x4 cell: the seed grid matches the two halves
        assert_eq!(result.supervoxel_count(), 2);
        for z in 0..4 {
            for y in 0..4 {
                for x in 0..8 {
                    let expected = if x < 4 { 0 } else { 1 };
                    assert_eq!(result.supervoxel_at(x, y, z), Some(expected));
                }
            }
        }
        assert_eq!(result.color_of(0), Some(0));
        assert_eq!(result.color_of(1), Some(255));
    }

    #[test]
    fn progress_is_monotonic() {
        let volume = Volume::from_fn([16, 16, 8], [1.0; 3], |[x, y, z]| ((x * y + z) % 256) as u8);
        let config = Config {
            max_iterations: 4,
            ..Config::default()
        };
        let reported = Mutex::new(Vec::new());
        run_slic(
            &volume,
            &WholeStack::new(volume.dims()),
            &config,
            &AbortFlag::new(),
            &|p| reported.lock().push(p),
        )
        .unwrap()
        .unwrap();
        assert_eq!(*reported.lock(), vec![0, 25, 50, 75]);
    }

    #[test]
    fn cancellation_during_second_iteration() {
        let volume = Volume::from_fn([32, 32, 16], [1.0; 3], |[x, y, z]| ((x ^ y) * 7 + z) as u8);
        let config = Config {
            spatial_size: 5,
            max_iterations: 10,
            ..Config::default()
        };
        let abort = AbortFlag::new();
        let result = run_slic(
            &volume,
            &WholeStack::new(volume.dims()),
            &config,
            &abort,
            &|p| {
                if p >= 10 {
                    abort.abort()
                }
            },
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn invalid_input_is_rejected() {
        let volume = Volume::from_fill(0, [4, 0, 4], [1.0; 3]);
        let result = run_slic(
            &volume,
            &WholeStack::new(volume.dims()),
            &Config::default(),
            &AbortFlag::new(),
            &|_| {},
        );
        assert!(matches!(result, Err(crate::error::Error::InvalidInputVolume(_))));
    }

    #[test]
    fn zero_iterations_are_rejected() {
        let volume = Volume::from_fill(50, [8, 8, 8], [1.0; 3]);
        let config = Config {
            max_iterations: 0,
            ..slic_config(4, 10)
        };
        let result = run_slic(
            &volume,
            &WholeStack::new(volume.dims()),
            &config,
            &AbortFlag::new(),
            &|_| {},
        );
        assert!(matches!(result, Err(crate::error::Error::InvalidConfig(_))));
        // a single iteration already assigns every voxel
        let config = Config {
            max_iterations: 1,
            ..config
        };
        let result = run_slic(
            &volume,
            &WholeStack::new(volume.dims()),
            &config,
            &AbortFlag::new(),
            &|_| {},
        )
        .unwrap()
        .unwrap();
        let ownership = result.decode().unwrap();
        assert!(ownership.to_vec().iter().all(|owner| *owner != UNASSIGNED));
    }
}
