//! 3D supervoxels of grayscale image stacks in Rust.
//!
//! This crate clusters the voxels of a stack of registered slices into supervoxels with SLIC
//! (simple linear iterative clustering) extended to three dimensions and anisotropic voxel
//! spacing. Besides plain SLIC it implements SLICO, where the spatial scale of every supervoxel
//! adapts to its observed extent, and ASLIC, where the color scale adapts as well.
//!
//! Only voxels inside the valid region of their slice (see `edges`) are clustered, so stacks
//! surrounded by background do not produce background supervoxels.
//!
//! The following example computes supervoxels synchronously and queries the result:
//!
//! ```rust
//! use stack_slic_rust::arrays::Volume;
//! use stack_slic_rust::common::{Config, SlicVariant};
//! use stack_slic_rust::edges::ChannelEdges;
//! use stack_slic_rust::slic::{run_slic, AbortFlag};
//!
//! fn main() {
//!     // two materials split along x, spacing in nm
//!     let volume = Volume::from_fn([32, 32, 8], [1.0, 1.0, 2.0], |[x, _, _]| {
//!         if x < 16 { 40 } else { 200 }
//!     });
//!     // clustering is restricted to voxels which differ from the background (0)
//!     let regions = ChannelEdges::detect(&volume, 0, 10);
//!     let config = Config {
//!         spatial_size: 8,
//!         variant: SlicVariant::Slico,
//!         ..Config::default()
//!     };
//!     let result = run_slic(&volume, &regions, &config, &AbortFlag::new(), &|_| {})
//!         .unwrap()
//!         .unwrap();
//!     let label = result.supervoxel_at(3, 3, 1).unwrap();
//!     assert_eq!(result.color_of(label), Some(40));
//! }
//! ```
//!
//! For interactive use `task::StackSlic` runs the computation in the background, reports its
//! progress, can be aborted, and persists the result in a `storage::BlobStorage` from which it is
//! loaded again on the next query.
//!
//! The assignment step runs in parallel over supervoxels. Their candidate regions overlap, so
//! every change of a voxel's owner is validated again under a lock before it is committed. It's
//! strongly recommended to use this in release build, the hot loops use `assume!` to avoid
//! boundary checks.
//!

pub mod arrays;
pub mod assign;
pub mod atomic_arrays;
pub mod codec;
pub mod common;
pub mod connectivity;
pub mod distance;
pub mod edges;
pub mod error;
pub mod label;
pub mod seeds;
pub mod slic;
pub mod storage;
pub mod task;
