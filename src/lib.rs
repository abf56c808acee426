//! voxtree - an out-of-core bricked multi-resolution volume store
//!
//! Large raw voxel volumes are converted once into a single container file
//! holding a bricked LOD hierarchy (plus histograms, per-brick min/max and
//! free-form metadata) and then paged brick by brick, locally or over the
//! remote brick protocol.

pub mod container;
pub mod core;
pub mod dataset;
pub mod io;
pub mod math;
pub mod octree;
pub mod raster;
pub mod rebrick;
pub mod remote;

pub use core::error::{Error, Result};
pub use core::types::VoxelType;
