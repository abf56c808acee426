//! Dataset surface: brick metadata, linear indexing, concrete formats
//!
//! Every bricked source implements [`BrickedDataset`] over a shared
//! [`BrickTable`]; [`LinearIndexDataset`] adds the canonical 1D<->3D brick
//! index mapping. The deep class hierarchy of older viewers collapses here
//! into capability traits plus composition.

pub mod brick;
pub mod factory;
pub mod iterator;
pub mod volume;

pub use brick::{BrickKey, BrickMD, BrickTable};
pub use factory::{DatasetFactory, DatasetReader};
pub use iterator::BrickIterator;
pub use volume::VolumeDataset;

use glam::Vec3;
use std::path::PathBuf;

use crate::container::maxmin::MinMax;
use crate::core::error::{Error, Result};
use crate::core::types::VoxelType;

/// Anything organized as a table of bricks
pub trait BrickedDataset {
    fn bricks(&self) -> &BrickTable;
    fn lod_count(&self) -> u64;
    fn timestep_count(&self) -> u64 {
        1
    }
    /// voxels of one LOD
    fn domain_size(&self, lod: u64, timestep: u64) -> [u64; 3];
    /// bricks per axis of one LOD
    fn brick_layout(&self, lod: u64, timestep: u64) -> [u64; 3];
    /// brick size limit, ghost included
    fn max_brick_size(&self) -> [u64; 3];
    /// single-sided ghost width per axis
    fn overlap(&self) -> [u32; 3];
    fn voxel_type(&self) -> VoxelType;
    fn component_count(&self) -> u64;
    /// Fetch the raw bytes of one brick; `out` is resized to fit
    fn get_brick(&self, key: &BrickKey, out: &mut Vec<u8>) -> Result<()>;
    /// global scalar range
    fn range(&self) -> (f64, f64);
    fn maxmin_for_key(&self, key: &BrickKey) -> Result<MinMax>;
    fn max_gradient_magnitude(&self) -> f32 {
        -1.0
    }
    /// Backing file, when there is one
    fn file_path(&self) -> Option<PathBuf> {
        None
    }
    /// Flatten one LOD back into a raw file
    fn export_lod(&self, _lod: u64, _target: &std::path::Path) -> Result<()> {
        Err(Error::Unsupported("this dataset cannot export".into()))
    }

    // --- provided queries over the brick table ---

    fn total_brick_count(&self) -> u64 {
        self.bricks().len() as u64
    }

    fn brick_metadata(&self, key: &BrickKey) -> Option<&BrickMD> {
        self.bricks().get(key)
    }

    fn brick_extents(&self, key: &BrickKey) -> Vec3 {
        self.brick_metadata(key)
            .map(|md| md.extents)
            .unwrap_or(Vec3::ZERO)
    }

    fn brick_voxel_counts(&self, key: &BrickKey) -> Option<[u32; 3]> {
        self.brick_metadata(key).map(|md| md.n_voxels)
    }

    /// The coarsest LOD holding a single brick
    fn largest_single_brick_lod(&self, timestep: u64) -> u64 {
        for lod in 0..self.lod_count() {
            let l = self.brick_layout(lod, timestep);
            if l[0] * l[1] * l[2] == 1 {
                return lod;
            }
        }
        self.lod_count() - 1
    }

    /// Axis-wise maximum voxel count over all bricks
    fn max_used_brick_size(&self) -> [u32; 3] {
        let mut max = [0u32; 3];
        for md in self.bricks().values() {
            for d in 0..3 {
                max[d] = max[d].max(md.n_voxels[d]);
            }
        }
        max
    }

    /// World-space bounds of the whole dataset, centered at the origin
    fn dataset_extents(&self) -> [Vec3; 2] {
        let lod = self.largest_single_brick_lod(0);
        let extents = self.brick_extents(&BrickKey::new(0, lod, 0));
        [-extents / 2.0, extents / 2.0]
    }
}

/// A bricked dataset whose brick indices follow the canonical layout
/// `index = x + y*Nx + z*Nx*Ny` with no holes.
pub trait LinearIndexDataset: BrickedDataset {
    fn index_from_4d(&self, xyz_lod: [u64; 4], timestep: u64) -> BrickKey {
        let lod = xyz_lod[3];
        let layout = self.brick_layout(lod, timestep);
        BrickKey::new(
            timestep,
            lod,
            xyz_lod[0] + xyz_lod[1] * layout[0] + xyz_lod[2] * layout[0] * layout[1],
        )
    }

    fn index_to_4d(&self, key: &BrickKey) -> [u64; 4] {
        let layout = self.brick_layout(key.lod, key.timestep);
        [
            key.index % layout[0],
            (key.index / layout[0]) % layout[1],
            key.index / (layout[0] * layout[1]),
            key.lod,
        ]
    }

    fn is_first_in_dimension(&self, dim: usize, key: &BrickKey) -> bool {
        self.index_to_4d(key)[dim] == 0
    }

    fn is_last_in_dimension(&self, dim: usize, key: &BrickKey) -> bool {
        let layout = self.brick_layout(key.lod, key.timestep);
        self.index_to_4d(key)[dim] == layout[dim] - 1
    }
}

impl<T: BrickedDataset + ?Sized> BrickedDataset for Box<T> {
    fn bricks(&self) -> &BrickTable {
        (**self).bricks()
    }
    fn lod_count(&self) -> u64 {
        (**self).lod_count()
    }
    fn timestep_count(&self) -> u64 {
        (**self).timestep_count()
    }
    fn domain_size(&self, lod: u64, timestep: u64) -> [u64; 3] {
        (**self).domain_size(lod, timestep)
    }
    fn brick_layout(&self, lod: u64, timestep: u64) -> [u64; 3] {
        (**self).brick_layout(lod, timestep)
    }
    fn max_brick_size(&self) -> [u64; 3] {
        (**self).max_brick_size()
    }
    fn overlap(&self) -> [u32; 3] {
        (**self).overlap()
    }
    fn voxel_type(&self) -> VoxelType {
        (**self).voxel_type()
    }
    fn component_count(&self) -> u64 {
        (**self).component_count()
    }
    fn get_brick(&self, key: &BrickKey, out: &mut Vec<u8>) -> Result<()> {
        (**self).get_brick(key, out)
    }
    fn range(&self) -> (f64, f64) {
        (**self).range()
    }
    fn maxmin_for_key(&self, key: &BrickKey) -> Result<MinMax> {
        (**self).maxmin_for_key(key)
    }
    fn max_gradient_magnitude(&self) -> f32 {
        (**self).max_gradient_magnitude()
    }
    fn file_path(&self) -> Option<PathBuf> {
        (**self).file_path()
    }
    fn export_lod(&self, lod: u64, target: &std::path::Path) -> Result<()> {
        (**self).export_lod(lod, target)
    }
}

impl<T: LinearIndexDataset + ?Sized> LinearIndexDataset for Box<T> {}
