//! Brick keys and per-brick metadata

use glam::Vec3;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Identity of one brick: `(timestep, lod, linear brick index)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BrickKey {
    pub timestep: u64,
    pub lod: u64,
    pub index: u64,
}

impl BrickKey {
    pub fn new(timestep: u64, lod: u64, index: u64) -> Self {
        Self {
            timestep,
            lod,
            index,
        }
    }

    /// Fibonacci-style combiner mixing all three fields into one word
    fn mix(&self) -> u64 {
        let mut seed = self.lod;
        seed ^= self
            .index
            .wrapping_add(0x9e37_79b9)
            .wrapping_add(seed << 6)
            .wrapping_add(seed >> 2);
        seed ^= self
            .timestep
            .wrapping_add(0x9e37_79b9)
            .wrapping_add(seed << 6)
            .wrapping_add(seed >> 2);
        seed
    }
}

impl Hash for BrickKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.mix());
    }
}

/// World-space placement and voxel count of a brick.
///
/// `n_voxels` includes the ghost border; `center` and `extents` describe the
/// brick's core region in world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BrickMD {
    pub center: Vec3,
    pub extents: Vec3,
    pub n_voxels: [u32; 3],
}

/// Per-dataset brick metadata table
pub type BrickTable = HashMap<BrickKey, BrickMD>;
