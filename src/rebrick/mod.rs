//! Dynamic re-bricking of an existing dataset
//!
//! Presents a linear-index dataset through smaller bricks carved on the fly
//! from the stored ones. The target brick core must divide the source brick
//! core on every axis, so each target brick lies inside exactly one source
//! brick and a fetch is a cache lookup plus a strided sub-region copy.

pub mod cache;

pub use cache::BrickDataCache;

use bytemuck::{Zeroable, cast_slice_mut};
use glam::Vec3;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::container::maxmin::MinMax;
use crate::core::error::{Error, Result};
use crate::core::types::{VoxelScalar, VoxelType, cast_voxels};
use crate::dataset::{BrickKey, BrickMD, BrickTable, BrickedDataset, LinearIndexDataset};
use crate::dispatch_voxel_type;
use crate::io::RawFile;
use crate::octree::ceil_div;

/// How the rebricker answers per-brick min/max queries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinMaxMode {
    /// reuse the source brick's extrema (overestimates for smaller bricks)
    Source,
    /// scan the requested brick every time
    Dynamic,
    /// scan every brick once up front and remember the results
    Precompute,
}

pub struct Rebricker<D: LinearIndexDataset> {
    source: Arc<D>,
    /// target brick size limit, ghost included
    brick_size: [u64; 3],
    overlap: u32,
    bricks: BrickTable,
    cache: Mutex<BrickDataCache>,
    minmax: HashMap<BrickKey, MinMax>,
    mode: MinMaxMode,
}

impl<D: LinearIndexDataset> Rebricker<D> {
    /// Re-brick `source` into `target_brick_size` bricks (ghost included).
    /// Fails unless the source overlap is isotropic and each target core is
    /// an integer divisor of the source core.
    pub fn new(
        source: Arc<D>,
        target_brick_size: [u64; 3],
        cache_bytes: usize,
        mode: MinMaxMode,
    ) -> Result<Self> {
        let ov = source.overlap();
        if ov[0] != ov[1] || ov[1] != ov[2] {
            return Err(Error::ConfigInvalid(format!(
                "source overlap {ov:?} is anisotropic"
            )));
        }
        let overlap = ov[0];
        let ghost = 2 * overlap as u64;
        let src_bs = source.max_brick_size();
        for d in 0..3 {
            if target_brick_size[d] <= ghost {
                return Err(Error::ConfigInvalid(format!(
                    "target brick size {target_brick_size:?} must exceed the ghost {ghost}"
                )));
            }
            let src_core = src_bs[d] - ghost;
            let tgt_core = target_brick_size[d] - ghost;
            if src_core % tgt_core != 0 {
                return Err(Error::ConfigInvalid(format!(
                    "target core {tgt_core} does not divide source core {src_core} in dimension {d}"
                )));
            }
        }

        let mut rb = Self {
            source,
            brick_size: target_brick_size,
            overlap,
            bricks: BrickTable::default(),
            cache: Mutex::new(BrickDataCache::new(cache_bytes)),
            minmax: HashMap::new(),
            mode,
        };
        rb.rebrick();
        if mode == MinMaxMode::Precompute {
            rb.precompute_minmax()?;
        }
        Ok(rb)
    }

    fn tgt_core(&self) -> [u64; 3] {
        let g = 2 * self.overlap as u64;
        [
            self.brick_size[0] - g,
            self.brick_size[1] - g,
            self.brick_size[2] - g,
        ]
    }

    fn ratio(&self) -> [u64; 3] {
        let g = 2 * self.overlap as u64;
        let src = self.source.max_brick_size();
        let tgt = self.tgt_core();
        [
            (src[0] - g) / tgt[0],
            (src[1] - g) / tgt[1],
            (src[2] - g) / tgt[2],
        ]
    }

    /// Build the target brick table. The LOD count never exceeds the
    /// source's (no on-the-fly super-sampling).
    fn rebrick(&mut self) {
        self.bricks.clear();
        let ghost = 2 * self.overlap as u64;
        let core = self.tgt_core();
        let extents = self.source.dataset_extents();

        for lod in 0..self.source.lod_count() {
            let voxels = self.source.domain_size(lod, 0);
            let layout = [
                ceil_div(voxels[0], core[0]),
                ceil_div(voxels[1], core[1]),
                ceil_div(voxels[2], core[2]),
            ];
            for z in 0..layout[2] {
                for y in 0..layout[1] {
                    for x in 0..layout[0] {
                        let loc = [x, y, z];
                        let index = z * layout[1] * layout[0] + y * layout[0] + x;

                        let mut n_voxels = [0u32; 3];
                        let mut center = Vec3::ZERO;
                        let mut ext = Vec3::ZERO;
                        for d in 0..3 {
                            let vlow = loc[d] * core[d];
                            let c = core[d].min(voxels[d] - vlow);
                            n_voxels[d] = (c + ghost) as u32;

                            let span = (extents[1][d] - extents[0][d]) as f64;
                            let lerp = |v: f64| {
                                (extents[0][d] as f64 + v / voxels[d] as f64 * span) as f32
                            };
                            center[d] = lerp((vlow * 2 + c) as f64 / 2.0);
                            ext[d] = lerp((vlow + c) as f64) - lerp(vlow as f64);
                        }

                        self.bricks.insert(
                            BrickKey::new(0, lod, index),
                            BrickMD {
                                center,
                                extents: ext,
                                n_voxels,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Source brick containing a target brick
    pub fn source_key(&self, key: &BrickKey) -> BrickKey {
        let t3 = self.index_to_4d(key);
        let ratio = self.ratio();
        let s3 = [t3[0] / ratio[0], t3[1] / ratio[1], t3[2] / ratio[2]];
        let layout = self.source.brick_layout(key.lod, key.timestep);
        BrickKey::new(
            key.timestep,
            key.lod,
            s3[0] + s3[1] * layout[0] + s3[2] * layout[0] * layout[1],
        )
    }

    /// Voxel offset of a target brick inside its source brick's body
    fn offset_into_source(&self, key: &BrickKey) -> [u64; 3] {
        let t3 = self.index_to_4d(key);
        let ratio = self.ratio();
        let core = self.tgt_core();
        [
            (t3[0] % ratio[0]) * core[0],
            (t3[1] % ratio[1]) * core[1],
            (t3[2] % ratio[2]) * core[2],
        ]
    }

    fn voxel_bytes(&self) -> usize {
        self.source.voxel_type().size_of() * self.source.component_count() as usize
    }

    /// Fetch a target brick into `out`, which must hold exactly the brick's
    /// uncompressed bytes.
    fn read_brick_into(&self, key: &BrickKey, out: &mut [u8]) -> Result<()> {
        let md = *self
            .bricks
            .get(key)
            .ok_or_else(|| Error::OutOfRange(format!("{key:?} is not a target brick")))?;
        let skey = self.source_key(key);
        let src_n = self
            .source
            .brick_voxel_counts(&skey)
            .ok_or_else(|| Error::OutOfRange(format!("{skey:?} is not a source brick")))?;
        let src_bs = [src_n[0] as u64, src_n[1] as u64, src_n[2] as u64];
        let tgt_bs = [
            md.n_voxels[0] as u64,
            md.n_voxels[1] as u64,
            md.n_voxels[2] as u64,
        ];
        let src_off = self.offset_into_source(key);
        let voxel = self.voxel_bytes();
        debug_assert_eq!(
            out.len(),
            (tgt_bs[0] * tgt_bs[1] * tgt_bs[2]) as usize * voxel
        );

        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(data) = cache.get(&skey) {
                copy_subregion(data, src_bs, out, tgt_bs, src_off, voxel);
                return Ok(());
            }
        }

        let mut src_data = Vec::new();
        self.source.get_brick(&skey, &mut src_data)?;
        copy_subregion(&src_data, src_bs, out, tgt_bs, src_off, voxel);
        self.cache.lock().unwrap().insert(skey, src_data);
        Ok(())
    }

    /// Typed fetch of a target brick
    pub fn get_brick_typed<T: VoxelScalar>(&self, key: &BrickKey) -> Result<Vec<T>> {
        if T::TYPE != self.source.voxel_type() {
            return Err(Error::ConfigInvalid(format!(
                "requested {:?} from a {:?} dataset",
                T::TYPE,
                self.source.voxel_type()
            )));
        }
        let md = self
            .bricks
            .get(key)
            .ok_or_else(|| Error::OutOfRange(format!("{key:?} is not a target brick")))?;
        let elems = md.n_voxels.iter().map(|&n| n as usize).product::<usize>()
            * self.source.component_count() as usize;
        let mut out = vec![T::zeroed(); elems];
        self.read_brick_into(key, cast_slice_mut(&mut out))?;
        Ok(out)
    }

    // --- min/max ---

    /// Path of the persistent min/max side cache next to the source file
    fn minmax_cache_path(&self) -> Option<PathBuf> {
        let path = self.source.file_path()?;
        let name = path.file_name()?.to_string_lossy().into_owned();
        let bs = self.brick_size;
        Some(
            path.with_file_name(format!(".{}x{}x{}-{}.cached", bs[0], bs[1], bs[2], name)),
        )
    }

    fn precompute_minmax(&mut self) -> Result<()> {
        if let Some(cache_path) = self.minmax_cache_path()
            && cache_path.exists()
            && self.load_minmax(&cache_path).is_ok()
        {
            log::debug!("reloaded brick min/max from {}", cache_path.display());
            return Ok(());
        }

        let mut keys: Vec<BrickKey> = self.bricks.keys().copied().collect();
        keys.sort();
        let vt = self.source.voxel_type();
        let mut bytes = Vec::new();
        for key in keys {
            let md = self.bricks[&key];
            let voxels = md.n_voxels.iter().map(|&n| n as usize).product::<usize>();
            bytes.resize(voxels * self.voxel_bytes(), 0);
            self.read_brick_into(&key, &mut bytes)?;
            let mm = dispatch_voxel_type!(vt, T => {
                scan_minmax::<T>(&cast_voxels::<T>(&bytes))
            });
            self.minmax.insert(key, mm);
        }
        self.cache.lock().unwrap().clear();

        if let Some(cache_path) = self.minmax_cache_path()
            && let Err(e) = self.save_minmax(&cache_path)
        {
            log::warn!("could not save min/max cache {}: {e}", cache_path.display());
        }
        Ok(())
    }

    fn load_minmax(&mut self, path: &std::path::Path) -> Result<()> {
        let mut f = RawFile::open(path)?;
        let n = f.read_u64()?;
        if n != self.bricks.len() as u64 {
            return Err(Error::format_invalid(
                path,
                format!("min/max cache has {n} records, dataset has {}", self.bricks.len()),
            ));
        }
        let mut loaded = HashMap::with_capacity(n as usize);
        for _ in 0..n {
            let key = BrickKey::new(f.read_u64()?, f.read_u64()?, f.read_u64()?);
            let min = f.read_f64()?;
            let max = f.read_f64()?;
            if !self.bricks.contains_key(&key) {
                return Err(Error::format_invalid(
                    path,
                    format!("min/max cache names unknown brick {key:?}"),
                ));
            }
            loaded.insert(key, MinMax::new(min, max, f64::MAX, -(f32::MAX as f64)));
        }
        self.minmax = loaded;
        Ok(())
    }

    fn save_minmax(&self, path: &std::path::Path) -> Result<()> {
        let mut f = RawFile::create(path)?;
        f.write_u64(self.minmax.len() as u64)?;
        let mut keys: Vec<&BrickKey> = self.minmax.keys().collect();
        keys.sort();
        for key in keys {
            let mm = &self.minmax[key];
            f.write_u64(key.timestep)?;
            f.write_u64(key.lod)?;
            f.write_u64(key.index)?;
            f.write_f64(mm.min_scalar)?;
            f.write_f64(mm.max_scalar)?;
        }
        Ok(())
    }

    // --- cache management ---

    pub fn cache_bytes(&self) -> usize {
        self.cache.lock().unwrap().budget()
    }

    pub fn set_cache_bytes(&self, bytes: usize) {
        self.cache.lock().unwrap().set_budget(bytes);
    }

    pub fn cached_brick_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn cached_source_keys(&self) -> Vec<BrickKey> {
        let cache = self.cache.lock().unwrap();
        self.bricks
            .keys()
            .map(|k| self.source_key(k))
            .filter(|k| cache.contains(k))
            .collect()
    }

    /// Drop all cached source bricks
    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub fn source(&self) -> &Arc<D> {
        &self.source
    }
}

impl<D: LinearIndexDataset> BrickedDataset for Rebricker<D> {
    fn bricks(&self) -> &BrickTable {
        &self.bricks
    }

    fn lod_count(&self) -> u64 {
        self.source.lod_count()
    }

    fn domain_size(&self, lod: u64, timestep: u64) -> [u64; 3] {
        self.source.domain_size(lod, timestep)
    }

    fn brick_layout(&self, lod: u64, timestep: u64) -> [u64; 3] {
        let core = self.tgt_core();
        let voxels = self.source.domain_size(lod, timestep);
        [
            ceil_div(voxels[0], core[0]),
            ceil_div(voxels[1], core[1]),
            ceil_div(voxels[2], core[2]),
        ]
    }

    fn max_brick_size(&self) -> [u64; 3] {
        self.brick_size
    }

    fn overlap(&self) -> [u32; 3] {
        [self.overlap; 3]
    }

    fn voxel_type(&self) -> VoxelType {
        self.source.voxel_type()
    }

    fn component_count(&self) -> u64 {
        self.source.component_count()
    }

    fn get_brick(&self, key: &BrickKey, out: &mut Vec<u8>) -> Result<()> {
        let md = self
            .bricks
            .get(key)
            .ok_or_else(|| Error::OutOfRange(format!("{key:?} is not a target brick")))?;
        let bytes = md.n_voxels.iter().map(|&n| n as usize).product::<usize>()
            * self.voxel_bytes();
        out.resize(bytes, 0);
        self.read_brick_into(key, out)
    }

    fn range(&self) -> (f64, f64) {
        self.source.range()
    }

    fn maxmin_for_key(&self, key: &BrickKey) -> Result<MinMax> {
        match self.mode {
            MinMaxMode::Source => self.source.maxmin_for_key(&self.source_key(key)),
            MinMaxMode::Dynamic => {
                let md = self
                    .bricks
                    .get(key)
                    .ok_or_else(|| Error::OutOfRange(format!("{key:?} is not a target brick")))?;
                let voxels = md.n_voxels.iter().map(|&n| n as usize).product::<usize>();
                let mut bytes = vec![0u8; voxels * self.voxel_bytes()];
                self.read_brick_into(key, &mut bytes)?;
                Ok(dispatch_voxel_type!(self.source.voxel_type(), T => {
                    scan_minmax::<T>(&cast_voxels::<T>(&bytes))
                }))
            }
            MinMaxMode::Precompute => self
                .minmax
                .get(key)
                .copied()
                .ok_or_else(|| Error::OutOfRange(format!("{key:?} has no precomputed min/max"))),
        }
    }

    fn max_gradient_magnitude(&self) -> f32 {
        self.source.max_gradient_magnitude()
    }

    fn file_path(&self) -> Option<PathBuf> {
        self.source.file_path()
    }

    fn export_lod(&self, lod: u64, target: &std::path::Path) -> Result<()> {
        self.source.export_lod(lod, target)
    }
}

impl<D: LinearIndexDataset> LinearIndexDataset for Rebricker<D> {}

/// Copy a `tgt_bs` box out of a source brick, rows strided by the
/// respective brick widths
fn copy_subregion(
    src: &[u8],
    src_bs: [u64; 3],
    dst: &mut [u8],
    tgt_bs: [u64; 3],
    src_off: [u64; 3],
    voxel: usize,
) {
    let line = tgt_bs[0] as usize * voxel;
    for z in 0..tgt_bs[2] {
        for y in 0..tgt_bs[1] {
            let s = (((src_off[2] + z) * src_bs[1] + (src_off[1] + y)) * src_bs[0] + src_off[0])
                as usize
                * voxel;
            let d = ((z * tgt_bs[1] + y) * tgt_bs[0]) as usize * voxel;
            dst[d..d + line].copy_from_slice(&src[s..s + line]);
        }
    }
}

fn scan_minmax<T: VoxelScalar>(data: &[T]) -> MinMax {
    let mut mm = MinMax::default();
    for &v in data {
        let v = v.to_f64();
        mm.min_scalar = mm.min_scalar.min(v);
        mm.max_scalar = mm.max_scalar.max(v);
    }
    mm
}
