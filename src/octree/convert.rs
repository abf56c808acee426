//! Raw-to-octree conversion
//!
//! The converter permutes a flat voxel stream into LOD-0 bricks, fills the
//! ghost borders between neighbors, builds the coarser levels by 2x2x2
//! filtering, and optionally compresses brick bodies followed by a
//! hole-compaction pass. All brick traffic goes through a write-back LRU
//! cache sized from the caller's memory budget.

use bytemuck::{Zeroable, cast_slice, cast_slice_mut};
use glam::DVec3;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::cache::{UNUSED, WriteCache};
use super::stats::compute_brick_stats;
use super::toc::{CompressionTag, LayoutOrder, TocEntry};
use super::{BrickCoords, OCTREE_VERSION, Octree, atlas};
use crate::container::maxmin::BrickStatVec;
use crate::core::error::{Error, Result};
use crate::core::types::{VoxelScalar, VoxelType};
use crate::dispatch_voxel_type;
use crate::io::RawFile;
use crate::math::morton::morton_encode;

/// Filter used to collapse 2x2x2 fine voxels into one coarse voxel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DownsampleFilter {
    #[default]
    Average,
    /// per-component lower median
    Median,
}

#[derive(Clone, Debug)]
pub struct ConvertConfig {
    /// maximum brick size including the ghost border
    pub max_brick_size: [u64; 3],
    /// single-sided ghost width, equal on all axes
    pub overlap: u32,
    /// memory budget for the write-back brick cache, in bytes
    pub mem_limit: usize,
    pub compression: CompressionTag,
    pub filter: DownsampleFilter,
    /// duplicate edge voxels into the domain-boundary ghost instead of zeros
    pub clamp_to_edge: bool,
    pub layout: LayoutOrder,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            max_brick_size: [128, 128, 128],
            overlap: 2,
            mem_limit: 256 << 20,
            compression: CompressionTag::None,
            filter: DownsampleFilter::Average,
            clamp_to_edge: false,
            layout: LayoutOrder::Scanline,
        }
    }
}

impl ConvertConfig {
    fn validate(&self) -> Result<()> {
        let o = 2 * self.overlap as u64;
        for d in 0..3 {
            if self.max_brick_size[d] <= o {
                return Err(Error::ConfigInvalid(format!(
                    "brick size {:?} must exceed twice the overlap {}",
                    self.max_brick_size, self.overlap
                )));
            }
        }
        if self.compression == CompressionTag::Jpeg {
            return Err(Error::Unsupported(
                "jpeg brick compression is a reserved tag".into(),
            ));
        }
        match self.layout {
            LayoutOrder::Scanline => {}
            LayoutOrder::Morton => {
                if self.compression != CompressionTag::None {
                    return Err(Error::ConfigInvalid(
                        "the compaction pass requires scanline layout".into(),
                    ));
                }
            }
            LayoutOrder::Hilbert | LayoutOrder::Random => {
                return Err(Error::ConfigInvalid(format!(
                    "{:?} layout is recognized but not writable",
                    self.layout
                )));
            }
        }
        Ok(())
    }
}

pub struct Converter {
    cfg: ConvertConfig,
    cache: WriteCache,
    progress: AtomicU32,
    bricks_done: u64,
    bricks_total: u64,
    stats: Option<BrickStatVec>,
}

impl Converter {
    pub fn new(cfg: ConvertConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            cache: WriteCache::new(0, 1, 0),
            progress: AtomicU32::new(0),
            bricks_done: 0,
            bricks_total: 0,
            stats: None,
        })
    }

    /// Conversion progress in [0, 1], safe to poll from another thread
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Relaxed))
    }

    fn set_progress(&self, v: f32) {
        self.progress.store(v.to_bits(), Ordering::Relaxed);
    }

    fn brick_finished(&mut self) {
        self.bricks_done += 1;
        let p = self.bricks_done as f32 / self.bricks_total.max(1) as f32;
        self.set_progress(p.min(0.99));
    }

    /// Convenience wrapper over [`Converter::convert`] taking file paths
    #[allow(clippy::too_many_arguments)]
    pub fn convert_paths(
        &mut self,
        input: impl AsRef<Path>,
        input_offset: u64,
        voxel_type: VoxelType,
        component_count: u64,
        volume_size: [u64; 3],
        aspect: DVec3,
        output: impl AsRef<Path>,
        output_offset: u64,
        collect_stats: bool,
    ) -> Result<(Octree, Option<BrickStatVec>)> {
        let mut input = RawFile::open(input)?;
        let output = Arc::new(Mutex::new(RawFile::create(output)?));
        self.convert(
            &mut input,
            input_offset,
            voxel_type,
            component_count,
            volume_size,
            aspect,
            output,
            output_offset,
            collect_stats,
        )
    }

    /// Convert a flat raw voxel stream into a bricked multi-resolution
    /// octree written at `output_offset` in `output`.
    #[allow(clippy::too_many_arguments)]
    pub fn convert(
        &mut self,
        input: &mut RawFile,
        input_offset: u64,
        voxel_type: VoxelType,
        component_count: u64,
        volume_size: [u64; 3],
        aspect: DVec3,
        output: Arc<Mutex<RawFile>>,
        output_offset: u64,
        collect_stats: bool,
    ) -> Result<(Octree, Option<BrickStatVec>)> {
        if component_count == 0 || volume_size.contains(&0) {
            return Err(Error::ConfigInvalid(format!(
                "cannot brick a {volume_size:?} volume with {component_count} components"
            )));
        }
        self.set_progress(0.0);
        self.stats = collect_stats.then(Vec::new);

        let mut tree = Octree {
            voxel_type,
            component_count,
            precomputed_normals: false,
            volume_size,
            aspect,
            max_brick_size: self.cfg.max_brick_size,
            overlap: self.cfg.overlap,
            version: OCTREE_VERSION,
            size: 0,
            offset: output_offset,
            file: output,
            toc: Vec::new(),
            lods: Vec::new(),
        };
        tree.compute_metadata();

        self.bricks_done = 0;
        self.bricks_total = tree.computed_brick_total();
        self.cache = WriteCache::new(
            self.cfg.mem_limit,
            tree.max_brick_bytes() as usize,
            self.bricks_total as usize,
        );

        // LOD 0: permute the input into bricks
        let start = tree.final_header_size();
        self.allocate_lod_toc(&mut tree, 0, start)?;
        self.permute_input(&mut tree, input, input_offset)?;
        self.fill_overlap(&mut tree, 0)?;
        self.flush(&mut tree)?;
        let next_offset = self.compress_and_compact(&mut tree, 0)?;

        // coarser levels
        dispatch_voxel_type!(voxel_type, T => {
            self.compute_hierarchy::<T>(&mut tree, next_offset)
        })?;

        // finalize: commit stragglers, write the header, drop the tail
        self.flush(&mut tree)?;
        tree.write_header()?;
        let end = tree
            .toc
            .iter()
            .map(|e| e.offset + e.length)
            .max()
            .expect("a converted tree has bricks");
        tree.file.lock().unwrap().truncate(output_offset + end)?;
        tree.size = end;

        self.set_progress(1.0);
        Ok((tree, self.stats.take()))
    }

    /// Push ToC entries for every brick of `lod` (canonical index order) and
    /// assign their disk offsets in layout order. Returns the end offset.
    fn allocate_lod_toc(&self, tree: &mut Octree, lod: u64, start_offset: u64) -> Result<u64> {
        debug_assert_eq!(tree.toc.len() as u64, tree.lods[lod as usize].offset);
        let count = tree.brick_count(lod);
        let voxel = tree.voxel_size() as u64;

        for z in 0..count[2] {
            for y in 0..count[1] {
                for x in 0..count[0] {
                    let s = tree.compute_brick_size([x, y, z, lod]);
                    let bytes = s[0] * s[1] * s[2] * voxel;
                    tree.toc.push(TocEntry {
                        offset: 0,
                        length: bytes,
                        compression: CompressionTag::None,
                        valid_length: bytes,
                        atlas_size: [0, 0],
                    });
                }
            }
        }

        let mut order: Vec<[u64; 3]> = Vec::with_capacity((count[0] * count[1] * count[2]) as usize);
        for z in 0..count[2] {
            for y in 0..count[1] {
                for x in 0..count[0] {
                    order.push([x, y, z]);
                }
            }
        }
        if self.cfg.layout == LayoutOrder::Morton {
            order.sort_by_key(|&c| morton_encode(c));
        }

        let mut cur = start_offset;
        for c in order {
            let index = tree.brick_coords_to_index([c[0], c[1], c[2], lod]) as usize;
            tree.toc[index].offset = cur;
            cur += tree.toc[index].length;
        }
        Ok(cur)
    }

    /// Reorder the flat input into LOD-0 bricks
    fn permute_input(&mut self, tree: &mut Octree, input: &mut RawFile, input_offset: u64) -> Result<()> {
        let count = tree.brick_count(0);
        let mut data = Vec::new();
        for z in 0..count[2] {
            for y in 0..count[1] {
                for x in 0..count[0] {
                    let coords = [x, y, z, 0];
                    self.get_input_brick(tree, input, input_offset, coords, &mut data)?;
                    let index = tree.brick_coords_to_index(coords);
                    self.set_brick(tree, &data, index)?;
                    self.brick_finished();
                }
            }
        }
        Ok(())
    }

    /// Extract one LOD-0 brick (ghost included) from the flat input.
    /// Out-of-domain ghost voxels stay zero, or duplicate the nearest edge
    /// voxel in clamp-to-edge mode.
    fn get_input_brick(
        &self,
        tree: &Octree,
        input: &mut RawFile,
        input_offset: u64,
        coords: BrickCoords,
        data: &mut Vec<u8>,
    ) -> Result<()> {
        let bsize = tree.compute_brick_size(coords);
        let voxel = tree.voxel_size() as u64;
        let bytes = (bsize[0] * bsize[1] * bsize[2] * voxel) as usize;
        data.clear();
        data.resize(bytes, 0);

        let o = tree.overlap as i64;
        let eff = tree.effective_brick_size();
        let vs = tree.volume_size;

        // intersect the brick's global voxel range with the domain
        let mut in_lo = [0u64; 3];
        let mut in_len = [0u64; 3];
        let mut local0 = [0u64; 3];
        for d in 0..3 {
            let start = coords[d] as i64 * eff[d] as i64 - o;
            let lo = start.max(0) as u64;
            let hi = ((start + bsize[d] as i64) as u64).min(vs[d]);
            in_lo[d] = lo;
            in_len[d] = hi.saturating_sub(lo);
            local0[d] = (lo as i64 - start) as u64;
        }

        if in_len.iter().all(|&l| l > 0) {
            let line = (in_len[0] * voxel) as usize;
            for z in 0..in_len[2] {
                for y in 0..in_len[1] {
                    let src = input_offset
                        + voxel
                            * (in_lo[0]
                                + (in_lo[1] + y) * vs[0]
                                + (in_lo[2] + z) * vs[0] * vs[1]);
                    let dst = (voxel
                        * (local0[0]
                            + (local0[1] + y) * bsize[0]
                            + (local0[2] + z) * bsize[0] * bsize[1]))
                        as usize;
                    input.seek_to(src)?;
                    input.fill(&mut data[dst..dst + line])?;
                }
            }
        }

        if self.cfg.clamp_to_edge {
            clamp_to_edge(data, bsize, voxel as usize, local0, in_len);
        }
        Ok(())
    }

    // --- cached brick access ---

    /// Load a brick through the cache into `data` (exact uncompressed size)
    fn get_brick(&mut self, tree: &Octree, data: &mut [u8], index: u64) -> Result<()> {
        if self.cache.is_empty() {
            return tree.get_brick_data_by_index(data, index);
        }
        if let Some(slot) = self.cache.find(index) {
            data.copy_from_slice(&self.cache.slots[slot].data[..data.len()]);
            self.cache.slots[slot].access = self.cache.next_access();
            return Ok(());
        }

        tree.get_brick_data_by_index(data, index)?;

        let victim = self.cache.victim();
        self.flush_slot(tree, victim)?;
        let access = self.cache.next_access();
        let slot = &mut self.cache.slots[victim];
        slot.index = index;
        slot.dirty = false;
        slot.access = access;
        slot.data[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Store a brick through the cache from `data` (exact uncompressed size)
    fn set_brick(&mut self, tree: &mut Octree, data: &[u8], index: u64) -> Result<()> {
        if self.cache.is_empty() {
            return write_brick_to_disk(tree, &mut self.stats, data, index);
        }
        debug_assert!(data.len() <= tree.max_brick_bytes() as usize);
        let slot = match self.cache.find(index) {
            Some(slot) => slot,
            None => {
                let victim = self.cache.victim();
                self.flush_slot(tree, victim)?;
                victim
            }
        };
        let access = self.cache.next_access();
        let s = &mut self.cache.slots[slot];
        s.index = index;
        s.dirty = true;
        s.access = access;
        s.data[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Commit one slot to disk if it holds unwritten data
    fn flush_slot(&mut self, tree: &Octree, slot: usize) -> Result<()> {
        let s = &self.cache.slots[slot];
        if s.dirty && s.index != UNUSED {
            let coords = tree.index_to_brick_coords(s.index);
            let bytes = tree.brick_bytes(coords) as usize;
            let index = s.index;
            let data = &self.cache.slots[slot].data[..bytes];
            write_brick_to_disk(tree, &mut self.stats, data, index)?;
            self.cache.slots[slot].dirty = false;
        }
        Ok(())
    }

    /// Write every dirty cache entry to disk
    fn flush(&mut self, tree: &mut Octree) -> Result<()> {
        for slot in self.cache.dirty_slots() {
            self.flush_slot(tree, slot)?;
        }
        Ok(())
    }

    // --- ghost filling ---

    /// Fill the ghost border of every brick of a completed level from its
    /// neighbors. Scanning in x,y,z order means bricks behind the sweep are
    /// already complete, so only 10 of the 26 neighbors need copying: the 6
    /// faces, the +x+y in-plane diagonal, and the three forward-plane
    /// diagonals.
    fn fill_overlap(&mut self, tree: &mut Octree, lod: u64) -> Result<()> {
        if tree.overlap == 0 {
            return Ok(());
        }
        let count = tree.brick_count(lod);
        let o = tree.overlap as u64;
        let voxel = tree.voxel_size();
        let max_bytes = tree.max_brick_bytes() as usize;
        let mut target = vec![0u8; max_bytes];
        let mut source = vec![0u8; max_bytes];

        // (delta, case) table; the case selects offsets below
        const NEIGHBORS: [[i64; 3]; 10] = [
            [1, 0, 0],
            [0, 1, 0],
            [0, 0, 1],
            [-1, 0, 0],
            [0, -1, 0],
            [0, 0, -1],
            [1, 1, 0],
            [1, 0, 1],
            [0, 1, 1],
            [1, 1, 1],
        ];

        for z in 0..count[2] {
            for y in 0..count[1] {
                for x in 0..count[0] {
                    let coords = [x, y, z, lod];
                    let tsz = tree.compute_brick_size(coords);
                    let tbytes = (tsz[0] * tsz[1] * tsz[2]) as usize * voxel;
                    let index = tree.brick_coords_to_index(coords);
                    self.get_brick(tree, &mut target[..tbytes], index)?;

                    for (case, delta) in NEIGHBORS.iter().enumerate() {
                        let nx = x as i64 + delta[0];
                        let ny = y as i64 + delta[1];
                        let nz = z as i64 + delta[2];
                        if nx < 0
                            || ny < 0
                            || nz < 0
                            || nx >= count[0] as i64
                            || ny >= count[1] as i64
                            || nz >= count[2] as i64
                        {
                            continue;
                        }
                        let scoords = [nx as u64, ny as u64, nz as u64, lod];
                        let ssz = tree.compute_brick_size(scoords);
                        let sbytes = (ssz[0] * ssz[1] * ssz[2]) as usize * voxel;
                        let sindex = tree.brick_coords_to_index(scoords);
                        self.get_brick(tree, &mut source[..sbytes], sindex)?;

                        let (src_off, dst_off, region) = neighbor_copy_params(case, o, tsz, ssz);
                        copy_brick_to_brick(
                            &source[..sbytes],
                            ssz,
                            &mut target[..tbytes],
                            tsz,
                            src_off,
                            dst_off,
                            region,
                            voxel,
                        );
                    }

                    self.set_brick(tree, &target[..tbytes], index)?;
                }
            }
        }
        Ok(())
    }

    // --- hierarchy ---

    fn compute_hierarchy<T: VoxelScalar>(
        &mut self,
        tree: &mut Octree,
        mut next_offset: u64,
    ) -> Result<()> {
        let max_elems = tree.max_brick_bytes() as usize / std::mem::size_of::<T>();
        let mut target: Vec<T> = vec![T::zeroed(); max_elems];
        let mut source: Vec<T> = vec![T::zeroed(); max_elems];

        for lod in 1..tree.lod_count() {
            next_offset = self.allocate_lod_toc(tree, lod, next_offset)?;
            let count = tree.brick_count(lod);
            for z in 0..count[2] {
                for y in 0..count[1] {
                    for x in 0..count[0] {
                        let coords = [x, y, z, lod];
                        let elems =
                            self.downsample_brick::<T>(tree, coords, &mut target, &mut source)?;
                        let index = tree.brick_coords_to_index(coords);
                        self.set_brick(tree, cast_slice(&target[..elems]), index)?;
                        self.brick_finished();
                    }
                }
            }
            self.fill_overlap(tree, lod)?;
            self.flush(tree)?;
            next_offset = self.compress_and_compact(tree, lod)?;
        }
        Ok(())
    }

    /// Produce one coarse brick by filtering the up-to-eight child bricks of
    /// the finer level. Returns the element count of the target brick.
    fn downsample_brick<T: VoxelScalar>(
        &mut self,
        tree: &Octree,
        coords: BrickCoords,
        target: &mut [T],
        source: &mut [T],
    ) -> Result<usize> {
        let comp = tree.component_count as usize;
        let tsz = tree.compute_brick_size(coords);
        let telems = (tsz[0] * tsz[1] * tsz[2]) as usize * comp;
        target[..telems].fill(T::zeroed());

        let finer = coords[3] - 1;
        let fcount = tree.brick_count(finer);

        for dz in 0..2u64 {
            for dy in 0..2u64 {
                for dx in 0..2u64 {
                    let cx = 2 * coords[0] + dx;
                    let cy = 2 * coords[1] + dy;
                    let cz = 2 * coords[2] + dz;
                    if cx >= fcount[0] || cy >= fcount[1] || cz >= fcount[2] {
                        continue;
                    }
                    let scoords = [cx, cy, cz, finer];
                    let ssz = tree.compute_brick_size(scoords);
                    let selems = (ssz[0] * ssz[1] * ssz[2]) as usize * comp;
                    let sindex = tree.brick_coords_to_index(scoords);
                    self.get_brick(tree, cast_slice_mut(&mut source[..selems]), sindex)?;

                    downsample_child::<T>(
                        &source[..selems],
                        ssz,
                        [dx, dy, dz],
                        &mut target[..telems],
                        tsz,
                        tree.effective_brick_size(),
                        tree.overlap as u64,
                        comp,
                        self.cfg.filter,
                    );
                }
            }
        }

        if self.cfg.clamp_to_edge {
            let o = tree.overlap as u64;
            let core = [tsz[0] - 2 * o, tsz[1] - 2 * o, tsz[2] - 2 * o];
            clamp_to_edge(
                cast_slice_mut(&mut target[..telems]),
                tsz,
                tree.voxel_size(),
                [o, o, o],
                core,
            );
        }
        Ok(telems)
    }

    // --- compression ---

    /// Two sub-passes over a finished level: (a) compress each brick in
    /// place, keeping the result only when strictly smaller; (b) slide brick
    /// bodies forward so the file is hole-free. No-ops when compression is
    /// disabled. The cache must be flushed before calling this.
    fn compress_and_compact(&mut self, tree: &mut Octree, lod: u64) -> Result<u64> {
        let first = tree.lods[lod as usize].offset;
        let count = tree.lods[lod as usize].brick_total();
        let range = first..first + count;

        if self.cfg.compression == CompressionTag::None {
            let end = range
                .map(|i| {
                    let e = &tree.toc[i as usize];
                    e.offset + e.length
                })
                .max()
                .unwrap_or(0);
            return Ok(end);
        }

        let mut raw = vec![0u8; tree.max_brick_bytes() as usize];
        for i in range.clone() {
            if tree.toc[i as usize].compression == self.cfg.compression {
                continue;
            }
            let coords = tree.index_to_brick_coords(i);
            let bytes = tree.brick_bytes(coords) as usize;
            tree.get_brick_data_by_index(&mut raw[..bytes], i)?;

            let compressed = zlib_compress(&raw[..bytes])?;
            if (compressed.len() as u64) < tree.toc[i as usize].length {
                {
                    let mut f = tree.file.lock().unwrap();
                    f.seek_to(tree.offset + tree.toc[i as usize].offset)?;
                    f.write_all(&compressed)?;
                }
                let e = &mut tree.toc[i as usize];
                e.length = compressed.len() as u64;
                e.valid_length = e.length;
                e.compression = self.cfg.compression;
            }
        }

        // compact: shift every brick onto the end of its predecessor
        let mut body = Vec::new();
        for i in range {
            let dense = if i == 0 {
                tree.final_header_size()
            } else {
                let prev = &tree.toc[i as usize - 1];
                prev.offset + prev.length
            };
            let e = tree.toc[i as usize];
            if dense < e.offset {
                body.resize(e.length as usize, 0);
                let mut f = tree.file.lock().unwrap();
                f.seek_to(tree.offset + e.offset)?;
                f.fill(&mut body)?;
                f.seek_to(tree.offset + dense)?;
                f.write_all(&body)?;
                tree.toc[i as usize].offset = dense;
            }
        }

        let last = &tree.toc[(first + count - 1) as usize];
        Ok(last.offset + last.length)
    }

    // --- static exports ---

    /// Flatten one LOD back into a raw file; LOD 0 recovers the original
    /// voxel stream byte for byte.
    pub fn export_to_raw(
        tree: &Octree,
        out: &mut RawFile,
        lod: u64,
        out_offset: u64,
    ) -> Result<()> {
        if lod >= tree.lod_count() {
            return Err(Error::OutOfRange(format!(
                "lod {lod} of {}",
                tree.lod_count()
            )));
        }
        let voxel = tree.voxel_size() as u64;
        let o = tree.overlap as u64;
        let eff = tree.effective_brick_size();
        let out_size = tree.lod_size(lod);
        let count = tree.brick_count(lod);
        let mut data = vec![0u8; tree.max_brick_bytes() as usize];

        for z in 0..count[2] {
            for y in 0..count[1] {
                for x in 0..count[0] {
                    let coords = [x, y, z, lod];
                    let bsize = tree.compute_brick_size(coords);
                    let bytes = (bsize[0] * bsize[1] * bsize[2] * voxel) as usize;
                    tree.get_brick_data(&mut data[..bytes], coords)?;

                    let line = ((bsize[0] - 2 * o) * voxel) as usize;
                    for bz in 0..bsize[2] - 2 * o {
                        for by in 0..bsize[1] - 2 * o {
                            let dst = out_offset
                                + voxel
                                    * (x * eff[0]
                                        + (by + y * eff[1]) * out_size[0]
                                        + (bz + z * eff[2]) * out_size[0] * out_size[1]);
                            let src = (voxel
                                * (o + (by + o) * bsize[0] + (bz + o) * bsize[0] * bsize[1]))
                                as usize;
                            out.seek_to(dst)?;
                            out.write_all(&data[src..src + line])?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn export_to_raw_path(
        tree: &Octree,
        path: impl AsRef<Path>,
        lod: u64,
        out_offset: u64,
    ) -> Result<()> {
        if lod >= tree.lod_count() {
            return Err(Error::OutOfRange(format!(
                "lod {lod} of {}",
                tree.lod_count()
            )));
        }
        let out_size = tree.lod_size(lod);
        let bytes = out_size[0] * out_size[1] * out_size[2] * tree.voxel_size() as u64;
        let mut out = RawFile::create_with_size(path, out_offset + bytes)?;
        Self::export_to_raw(tree, &mut out, lod, out_offset)
    }

    /// Walk every brick of a level and hand `(data, size, domain_offset)` of
    /// its core (plus `extra_overlap` ghost voxels per side, capped at the
    /// stored overlap) to the callback. Returns false when the callback
    /// aborted the walk.
    pub fn apply_function(
        tree: &Octree,
        lod: u64,
        extra_overlap: u32,
        brick_fn: &mut dyn FnMut(&[u8], [u64; 3], [u64; 3]) -> bool,
    ) -> Result<bool> {
        if lod >= tree.lod_count() {
            return Err(Error::OutOfRange(format!(
                "lod {lod} of {}",
                tree.lod_count()
            )));
        }
        let o = tree.overlap as u64;
        let ro = (extra_overlap as u64).min(o);
        let skip = o - ro;
        let voxel = tree.voxel_size();
        let eff = tree.effective_brick_size();
        let count = tree.brick_count(lod);
        let mut data = vec![0u8; tree.max_brick_bytes() as usize];
        let mut region = Vec::new();

        for z in 0..count[2] {
            for y in 0..count[1] {
                for x in 0..count[0] {
                    let coords = [x, y, z, lod];
                    let bsize = tree.compute_brick_size(coords);
                    let bytes = (bsize[0] * bsize[1] * bsize[2]) as usize * voxel;
                    tree.get_brick_data(&mut data[..bytes], coords)?;

                    let rsize = [
                        bsize[0] - 2 * skip,
                        bsize[1] - 2 * skip,
                        bsize[2] - 2 * skip,
                    ];
                    region.clear();
                    region.resize((rsize[0] * rsize[1] * rsize[2]) as usize * voxel, 0);
                    copy_brick_to_brick(
                        &data[..bytes],
                        bsize,
                        &mut region,
                        rsize,
                        [skip, skip, skip],
                        [0, 0, 0],
                        rsize,
                        voxel,
                    );

                    let domain_offset = [
                        (x * eff[0]).saturating_sub(ro),
                        (y * eff[1]).saturating_sub(ro),
                        (z * eff[2]).saturating_sub(ro),
                    ];
                    if !brick_fn(&region, rsize, domain_offset) {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Post-pass: rewrite an uncompressed octree with every brick packed
    /// into 2D-atlas form, at `target_offset` in a new file.
    pub fn atlasify_tree(
        tree: &Octree,
        atlas_size: [u32; 2],
        target: impl AsRef<Path>,
        target_offset: u64,
    ) -> Result<Octree> {
        if tree.toc.iter().any(|e| e.compression != CompressionTag::None) {
            return Err(Error::Unsupported(
                "atlas packing only applies to uncompressed bricks".into(),
            ));
        }
        if !atlas::atlas_fits(tree.max_brick_size, atlas_size) {
            return Err(Error::ConfigInvalid(format!(
                "atlas {atlas_size:?} cannot hold a {:?} brick",
                tree.max_brick_size
            )));
        }

        let voxel = tree.voxel_size();
        let body_bytes = atlas::atlas_bytes(atlas_size, voxel) as u64;
        let file = Arc::new(Mutex::new(RawFile::create(target)?));

        let mut packed = Octree {
            voxel_type: tree.voxel_type,
            component_count: tree.component_count,
            precomputed_normals: tree.precomputed_normals,
            volume_size: tree.volume_size,
            aspect: tree.aspect,
            max_brick_size: tree.max_brick_size,
            overlap: tree.overlap,
            version: tree.version,
            size: 0,
            offset: target_offset,
            file,
            toc: Vec::new(),
            lods: tree.lods.clone(),
        };

        let header = packed.final_header_size();
        for i in 0..tree.brick_total() {
            packed.toc.push(TocEntry {
                offset: header + i * body_bytes,
                length: body_bytes,
                compression: CompressionTag::None,
                valid_length: body_bytes,
                atlas_size,
            });
        }

        let mut raw = vec![0u8; tree.max_brick_bytes() as usize];
        let mut body = vec![0u8; body_bytes as usize];
        for i in 0..tree.brick_total() {
            let coords = tree.index_to_brick_coords(i);
            let bsize = tree.compute_brick_size(coords);
            let bytes = tree.brick_bytes(coords) as usize;
            tree.get_brick_data_by_index(&mut raw[..bytes], i)?;
            atlas::atlasify(&raw[..bytes], bsize, voxel, atlas_size, &mut body)?;

            let entry = packed.toc[i as usize];
            let mut f = packed.file.lock().unwrap();
            f.seek_to(target_offset + entry.offset)?;
            f.write_all(&body)?;
        }

        packed.write_header()?;
        packed.size = header + tree.brick_total() * body_bytes;
        Ok(packed)
    }

    /// Inverse of [`Converter::atlasify_tree`]: rewrite an atlased octree
    /// with plain 3D brick bodies.
    pub fn deatlasify_tree(
        tree: &Octree,
        target: impl AsRef<Path>,
        target_offset: u64,
    ) -> Result<Octree> {
        let voxel = tree.voxel_size() as u64;
        let file = Arc::new(Mutex::new(RawFile::create(target)?));

        let mut plain = Octree {
            voxel_type: tree.voxel_type,
            component_count: tree.component_count,
            precomputed_normals: tree.precomputed_normals,
            volume_size: tree.volume_size,
            aspect: tree.aspect,
            max_brick_size: tree.max_brick_size,
            overlap: tree.overlap,
            version: tree.version,
            size: 0,
            offset: target_offset,
            file,
            toc: Vec::new(),
            lods: tree.lods.clone(),
        };

        let header = plain.final_header_size();
        let mut cur = header;
        for i in 0..tree.brick_total() {
            let coords = tree.index_to_brick_coords(i);
            let s = tree.compute_brick_size(coords);
            let bytes = s[0] * s[1] * s[2] * voxel;
            plain.toc.push(TocEntry {
                offset: cur,
                length: bytes,
                compression: CompressionTag::None,
                valid_length: bytes,
                atlas_size: [0, 0],
            });
            cur += bytes;
        }

        let mut body = vec![0u8; tree.max_brick_bytes() as usize];
        for i in 0..tree.brick_total() {
            let coords = tree.index_to_brick_coords(i);
            let bytes = tree.brick_bytes(coords) as usize;
            tree.get_brick_data_by_index(&mut body[..bytes], i)?;

            let entry = plain.toc[i as usize];
            let mut f = plain.file.lock().unwrap();
            f.seek_to(target_offset + entry.offset)?;
            f.write_all(&body[..bytes])?;
        }

        plain.write_header()?;
        plain.size = cur;
        Ok(plain)
    }
}

/// Offsets and extents for one of the ten neighbor-copy cases of
/// [`Converter::fill_overlap`]
fn neighbor_copy_params(
    case: usize,
    o: u64,
    tsz: [u64; 3],
    ssz: [u64; 3],
) -> ([u64; 3], [u64; 3], [u64; 3]) {
    match case {
        // +x
        0 => (
            [o, 0, 0],
            [tsz[0] - o, 0, 0],
            [o, ssz[1], ssz[2]],
        ),
        // +y
        1 => (
            [0, o, 0],
            [0, tsz[1] - o, 0],
            [ssz[0], o, ssz[2]],
        ),
        // +z
        2 => (
            [0, 0, o],
            [0, 0, tsz[2] - o],
            [ssz[0], ssz[1], o],
        ),
        // -x
        3 => (
            [ssz[0] - 2 * o, 0, 0],
            [0, 0, 0],
            [o, ssz[1], ssz[2]],
        ),
        // -y
        4 => (
            [0, ssz[1] - 2 * o, 0],
            [0, 0, 0],
            [ssz[0], o, ssz[2]],
        ),
        // -z
        5 => (
            [0, 0, ssz[2] - 2 * o],
            [0, 0, 0],
            [ssz[0], ssz[1], o],
        ),
        // +x+y
        6 => (
            [o, o, 0],
            [tsz[0] - o, tsz[1] - o, 0],
            [o, o, ssz[2]],
        ),
        // +x+z
        7 => (
            [o, 0, o],
            [tsz[0] - o, 0, tsz[2] - o],
            [o, ssz[1], o],
        ),
        // +y+z
        8 => (
            [0, o, o],
            [0, tsz[1] - o, tsz[2] - o],
            [ssz[0], o, o],
        ),
        // +x+y+z
        9 => (
            [o, o, o],
            [tsz[0] - o, tsz[1] - o, tsz[2] - o],
            [o, o, o],
        ),
        _ => unreachable!("neighbor case {case}"),
    }
}

/// Copy a sub-region of one brick into another
#[allow(clippy::too_many_arguments)]
fn copy_brick_to_brick(
    src: &[u8],
    ssz: [u64; 3],
    dst: &mut [u8],
    dsz: [u64; 3],
    src_off: [u64; 3],
    dst_off: [u64; 3],
    region: [u64; 3],
    voxel: usize,
) {
    for z in 0..region[2] {
        for y in 0..region[1] {
            let s = ((src_off[2] + z) * ssz[1] * ssz[0] + (src_off[1] + y) * ssz[0] + src_off[0])
                as usize
                * voxel;
            let d = ((dst_off[2] + z) * dsz[1] * dsz[0] + (dst_off[1] + y) * dsz[0] + dst_off[0])
                as usize
                * voxel;
            let n = region[0] as usize * voxel;
            dst[d..d + n].copy_from_slice(&src[s..s + n]);
        }
    }
}

/// Duplicate the outermost filled voxels into the unfilled border region.
/// `lo`/`len` describe the filled box; x columns first, then whole rows,
/// then whole planes, so corners end up correct.
fn clamp_to_edge(data: &mut [u8], bsize: [u64; 3], voxel: usize, lo: [u64; 3], len: [u64; 3]) {
    if len.iter().any(|&l| l == 0) {
        return;
    }
    let (bx, by) = (bsize[0] as usize, bsize[1] as usize);
    let bz = bsize[2] as usize;
    let (x0, y0, z0) = (lo[0] as usize, lo[1] as usize, lo[2] as usize);
    let x1 = x0 + len[0] as usize;
    let y1 = y0 + len[1] as usize;
    let z1 = z0 + len[2] as usize;

    for z in z0..z1 {
        for y in y0..y1 {
            let row = (z * by + y) * bx * voxel;
            for x in 0..x0 {
                data.copy_within(row + x0 * voxel..row + (x0 + 1) * voxel, row + x * voxel);
            }
            for x in x1..bx {
                data.copy_within(
                    row + (x1 - 1) * voxel..row + x1 * voxel,
                    row + x * voxel,
                );
            }
        }
    }
    let line = bx * voxel;
    for z in z0..z1 {
        let plane = z * by * bx * voxel;
        for y in 0..y0 {
            data.copy_within(plane + y0 * line..plane + (y0 + 1) * line, plane + y * line);
        }
        for y in y1..by {
            data.copy_within(
                plane + (y1 - 1) * line..plane + y1 * line,
                plane + y * line,
            );
        }
    }
    let plane = by * bx * voxel;
    for z in 0..z0 {
        data.copy_within(z0 * plane..(z0 + 1) * plane, z * plane);
    }
    for z in z1..bz {
        data.copy_within((z1 - 1) * plane..z1 * plane, z * plane);
    }
}

/// Collapse the 2x2x2 fine voxels behind each coarse voxel that this child
/// brick covers. Samples falling just outside the child's core land in its
/// ghost border (already filled); with no ghost they clamp to the nearest
/// voxel.
#[allow(clippy::too_many_arguments)]
fn downsample_child<T: VoxelScalar>(
    src: &[T],
    ssz: [u64; 3],
    child: [u64; 3],
    dst: &mut [T],
    tsz: [u64; 3],
    eff: [u64; 3],
    o: u64,
    comp: usize,
    filter: DownsampleFilter,
) {
    let tcore = [tsz[0] - 2 * o, tsz[1] - 2 * o, tsz[2] - 2 * o];
    let score = [ssz[0] - 2 * o, ssz[1] - 2 * o, ssz[2] - 2 * o];

    let mut start = [0u64; 3];
    let mut end = [0u64; 3];
    for d in 0..3 {
        start[d] = (child[d] * eff[d]).div_ceil(2);
        end[d] = tcore[d].min((child[d] * eff[d] + score[d] + 1) / 2);
    }

    // child-local buffer coordinate of a fine sample, clamped into the brick
    let local = |out: u64, s: u64, d: usize| -> u64 {
        let fine_rel = (2 * out + s) as i64 - (child[d] * eff[d]) as i64;
        (o as i64 + fine_rel).clamp(0, ssz[d] as i64 - 1) as u64
    };

    let mut samples = [0.0f64; 8];
    for oz in start[2]..end[2] {
        for oy in start[1]..end[1] {
            for ox in start[0]..end[0] {
                let dst_base = ((o + oz) * tsz[1] * tsz[0] + (o + oy) * tsz[0] + (o + ox))
                    as usize
                    * comp;
                for c in 0..comp {
                    let mut n = 0;
                    for sz in 0..2u64 {
                        for sy in 0..2u64 {
                            for sx in 0..2u64 {
                                let lx = local(ox, sx, 0);
                                let ly = local(oy, sy, 1);
                                let lz = local(oz, sz, 2);
                                let idx =
                                    (lz * ssz[1] * ssz[0] + ly * ssz[0] + lx) as usize * comp + c;
                                samples[n] = src[idx].to_f64();
                                n += 1;
                            }
                        }
                    }
                    let value = match filter {
                        DownsampleFilter::Average => samples.iter().sum::<f64>() / 8.0,
                        DownsampleFilter::Median => {
                            let mut sorted = samples;
                            sorted.sort_by(|a, b| {
                                a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
                            });
                            sorted[3]
                        }
                    };
                    dst[dst_base + c] = T::from_f64(value);
                }
            }
        }
    }
}

fn zlib_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::write::ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2),
        flate2::Compression::default(),
    );
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Write one brick body (uncompressed) to its ToC slot, updating the
/// statistics sink when one is attached. A brick rewritten later overwrites
/// its statistics entry.
fn write_brick_to_disk(
    tree: &Octree,
    stats: &mut Option<BrickStatVec>,
    data: &[u8],
    index: u64,
) -> Result<()> {
    if let Some(stats) = stats.as_mut() {
        let cc = tree.component_count as usize;
        let coords = tree.index_to_brick_coords(index);
        let bsize = tree.compute_brick_size(coords);
        let brick_stats = compute_brick_stats(tree.voxel_type, data, bsize, cc);
        let base = index as usize * cc;
        if stats.len() < base + cc {
            stats.resize(base + cc, Default::default());
        }
        stats[base..base + cc].copy_from_slice(&brick_stats);
    }

    let entry = &tree.toc[index as usize];
    debug_assert_eq!(data.len() as u64, entry.length);
    let mut f = tree.file.lock().unwrap();
    f.seek_to(tree.offset + entry.offset)?;
    f.write_all(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_raw(path: &Path, data: &[u8]) {
        let mut f = RawFile::create(path).unwrap();
        f.write_all(data).unwrap();
    }

    fn ramp_volume(size: [u64; 3]) -> Vec<u8> {
        (0..size[0] * size[1] * size[2])
            .map(|i| (i % 256) as u8)
            .collect()
    }

    fn convert_u8(
        dir: &Path,
        data: &[u8],
        size: [u64; 3],
        cfg: ConvertConfig,
    ) -> (Octree, Option<BrickStatVec>, Converter) {
        let input = dir.join("in.raw");
        write_raw(&input, data);
        let mut conv = Converter::new(cfg).unwrap();
        let (tree, stats) = conv
            .convert_paths(
                &input,
                0,
                VoxelType::U8,
                1,
                size,
                DVec3::ONE,
                dir.join("out.oct"),
                0,
                true,
            )
            .unwrap();
        (tree, stats, conv)
    }

    #[test]
    fn test_roundtrip_no_overlap() {
        let dir = tempdir().unwrap();
        let size = [8u64, 8, 8];
        let data = ramp_volume(size);
        let cfg = ConvertConfig {
            max_brick_size: [4, 4, 4],
            overlap: 0,
            ..Default::default()
        };
        let (tree, _, conv) = convert_u8(dir.path(), &data, size, cfg);
        assert_eq!(tree.lod_count(), 2);
        assert!((conv.progress() - 1.0).abs() < f32::EPSILON);

        let back = dir.path().join("back.raw");
        Converter::export_to_raw_path(&tree, &back, 0, 0).unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), data);
    }

    #[test]
    fn test_roundtrip_with_overlap_and_clamp() {
        let dir = tempdir().unwrap();
        let size = [12u64, 10, 6];
        let data = ramp_volume(size);
        let cfg = ConvertConfig {
            max_brick_size: [8, 8, 8],
            overlap: 2,
            clamp_to_edge: true,
            ..Default::default()
        };
        let (tree, _, _) = convert_u8(dir.path(), &data, size, cfg);

        let back = dir.path().join("back.raw");
        Converter::export_to_raw_path(&tree, &back, 0, 0).unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), data);
    }

    #[test]
    fn test_overlap_mirrors_neighbor() {
        let dir = tempdir().unwrap();
        let size = [8u64, 4, 4];
        let data = ramp_volume(size);
        let cfg = ConvertConfig {
            max_brick_size: [6, 6, 6],
            overlap: 1,
            ..Default::default()
        };
        let (tree, _, _) = convert_u8(dir.path(), &data, size, cfg);
        assert_eq!(tree.brick_count(0), [2, 1, 1]);

        // brick 0 spans x in [-1, 5); its ghost column x=5 (local) must
        // equal global column x=4, which brick 1 owns
        let b0size = tree.compute_brick_size([0, 0, 0, 0]);
        let mut b0 = vec![0u8; tree.brick_bytes([0, 0, 0, 0]) as usize];
        tree.get_brick_data(&mut b0, [0, 0, 0, 0]).unwrap();

        for z in 0..4u64 {
            for y in 0..4u64 {
                // local voxel (y+1, z+1) row, ghost col = b0size.x-1
                let local =
                    ((z + 1) * b0size[1] * b0size[0] + (y + 1) * b0size[0] + b0size[0] - 1)
                        as usize;
                let global = (z * size[0] * size[1] + y * size[0] + 4) as usize;
                assert_eq!(b0[local], data[global], "ghost mismatch at y={y} z={z}");
            }
        }
    }

    #[test]
    fn test_zlib_hole_freeness_and_roundtrip() {
        let dir = tempdir().unwrap();
        let size = [16u64, 16, 16];
        // compressible payload
        let data = vec![7u8; (size[0] * size[1] * size[2]) as usize];
        let cfg = ConvertConfig {
            max_brick_size: [8, 8, 8],
            overlap: 2,
            compression: CompressionTag::Zlib,
            ..Default::default()
        };
        let (tree, _, _) = convert_u8(dir.path(), &data, size, cfg);

        for i in 1..tree.brick_total() as usize {
            assert_eq!(
                tree.toc[i].offset,
                tree.toc[i - 1].offset + tree.toc[i - 1].length,
                "hole before brick {i}"
            );
        }
        assert!(tree.toc.iter().any(|e| e.compression == CompressionTag::Zlib));

        let back = dir.path().join("back.raw");
        Converter::export_to_raw_path(&tree, &back, 0, 0).unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), data);
    }

    #[test]
    fn test_downsample_average() {
        let dir = tempdir().unwrap();
        let size = [4u64, 4, 4];
        // two nested shells: outer 8, inner 40
        let mut data = vec![8u8; 64];
        for z in 1..3 {
            for y in 1..3 {
                for x in 1..3 {
                    data[z * 16 + y * 4 + x] = 40;
                }
            }
        }
        let cfg = ConvertConfig {
            max_brick_size: [4, 4, 4],
            overlap: 0,
            ..Default::default()
        };
        let (tree, _, _) = convert_u8(dir.path(), &data, size, cfg);
        assert_eq!(tree.lod_count(), 2);

        let mut coarse = vec![0u8; tree.brick_bytes([0, 0, 0, 1]) as usize];
        tree.get_brick_data(&mut coarse, [0, 0, 0, 1]).unwrap();
        assert_eq!(coarse.len(), 8);
        // every coarse voxel averages one inner (40) and seven outer (8)
        for &v in &coarse {
            assert_eq!(v, 12);
        }
    }

    #[test]
    fn test_downsample_median_uniform() {
        let dir = tempdir().unwrap();
        let size = [4u64, 4, 4];
        let data = vec![99u8; 64];
        let cfg = ConvertConfig {
            max_brick_size: [4, 4, 4],
            overlap: 0,
            filter: DownsampleFilter::Median,
            ..Default::default()
        };
        let (tree, _, _) = convert_u8(dir.path(), &data, size, cfg);
        let mut coarse = vec![0u8; tree.brick_bytes([0, 0, 0, 1]) as usize];
        tree.get_brick_data(&mut coarse, [0, 0, 0, 1]).unwrap();
        assert!(coarse.iter().all(|&v| v == 99));
    }

    #[test]
    fn test_stats_cover_every_brick() {
        let dir = tempdir().unwrap();
        let size = [8u64, 8, 8];
        let data = ramp_volume(size);
        let cfg = ConvertConfig {
            max_brick_size: [4, 4, 4],
            overlap: 0,
            ..Default::default()
        };
        let (tree, stats, _) = convert_u8(dir.path(), &data, size, cfg);
        let stats = stats.unwrap();
        assert_eq!(stats.len() as u64, tree.brick_total());
        for s in &stats {
            assert!(s.min_scalar <= s.max_scalar);
            assert!(s.max_scalar <= 255.0);
        }
    }

    #[test]
    fn test_morton_layout_still_reads_back() {
        let dir = tempdir().unwrap();
        let size = [8u64, 8, 8];
        let data = ramp_volume(size);
        let cfg = ConvertConfig {
            max_brick_size: [2, 2, 2],
            overlap: 0,
            layout: LayoutOrder::Morton,
            ..Default::default()
        };
        let (tree, _, _) = convert_u8(dir.path(), &data, size, cfg);

        // offsets are not monotone in index order, but reads still work
        let monotone = (1..tree.brick_total() as usize)
            .all(|i| tree.toc[i].offset > tree.toc[i - 1].offset);
        assert!(!monotone);

        let back = dir.path().join("back.raw");
        Converter::export_to_raw_path(&tree, &back, 0, 0).unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), data);
    }

    #[test]
    fn test_reopen_after_convert() {
        let dir = tempdir().unwrap();
        let size = [8u64, 8, 8];
        let data = ramp_volume(size);
        let cfg = ConvertConfig {
            max_brick_size: [6, 6, 6],
            overlap: 1,
            ..Default::default()
        };
        let (tree, _, _) = convert_u8(dir.path(), &data, size, cfg);
        drop(tree);

        let tree = Octree::open_path(dir.path().join("out.oct"), 0, OCTREE_VERSION).unwrap();
        assert_eq!(tree.volume_size(), size);
        assert_eq!(tree.overlap(), 1);
        let back = dir.path().join("back.raw");
        Converter::export_to_raw_path(&tree, &back, 0, 0).unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), data);
    }

    #[test]
    fn test_set_global_aspect_persists() {
        let dir = tempdir().unwrap();
        let size = [4u64, 4, 4];
        let data = ramp_volume(size);
        let cfg = ConvertConfig {
            max_brick_size: [4, 4, 4],
            overlap: 0,
            ..Default::default()
        };
        let (tree, _, _) = convert_u8(dir.path(), &data, size, cfg);
        drop(tree);

        let mut tree = Octree::open_path(dir.path().join("out.oct"), 0, OCTREE_VERSION).unwrap();
        let aspect = DVec3::new(1.0, 1.0, 2.5);
        tree.set_global_aspect(aspect).unwrap();
        drop(tree);

        let tree = Octree::open_path(dir.path().join("out.oct"), 0, OCTREE_VERSION).unwrap();
        assert_eq!(tree.global_aspect(), aspect);
    }

    #[test]
    fn test_apply_function_visits_all_bricks() {
        let dir = tempdir().unwrap();
        let size = [8u64, 8, 8];
        let data = ramp_volume(size);
        let cfg = ConvertConfig {
            max_brick_size: [4, 4, 4],
            overlap: 0,
            ..Default::default()
        };
        let (tree, _, _) = convert_u8(dir.path(), &data, size, cfg);

        let mut seen = 0u64;
        let mut voxels = 0u64;
        let complete = Converter::apply_function(&tree, 0, 0, &mut |brick, bsize, _off| {
            seen += 1;
            voxels += bsize[0] * bsize[1] * bsize[2];
            assert_eq!(brick.len() as u64, bsize[0] * bsize[1] * bsize[2]);
            true
        })
        .unwrap();
        assert!(complete);
        assert_eq!(seen, 8);
        assert_eq!(voxels, 8 * 8 * 8);
    }

    #[test]
    fn test_atlas_pack_roundtrip() {
        let dir = tempdir().unwrap();
        let size = [8u64, 8, 8];
        let data = ramp_volume(size);
        let cfg = ConvertConfig {
            max_brick_size: [4, 4, 4],
            overlap: 0,
            ..Default::default()
        };
        let (tree, _, _) = convert_u8(dir.path(), &data, size, cfg);

        let packed =
            Converter::atlasify_tree(&tree, [8, 8], dir.path().join("atlas.oct"), 0).unwrap();
        assert!(packed.toc.iter().all(|e| e.is_atlased()));

        // reads de-atlas transparently
        let back = dir.path().join("back.raw");
        Converter::export_to_raw_path(&packed, &back, 0, 0).unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), data);

        // and the explicit inverse restores a plain tree
        let plain =
            Converter::deatlasify_tree(&packed, dir.path().join("plain.oct"), 0).unwrap();
        assert!(plain.toc.iter().all(|e| !e.is_atlased()));
        let back2 = dir.path().join("back2.raw");
        Converter::export_to_raw_path(&plain, &back2, 0, 0).unwrap();
        assert_eq!(std::fs::read(&back2).unwrap(), data);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            Converter::new(ConvertConfig {
                max_brick_size: [4, 4, 4],
                overlap: 2,
                ..Default::default()
            }),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(
            Converter::new(ConvertConfig {
                compression: CompressionTag::Jpeg,
                ..Default::default()
            }),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            Converter::new(ConvertConfig {
                layout: LayoutOrder::Hilbert,
                ..Default::default()
            }),
            Err(Error::ConfigInvalid(_))
        ));
    }
}
