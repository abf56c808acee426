//! Bricked multi-resolution octree: the TOC engine
//!
//! An octree is a header (metadata + LOD table + ToC) followed by raw brick
//! bodies, all living at some base offset inside a larger file. Bricks are
//! fixed-size 3D tiles with a ghost border on every side; boundary bricks
//! have a smaller core but keep their ghost (zero- or clamp-filled at the
//! domain edge).

pub mod atlas;
pub mod cache;
pub mod convert;
pub mod stats;
pub mod toc;

pub use convert::{ConvertConfig, Converter, DownsampleFilter};
pub use toc::{CompressionTag, LayoutOrder, LodEntry, TocEntry};

use glam::DVec3;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::core::error::{Error, Result};
use crate::core::types::VoxelType;
use crate::io::RawFile;

/// Octree format version
pub const OCTREE_VERSION: u32 = 1;

/// Byte offset of the global aspect inside the octree header
const ASPECT_FIELD_OFFSET: u64 = 24 + 4 + 4 + 8 + 8 + 1 + 24;

/// Fixed part of the header before the LOD table
const FIXED_HEADER_SIZE: u64 = ASPECT_FIELD_OFFSET + 24 + 8;

/// Brick coordinates: `[x, y, z, lod]`
pub type BrickCoords = [u64; 4];

pub struct Octree {
    pub(crate) voxel_type: VoxelType,
    pub(crate) component_count: u64,
    pub(crate) precomputed_normals: bool,
    pub(crate) volume_size: [u64; 3],
    pub(crate) aspect: DVec3,
    pub(crate) max_brick_size: [u64; 3],
    pub(crate) overlap: u32,
    pub(crate) version: u32,
    /// total octree size in bytes including the header
    pub(crate) size: u64,
    /// base offset of the octree inside the file
    pub(crate) offset: u64,
    pub(crate) file: Arc<Mutex<RawFile>>,
    pub(crate) toc: Vec<TocEntry>,
    pub(crate) lods: Vec<LodEntry>,
}

pub(crate) fn ceil_div(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

impl Octree {
    /// Read an octree header from an already open file, skipping `offset`
    /// bytes. Fails on version mismatch or a truncated/inconsistent header.
    pub fn open(file: Arc<Mutex<RawFile>>, offset: u64, expected_version: u32) -> Result<Self> {
        let mut tree = {
            let mut f = file.lock().unwrap();
            let path = f.path().to_path_buf();
            let file_size = f.current_size()?;

            f.seek_to(offset)
                .map_err(|_| Error::format_invalid(&path, "octree offset beyond end of file"))?;
            let max_brick_size = f.read_u64_triple()?;
            let overlap = f.read_u32()?;
            let version = f.read_u32()?;
            if version != expected_version {
                return Err(Error::format_invalid(
                    &path,
                    format!("octree version {version}, expected {expected_version}"),
                ));
            }
            let type_tag = f.read_u64()?;
            let voxel_type = VoxelType::from_tag(type_tag).ok_or_else(|| {
                Error::format_invalid(&path, format!("unknown component type {type_tag}"))
            })?;
            let component_count = f.read_u64()?;
            let precomputed_normals = f.read_u8()? != 0;
            if precomputed_normals && component_count != 4 {
                return Err(Error::format_invalid(
                    &path,
                    "precomputed normals require 4 components",
                ));
            }
            let volume_size = f.read_u64_triple()?;
            let aspect = DVec3::from_array(f.read_f64_triple()?);
            let lod_count = f.read_u64()?;
            if lod_count == 0 || lod_count > 64 {
                return Err(Error::format_invalid(
                    &path,
                    format!("implausible LOD count {lod_count}"),
                ));
            }
            let mut lods = Vec::with_capacity(lod_count as usize);
            for _ in 0..lod_count {
                lods.push(LodEntry::read(&mut f)?);
            }
            let brick_total = f.read_u64()?;
            let computed: u64 = lods.iter().map(|l| l.brick_total()).sum();
            if brick_total != computed {
                return Err(Error::format_invalid(
                    &path,
                    "brick total disagrees with the LOD table",
                ));
            }
            let mut toc = Vec::with_capacity(brick_total as usize);
            for _ in 0..brick_total {
                toc.push(TocEntry::read(&mut f)?);
            }
            drop(f);

            // the end of the last brick must lie inside the file
            let end = toc.iter().map(|e| e.offset + e.length).max().unwrap_or(0);
            if offset + end > file_size {
                return Err(Error::format_invalid(
                    path,
                    "ToC inconsistent with file size",
                ));
            }

            Octree {
                voxel_type,
                component_count,
                precomputed_normals,
                volume_size,
                aspect,
                max_brick_size,
                overlap,
                version,
                size: 0,
                offset,
                file: file.clone(),
                toc,
                lods,
            }
        };
        tree.size = tree
            .toc
            .iter()
            .map(|e| e.offset + e.length)
            .max()
            .unwrap_or_else(|| tree.header_size());
        Ok(tree)
    }

    /// Open an octree stored at `offset` in `path`
    pub fn open_path(
        path: impl AsRef<Path>,
        offset: u64,
        expected_version: u32,
    ) -> Result<Self> {
        let file = Arc::new(Mutex::new(RawFile::open(path)?));
        Self::open(file, offset, expected_version)
    }

    /// Close the underlying file; the octree must not be used afterwards
    pub fn close(&self) {
        self.file.lock().unwrap().close();
    }

    // --- metadata queries ---

    pub fn voxel_type(&self) -> VoxelType {
        self.voxel_type
    }

    pub fn component_count(&self) -> u64 {
        self.component_count
    }

    pub fn has_precomputed_normals(&self) -> bool {
        self.precomputed_normals
    }

    pub fn lod_count(&self) -> u64 {
        self.lods.len() as u64
    }

    pub fn overlap(&self) -> u32 {
        self.overlap
    }

    pub fn max_brick_size(&self) -> [u64; 3] {
        self.max_brick_size
    }

    pub fn volume_size(&self) -> [u64; 3] {
        self.volume_size
    }

    pub fn global_aspect(&self) -> DVec3 {
        self.aspect
    }

    pub fn voxel_size(&self) -> usize {
        self.voxel_type.size_of() * self.component_count as usize
    }

    /// Total octree size in bytes, header included
    pub fn size(&self) -> u64 {
        if self.toc.is_empty() {
            self.header_size()
        } else {
            self.size
        }
    }

    /// Brick size limit minus the ghost border on both sides
    pub fn effective_brick_size(&self) -> [u64; 3] {
        let o = 2 * self.overlap as u64;
        [
            self.max_brick_size[0] - o,
            self.max_brick_size[1] - o,
            self.max_brick_size[2] - o,
        ]
    }

    pub fn brick_count(&self, lod: u64) -> [u64; 3] {
        self.lods[lod as usize].brick_count
    }

    pub fn lod_size(&self, lod: u64) -> [u64; 3] {
        self.lods[lod as usize].pixel_size
    }

    pub fn lod_table(&self) -> &[LodEntry] {
        &self.lods
    }

    pub fn brick_total(&self) -> u64 {
        self.toc.len() as u64
    }

    pub fn toc_entry(&self, index: u64) -> &TocEntry {
        &self.toc[index as usize]
    }

    pub fn toc_entry_for(&self, coords: BrickCoords) -> &TocEntry {
        &self.toc[self.brick_coords_to_index(coords) as usize]
    }

    /// Aspect of bricks in the given LOD (decimation-induced only)
    pub fn brick_aspect(&self, coords: BrickCoords) -> DVec3 {
        self.lods[coords[3] as usize].aspect
    }

    /// Number of voxels per axis of a brick, ghost border included
    pub fn compute_brick_size(&self, coords: BrickCoords) -> [u64; 3] {
        let lod = &self.lods[coords[3] as usize];
        let eff = self.effective_brick_size();
        let o = 2 * self.overlap as u64;
        let mut size = [0u64; 3];
        for d in 0..3 {
            let core = eff[d].min(lod.pixel_size[d] - coords[d] * eff[d]);
            size[d] = core + o;
        }
        size
    }

    /// Whether the brick is the last of its row/column/slice
    pub fn is_last_brick(&self, coords: BrickCoords) -> [bool; 3] {
        let count = self.lods[coords[3] as usize].brick_count;
        [
            coords[0] == count[0] - 1,
            coords[1] == count[1] - 1,
            coords[2] == count[2] - 1,
        ]
    }

    /// Uncompressed byte size of a brick body
    pub fn brick_bytes(&self, coords: BrickCoords) -> u64 {
        let s = self.compute_brick_size(coords);
        s[0] * s[1] * s[2] * self.voxel_size() as u64
    }

    /// Uncompressed byte size of the largest possible brick
    pub fn max_brick_bytes(&self) -> u64 {
        self.max_brick_size[0]
            * self.max_brick_size[1]
            * self.max_brick_size[2]
            * self.voxel_size() as u64
    }

    // --- canonical index mapping ---

    pub fn brick_coords_to_index(&self, coords: BrickCoords) -> u64 {
        let lod = &self.lods[coords[3] as usize];
        let [nx, ny, _] = lod.brick_count;
        lod.offset + coords[2] * ny * nx + coords[1] * nx + coords[0]
    }

    pub fn index_to_brick_coords(&self, index: u64) -> BrickCoords {
        let lod_idx = self
            .lods
            .iter()
            .position(|l| index >= l.offset && index < l.offset + l.brick_total())
            .unwrap_or_else(|| panic!("brick index {index} out of range"));
        let lod = &self.lods[lod_idx];
        let rel = index - lod.offset;
        let [nx, ny, _] = lod.brick_count;
        [rel % nx, (rel / nx) % ny, rel / (nx * ny), lod_idx as u64]
    }

    // --- data access ---

    /// Copy the raw (uncompressed, de-atlased) bytes of a brick into `dst`,
    /// which must be exactly the uncompressed brick byte size.
    pub fn get_brick_data(&self, dst: &mut [u8], coords: BrickCoords) -> Result<()> {
        let lod_count = self.lod_count();
        if coords[3] >= lod_count {
            return Err(Error::OutOfRange(format!(
                "lod {} of {lod_count}",
                coords[3]
            )));
        }
        let count = self.brick_count(coords[3]);
        if coords[0] >= count[0] || coords[1] >= count[1] || coords[2] >= count[2] {
            return Err(Error::OutOfRange(format!(
                "brick ({},{},{}) in layout {count:?}",
                coords[0], coords[1], coords[2]
            )));
        }
        self.get_brick_data_by_index(dst, self.brick_coords_to_index(coords))
    }

    pub(crate) fn get_brick_data_by_index(&self, dst: &mut [u8], index: u64) -> Result<()> {
        let coords = self.index_to_brick_coords(index);
        let expected = self.brick_bytes(coords) as usize;
        if dst.len() != expected {
            return Err(Error::ConfigInvalid(format!(
                "brick buffer is {} bytes, brick needs {expected}",
                dst.len()
            )));
        }
        let entry = self.toc[index as usize];

        let mut body = vec![0u8; entry.length as usize];
        {
            let mut f = self.file.lock().unwrap();
            f.seek_to(self.offset + entry.offset)?;
            f.fill(&mut body)?;
        }

        match entry.compression {
            CompressionTag::None => {
                if entry.is_atlased() {
                    let size = self.compute_brick_size(coords);
                    atlas::deatlasify(&body, size, self.voxel_size(), entry.atlas_size, dst)?;
                } else {
                    if body.len() != expected {
                        let path = self.file.lock().unwrap().path().to_path_buf();
                        return Err(Error::format_invalid(
                            path,
                            "uncompressed brick length disagrees with its size",
                        ));
                    }
                    dst.copy_from_slice(&body);
                }
            }
            CompressionTag::Zlib => {
                let mut decoder = flate2::read::ZlibDecoder::new(&body[..]);
                decoder.read_exact(dst).map_err(|e| {
                    let path = self.file.lock().unwrap().path().to_path_buf();
                    Error::format_invalid(path, format!("zlib brick decode failed: {e}"))
                })?;
            }
            CompressionTag::Jpeg => {
                return Err(Error::Unsupported(
                    "jpeg brick compression is a reserved tag".into(),
                ));
            }
        }
        Ok(())
    }

    /// Rewrite the global aspect in the header. Reopens the file read-write
    /// for the patch and drops back to read-only afterwards.
    pub fn set_global_aspect(&mut self, aspect: DVec3) -> Result<()> {
        {
            let mut f = self.file.lock().unwrap();
            f.reopen_rw()?;
            f.seek_to(self.offset + ASPECT_FIELD_OFFSET)?;
            f.write_f64_triple(aspect.to_array())?;
            f.reopen_ro()?;
        }
        self.aspect = aspect;
        Ok(())
    }

    // --- header bookkeeping (converter side) ---

    /// Compute the LOD table from volume size, brick size, and overlap.
    /// The coarsest level is the first one that fits in a single brick.
    pub(crate) fn compute_metadata(&mut self) {
        let eff = self.effective_brick_size();
        debug_assert!(eff.iter().all(|&e| e > 0));

        self.lods.clear();
        let mut size = self.volume_size;
        let mut aspect = DVec3::ONE;
        let mut offset = 0u64;
        loop {
            let bricks = [
                ceil_div(size[0], eff[0]),
                ceil_div(size[1], eff[1]),
                ceil_div(size[2], eff[2]),
            ];
            let entry = LodEntry {
                aspect,
                pixel_size: size,
                brick_count: bricks,
                offset,
            };
            offset += entry.brick_total();
            let done = bricks == [1, 1, 1];
            self.lods.push(entry);
            if done {
                break;
            }

            // halve each axis with a floor of one voxel; an axis that can no
            // longer shrink gets relatively finer spacing
            for d in 0..3 {
                if size[d] > 1 {
                    size[d] = ceil_div(size[d], 2);
                    aspect[d] *= 2.0;
                }
            }
            aspect /= aspect.max_element();
        }
    }

    /// Bricks across all levels, computable before the ToC exists
    pub(crate) fn computed_brick_total(&self) -> u64 {
        self.lods.iter().map(|l| l.brick_total()).sum()
    }

    pub fn header_size(&self) -> u64 {
        FIXED_HEADER_SIZE
            + self.lods.len() as u64 * LodEntry::SIZE_IN_FILE
            + 8
            + self.toc.len() as u64 * TocEntry::SIZE_IN_FILE
    }

    /// Header size once the ToC is fully populated, computable up front
    pub(crate) fn final_header_size(&self) -> u64 {
        FIXED_HEADER_SIZE
            + self.lods.len() as u64 * LodEntry::SIZE_IN_FILE
            + 8
            + self.computed_brick_total() * TocEntry::SIZE_IN_FILE
    }

    pub(crate) fn write_header(&self) -> Result<()> {
        let mut f = self.file.lock().unwrap();
        f.seek_to(self.offset)?;
        f.write_u64_triple(self.max_brick_size)?;
        f.write_u32(self.overlap)?;
        f.write_u32(self.version)?;
        f.write_u64(self.voxel_type.tag())?;
        f.write_u64(self.component_count)?;
        f.write_u8(self.precomputed_normals as u8)?;
        f.write_u64_triple(self.volume_size)?;
        f.write_f64_triple(self.aspect.to_array())?;
        f.write_u64(self.lods.len() as u64)?;
        for lod in &self.lods {
            lod.write(&mut f)?;
        }
        f.write_u64(self.toc.len() as u64)?;
        for entry in &self.toc {
            entry.write(&mut f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skeleton(volume: [u64; 3], bs: [u64; 3], overlap: u32) -> (Octree, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = Octree {
            voxel_type: VoxelType::U8,
            component_count: 1,
            precomputed_normals: false,
            volume_size: volume,
            aspect: DVec3::ONE,
            max_brick_size: bs,
            overlap,
            version: OCTREE_VERSION,
            size: 0,
            offset: 0,
            file: Arc::new(Mutex::new(
                RawFile::create(dir.path().join("meta.tmp")).unwrap(),
            )),
            toc: Vec::new(),
            lods: Vec::new(),
        };
        tree.compute_metadata();
        (tree, dir)
    }

    #[test]
    fn test_lod_table_tiny() {
        // 8x8x1 with 4x8x1 bricks: two LODs, three bricks total
        let (tree, _dir) = skeleton([8, 8, 1], [4, 8, 1], 0);
        assert_eq!(tree.lod_count(), 2);
        assert_eq!(tree.brick_count(0), [2, 1, 1]);
        assert_eq!(tree.brick_count(1), [1, 1, 1]);
        assert_eq!(tree.computed_brick_total(), 3);
        assert_eq!(tree.lods[1].pixel_size, [4, 4, 1]);
        assert_eq!(tree.lods[1].offset, 2);
    }

    #[test]
    fn test_lod_table_single_level() {
        // volume no larger than one brick core: one coherent LOD
        let (tree, _dir) = skeleton([28, 20, 10], [32, 32, 32], 2);
        assert_eq!(tree.lod_count(), 1);
        assert_eq!(tree.brick_count(0), [1, 1, 1]);

        // two voxels more along x and the finest level needs two bricks,
        // so a coarser single-brick level follows
        let (tree, _dir) = skeleton([30, 20, 10], [32, 32, 32], 2);
        assert_eq!(tree.lod_count(), 2);
        assert_eq!(tree.brick_count(0), [2, 1, 1]);
        assert_eq!(tree.brick_count(1), [1, 1, 1]);
    }

    #[test]
    fn test_brick_size_with_overlap() {
        let (tree, _dir) = skeleton([100, 60, 60], [34, 34, 34], 2);
        // effective 30 per axis; x tiles 30+30+30+10
        assert_eq!(tree.brick_count(0), [4, 2, 2]);
        assert_eq!(tree.compute_brick_size([0, 0, 0, 0]), [34, 34, 34]);
        assert_eq!(tree.compute_brick_size([3, 0, 0, 0]), [14, 34, 34]);
        assert_eq!(tree.is_last_brick([3, 1, 0, 0]), [true, true, false]);
    }

    #[test]
    fn test_index_roundtrip() {
        let (tree, _dir) = skeleton([100, 60, 60], [34, 34, 34], 2);
        for index in 0..tree.computed_brick_total() {
            let coords = tree.index_to_brick_coords(index);
            assert_eq!(tree.brick_coords_to_index(coords), index);
        }
    }

    #[test]
    fn test_anisotropic_aspect() {
        // z collapses to one voxel quickly; its relative spacing shrinks
        let (tree, _dir) = skeleton([64, 64, 2], [8, 8, 8], 0);
        let finest = tree.lods[0].aspect;
        assert_eq!(finest, DVec3::ONE);
        let coarsest = tree.lods.last().unwrap().aspect;
        assert!(coarsest.z < 1.0);
        assert_eq!(coarsest.max_element(), 1.0);
    }
}
