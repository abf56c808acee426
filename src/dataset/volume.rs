//! Container-backed volume dataset
//!
//! The concrete dataset over a container file: owns the TOC octree and the
//! side blocks (histograms, min/max, key/value metadata), shares the file
//! handle with the octree, and populates the brick table at open time.

use glam::{DVec3, Vec3};
use std::path::{Path, PathBuf};

use super::iterator::BrickIterator;
use super::{BrickKey, BrickTable, BrickedDataset, LinearIndexDataset};
use crate::container::histogram::{Histogram1D, Histogram2D};
use crate::container::keyvalue::KeyValuePairs;
use crate::container::maxmin::{MaxMinBlock, MinMax};
use crate::container::{BlockSemantic, ChecksumScheme, ContainerReader, ContainerWriter, MAGIC};
use crate::core::error::{Error, Result};
use crate::core::types::VoxelType;
use crate::io::{RawFile, TempRawFile};
use crate::octree::{ConvertConfig, Converter, OCTREE_VERSION, Octree};

pub struct VolumeDataset {
    path: PathBuf,
    container: ContainerReader,
    octree: Octree,
    bricks: BrickTable,
    hist1d: Option<Histogram1D>,
    hist2d: Option<Histogram2D>,
    maxmin: Option<MaxMinBlock>,
    metadata: Option<KeyValuePairs>,
}

impl VolumeDataset {
    /// Open a container file and materialize all of its blocks
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let container = ContainerReader::open(&path)?;

        let toc = container
            .find(BlockSemantic::TocOctree)
            .ok_or_else(|| Error::open_failed(&path, "container has no TOC block"))?
            .clone();
        let octree = Octree::open(container.file(), toc.payload_offset, OCTREE_VERSION)?;

        let mut hist1d = None;
        let mut hist2d = None;
        let mut maxmin = None;
        let mut metadata = None;
        {
            let file = container.file();
            let mut f = file.lock().unwrap();
            for info in container.blocks() {
                f.seek_to(info.payload_offset)?;
                match info.header.semantic {
                    BlockSemantic::Histogram1D => hist1d = Some(Histogram1D::read_payload(&mut f)?),
                    BlockSemantic::Histogram2D => hist2d = Some(Histogram2D::read_payload(&mut f)?),
                    BlockSemantic::BrickMaxMin => maxmin = Some(MaxMinBlock::read_payload(&mut f)?),
                    BlockSemantic::KeyValuePairs => {
                        metadata = Some(KeyValuePairs::read_payload(&mut f)?)
                    }
                    _ => {}
                }
            }
        }

        let bricks = Self::build_brick_table(&octree);
        Ok(Self {
            path,
            container,
            octree,
            bricks,
            hist1d,
            hist2d,
            maxmin,
            metadata,
        })
    }

    fn build_brick_table(octree: &Octree) -> BrickTable {
        let volume = octree.volume_size();
        let aspect = octree.global_aspect();
        let world = Vec3::new(
            (volume[0] as f64 * aspect.x) as f32,
            (volume[1] as f64 * aspect.y) as f32,
            (volume[2] as f64 * aspect.z) as f32,
        );
        let extents = [-world / 2.0, world / 2.0];
        BrickIterator::new(
            volume,
            octree.max_brick_size(),
            octree.overlap(),
            extents,
            octree.lod_count(),
        )
        .collect()
    }

    /// Convert a flat raw file into a complete container at `target`:
    /// TOC octree, key/value provenance, histograms, and per-brick min/max.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        raw: impl AsRef<Path>,
        raw_offset: u64,
        voxel_type: VoxelType,
        component_count: u64,
        volume_size: [u64; 3],
        aspect: DVec3,
        cfg: ConvertConfig,
        target: impl AsRef<Path>,
    ) -> Result<Self> {
        let raw = raw.as_ref();
        let target = target.as_ref();
        let temp = TempRawFile::create(target.with_extension("oct.tmp"))?;

        let mut converter = Converter::new(cfg)?;
        let (tree, stats) = converter.convert_paths(
            raw,
            raw_offset,
            voxel_type,
            component_count,
            volume_size,
            aspect,
            temp.path(),
            0,
            true,
        )?;
        let stats = stats.expect("converter was asked for statistics");
        let maxmin = MaxMinBlock::from_brick_stats(&stats, component_count as usize);

        fn allow_unsupported<T>(r: Result<T>) -> Result<Option<T>> {
            match r {
                Ok(v) => Ok(Some(v)),
                Err(Error::Unsupported(_)) => Ok(None),
                Err(e) => Err(e),
            }
        }
        let hist1d = allow_unsupported(Histogram1D::compute(&tree, 0))?;
        let max_value = (0..component_count as usize)
            .map(|c| maxmin.global(c).max_scalar)
            .fold(0.0f64, f64::max);
        let hist2d = allow_unsupported(Histogram2D::compute(&tree, 0, 256, max_value))?;

        let mut kv = KeyValuePairs::new();
        kv.push("source", raw.display().to_string());
        kv.push(
            "volume size",
            format!(
                "{}x{}x{}",
                volume_size[0], volume_size[1], volume_size[2]
            ),
        );
        kv.push("component type", format!("{voxel_type:?}"));
        kv.push("component count", component_count.to_string());

        let mut w = ContainerWriter::create(target, ChecksumScheme::Md5)?;
        kv.write_block(&mut w)?;
        {
            let octree_size = tree.size();
            let file = tree.file.clone();
            let mut f = file.lock().unwrap();
            w.append_block_from_file(
                "Table of Contents Octree",
                BlockSemantic::TocOctree,
                &mut f,
                0,
                octree_size,
            )?;
        }
        if let Some(h) = &hist1d {
            h.write_block(&mut w)?;
        }
        if let Some(h) = &hist2d {
            h.write_block(&mut w)?;
        }
        maxmin.write_block(&mut w)?;
        w.finish()?;

        tree.close();
        drop(temp);
        Self::open(target)
    }

    pub fn octree(&self) -> &Octree {
        &self.octree
    }

    pub fn histogram_1d(&self) -> Option<&Histogram1D> {
        self.hist1d.as_ref()
    }

    pub fn histogram_2d(&self) -> Option<&Histogram2D> {
        self.hist2d.as_ref()
    }

    pub fn metadata(&self) -> Option<&KeyValuePairs> {
        self.metadata.as_ref()
    }

    pub fn maxmin(&self) -> Option<&MaxMinBlock> {
        self.maxmin.as_ref()
    }

    /// Recompute the container checksum
    pub fn verify(&self) -> Result<()> {
        self.container.verify()
    }

    /// Persist a new global aspect into the octree header; the container
    /// digest is refreshed to match
    pub fn set_global_aspect(&mut self, aspect: DVec3) -> Result<()> {
        self.octree.set_global_aspect(aspect)?;
        self.container.rewrite_digest()?;
        self.bricks = Self::build_brick_table(&self.octree);
        Ok(())
    }

    /// Sniff test for the dataset factory
    pub fn can_read(_path: &Path, first_block: &[u8]) -> bool {
        first_block.len() >= 4 && &first_block[..4] == MAGIC
    }

    pub fn extensions() -> &'static [&'static str] {
        &["vxt"]
    }
}

impl BrickedDataset for VolumeDataset {
    fn bricks(&self) -> &BrickTable {
        &self.bricks
    }

    fn lod_count(&self) -> u64 {
        self.octree.lod_count()
    }

    fn domain_size(&self, lod: u64, _timestep: u64) -> [u64; 3] {
        self.octree.lod_size(lod)
    }

    fn brick_layout(&self, lod: u64, _timestep: u64) -> [u64; 3] {
        self.octree.brick_count(lod)
    }

    fn max_brick_size(&self) -> [u64; 3] {
        self.octree.max_brick_size()
    }

    fn overlap(&self) -> [u32; 3] {
        [self.octree.overlap(); 3]
    }

    fn voxel_type(&self) -> VoxelType {
        self.octree.voxel_type()
    }

    fn component_count(&self) -> u64 {
        self.octree.component_count()
    }

    fn get_brick(&self, key: &BrickKey, out: &mut Vec<u8>) -> Result<()> {
        let coords = self.index_to_4d(key);
        out.resize(self.octree.brick_bytes(coords) as usize, 0);
        self.octree.get_brick_data(out, coords)
    }

    fn range(&self) -> (f64, f64) {
        match &self.maxmin {
            Some(mm) => {
                let g = mm.global(0);
                (g.min_scalar, g.max_scalar)
            }
            None => (0.0, 0.0),
        }
    }

    fn maxmin_for_key(&self, key: &BrickKey) -> Result<MinMax> {
        let mm = self
            .maxmin
            .as_ref()
            .ok_or_else(|| Error::Unsupported("dataset carries no min/max block".into()))?;
        // min/max entries follow the global ToC order; fold the components
        let global_index = self.octree.lod_table()[key.lod as usize].offset + key.index;
        if global_index >= mm.brick_count() as u64 {
            return Err(Error::OutOfRange(format!(
                "brick {global_index} in min/max"
            )));
        }
        let mut merged = MinMax::default();
        for c in 0..mm.component_count() {
            merged.merge(&mm.get(global_index as usize, c));
        }
        Ok(merged)
    }

    fn max_gradient_magnitude(&self) -> f32 {
        self.hist2d.as_ref().map(|h| h.max_gradient()).unwrap_or(-1.0)
    }

    fn file_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    fn export_lod(&self, lod: u64, target: &Path) -> Result<()> {
        Converter::export_to_raw_path(&self.octree, target, lod, 0)
    }
}

impl LinearIndexDataset for VolumeDataset {}
