//! Table-of-contents and level-of-detail tables

use glam::DVec3;

use crate::core::error::{Error, Result};
use crate::io::RawFile;

/// Per-brick compression scheme.
///
/// `Jpeg` (slice-wise) is a reserved tag: recognized, never produced, and
/// refused on read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum CompressionTag {
    #[default]
    None = 0,
    Zlib = 1,
    Jpeg = 2,
}

impl CompressionTag {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(CompressionTag::None),
            1 => Some(CompressionTag::Zlib),
            2 => Some(CompressionTag::Jpeg),
            _ => None,
        }
    }
}

/// On-disk ordering of brick bodies.
///
/// Readers never assume anything about it; the ToC carries explicit offsets.
/// `Scanline` is the only order the compaction pass supports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LayoutOrder {
    #[default]
    Scanline,
    Morton,
    Hilbert,
    Random,
}

/// One ToC entry per brick, in canonical order (LOD 0 first, index order
/// within a LOD).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TocEntry {
    /// byte offset of the body, relative to the octree header start
    pub offset: u64,
    /// byte length of the body on disk
    pub length: u64,
    pub compression: CompressionTag,
    /// valid bytes; equal to `length` for complete bricks, smaller while a
    /// brick is still streaming in
    pub valid_length: u64,
    /// 2D texture size when the body is atlas-packed, zero otherwise
    pub atlas_size: [u32; 2],
}

impl TocEntry {
    /// Bytes one entry occupies inside the octree header
    pub const SIZE_IN_FILE: u64 = 8 + 8 + 4 + 8 + 4 + 4;

    pub fn is_atlased(&self) -> bool {
        self.atlas_size[0] != 0 && self.atlas_size[1] != 0
    }

    pub fn read(f: &mut RawFile) -> Result<Self> {
        let offset = f.read_u64()?;
        let length = f.read_u64()?;
        let compression_tag = f.read_u32()?;
        let compression = CompressionTag::from_tag(compression_tag).ok_or_else(|| {
            Error::format_invalid(f.path(), format!("unknown compression tag {compression_tag}"))
        })?;
        let valid_length = f.read_u64()?;
        let atlas_size = [f.read_u32()?, f.read_u32()?];
        Ok(Self {
            offset,
            length,
            compression,
            valid_length,
            atlas_size,
        })
    }

    pub fn write(&self, f: &mut RawFile) -> Result<()> {
        f.write_u64(self.offset)?;
        f.write_u64(self.length)?;
        f.write_u32(self.compression as u32)?;
        f.write_u64(self.valid_length)?;
        f.write_u32(self.atlas_size[0])?;
        f.write_u32(self.atlas_size[1])
    }
}

/// Metadata of one level of detail
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LodEntry {
    /// aspect accumulated from anisotropic decimation only; the global
    /// volume aspect is stored separately
    pub aspect: DVec3,
    /// size of the whole level in voxels
    pub pixel_size: [u64; 3],
    /// bricks per axis in this level
    pub brick_count: [u64; 3],
    /// sum of brick counts of all finer levels; the 1D index offset of this
    /// level's first brick
    pub offset: u64,
}

impl LodEntry {
    pub const SIZE_IN_FILE: u64 = 24 + 24 + 24 + 8;

    pub fn brick_total(&self) -> u64 {
        self.brick_count[0] * self.brick_count[1] * self.brick_count[2]
    }

    pub fn read(f: &mut RawFile) -> Result<Self> {
        let a = f.read_f64_triple()?;
        Ok(Self {
            aspect: DVec3::from_array(a),
            pixel_size: f.read_u64_triple()?,
            brick_count: f.read_u64_triple()?,
            offset: f.read_u64()?,
        })
    }

    pub fn write(&self, f: &mut RawFile) -> Result<()> {
        f.write_f64_triple(self.aspect.to_array())?;
        f.write_u64_triple(self.pixel_size)?;
        f.write_u64_triple(self.brick_count)?;
        f.write_u64(self.offset)
    }
}
