//! Self-describing data blocks chained inside a container file

use crate::core::error::{Error, Result};
use crate::io::RawFile;

/// Semantic tag of a block payload.
///
/// The discriminants are the on-disk tags; do not reorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockSemantic {
    Empty = 0,
    RegularNDGrid = 1,
    NDTransferFunction = 2,
    PreviewImage = 3,
    KeyValuePairs = 4,
    Histogram1D = 5,
    Histogram2D = 6,
    BrickMaxMin = 7,
    Geometry = 8,
    TocOctree = 9,
}

impl BlockSemantic {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => BlockSemantic::Empty,
            1 => BlockSemantic::RegularNDGrid,
            2 => BlockSemantic::NDTransferFunction,
            3 => BlockSemantic::PreviewImage,
            4 => BlockSemantic::KeyValuePairs,
            5 => BlockSemantic::Histogram1D,
            6 => BlockSemantic::Histogram2D,
            7 => BlockSemantic::BrickMaxMin,
            8 => BlockSemantic::Geometry,
            9 => BlockSemantic::TocOctree,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            BlockSemantic::Empty => "Empty",
            BlockSemantic::RegularNDGrid => "Regular N-Dimensional Grid",
            BlockSemantic::NDTransferFunction => "N-Dimensional Transfer Function",
            BlockSemantic::PreviewImage => "Preview Image",
            BlockSemantic::KeyValuePairs => "Key/Value Pairs",
            BlockSemantic::Histogram1D => "Histogram (1D)",
            BlockSemantic::Histogram2D => "Histogram (2D)",
            BlockSemantic::BrickMaxMin => "Brick Max/Min Values",
            BlockSemantic::Geometry => "Geometry",
            BlockSemantic::TocOctree => "Table of Contents (TOC)",
        }
    }
}

/// Header preceding every block payload.
///
/// `offset_to_next` is an absolute file offset; 0 marks the final block.
/// Block-level compression is always 0 (`none`); per-brick compression lives
/// in the octree ToC.
#[derive(Clone, Debug)]
pub struct BlockHeader {
    pub id: String,
    pub semantic: BlockSemantic,
    pub compression: u8,
    pub offset_to_next: u64,
}

impl BlockHeader {
    pub fn new(id: impl Into<String>, semantic: BlockSemantic) -> Self {
        Self {
            id: id.into(),
            semantic,
            compression: 0,
            offset_to_next: 0,
        }
    }

    /// Size of this header on disk
    pub fn size_in_file(&self) -> u64 {
        2 + self.id.len() as u64 + 1 + 1 + 8
    }

    /// Byte offset of the `offset_to_next` field, relative to the header start
    pub fn next_field_offset(&self) -> u64 {
        2 + self.id.len() as u64 + 1 + 1
    }

    pub fn read(file: &mut RawFile) -> Result<Self> {
        let id = file.read_string_u16()?;
        let semantic_tag = file.read_u8()?;
        let semantic = BlockSemantic::from_tag(semantic_tag).ok_or_else(|| {
            Error::format_invalid(
                file.path(),
                format!("unknown block semantic {semantic_tag}"),
            )
        })?;
        let compression = file.read_u8()?;
        if compression != 0 {
            return Err(Error::format_invalid(
                file.path(),
                format!("unsupported block compression {compression}"),
            ));
        }
        let offset_to_next = file.read_u64()?;
        Ok(Self {
            id,
            semantic,
            compression,
            offset_to_next,
        })
    }

    pub fn write(&self, file: &mut RawFile) -> Result<()> {
        file.write_string_u16(&self.id)?;
        file.write_u8(self.semantic as u8)?;
        file.write_u8(self.compression)?;
        file.write_u64(self.offset_to_next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_header_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hdr.bin");

        let mut f = RawFile::create(&path).unwrap();
        let hdr = BlockHeader::new("Key/Value metadata", BlockSemantic::KeyValuePairs);
        hdr.write(&mut f).unwrap();
        let written = f.tell().unwrap();
        assert_eq!(written, hdr.size_in_file());

        f.seek_start().unwrap();
        let back = BlockHeader::read(&mut f).unwrap();
        assert_eq!(back.id, hdr.id);
        assert_eq!(back.semantic, BlockSemantic::KeyValuePairs);
        assert_eq!(back.offset_to_next, 0);
    }

    #[test]
    fn test_semantic_tags() {
        for tag in 0..10u8 {
            let s = BlockSemantic::from_tag(tag).unwrap();
            assert_eq!(s as u8, tag);
        }
        assert!(BlockSemantic::from_tag(10).is_none());
    }
}
