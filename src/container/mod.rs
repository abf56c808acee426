//! Container file: a global header followed by a chain of typed blocks
//!
//! A single file holds everything a dataset needs: the TOC octree, the
//! histograms, per-brick min/max acceleration data, and free-form key/value
//! metadata. Blocks are self-describing and chained through absolute
//! `offset_to_next` links; readers iterate until the link is 0.

pub mod block;
pub mod histogram;
pub mod keyvalue;
pub mod maxmin;

pub use block::{BlockHeader, BlockSemantic};

use md5::{Digest, Md5};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::core::error::{Error, Result};
use crate::io::{Endianness, RawFile};

pub const MAGIC: &[u8; 4] = b"VXTC";
pub const CONTAINER_VERSION: u8 = 1;
pub const GLOBAL_HEADER_SIZE: u64 = 24;

/// Container integrity scheme
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChecksumScheme {
    None = 0,
    Md5 = 1,
}

impl ChecksumScheme {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ChecksumScheme::None),
            1 => Some(ChecksumScheme::Md5),
            _ => None,
        }
    }
}

fn digest_from(file: &mut RawFile, offset: u64) -> Result<[u8; 16]> {
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 4 << 20];
    file.seek_to(offset)?;
    loop {
        let got = file.read_raw(&mut buf)?;
        if got == 0 {
            break;
        }
        hasher.update(&buf[..got]);
    }
    Ok(hasher.finalize().into())
}

/// Sequential writer for a new container file
pub struct ContainerWriter {
    file: RawFile,
    checksum: ChecksumScheme,
    // absolute offset of the previous block header's offset_to_next field
    prev_link: Option<u64>,
}

impl ContainerWriter {
    pub fn create(path: impl AsRef<Path>, checksum: ChecksumScheme) -> Result<Self> {
        let mut file = RawFile::create(path)?;
        file.write_all(MAGIC)?;
        file.write_u8(CONTAINER_VERSION)?;
        file.write_u8(match file.endianness() {
            Endianness::Little => 0,
            Endianness::Big => 1,
        })?;
        file.write_u8(checksum as u8)?;
        file.write_u8(0)?; // reserved
        file.write_all(&[0u8; 16])?; // digest placeholder
        Ok(Self {
            file,
            checksum,
            prev_link: None,
        })
    }

    /// Append a block header; the payload is then written through
    /// [`ContainerWriter::file_mut`]. Returns the payload offset.
    pub fn begin_block(&mut self, id: &str, semantic: BlockSemantic) -> Result<u64> {
        let header_start = self.file.seek_end()?;
        if let Some(link) = self.prev_link {
            self.file.seek_to(link)?;
            self.file.write_u64(header_start)?;
            self.file.seek_to(header_start)?;
        }
        let header = BlockHeader::new(id, semantic);
        header.write(&mut self.file)?;
        self.prev_link = Some(header_start + header.next_field_offset());
        self.file.tell()
    }

    pub fn file_mut(&mut self) -> &mut RawFile {
        &mut self.file
    }

    /// Append a block whose payload is streamed from another file
    pub fn append_block_from_file(
        &mut self,
        id: &str,
        semantic: BlockSemantic,
        source: &mut RawFile,
        source_offset: u64,
        length: u64,
    ) -> Result<u64> {
        let payload_offset = self.begin_block(id, semantic)?;
        source.seek_to(source_offset)?;
        let mut buf = vec![0u8; 4 << 20];
        let mut remaining = length;
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            source.fill(&mut buf[..chunk])?;
            self.file.write_all(&buf[..chunk])?;
            remaining -= chunk as u64;
        }
        Ok(payload_offset)
    }

    /// Compute and patch the integrity digest, then close the file
    pub fn finish(mut self) -> Result<()> {
        if self.checksum == ChecksumScheme::Md5 {
            let digest = digest_from(&mut self.file, GLOBAL_HEADER_SIZE)?;
            self.file.seek_to(8)?;
            self.file.write_all(&digest)?;
        }
        self.file.close();
        Ok(())
    }
}

/// One block located inside an open container
#[derive(Clone, Debug)]
pub struct BlockInfo {
    pub header: BlockHeader,
    pub payload_offset: u64,
}

/// Read-side view of a container file
pub struct ContainerReader {
    file: Arc<Mutex<RawFile>>,
    path: PathBuf,
    checksum: ChecksumScheme,
    stored_digest: [u8; 16],
    blocks: Vec<BlockInfo>,
}

impl ContainerReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = RawFile::open(&path)?;

        let mut magic = [0u8; 4];
        file.fill(&mut magic)
            .map_err(|_| Error::format_invalid(&path, "truncated header"))?;
        if &magic != MAGIC {
            return Err(Error::format_invalid(&path, "bad magic"));
        }
        let version = file.read_u8()?;
        if version != CONTAINER_VERSION {
            return Err(Error::format_invalid(
                &path,
                format!("container version {version}, expected {CONTAINER_VERSION}"),
            ));
        }
        let endian = match file.read_u8()? {
            0 => Endianness::Little,
            1 => Endianness::Big,
            other => {
                return Err(Error::format_invalid(
                    &path,
                    format!("bad endian flag {other}"),
                ));
            }
        };
        file.set_endianness(endian);
        let checksum_tag = file.read_u8()?;
        let checksum = ChecksumScheme::from_tag(checksum_tag).ok_or_else(|| {
            Error::format_invalid(&path, format!("unknown checksum scheme {checksum_tag}"))
        })?;
        file.read_u8()?; // reserved
        let mut stored_digest = [0u8; 16];
        file.fill(&mut stored_digest)?;

        let file_size = file.current_size()?;
        let mut blocks = Vec::new();
        let mut pos = GLOBAL_HEADER_SIZE;
        if pos < file_size {
            loop {
                file.seek_to(pos)?;
                let header = BlockHeader::read(&mut file)?;
                let payload_offset = file.tell()?;
                let next = header.offset_to_next;
                blocks.push(BlockInfo {
                    header,
                    payload_offset,
                });
                if next == 0 {
                    break;
                }
                if next <= pos || next >= file_size {
                    return Err(Error::format_invalid(&path, "corrupt block chain"));
                }
                pos = next;
            }
        }

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path,
            checksum,
            stored_digest,
            blocks,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    pub fn find(&self, semantic: BlockSemantic) -> Option<&BlockInfo> {
        self.blocks.iter().find(|b| b.header.semantic == semantic)
    }

    /// Shared handle to the underlying file; the octree keeps one
    pub fn file(&self) -> Arc<Mutex<RawFile>> {
        self.file.clone()
    }

    /// Recompute the payload digest and compare against the header
    pub fn verify(&self) -> Result<()> {
        if self.checksum != ChecksumScheme::Md5 {
            return Ok(());
        }
        let digest = {
            let mut file = self.file.lock().unwrap();
            digest_from(&mut file, GLOBAL_HEADER_SIZE)?
        };
        if digest != self.stored_digest {
            return Err(Error::ChecksumMismatch {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    /// Recompute and patch the digest after an in-place header mutation
    /// (e.g. a global-aspect rewrite). No-op without a checksum scheme.
    pub fn rewrite_digest(&mut self) -> Result<()> {
        if self.checksum != ChecksumScheme::Md5 {
            return Ok(());
        }
        let digest = {
            let mut file = self.file.lock().unwrap();
            file.reopen_rw()?;
            let digest = digest_from(&mut file, GLOBAL_HEADER_SIZE)?;
            file.seek_to(8)?;
            file.write_all(&digest)?;
            file.reopen_ro()?;
            digest
        };
        self.stored_digest = digest;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_block_chain_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain.vxt");

        let mut w = ContainerWriter::create(&path, ChecksumScheme::Md5).unwrap();
        let p0 = w.begin_block("first", BlockSemantic::Empty).unwrap();
        w.file_mut().write_u64(111).unwrap();
        let p1 = w.begin_block("second", BlockSemantic::Geometry).unwrap();
        w.file_mut().write_u64(222).unwrap();
        w.finish().unwrap();

        let r = ContainerReader::open(&path).unwrap();
        assert_eq!(r.blocks().len(), 2);
        assert_eq!(r.blocks()[0].header.id, "first");
        assert_eq!(r.blocks()[0].payload_offset, p0);
        assert_eq!(r.blocks()[1].header.semantic, BlockSemantic::Geometry);
        assert_eq!(r.blocks()[1].payload_offset, p1);
        assert_eq!(r.blocks()[1].header.offset_to_next, 0);
        r.verify().unwrap();

        let file = r.file();
        let mut f = file.lock().unwrap();
        f.seek_to(p1).unwrap();
        assert_eq!(f.read_u64().unwrap(), 222);
    }

    #[test]
    fn test_verify_detects_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.vxt");

        let mut w = ContainerWriter::create(&path, ChecksumScheme::Md5).unwrap();
        let p = w.begin_block("payload", BlockSemantic::Empty).unwrap();
        w.file_mut().write_u64(0xAAAA).unwrap();
        w.finish().unwrap();

        {
            let mut f = RawFile::open_rw(&path).unwrap();
            f.seek_to(p).unwrap();
            f.write_u64(0xBBBB).unwrap();
        }

        let r = ContainerReader::open(&path).unwrap();
        assert!(matches!(r.verify(), Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, b"not a container at all......").unwrap();
        assert!(matches!(
            ContainerReader::open(&path),
            Err(Error::FormatInvalid { .. })
        ));
    }

    #[test]
    fn test_append_block_from_file() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("payload.bin");
        let path = dir.path().join("copied.vxt");

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        let mut src = RawFile::create(&src_path).unwrap();
        src.write_all(&payload).unwrap();

        let mut w = ContainerWriter::create(&path, ChecksumScheme::None).unwrap();
        let p = w
            .append_block_from_file(
                "copied",
                BlockSemantic::TocOctree,
                &mut src,
                4,
                payload.len() as u64 - 4,
            )
            .unwrap();
        w.finish().unwrap();

        let r = ContainerReader::open(&path).unwrap();
        let mut file = r.file.lock().unwrap();
        file.seek_to(p).unwrap();
        let mut back = vec![0u8; payload.len() - 4];
        file.fill(&mut back).unwrap();
        assert_eq!(back, payload[4..]);
    }
}
