//! Dataset factory: sniff a file and pick the reader that accepts it

use std::path::Path;

use super::volume::VolumeDataset;
use super::LinearIndexDataset;
use crate::core::error::{Error, Result};

/// Number of leading bytes handed to `can_read`
const SNIFF_BYTES: usize = 512;

/// One registered format reader
pub trait DatasetReader {
    fn name(&self) -> &'static str;
    /// Decide from the file name and its first 512 bytes (zero padded)
    fn can_read(&self, path: &Path, first_block: &[u8]) -> bool;
    fn open(&self, path: &Path) -> Result<Box<dyn LinearIndexDataset + Send + Sync>>;
}

/// Walks its readers in registration order and opens the file with the
/// first one whose sniff test accepts it.
#[derive(Default)]
pub struct DatasetFactory {
    readers: Vec<Box<dyn DatasetReader + Send + Sync>>,
}

impl DatasetFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory with the built-in container reader registered
    pub fn with_default_readers() -> Self {
        let mut factory = Self::new();
        factory.register(Box::new(VolumeReader));
        factory
    }

    pub fn register(&mut self, reader: Box<dyn DatasetReader + Send + Sync>) {
        self.readers.push(reader);
    }

    pub fn readers(&self) -> impl Iterator<Item = &str> {
        self.readers.iter().map(|r| r.name())
    }

    fn first_block(path: &Path) -> Vec<u8> {
        let mut block = vec![0u8; SNIFF_BYTES];
        if let Ok(data) = std::fs::read(path) {
            let n = data.len().min(SNIFF_BYTES);
            block[..n].copy_from_slice(&data[..n]);
        }
        block
    }

    /// Find the reader accepting this file, without opening the dataset
    pub fn reader_for(&self, path: &Path) -> Option<&(dyn DatasetReader + Send + Sync)> {
        let block = Self::first_block(path);
        self.readers
            .iter()
            .find(|r| r.can_read(path, &block))
            .map(|r| r.as_ref())
    }

    pub fn open(&self, path: impl AsRef<Path>) -> Result<Box<dyn LinearIndexDataset + Send + Sync>> {
        let path = path.as_ref();
        match self.reader_for(path) {
            Some(reader) => reader.open(path),
            None => Err(Error::open_failed(path, "no reader can read this data")),
        }
    }
}

/// Built-in reader for container files
struct VolumeReader;

impl DatasetReader for VolumeReader {
    fn name(&self) -> &'static str {
        "bricked volume container"
    }

    fn can_read(&self, path: &Path, first_block: &[u8]) -> bool {
        VolumeDataset::can_read(path, first_block)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn LinearIndexDataset + Send + Sync>> {
        Ok(Box::new(VolumeDataset::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::VoxelType;
    use crate::dataset::BrickedDataset;
    use crate::io::RawFile;
    use crate::octree::ConvertConfig;
    use glam::DVec3;
    use tempfile::tempdir;

    #[test]
    fn test_opens_container_files() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("in.raw");
        let mut f = RawFile::create(&raw).unwrap();
        f.write_all(&vec![9u8; 512]).unwrap();
        drop(f);
        VolumeDataset::create(
            &raw,
            0,
            VoxelType::U8,
            1,
            [8, 8, 8],
            DVec3::ONE,
            ConvertConfig {
                max_brick_size: [8, 8, 8],
                overlap: 0,
                ..Default::default()
            },
            dir.path().join("vol.vxt"),
        )
        .unwrap();

        let factory = DatasetFactory::with_default_readers();
        let ds = factory.open(dir.path().join("vol.vxt")).unwrap();
        assert_eq!(ds.voxel_type(), VoxelType::U8);
        assert_eq!(ds.total_brick_count(), 1);
    }

    #[test]
    fn test_rejects_unknown_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("noise.bin");
        std::fs::write(&path, b"arbitrary bytes, certainly not a container").unwrap();

        let factory = DatasetFactory::with_default_readers();
        assert!(matches!(
            factory.open(&path),
            Err(Error::OpenFailed { .. })
        ));
    }

    #[test]
    fn test_insertion_order_wins() {
        struct Greedy;
        impl DatasetReader for Greedy {
            fn name(&self) -> &'static str {
                "greedy"
            }
            fn can_read(&self, _: &Path, _: &[u8]) -> bool {
                true
            }
            fn open(&self, path: &Path) -> Result<Box<dyn LinearIndexDataset + Send + Sync>> {
                Err(Error::open_failed(path, "greedy reader cannot open"))
            }
        }

        let mut factory = DatasetFactory::new();
        factory.register(Box::new(Greedy));
        factory.register(Box::new(VolumeReader));
        assert_eq!(
            factory.reader_for(Path::new("anything")).unwrap().name(),
            "greedy"
        );
    }
}
