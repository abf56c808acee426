//! Key/value pair metadata block

use super::{BlockSemantic, ContainerWriter};
use crate::core::error::Result;
use crate::io::RawFile;

/// Free-form dataset metadata: converter provenance, source file name,
/// acquisition parameters and the like.
#[derive(Clone, Debug, Default)]
pub struct KeyValuePairs {
    pairs: Vec<(String, String)>,
}

impl KeyValuePairs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.pairs.iter()
    }

    pub fn write_block(&self, w: &mut ContainerWriter) -> Result<()> {
        w.begin_block("Key/Value metadata", BlockSemantic::KeyValuePairs)?;
        let f = w.file_mut();
        f.write_u64(self.pairs.len() as u64)?;
        for (k, v) in &self.pairs {
            f.write_string_u64(k)?;
            f.write_string_u64(v)?;
        }
        Ok(())
    }

    /// Read the payload; the file must be positioned at the payload start
    pub fn read_payload(f: &mut RawFile) -> Result<Self> {
        let count = f.read_u64()?;
        let mut pairs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let k = f.read_string_u64()?;
            let v = f.read_string_u64()?;
            pairs.push((k, v));
        }
        Ok(Self { pairs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ChecksumScheme, ContainerReader};
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_through_container() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.vxt");

        let mut kv = KeyValuePairs::new();
        kv.push("source", "head_aneurysm.raw");
        kv.push("converter", "voxtree");

        let mut w = ContainerWriter::create(&path, ChecksumScheme::None).unwrap();
        kv.write_block(&mut w).unwrap();
        w.finish().unwrap();

        let r = ContainerReader::open(&path).unwrap();
        let info = r.find(BlockSemantic::KeyValuePairs).unwrap().clone();
        let file = r.file();
        let mut f = file.lock().unwrap();
        f.seek_to(info.payload_offset).unwrap();
        let back = KeyValuePairs::read_payload(&mut f).unwrap();

        assert_eq!(back.len(), 2);
        assert_eq!(back.get("source"), Some("head_aneurysm.raw"));
        assert_eq!(back.get("missing"), None);
    }
}
