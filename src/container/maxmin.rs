//! Per-brick min/max acceleration block

use super::{BlockSemantic, ContainerWriter};
use crate::core::error::{Error, Result};
use crate::io::RawFile;

/// Scalar and gradient extrema of one brick component.
///
/// The defaults are sentinels chosen so that any merge replaces them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MinMax {
    pub min_scalar: f64,
    pub max_scalar: f64,
    pub min_gradient: f64,
    pub max_gradient: f64,
}

impl Default for MinMax {
    fn default() -> Self {
        Self {
            min_scalar: f64::MAX,
            max_scalar: -(f32::MAX as f64),
            min_gradient: f64::MAX,
            max_gradient: -(f32::MAX as f64),
        }
    }
}

impl MinMax {
    pub fn new(min_scalar: f64, max_scalar: f64, min_gradient: f64, max_gradient: f64) -> Self {
        Self {
            min_scalar,
            max_scalar,
            min_gradient,
            max_gradient,
        }
    }

    pub fn merge(&mut self, other: &MinMax) {
        self.min_scalar = self.min_scalar.min(other.min_scalar);
        self.max_scalar = self.max_scalar.max(other.max_scalar);
        self.min_gradient = self.min_gradient.min(other.min_gradient);
        self.max_gradient = self.max_gradient.max(other.max_gradient);
    }
}

/// Flat per-brick statistics produced by the converter, brick-major:
/// entry `index * components + c` belongs to component `c` of brick `index`.
pub type BrickStatVec = Vec<MinMax>;

/// Acceleration block: per-brick, per-component extrema plus a global
/// aggregate per component.
#[derive(Clone, Debug)]
pub struct MaxMinBlock {
    component_count: usize,
    entries: Vec<MinMax>,
    global: Vec<MinMax>,
}

impl MaxMinBlock {
    pub fn new(component_count: usize) -> Self {
        assert!(component_count > 0);
        Self {
            component_count,
            entries: Vec::new(),
            global: vec![MinMax::default(); component_count],
        }
    }

    pub fn component_count(&self) -> usize {
        self.component_count
    }

    pub fn brick_count(&self) -> usize {
        self.entries.len() / self.component_count
    }

    /// Append a fresh all-sentinel entry for the next brick
    pub fn start_new_brick(&mut self) {
        self.entries
            .extend(std::iter::repeat_n(MinMax::default(), self.component_count));
    }

    /// Merge per-component data into the most recent brick and the global
    /// aggregate
    pub fn merge(&mut self, per_component: &[MinMax]) {
        assert_eq!(per_component.len(), self.component_count);
        assert!(!self.entries.is_empty(), "merge before start_new_brick");
        let base = self.entries.len() - self.component_count;
        for (c, mm) in per_component.iter().enumerate() {
            self.entries[base + c].merge(mm);
            self.global[c].merge(mm);
        }
    }

    pub fn get(&self, brick_index: usize, component: usize) -> MinMax {
        self.entries[brick_index * self.component_count + component]
    }

    pub fn global(&self, component: usize) -> MinMax {
        self.global[component]
    }

    /// Build from the converter's flat statistics vector
    pub fn from_brick_stats(stats: &BrickStatVec, component_count: usize) -> Self {
        assert!(component_count > 0);
        assert_eq!(stats.len() % component_count, 0);
        let mut block = Self::new(component_count);
        for chunk in stats.chunks(component_count) {
            block.start_new_brick();
            block.merge(chunk);
        }
        block
    }

    pub fn write_block(&self, w: &mut ContainerWriter) -> Result<()> {
        w.begin_block("Brick Max/Min Values", BlockSemantic::BrickMaxMin)?;
        let f = w.file_mut();
        f.write_u64(self.brick_count() as u64)?;
        f.write_u64(self.component_count as u64)?;
        for mm in &self.entries {
            f.write_f64(mm.min_scalar)?;
            f.write_f64(mm.max_scalar)?;
            f.write_f64(mm.min_gradient)?;
            f.write_f64(mm.max_gradient)?;
        }
        Ok(())
    }

    /// Read the payload; the file must be positioned at the payload start.
    /// The global aggregate is rebuilt by merging.
    pub fn read_payload(f: &mut RawFile) -> Result<Self> {
        let brick_count = f.read_u64()? as usize;
        let component_count = f.read_u64()? as usize;
        if component_count == 0 {
            return Err(Error::format_invalid(
                f.path(),
                "max/min block with zero components",
            ));
        }
        let mut block = Self::new(component_count);
        let mut record = vec![MinMax::default(); component_count];
        for _ in 0..brick_count {
            for mm in record.iter_mut() {
                mm.min_scalar = f.read_f64()?;
                mm.max_scalar = f.read_f64()?;
                mm.min_gradient = f.read_f64()?;
                mm.max_gradient = f.read_f64()?;
            }
            block.start_new_brick();
            block.merge(&record);
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ChecksumScheme, ContainerReader};
    use tempfile::tempdir;

    #[test]
    fn test_merge_updates_last_and_global() {
        let mut block = MaxMinBlock::new(1);
        block.start_new_brick();
        block.merge(&[MinMax::new(1.0, 5.0, 0.0, 0.5)]);
        block.start_new_brick();
        block.merge(&[MinMax::new(-2.0, 3.0, 0.0, 0.9)]);
        block.merge(&[MinMax::new(0.0, 7.0, 0.0, 0.1)]);

        assert_eq!(block.brick_count(), 2);
        assert_eq!(block.get(0, 0).max_scalar, 5.0);
        assert_eq!(block.get(1, 0).min_scalar, -2.0);
        assert_eq!(block.get(1, 0).max_scalar, 7.0);
        assert_eq!(block.global(0).min_scalar, -2.0);
        assert_eq!(block.global(0).max_scalar, 7.0);
        assert_eq!(block.global(0).max_gradient, 0.9);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mm.vxt");

        let stats = vec![
            MinMax::new(0.0, 10.0, 0.0, 0.1),
            MinMax::new(5.0, 50.0, 0.0, 0.2),
            MinMax::new(2.0, 20.0, 0.0, 0.3),
            MinMax::new(7.0, 70.0, 0.0, 0.4),
        ];
        let block = MaxMinBlock::from_brick_stats(&stats, 2);
        assert_eq!(block.brick_count(), 2);

        let mut w = ContainerWriter::create(&path, ChecksumScheme::None).unwrap();
        block.write_block(&mut w).unwrap();
        w.finish().unwrap();

        let r = ContainerReader::open(&path).unwrap();
        let info = r.find(BlockSemantic::BrickMaxMin).unwrap().clone();
        let file = r.file();
        let mut f = file.lock().unwrap();
        f.seek_to(info.payload_offset).unwrap();
        let back = MaxMinBlock::read_payload(&mut f).unwrap();

        assert_eq!(back.brick_count(), 2);
        assert_eq!(back.component_count(), 2);
        assert_eq!(back.get(1, 1).max_scalar, 70.0);
        assert_eq!(back.global(0).max_scalar, 20.0);
        assert_eq!(back.global(1).max_scalar, 70.0);
    }
}
