//! Request commands and structured messages of the brick protocol

use std::io::{Read, Write};

use super::wire;
use crate::core::error::{Error, Result};
use crate::core::types::VoxelType;

/// One-byte command codes on the request stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Open = 1,
    Close = 2,
    Brick = 3,
    ListFiles = 4,
    Shutdown = 5,
    Rotation = 6,
    BatchSize = 7,
    CalcMinMax = 8,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Command::Open,
            2 => Command::Close,
            3 => Command::Brick,
            4 => Command::ListFiles,
            5 => Command::Shutdown,
            6 => Command::Rotation,
            7 => Command::BatchSize,
            8 => Command::CalcMinMax,
            _ => return None,
        })
    }
}

/// Placement of one remote brick, from the OPEN reply
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RemoteBrickInfo {
    pub lod: u64,
    pub index: u64,
    pub center: [f32; 3],
    pub extents: [f32; 3],
    pub n_voxels: [u32; 3],
}

/// Everything the server tells a client about an opened dataset
#[derive(Clone, Debug)]
pub struct RemoteMetadata {
    pub filename: String,
    pub lod_count: u64,
    pub voxel_type: VoxelType,
    pub component_count: u64,
    /// bricks per axis, per LOD
    pub layouts: Vec<[u64; 3]>,
    /// voxels per axis, per LOD
    pub domain_sizes: Vec<[u64; 3]>,
    pub overlap: [u32; 3],
    pub range: (f64, f64),
    pub bricks: Vec<RemoteBrickInfo>,
    pub max_gradient: f32,
}

impl RemoteMetadata {
    pub fn brick_info(&self, lod: u64, index: u64) -> Option<&RemoteBrickInfo> {
        self.bricks
            .iter()
            .find(|b| b.lod == lod && b.index == index)
    }

    /// Uncompressed byte size of one brick
    pub fn brick_bytes(&self, lod: u64, index: u64) -> Option<usize> {
        let info = self.brick_info(lod, index)?;
        let voxels: u64 = info.n_voxels.iter().map(|&n| n as u64).product();
        Some(voxels as usize * self.voxel_type.size_of() * self.component_count as usize)
    }

    /// Serialize as the OPEN reply body (the filename travels in the
    /// request, not the reply)
    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        wire::wr_u64(w, self.lod_count)?;
        wire::wr_u8(w, self.voxel_type.tag() as u8)?;
        wire::wr_u64(w, self.component_count)?;
        for l in &self.layouts {
            wire::wr_u64s(w, l)?;
        }
        for d in &self.domain_sizes {
            wire::wr_u64s(w, d)?;
        }
        wire::wr_u32s(w, &self.overlap)?;
        wire::wr_f64(w, self.range.0)?;
        wire::wr_f64(w, self.range.1)?;

        wire::wr_u64(w, self.bricks.len() as u64)?;
        for b in &self.bricks {
            wire::wr_u64(w, b.lod)?;
        }
        for b in &self.bricks {
            wire::wr_u64(w, b.index)?;
        }
        for b in &self.bricks {
            wire::wr_f32s(w, &b.center)?;
        }
        for b in &self.bricks {
            wire::wr_f32s(w, &b.extents)?;
        }
        for b in &self.bricks {
            wire::wr_u32s(w, &b.n_voxels)?;
        }
        wire::wr_f32(w, self.max_gradient)
    }

    pub fn read(r: &mut impl Read, filename: String) -> Result<Self> {
        let lod_count = wire::rd_u64(r)?;
        if lod_count == 0 || lod_count > 64 {
            return Err(Error::Unsupported(format!(
                "server reported {lod_count} LODs"
            )));
        }
        let type_tag = wire::rd_u8(r)?;
        let voxel_type = VoxelType::from_tag(type_tag as u64).ok_or_else(|| {
            Error::Unsupported(format!("server reported component type {type_tag}"))
        })?;
        let component_count = wire::rd_u64(r)?;

        let mut layouts = Vec::with_capacity(lod_count as usize);
        for _ in 0..lod_count {
            let v = wire::rd_u64s(r, 3)?;
            layouts.push([v[0], v[1], v[2]]);
        }
        let mut domain_sizes = Vec::with_capacity(lod_count as usize);
        for _ in 0..lod_count {
            let v = wire::rd_u64s(r, 3)?;
            domain_sizes.push([v[0], v[1], v[2]]);
        }
        let ov = wire::rd_u32s(r, 3)?;
        let range = (wire::rd_f64(r)?, wire::rd_f64(r)?);

        let n = wire::rd_u64(r)? as usize;
        let lods = wire::rd_u64s(r, n)?;
        let idxs = wire::rd_u64s(r, n)?;
        let centers = wire::rd_f32s(r, n * 3)?;
        let extents = wire::rd_f32s(r, n * 3)?;
        let n_voxels = wire::rd_u32s(r, n * 3)?;
        let max_gradient = wire::rd_f32(r)?;

        let bricks = (0..n)
            .map(|i| RemoteBrickInfo {
                lod: lods[i],
                index: idxs[i],
                center: [centers[i * 3], centers[i * 3 + 1], centers[i * 3 + 2]],
                extents: [extents[i * 3], extents[i * 3 + 1], extents[i * 3 + 2]],
                n_voxels: [n_voxels[i * 3], n_voxels[i * 3 + 1], n_voxels[i * 3 + 2]],
            })
            .collect();

        Ok(Self {
            filename,
            lod_count,
            voxel_type,
            component_count,
            layouts,
            domain_sizes,
            overlap: [ov[0], ov[1], ov[2]],
            range,
            bricks,
            max_gradient,
        })
    }
}

/// One row of the CALC_MINMAX reply tables
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MinMaxRecord {
    pub lod: u64,
    pub index: u64,
    pub min_scalar: f64,
    pub max_scalar: f64,
    pub min_gradient: f64,
    pub max_gradient: f64,
}

/// Write the CALC_MINMAX reply: a count followed by parallel tables
pub fn write_minmax_tables(w: &mut impl Write, records: &[MinMaxRecord]) -> Result<()> {
    wire::wr_u64(w, records.len() as u64)?;
    for r in records {
        wire::wr_u64(w, r.lod)?;
    }
    for r in records {
        wire::wr_u64(w, r.index)?;
    }
    for r in records {
        wire::wr_f64(w, r.min_scalar)?;
    }
    for r in records {
        wire::wr_f64(w, r.max_scalar)?;
    }
    for r in records {
        wire::wr_f64(w, r.min_gradient)?;
    }
    for r in records {
        wire::wr_f64(w, r.max_gradient)?;
    }
    Ok(())
}

pub fn read_minmax_tables(r: &mut impl Read) -> Result<Vec<MinMaxRecord>> {
    let n = wire::rd_u64(r)? as usize;
    let lods = wire::rd_u64s(r, n)?;
    let idxs = wire::rd_u64s(r, n)?;
    let mins = wire::rd_f64s(r, n)?;
    let maxes = wire::rd_f64s(r, n)?;
    let min_grads = wire::rd_f64s(r, n)?;
    let max_grads = wire::rd_f64s(r, n)?;
    Ok((0..n)
        .map(|i| MinMaxRecord {
            lod: lods[i],
            index: idxs[i],
            min_scalar: mins[i],
            max_scalar: maxes[i],
            min_gradient: min_grads[i],
            max_gradient: max_grads[i],
        })
        .collect())
}

/// Header of one pushed batch on the batch stream
#[derive(Clone, Debug, PartialEq)]
pub struct BatchHeader {
    pub more_coming: bool,
    /// `(lod, index, byte_size)` per brick, in delivery order
    pub bricks: Vec<(u64, u64, u64)>,
}

impl BatchHeader {
    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        wire::wr_u64(w, self.bricks.len() as u64)?;
        wire::wr_u8(w, self.more_coming as u8)?;
        for &(lod, index, bytes) in &self.bricks {
            wire::wr_u64(w, lod)?;
            wire::wr_u64(w, index)?;
            wire::wr_u64(w, bytes)?;
        }
        Ok(())
    }

    /// Read the remainder of a batch header after its size word
    pub fn read_after_size(r: &mut impl Read, batch_size: u64) -> Result<Self> {
        let more_coming = wire::rd_u8(r)? == 1;
        let mut bricks = Vec::with_capacity(batch_size as usize);
        for _ in 0..batch_size {
            bricks.push((wire::rd_u64(r)?, wire::rd_u64(r)?, wire::rd_u64(r)?));
        }
        Ok(Self {
            more_coming,
            bricks,
        })
    }
}
