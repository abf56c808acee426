//! Legacy N-dimensional raster data block
//!
//! The predecessor of the TOC octree: arbitrary-dimensional domains diced
//! into bricks with explicit per-LOD brick-count, brick-size, and offset
//! tables. Adjacent bricks share `overlap[d]` voxels one-sidedly (the tail
//! of a brick is the head of its successor). Coarser levels are produced by
//! sub-sampling a temp RAW file through a user combine callback, then
//! re-bricking the result.

use crate::container::{BlockSemantic, ContainerWriter};
use crate::core::error::{Error, Result};
use crate::core::types::{VoxelScalar, VoxelType, cast_voxels};
use crate::dispatch_voxel_type;
use crate::io::{RawFile, TempRawFile};

/// Per-component element description
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementInfo {
    pub bit_size: u64,
    pub mantissa: u64,
    pub signed: bool,
}

impl ElementInfo {
    pub fn from_voxel_type(vt: VoxelType) -> Self {
        Self {
            bit_size: vt.bit_width() as u64,
            mantissa: match vt {
                VoxelType::F32 => 23,
                VoxelType::F64 => 52,
                _ => 0,
            },
            signed: vt.is_signed(),
        }
    }
}

/// Combine callback: gathers the source elements at `source_indices`
/// (element indices into the window buffer) into target element `target`
/// of the output scanline.
pub type CombineFn<'a> = dyn FnMut(&[u64], usize, &[u8], &mut [u8]) + 'a;

#[derive(Clone, Debug)]
pub struct RasterDataBlock {
    domain_size: Vec<u64>,
    brick_size: Vec<u64>,
    overlap: Vec<u64>,
    elements: Vec<ElementInfo>,
    // derived tables
    lod_domains: Vec<Vec<u64>>,
    /// byte offset of each LOD's first brick, relative to the data start
    lod_offsets: Vec<u64>,
    /// bricks per dimension, per LOD
    brick_counts: Vec<Vec<u64>>,
    /// brick sizes along each dimension, per LOD: `[lod][dim][brick]`
    brick_dim_sizes: Vec<Vec<Vec<u64>>>,
    /// byte offset of each brick within its LOD, canonical order
    brick_offsets: Vec<Vec<u64>>,
}

impl RasterDataBlock {
    /// Build the block description and all derived tables. Fails when any
    /// `brick_size[d] <= overlap[d]` or the element size is not byte-aligned.
    pub fn new(
        domain_size: Vec<u64>,
        brick_size: Vec<u64>,
        overlap: Vec<u64>,
        elements: Vec<ElementInfo>,
    ) -> Result<Self> {
        let dims = domain_size.len();
        if dims == 0
            || brick_size.len() != dims
            || overlap.len() != dims
            || elements.is_empty()
            || domain_size.contains(&0)
        {
            return Err(Error::ConfigInvalid(
                "raster block needs matching non-empty domain/brick/overlap tables".into(),
            ));
        }
        for d in 0..dims {
            if brick_size[d] <= overlap[d] {
                return Err(Error::ConfigInvalid(format!(
                    "brick size {} must exceed overlap {} in dimension {d}",
                    brick_size[d], overlap[d]
                )));
            }
        }
        let bits: u64 = elements.iter().map(|e| e.bit_size).sum();
        if bits == 0 || bits % 8 != 0 {
            return Err(Error::ConfigInvalid(format!(
                "element size of {bits} bits is not byte aligned"
            )));
        }

        let mut block = Self {
            domain_size,
            brick_size,
            overlap,
            elements,
            lod_domains: Vec::new(),
            lod_offsets: Vec::new(),
            brick_counts: Vec::new(),
            brick_dim_sizes: Vec::new(),
            brick_offsets: Vec::new(),
        };
        block.compute_tables();
        Ok(block)
    }

    /// Brick sizes along one dimension, mirroring the classic dicing: every
    /// brick consumes `bs - overlap` fresh voxels and shares `overlap` with
    /// its successor; the last brick takes whatever is left.
    fn compute_bricks_1d(mut size: u64, bs: u64, overlap: u64) -> Vec<u64> {
        let mut bricks = Vec::new();
        if size <= bs {
            bricks.push(size);
            return bricks;
        }
        loop {
            if size + overlap <= bs {
                bricks.push(size);
                break;
            }
            bricks.push(bs);
            size = size + overlap - bs;
            if size <= overlap {
                break;
            }
        }
        bricks
    }

    fn compute_tables(&mut self) {
        let elem = self.element_bytes();
        let mut domain = self.domain_size.clone();
        let mut lod_offset = 0u64;
        loop {
            let per_dim: Vec<Vec<u64>> = domain
                .iter()
                .zip(self.brick_size.iter().zip(self.overlap.iter()))
                .map(|(&size, (&bs, &ov))| Self::compute_bricks_1d(size, bs, ov))
                .collect();
            let counts: Vec<u64> = per_dim.iter().map(|v| v.len() as u64).collect();
            let total: u64 = counts.iter().product();

            let mut offsets = Vec::with_capacity(total as usize);
            let mut cur = 0u64;
            for brick in 0..total {
                offsets.push(cur);
                let idx = Self::delinearize(brick, &counts);
                let voxels: u64 = idx
                    .iter()
                    .enumerate()
                    .map(|(d, &i)| per_dim[d][i as usize])
                    .product();
                cur += voxels * elem;
            }

            let single = counts.iter().all(|&c| c == 1);
            self.lod_domains.push(domain.clone());
            self.lod_offsets.push(lod_offset);
            self.brick_counts.push(counts);
            self.brick_dim_sizes.push(per_dim);
            self.brick_offsets.push(offsets);
            lod_offset += cur;

            if single {
                break;
            }
            for d in domain.iter_mut() {
                *d = (*d / 2).max(1);
            }
        }
    }

    fn delinearize(mut index: u64, counts: &[u64]) -> Vec<u64> {
        let mut idx = Vec::with_capacity(counts.len());
        for &c in counts {
            idx.push(index % c);
            index /= c;
        }
        idx
    }

    fn linearize(idx: &[u64], counts: &[u64]) -> u64 {
        let mut linear = 0u64;
        for d in (0..counts.len()).rev() {
            linear = linear * counts[d] + idx[d];
        }
        linear
    }

    // --- queries ---

    pub fn dimensions(&self) -> usize {
        self.domain_size.len()
    }

    pub fn domain_size(&self) -> &[u64] {
        &self.domain_size
    }

    pub fn elements(&self) -> &[ElementInfo] {
        &self.elements
    }

    pub fn element_bytes(&self) -> u64 {
        self.elements.iter().map(|e| e.bit_size).sum::<u64>() / 8
    }

    pub fn lod_count(&self) -> usize {
        self.lod_domains.len()
    }

    pub fn lod_domain(&self, lod: usize) -> &[u64] {
        &self.lod_domains[lod]
    }

    pub fn brick_count(&self, lod: usize) -> &[u64] {
        &self.brick_counts[lod]
    }

    pub fn brick_size(&self, lod: usize, brick: &[u64]) -> Vec<u64> {
        brick
            .iter()
            .enumerate()
            .map(|(d, &i)| self.brick_dim_sizes[lod][d][i as usize])
            .collect()
    }

    /// First domain voxel covered by a brick, per dimension
    pub fn brick_start(&self, dim: usize, brick_index: u64) -> u64 {
        brick_index * (self.brick_size[dim] - self.overlap[dim])
    }

    /// Byte offset of a brick body relative to the data start
    pub fn brick_offset(&self, lod: usize, brick: &[u64]) -> u64 {
        let linear = Self::linearize(brick, &self.brick_counts[lod]);
        self.lod_offsets[lod] + self.brick_offsets[lod][linear as usize]
    }

    /// The coarsest LOD, which always holds a single brick
    pub fn largest_single_brick_lod(&self) -> usize {
        self.lod_count() - 1
    }

    /// Total payload size in bytes
    pub fn data_size(&self) -> u64 {
        let last = self.lod_count() - 1;
        let counts = &self.brick_counts[last];
        let total: u64 = counts.iter().product();
        let idx = Self::delinearize(total - 1, counts);
        let bytes = self.brick_size(last, &idx).iter().product::<u64>() * self.element_bytes();
        self.lod_offsets[last] + self.brick_offsets[last].last().unwrap() + bytes
    }

    /// Single matching scalar type, when the element table describes one
    pub fn voxel_type(&self) -> Option<VoxelType> {
        let first = self.elements[0];
        if !self.elements.iter().all(|e| *e == first) {
            return None;
        }
        Some(match (first.bit_size, first.signed, first.mantissa > 0) {
            (8, false, false) => VoxelType::U8,
            (8, true, false) => VoxelType::I8,
            (16, false, false) => VoxelType::U16,
            (16, true, false) => VoxelType::I16,
            (32, false, false) => VoxelType::U32,
            (32, true, false) => VoxelType::I32,
            (64, false, false) => VoxelType::U64,
            (64, true, false) => VoxelType::I64,
            (32, true, true) => VoxelType::F32,
            (64, true, true) => VoxelType::F64,
            _ => return None,
        })
    }

    // --- flat <-> bricked ---

    /// Dice the flat voxel stream of one LOD into bricks, walking the domain
    /// scanline by scanline. When `minmax` is given it receives one entry
    /// per brick (scalar extrema only).
    #[allow(clippy::too_many_arguments)]
    pub fn flat_to_bricked(
        &self,
        source: &mut RawFile,
        source_offset: u64,
        lod: usize,
        target: &mut RawFile,
        data_offset: u64,
        mut minmax: Option<&mut crate::container::maxmin::MaxMinBlock>,
        mut histogram: Option<&mut Vec<u64>>,
    ) -> Result<()> {
        let elem = self.element_bytes();
        let domain = &self.lod_domains[lod];
        let counts = self.brick_counts[lod].clone();
        let total: u64 = counts.iter().product();

        let strides = Self::prefix_products(domain);

        for linear in 0..total {
            let brick = Self::delinearize(linear, &counts);
            let bsize = self.brick_size(lod, &brick);
            let start: Vec<u64> = brick
                .iter()
                .enumerate()
                .map(|(d, &i)| self.brick_start(d, i))
                .collect();

            let mut brick_data =
                vec![0u8; (bsize.iter().product::<u64>() * elem) as usize];
            let line = (bsize[0] * elem) as usize;

            // iterate scanlines: all dims above 0
            let scan_counts: Vec<u64> = bsize[1..].to_vec();
            let scanlines: u64 = scan_counts.iter().product();
            for s in 0..scanlines {
                let scan_idx = Self::delinearize(s, &scan_counts);
                let mut src_elem = start[0];
                for (d, &i) in scan_idx.iter().enumerate() {
                    src_elem += (start[d + 1] + i) * strides[d + 1];
                }
                let dst = (s * bsize[0] * elem) as usize;
                source.seek_to(source_offset + src_elem * elem)?;
                source.fill(&mut brick_data[dst..dst + line])?;
            }

            let offset = data_offset + self.brick_offset(lod, &brick);
            target.seek_to(offset)?;
            target.write_all(&brick_data)?;

            if let Some(mm) = minmax.as_deref_mut()
                && let Some(vt) = self.voxel_type()
            {
                let comp = self.elements.len();
                let stats = dispatch_voxel_type!(vt, T => {
                    scalar_extrema::<T>(&cast_voxels::<T>(&brick_data), comp)
                });
                mm.start_new_brick();
                mm.merge(&stats);
            }

            // count each voxel once: bricks own their span minus the shared
            // tail (the last brick keeps everything)
            if let Some(hist) = histogram.as_deref_mut()
                && let Some(vt) = self.voxel_type()
                && !vt.is_float()
                && vt.size_of() <= 4
                && self.elements.len() == 1
            {
                let owned: Vec<u64> = bsize
                    .iter()
                    .enumerate()
                    .map(|(d, &s)| {
                        if brick[d] == counts[d] - 1 { s } else { s - self.overlap[d] }
                    })
                    .collect();
                let owned_data = Self::crop(&brick_data, &bsize, &owned, elem);
                hist.resize(
                    hist.len().max(1usize << vt.bit_width()),
                    0,
                );
                let bias = crate::container::histogram::signed_bias(vt);
                dispatch_voxel_type!(vt, T => {
                    for &v in cast_voxels::<T>(&owned_data).iter() {
                        hist[(v.to_f64() as i64 + bias) as usize] += 1;
                    }
                });
            }
        }
        Ok(())
    }

    /// Reassemble the flat voxel stream of one LOD from its bricks
    pub fn bricked_to_flat(
        &self,
        source: &mut RawFile,
        data_offset: u64,
        lod: usize,
        target: &mut RawFile,
        target_offset: u64,
    ) -> Result<()> {
        let elem = self.element_bytes();
        let domain = &self.lod_domains[lod];
        let counts = self.brick_counts[lod].clone();
        let total: u64 = counts.iter().product();
        let strides = Self::prefix_products(domain);

        for linear in 0..total {
            let brick = Self::delinearize(linear, &counts);
            let bsize = self.brick_size(lod, &brick);
            let start: Vec<u64> = brick
                .iter()
                .enumerate()
                .map(|(d, &i)| self.brick_start(d, i))
                .collect();

            let mut brick_data =
                vec![0u8; (bsize.iter().product::<u64>() * elem) as usize];
            source.seek_to(data_offset + self.brick_offset(lod, &brick))?;
            source.fill(&mut brick_data)?;

            let line = (bsize[0] * elem) as usize;
            let scan_counts: Vec<u64> = bsize[1..].to_vec();
            let scanlines: u64 = scan_counts.iter().product();
            for s in 0..scanlines {
                let scan_idx = Self::delinearize(s, &scan_counts);
                let mut dst_elem = start[0];
                for (d, &i) in scan_idx.iter().enumerate() {
                    dst_elem += (start[d + 1] + i) * strides[d + 1];
                }
                let src = (s * bsize[0] * elem) as usize;
                target.seek_to(target_offset + dst_elem * elem)?;
                target.write_all(&brick_data[src..src + line])?;
            }
        }
        Ok(())
    }

    /// Walk every brick of a LOD and hand `(data, size, domain_offset)` to
    /// the callback. `extra_overlap` keeps up to that many of the shared
    /// trailing voxels per dimension (the full overlap is stored).
    pub fn apply_function(
        &self,
        source: &mut RawFile,
        data_offset: u64,
        lod: usize,
        extra_overlap: u64,
        brick_fn: &mut dyn FnMut(&[u8], &[u64], &[u64]) -> bool,
    ) -> Result<bool> {
        let elem = self.element_bytes();
        let counts = self.brick_counts[lod].clone();
        let total: u64 = counts.iter().product();

        for linear in 0..total {
            let brick = Self::delinearize(linear, &counts);
            let bsize = self.brick_size(lod, &brick);
            let mut brick_data =
                vec![0u8; (bsize.iter().product::<u64>() * elem) as usize];
            source.seek_to(data_offset + self.brick_offset(lod, &brick))?;
            source.fill(&mut brick_data)?;

            // trim the shared tail down to the requested overlap
            let trimmed: Vec<u64> = bsize
                .iter()
                .enumerate()
                .map(|(d, &s)| {
                    let last = brick[d] == counts[d] - 1;
                    let keep = extra_overlap.min(self.overlap[d]);
                    if last { s } else { s - (self.overlap[d] - keep) }
                })
                .collect();
            let trimmed_data = Self::crop(&brick_data, &bsize, &trimmed, elem);

            let start: Vec<u64> = brick
                .iter()
                .enumerate()
                .map(|(d, &i)| self.brick_start(d, i))
                .collect();
            if !brick_fn(&trimmed_data, &trimmed, &start) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Copy the leading `cropped` region out of an N-D buffer
    fn crop(data: &[u8], size: &[u64], cropped: &[u64], elem: u64) -> Vec<u8> {
        if size == cropped {
            return data.to_vec();
        }
        let mut out = vec![0u8; (cropped.iter().product::<u64>() * elem) as usize];
        let line = (cropped[0] * elem) as usize;
        let scan_counts: Vec<u64> = cropped[1..].to_vec();
        let scanlines: u64 = scan_counts.iter().product();
        let strides = Self::prefix_products(size);
        for s in 0..scanlines {
            let scan_idx = Self::delinearize(s, &scan_counts);
            let mut src_elem = 0u64;
            for (d, &i) in scan_idx.iter().enumerate() {
                src_elem += i * strides[d + 1];
            }
            let src = (src_elem * elem) as usize;
            let dst = (s * cropped[0] * elem) as usize;
            out[dst..dst + line].copy_from_slice(&data[src..src + line]);
        }
        out
    }

    fn prefix_products(size: &[u64]) -> Vec<u64> {
        let mut strides = vec![1u64];
        for d in 1..size.len() {
            strides.push(strides[d - 1] * size[d - 1]);
        }
        strides
    }

    // --- subsampling ---

    /// Reduce `source_size` to `target_size` through the combine callback,
    /// reading a sliding window that spans the reduction stride plus one
    /// source scanline so each window yields one output scanline. With
    /// `target` absent the reduction happens in place on `source` (seeks are
    /// saved and restored around window reads).
    pub fn subsample(
        &self,
        source: &mut RawFile,
        source_offset: u64,
        mut target: Option<&mut RawFile>,
        source_size: &[u64],
        target_size: &[u64],
        combine: &mut CombineFn,
    ) -> Result<()> {
        let elem = self.element_bytes();
        let dims = source_size.len();
        debug_assert_eq!(dims, target_size.len());

        let reduction: Vec<u64> = source_size
            .iter()
            .zip(target_size.iter())
            .map(|(&s, &t)| (s / t).max(1))
            .collect();
        let strides = Self::prefix_products(source_size);

        // element offsets of one reduction cell, serialized into the source
        let mut cell_offsets = vec![0u64];
        for d in 0..dims {
            let mut next = Vec::with_capacity(cell_offsets.len() * reduction[d] as usize);
            for step in 0..reduction[d] {
                for &base in &cell_offsets {
                    next.push(base + step * strides[d]);
                }
            }
            cell_offsets = next;
        }
        cell_offsets.sort_unstable();

        // window: the cell span plus the rest of one source scanline
        let window_elems =
            cell_offsets.last().unwrap() + 1 + (source_size[0] - reduction[0]);
        let mut window = vec![0u8; (window_elems * elem) as usize];
        let mut out_line = vec![0u8; (target_size[0] * elem) as usize];
        let mut gathered = vec![0u64; cell_offsets.len()];

        let out_scan_counts: Vec<u64> = target_size[1..].to_vec();
        let out_scanlines: u64 = out_scan_counts.iter().product::<u64>().max(1);

        if target.is_none() {
            source.seek_to(source_offset)?;
        }

        let mut write_pos = 0u64;
        for s in 0..out_scanlines {
            let scan_idx = Self::delinearize(s, &out_scan_counts);
            let mut window_start = 0u64;
            for (d, &i) in scan_idx.iter().enumerate() {
                window_start += i * reduction[d + 1] * strides[d + 1];
            }

            // read the window, preserving the write position when working
            // in place
            match target.as_deref_mut() {
                Some(_) => {
                    source.seek_to(source_offset + window_start * elem)?;
                    source.fill(&mut window)?;
                }
                None => {
                    let pos = source.tell()?;
                    source.seek_to(source_offset + window_start * elem)?;
                    source.fill(&mut window)?;
                    source.seek_to(pos)?;
                }
            }

            for t in 0..target_size[0] {
                for (g, &c) in gathered.iter_mut().zip(cell_offsets.iter()) {
                    *g = c + t * reduction[0];
                }
                combine(&gathered, t as usize, &window, &mut out_line);
            }

            match target.as_deref_mut() {
                Some(out) => {
                    out.seek_to(write_pos)?;
                    out.write_all(&out_line)?;
                }
                None => {
                    source.write_all(&out_line)?;
                }
            }
            write_pos += out_line.len() as u64;
        }
        Ok(())
    }

    /// Mean combine callback for the block's scalar type
    pub fn mean_combine(&self) -> Result<Box<CombineFn<'static>>> {
        let vt = self.voxel_type().ok_or_else(|| {
            Error::Unsupported("mean subsampling needs a uniform scalar element type".into())
        })?;
        let comp = self.elements.len();
        Ok(Box::new(
            move |sources: &[u64], target: usize, input: &[u8], output: &mut [u8]| {
                dispatch_voxel_type!(vt, T => {
                    let scalar = std::mem::size_of::<T>();
                    for c in 0..comp {
                        let sum: f64 = sources
                            .iter()
                            .map(|&s| {
                                let at = (s as usize * comp + c) * scalar;
                                bytemuck::pod_read_unaligned::<T>(&input[at..at + scalar])
                                    .to_f64()
                            })
                            .sum();
                        let v = T::from_f64(sum / sources.len() as f64);
                        let at = (target * comp + c) * scalar;
                        output[at..at + scalar].copy_from_slice(bytemuck::bytes_of(&v));
                    }
                });
            },
        ))
    }

    /// Dice a flat LOD-0 stream into all LOD levels, sub-sampling through a
    /// temp RAW file that is deleted on exit.
    pub fn flat_data_to_bricked_lod(
        &self,
        source: &mut RawFile,
        source_offset: u64,
        target: &mut RawFile,
        data_offset: u64,
        temp_path: impl AsRef<std::path::Path>,
        mut minmax: Option<&mut crate::container::maxmin::MaxMinBlock>,
    ) -> Result<()> {
        self.flat_to_bricked(
            source,
            source_offset,
            0,
            target,
            data_offset,
            minmax.as_deref_mut(),
            None,
        )?;
        if self.lod_count() == 1 {
            return Ok(());
        }

        let elem = self.element_bytes();
        let mut combine = self.mean_combine()?;
        let temp = TempRawFile::create(temp_path.as_ref())?;
        let mut temp_file = RawFile::create(temp.path())?;

        // lod0 -> temp, then keep halving the temp file in place
        self.subsample(
            source,
            source_offset,
            Some(&mut temp_file),
            &self.lod_domains[0],
            &self.lod_domains[1],
            &mut *combine,
        )?;
        self.flat_to_bricked(&mut temp_file, 0, 1, target, data_offset, minmax.as_deref_mut(), None)?;

        for lod in 2..self.lod_count() {
            temp_file.seek_start()?;
            self.subsample(
                &mut temp_file,
                0,
                None,
                &self.lod_domains[lod - 1],
                &self.lod_domains[lod],
                &mut *combine,
            )?;
            let bytes = self.lod_domains[lod].iter().product::<u64>() * elem;
            temp_file.truncate(bytes)?;
            self.flat_to_bricked(
                &mut temp_file,
                0,
                lod,
                target,
                data_offset,
                minmax.as_deref_mut(),
                None,
            )?;
        }
        Ok(())
    }

    // --- container embedding ---

    pub fn write_block(
        &self,
        w: &mut ContainerWriter,
        payload: &mut RawFile,
        payload_offset: u64,
    ) -> Result<()> {
        w.begin_block("Regular N-Dimensional Grid", BlockSemantic::RegularNDGrid)?;
        let f = w.file_mut();
        f.write_u64(self.domain_size.len() as u64)?;
        f.write_u64s(&self.domain_size)?;
        f.write_u64s(&self.brick_size)?;
        f.write_u64s(&self.overlap)?;
        f.write_u64(self.elements.len() as u64)?;
        for e in &self.elements {
            f.write_u64(e.bit_size)?;
            f.write_u64(e.mantissa)?;
            f.write_u8(e.signed as u8)?;
        }
        // stream the bricked payload behind the tables
        let size = self.data_size();
        payload.seek_to(payload_offset)?;
        let mut buf = vec![0u8; 4 << 20];
        let mut remaining = size;
        while remaining > 0 {
            let chunk = remaining.min(buf.len() as u64) as usize;
            payload.fill(&mut buf[..chunk])?;
            f.write_all(&buf[..chunk])?;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    /// Read the tables; the file must be positioned at the payload start.
    /// Returns the block and the offset of its bricked data.
    pub fn read_payload(f: &mut RawFile) -> Result<(Self, u64)> {
        let dims = f.read_u64()? as usize;
        if dims == 0 || dims > 16 {
            return Err(Error::format_invalid(
                f.path(),
                format!("implausible raster dimensionality {dims}"),
            ));
        }
        let domain_size = f.read_u64s(dims)?;
        let brick_size = f.read_u64s(dims)?;
        let overlap = f.read_u64s(dims)?;
        let n_elem = f.read_u64()? as usize;
        let mut elements = Vec::with_capacity(n_elem);
        for _ in 0..n_elem {
            elements.push(ElementInfo {
                bit_size: f.read_u64()?,
                mantissa: f.read_u64()?,
                signed: f.read_u8()? != 0,
            });
        }
        let data_offset = f.tell()?;
        let block = Self::new(domain_size, brick_size, overlap, elements)?;
        Ok((block, data_offset))
    }
}

fn scalar_extrema<T: VoxelScalar>(
    data: &[T],
    components: usize,
) -> Vec<crate::container::maxmin::MinMax> {
    let mut out = vec![crate::container::maxmin::MinMax::default(); components];
    for (i, &v) in data.iter().enumerate() {
        let mm = &mut out[i % components];
        let v = v.to_f64();
        mm.min_scalar = mm.min_scalar.min(v);
        mm.max_scalar = mm.max_scalar.max(v);
        mm.min_gradient = mm.min_gradient.min(0.0);
        mm.max_gradient = mm.max_gradient.max(0.0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn u8_elements() -> Vec<ElementInfo> {
        vec![ElementInfo::from_voxel_type(VoxelType::U8)]
    }

    #[test]
    fn test_brick_dicing_1d() {
        // classic shared-overlap dicing
        assert_eq!(RasterDataBlock::compute_bricks_1d(10, 16, 2), vec![10]);
        assert_eq!(RasterDataBlock::compute_bricks_1d(16, 16, 2), vec![16]);
        assert_eq!(RasterDataBlock::compute_bricks_1d(20, 16, 2), vec![16, 6]);
        assert_eq!(
            RasterDataBlock::compute_bricks_1d(44, 16, 2),
            vec![16, 16, 16]
        );
    }

    #[test]
    fn test_rejects_overlap_geq_brick() {
        assert!(matches!(
            RasterDataBlock::new(vec![32, 32], vec![4, 4], vec![4, 0], u8_elements()),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_tables_cover_all_lods() {
        let block =
            RasterDataBlock::new(vec![32, 32, 8], vec![8, 8, 8], vec![1, 1, 1], u8_elements())
                .unwrap();
        assert!(block.lod_count() >= 2);
        assert_eq!(block.lod_domain(0), &[32, 32, 8]);
        // coarsest level is a single brick
        let last = block.largest_single_brick_lod();
        assert!(block.brick_count(last).iter().all(|&c| c == 1));
        // offsets strictly increase per LOD
        for lod in 1..block.lod_count() {
            assert!(block.lod_offsets[lod] > block.lod_offsets[lod - 1]);
        }
    }

    #[test]
    fn test_flat_bricked_roundtrip() {
        let dir = tempdir().unwrap();
        let domain = vec![13u64, 9, 5];
        let data: Vec<u8> = (0..13 * 9 * 5).map(|i| (i % 251) as u8).collect();

        let mut flat = RawFile::create(dir.path().join("flat.raw")).unwrap();
        flat.write_all(&data).unwrap();

        let block =
            RasterDataBlock::new(domain.clone(), vec![6, 6, 6], vec![1, 1, 1], u8_elements())
                .unwrap();
        let mut bricked = RawFile::create(dir.path().join("bricked.bin")).unwrap();
        block
            .flat_to_bricked(&mut flat, 0, 0, &mut bricked, 0, None, None)
            .unwrap();

        let mut back = RawFile::create(dir.path().join("back.raw")).unwrap();
        block
            .bricked_to_flat(&mut bricked, 0, 0, &mut back, 0)
            .unwrap();
        back.seek_start().unwrap();
        let mut out = vec![0u8; data.len()];
        back.fill(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_flat_to_bricked_collects_minmax() {
        let dir = tempdir().unwrap();
        let domain = vec![8u64, 8];
        let data: Vec<u8> = (0..64).map(|i| i as u8).collect();
        let mut flat = RawFile::create(dir.path().join("flat.raw")).unwrap();
        flat.write_all(&data).unwrap();

        let block =
            RasterDataBlock::new(domain, vec![8, 8], vec![0, 0], u8_elements()).unwrap();
        let mut bricked = RawFile::create(dir.path().join("bricked.bin")).unwrap();
        let mut mm = crate::container::maxmin::MaxMinBlock::new(1);
        block
            .flat_to_bricked(&mut flat, 0, 0, &mut bricked, 0, Some(&mut mm), None)
            .unwrap();

        assert_eq!(mm.brick_count(), 1);
        assert_eq!(mm.get(0, 0).min_scalar, 0.0);
        assert_eq!(mm.get(0, 0).max_scalar, 63.0);
    }

    #[test]
    fn test_flat_to_bricked_histogram_counts_once() {
        let dir = tempdir().unwrap();
        // overlapping bricks along x; every voxel must be counted once
        let domain = vec![10u64, 4];
        let data = vec![7u8; 40];
        let mut flat = RawFile::create(dir.path().join("flat.raw")).unwrap();
        flat.write_all(&data).unwrap();

        let block =
            RasterDataBlock::new(domain, vec![6, 4], vec![2, 0], u8_elements()).unwrap();
        assert_eq!(block.brick_count(0), &[2, 1]);

        let mut bricked = RawFile::create(dir.path().join("bricked.bin")).unwrap();
        let mut hist = Vec::new();
        block
            .flat_to_bricked(&mut flat, 0, 0, &mut bricked, 0, None, Some(&mut hist))
            .unwrap();
        assert_eq!(hist[7], 40);
        assert_eq!(hist.iter().sum::<u64>(), 40);
    }

    #[test]
    fn test_subsample_mean() {
        let dir = tempdir().unwrap();
        // 4x4 checkerboard of 10 and 30: every 2x2 cell averages to 20
        let data: Vec<u8> = (0..16)
            .map(|i| if (i + i / 4) % 2 == 0 { 10 } else { 30 })
            .collect();
        let mut src = RawFile::create(dir.path().join("src.raw")).unwrap();
        src.write_all(&data).unwrap();

        let block =
            RasterDataBlock::new(vec![4, 4], vec![4, 4], vec![0, 0], u8_elements()).unwrap();
        let mut dst = RawFile::create(dir.path().join("dst.raw")).unwrap();
        let mut combine = block.mean_combine().unwrap();
        block
            .subsample(&mut src, 0, Some(&mut dst), &[4, 4], &[2, 2], &mut *combine)
            .unwrap();

        dst.seek_start().unwrap();
        let mut out = [0u8; 4];
        dst.fill(&mut out).unwrap();
        assert_eq!(out, [20, 20, 20, 20]);
    }

    #[test]
    fn test_subsample_in_place() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = vec![8; 64];
        let path = dir.path().join("inplace.raw");
        let mut f = RawFile::create(&path).unwrap();
        f.write_all(&data).unwrap();

        let block =
            RasterDataBlock::new(vec![8, 8], vec![8, 8], vec![0, 0], u8_elements()).unwrap();
        let mut combine = block.mean_combine().unwrap();
        f.seek_start().unwrap();
        block
            .subsample(&mut f, 0, None, &[8, 8], &[4, 4], &mut *combine)
            .unwrap();

        f.seek_start().unwrap();
        let mut out = [0u8; 16];
        f.fill(&mut out).unwrap();
        assert!(out.iter().all(|&v| v == 8));
    }

    #[test]
    fn test_full_pyramid_build_and_apply() {
        let dir = tempdir().unwrap();
        let domain = vec![16u64, 16, 4];
        let data: Vec<u8> = (0..16 * 16 * 4).map(|i| (i % 7) as u8 * 30).collect();
        let mut flat = RawFile::create(dir.path().join("flat.raw")).unwrap();
        flat.write_all(&data).unwrap();

        let block =
            RasterDataBlock::new(domain, vec![8, 8, 4], vec![1, 1, 1], u8_elements()).unwrap();
        let mut bricked = RawFile::create(dir.path().join("bricked.bin")).unwrap();
        block
            .flat_data_to_bricked_lod(
                &mut flat,
                0,
                &mut bricked,
                0,
                dir.path().join("sub.tmp"),
                None,
            )
            .unwrap();
        assert!(!dir.path().join("sub.tmp").exists());

        // LOD 0 reassembles exactly
        let mut back = RawFile::create(dir.path().join("back.raw")).unwrap();
        block
            .bricked_to_flat(&mut bricked, 0, 0, &mut back, 0)
            .unwrap();
        back.seek_start().unwrap();
        let mut out = vec![0u8; data.len()];
        back.fill(&mut out).unwrap();
        assert_eq!(out, data);

        // apply over LOD 0 without the shared tail covers the domain exactly
        let mut voxels = 0u64;
        block
            .apply_function(&mut bricked, 0, 0, 0, &mut |data, size, _start| {
                assert_eq!(data.len() as u64, size.iter().product::<u64>());
                voxels += size.iter().product::<u64>();
                true
            })
            .unwrap();
        assert_eq!(voxels, 16 * 16 * 4);
    }

}
