//! 1D and 2D histogram blocks
//!
//! Both are computed from the non-ghost voxels of one LOD of an octree.
//! Histograms only exist for single-component integer data of at most 32
//! bits; anything else yields `Unsupported`, which callers treat as "no
//! histogram block" rather than a failure.

use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{BlockSemantic, ContainerWriter};
use crate::core::error::{Error, Result};
use crate::core::types::{VoxelScalar, VoxelType, cast_voxels};
use crate::dispatch_voxel_type;
use crate::io::RawFile;
use crate::octree::Octree;

fn check_supported(tree: &Octree) -> Result<()> {
    let vt = tree.voxel_type();
    if vt.is_float() || vt.size_of() > 4 || tree.component_count() != 1 {
        return Err(Error::Unsupported(
            "histograms require single-component integer data of at most 32 bits".into(),
        ));
    }
    Ok(())
}

/// Bias that maps a (possibly signed) voxel value onto a non-negative bin
pub(crate) fn signed_bias(vt: VoxelType) -> i64 {
    match vt {
        VoxelType::I8 => 1 << 7,
        VoxelType::I16 => 1 << 15,
        VoxelType::I32 => 1 << 31,
        _ => 0,
    }
}

/// Value histogram with one bin per representable value, truncated after
/// the last non-zero bin.
#[derive(Clone, Debug, Default)]
pub struct Histogram1D {
    bins: Vec<u64>,
}

impl Histogram1D {
    pub fn bins(&self) -> &[u64] {
        &self.bins
    }

    pub fn compute(tree: &Octree, lod: u64) -> Result<Self> {
        check_supported(tree)?;
        let vt = tree.voxel_type();
        let bias = signed_bias(vt);
        let mut bins = vec![0u64; 1usize << vt.bit_width()];

        let count = tree.brick_count(lod);
        let o = tree.overlap() as u64;
        let mut data = vec![0u8; tree.max_brick_bytes() as usize];
        for bz in 0..count[2] {
            for by in 0..count[1] {
                for bx in 0..count[0] {
                    let coords = [bx, by, bz, lod];
                    let bsize = tree.compute_brick_size(coords);
                    let bytes = tree.brick_bytes(coords) as usize;
                    tree.get_brick_data(&mut data[..bytes], coords)?;

                    dispatch_voxel_type!(vt, T => {
                        let voxels = cast_voxels::<T>(&data[..bytes]);
                        for z in o..bsize[2] - o {
                            for y in o..bsize[1] - o {
                                for x in o..bsize[0] - o {
                                    let v = voxels
                                        [(z * bsize[1] * bsize[0] + y * bsize[0] + x) as usize];
                                    let bin = (v.to_f64() as i64 + bias) as usize;
                                    bins[bin] += 1;
                                }
                            }
                        }
                    });
                }
            }
        }

        // truncate after the last used bin
        let used = bins
            .iter()
            .rposition(|&b| b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        bins.truncate(used);
        Ok(Self { bins })
    }

    /// Fold contiguous bins in integer-ratio groups until the histogram is
    /// no longer than `max_target`. Idempotent once it fits.
    pub fn compress(&mut self, max_target: usize) -> usize {
        if self.bins.len() > max_target && max_target > 0 {
            let reduction = self.bins.len().div_ceil(max_target);
            let new_len = self.bins.len().div_ceil(reduction);
            let mut folded = vec![0u64; new_len];
            for (i, bin) in folded.iter_mut().enumerate() {
                for j in 0..reduction {
                    if let Some(&b) = self.bins.get(i * reduction + j) {
                        *bin += b;
                    }
                }
            }
            self.bins = folded;
        }
        self.bins.len()
    }

    pub fn write_block(&self, w: &mut ContainerWriter) -> Result<()> {
        w.begin_block("1D Histogram", BlockSemantic::Histogram1D)?;
        let f = w.file_mut();
        f.write_u64(self.bins.len() as u64)?;
        f.write_u64s(&self.bins)
    }

    /// Read the payload; the file must be positioned at the payload start
    pub fn read_payload(f: &mut RawFile) -> Result<Self> {
        let n = f.read_u64()? as usize;
        Ok(Self {
            bins: f.read_u64s(n)?,
        })
    }
}

/// Scalar-value x gradient-magnitude histogram.
///
/// The gradient axis always has 256 bins; the scalar axis is configurable
/// and rescaled against the largest non-zero value of the dataset. Built in
/// two sweeps: the first finds the maximum gradient magnitude, the second
/// populates the table. Both sweeps run in parallel over the outermost
/// brick axis; the table uses element-wise atomic increments.
#[derive(Clone, Debug)]
pub struct Histogram2D {
    /// scalar-major: `bins[scalar * 256 + gradient]`
    bins: Vec<u64>,
    scalar_bins: usize,
    max_gradient: f32,
}

impl Histogram2D {
    pub const GRADIENT_BINS: usize = 256;

    pub fn scalar_bins(&self) -> usize {
        self.scalar_bins
    }

    pub fn max_gradient(&self) -> f32 {
        self.max_gradient
    }

    pub fn get(&self, scalar: usize, gradient: usize) -> u64 {
        self.bins[scalar * Self::GRADIENT_BINS + gradient]
    }

    pub fn bins(&self) -> &[u64] {
        &self.bins
    }

    pub fn compute(
        tree: &Octree,
        lod: u64,
        scalar_bin_count: usize,
        max_nonzero_value: f64,
    ) -> Result<Self> {
        check_supported(tree)?;
        let vt = tree.voxel_type();
        let count = tree.brick_count(lod);

        // first sweep: the global maximum gradient magnitude
        let slab_maxes: Vec<f64> = (0..count[2])
            .into_par_iter()
            .map(|bz| -> Result<f64> {
                let mut slab_max = 0.0f64;
                let mut data = vec![0u8; tree.max_brick_bytes() as usize];
                for by in 0..count[1] {
                    for bx in 0..count[0] {
                        let coords = [bx, by, bz, lod];
                        let bytes = tree.brick_bytes(coords) as usize;
                        tree.get_brick_data(&mut data[..bytes], coords)?;
                        dispatch_voxel_type!(vt, T => {
                            scan_gradients::<T>(
                                &cast_voxels::<T>(&data[..bytes]),
                                tree.compute_brick_size(coords),
                                tree.overlap() as u64,
                                vt.dynamic_range(),
                                &mut |mag, _| slab_max = slab_max.max(mag),
                            )
                        });
                    }
                }
                Ok(slab_max)
            })
            .collect::<Result<_>>()?;
        let max_gradient = slab_maxes.into_iter().fold(0.0f64, f64::max);

        // second sweep: populate the table
        let bins: Vec<AtomicU64> = (0..scalar_bin_count * Self::GRADIENT_BINS)
            .map(|_| AtomicU64::new(0))
            .collect();
        let bias = signed_bias(vt) as f64;
        (0..count[2])
            .into_par_iter()
            .try_for_each(|bz| -> Result<()> {
                let mut data = vec![0u8; tree.max_brick_bytes() as usize];
                for by in 0..count[1] {
                    for bx in 0..count[0] {
                        let coords = [bx, by, bz, lod];
                        let bytes = tree.brick_bytes(coords) as usize;
                        tree.get_brick_data(&mut data[..bytes], coords)?;
                        dispatch_voxel_type!(vt, T => {
                            scan_gradients::<T>(
                                &cast_voxels::<T>(&data[..bytes]),
                                tree.compute_brick_size(coords),
                                tree.overlap() as u64,
                                vt.dynamic_range(),
                                &mut |mag, value| {
                                    let v = value + bias;
                                    let last = (scalar_bin_count - 1) as f64;
                                    let scalar = if max_nonzero_value <= last {
                                        (v.max(0.0) as usize).min(scalar_bin_count - 1)
                                    } else {
                                        ((v.max(0.0) * last / max_nonzero_value) as usize)
                                            .min(scalar_bin_count - 1)
                                    };
                                    let grad = if max_gradient > 0.0 {
                                        ((mag / max_gradient * 255.0) as usize).min(255)
                                    } else {
                                        0
                                    };
                                    bins[scalar * Self::GRADIENT_BINS + grad]
                                        .fetch_add(1, Ordering::Relaxed);
                                },
                            )
                        });
                    }
                }
                Ok(())
            })?;

        Ok(Self {
            bins: bins.into_iter().map(|b| b.into_inner()).collect(),
            scalar_bins: scalar_bin_count,
            max_gradient: max_gradient as f32,
        })
    }

    pub fn write_block(&self, w: &mut ContainerWriter) -> Result<()> {
        w.begin_block("2D Histogram", BlockSemantic::Histogram2D)?;
        let f = w.file_mut();
        f.write_f32(self.max_gradient)?;
        f.write_u64(self.scalar_bins as u64)?;
        f.write_u64(Self::GRADIENT_BINS as u64)?;
        f.write_u64s(&self.bins)
    }

    /// Read the payload; the file must be positioned at the payload start
    pub fn read_payload(f: &mut RawFile) -> Result<Self> {
        let max_gradient = f.read_f32()?;
        let nx = f.read_u64()? as usize;
        let ny = f.read_u64()? as usize;
        if ny != Self::GRADIENT_BINS {
            return Err(Error::format_invalid(
                f.path(),
                format!("2D histogram gradient axis has {ny} bins"),
            ));
        }
        Ok(Self {
            bins: f.read_u64s(nx * ny)?,
            scalar_bins: nx,
            max_gradient,
        })
    }
}

/// Visit every non-ghost voxel of a brick with its central-difference
/// gradient magnitude (normalized by the dynamic range) and scalar value.
fn scan_gradients<T: VoxelScalar>(
    voxels: &[T],
    bsize: [u64; 3],
    overlap: u64,
    dynamic_range: f64,
    visit: &mut dyn FnMut(f64, f64),
) {
    let (nx, ny, nz) = (bsize[0], bsize[1], bsize[2]);
    let at = |x: u64, y: u64, z: u64| voxels[(z * ny * nx + y * nx + x) as usize].to_f64();

    for z in overlap..nz - overlap {
        for y in overlap..ny - overlap {
            for x in overlap..nx - overlap {
                let mut g = [0.0f64; 3];
                let pos = [x, y, z];
                let dim = [nx, ny, nz];
                for d in 0..3 {
                    let mut scale = 0.0;
                    let mut lo = pos;
                    let mut hi = pos;
                    if pos[d] > 0 {
                        lo[d] -= 1;
                        scale += 1.0;
                    }
                    if pos[d] < dim[d] - 1 {
                        hi[d] += 1;
                        scale += 1.0;
                    }
                    if scale > 0.0 {
                        g[d] = (at(lo[0], lo[1], lo[2]) - at(hi[0], hi[1], hi[2]))
                            / (dynamic_range * scale);
                    }
                }
                let mag = (g[0] * g[0] + g[1] * g[1] + g[2] * g[2]).sqrt();
                visit(mag, at(x, y, z));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::octree::{ConvertConfig, Converter};
    use glam::DVec3;
    use tempfile::tempdir;

    fn build_tree(dir: &std::path::Path, data: &[u8], size: [u64; 3]) -> Octree {
        let input = dir.join("in.raw");
        let mut f = RawFile::create(&input).unwrap();
        f.write_all(data).unwrap();
        drop(f);
        let mut conv = Converter::new(ConvertConfig {
            max_brick_size: [8, 8, 8],
            overlap: 0,
            ..Default::default()
        })
        .unwrap();
        conv.convert_paths(
            &input,
            0,
            VoxelType::U8,
            1,
            size,
            DVec3::ONE,
            dir.join("out.oct"),
            0,
            false,
        )
        .unwrap()
        .0
    }

    #[test]
    fn test_1d_counts_every_voxel() {
        let dir = tempdir().unwrap();
        let size = [8u64, 8, 8];
        let data: Vec<u8> = (0..512).map(|i| if i % 2 == 0 { 3 } else { 10 }).collect();
        let tree = build_tree(dir.path(), &data, size);

        let hist = Histogram1D::compute(&tree, 0).unwrap();
        assert_eq!(hist.bins().len(), 11); // truncated after bin 10
        assert_eq!(hist.bins()[3], 256);
        assert_eq!(hist.bins()[10], 256);
        assert_eq!(hist.bins()[4], 0);
        assert_eq!(hist.bins().iter().sum::<u64>(), 512);
    }

    #[test]
    fn test_1d_compress_is_idempotent() {
        let mut hist = Histogram1D {
            bins: (0..100u64).collect(),
        };
        let total: u64 = hist.bins().iter().sum();
        let len = hist.compress(16);
        assert!(len <= 16);
        assert_eq!(hist.bins().iter().sum::<u64>(), total);

        let bins_before = hist.bins().to_vec();
        hist.compress(16);
        assert_eq!(hist.bins(), &bins_before[..]);
    }

    #[test]
    fn test_1d_rejects_floats() {
        let dir = tempdir().unwrap();
        let size = [4u64, 4, 4];
        let input = dir.path().join("in.raw");
        let mut f = RawFile::create(&input).unwrap();
        f.write_all(&vec![0u8; 4 * 4 * 4 * 4]).unwrap();
        drop(f);
        let mut conv = Converter::new(ConvertConfig {
            max_brick_size: [4, 4, 4],
            overlap: 0,
            ..Default::default()
        })
        .unwrap();
        let (tree, _) = conv
            .convert_paths(
                &input,
                0,
                VoxelType::F32,
                1,
                size,
                DVec3::ONE,
                dir.path().join("out.oct"),
                0,
                false,
            )
            .unwrap();
        assert!(matches!(
            Histogram1D::compute(&tree, 0),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            Histogram2D::compute(&tree, 0, 256, 255.0),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_2d_uniform_volume_has_zero_gradient() {
        let dir = tempdir().unwrap();
        let size = [8u64, 8, 8];
        let data = vec![42u8; 512];
        let tree = build_tree(dir.path(), &data, size);

        let hist = Histogram2D::compute(&tree, 0, 256, 255.0).unwrap();
        assert_eq!(hist.max_gradient(), 0.0);
        assert_eq!(hist.get(42, 0), 512);
        assert_eq!(hist.bins().iter().sum::<u64>(), 512);
    }

    #[test]
    fn test_2d_step_volume_fills_gradient_bins() {
        let dir = tempdir().unwrap();
        let size = [8u64, 8, 8];
        // step along x: half 0, half 200
        let mut data = vec![0u8; 512];
        for z in 0..8 {
            for y in 0..8 {
                for x in 4..8 {
                    data[z * 64 + y * 8 + x] = 200;
                }
            }
        }
        let tree = build_tree(dir.path(), &data, size);

        let hist = Histogram2D::compute(&tree, 0, 256, 255.0).unwrap();
        assert!(hist.max_gradient() > 0.0);
        // flat voxels far from the step have zero gradient
        assert!(hist.get(0, 0) > 0);
        assert!(hist.get(200, 0) > 0);
        // voxels at the step land in the top gradient bin
        assert!(hist.get(0, 255) > 0 || hist.get(200, 255) > 0);
        assert_eq!(hist.bins().iter().sum::<u64>(), 512);
    }

    #[test]
    fn test_roundtrip_blocks() {
        let dir = tempdir().unwrap();
        let size = [8u64, 8, 8];
        let data: Vec<u8> = (0..512).map(|i| (i % 17) as u8).collect();
        let tree = build_tree(dir.path(), &data, size);

        let h1 = Histogram1D::compute(&tree, 0).unwrap();
        let h2 = Histogram2D::compute(&tree, 0, 64, 16.0).unwrap();

        let path = dir.path().join("hist.vxt");
        let mut w =
            crate::container::ContainerWriter::create(&path, crate::container::ChecksumScheme::None)
                .unwrap();
        h1.write_block(&mut w).unwrap();
        h2.write_block(&mut w).unwrap();
        w.finish().unwrap();

        let r = crate::container::ContainerReader::open(&path).unwrap();
        let file = r.file();
        let mut f = file.lock().unwrap();

        let info = r.find(BlockSemantic::Histogram1D).unwrap();
        f.seek_to(info.payload_offset).unwrap();
        let h1b = Histogram1D::read_payload(&mut f).unwrap();
        assert_eq!(h1b.bins(), h1.bins());

        let info = r.find(BlockSemantic::Histogram2D).unwrap();
        f.seek_to(info.payload_offset).unwrap();
        let h2b = Histogram2D::read_payload(&mut f).unwrap();
        assert_eq!(h2b.bins(), h2.bins());
        assert_eq!(h2b.scalar_bins(), 64);
        assert_eq!(h2b.max_gradient(), h2.max_gradient());
    }
}
