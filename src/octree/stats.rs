//! Per-brick statistics computed at write time

use crate::container::maxmin::MinMax;
use crate::core::types::{VoxelScalar, VoxelType, cast_voxels};
use crate::dispatch_voxel_type;

/// Compute per-component `{min, max, min_gradient, max_gradient}` for one
/// brick body.
///
/// Scalar extrema cover every voxel including the ghost border. Gradient
/// magnitudes use central differences on the inner voxels, normalized by the
/// component's dynamic range; voxels on the brick faces contribute a
/// gradient of 0. Bricks too thin for a central difference keep the
/// gradient sentinels except for that edge 0.
pub fn compute_brick_stats(
    voxel_type: VoxelType,
    data: &[u8],
    brick_size: [u64; 3],
    components: usize,
) -> Vec<MinMax> {
    dispatch_voxel_type!(voxel_type, T => {
        compute_typed::<T>(
            &cast_voxels::<T>(data),
            brick_size,
            components,
            voxel_type.dynamic_range(),
        )
    })
}

fn compute_typed<T: VoxelScalar>(
    data: &[T],
    brick_size: [u64; 3],
    components: usize,
    dynamic_range: f64,
) -> Vec<MinMax> {
    let (nx, ny, nz) = (
        brick_size[0] as usize,
        brick_size[1] as usize,
        brick_size[2] as usize,
    );
    debug_assert_eq!(data.len(), nx * ny * nz * components);

    let mut stats = vec![MinMax::default(); components];
    if data.is_empty() {
        return stats;
    }

    for (i, &v) in data.iter().enumerate() {
        let mm = &mut stats[i % components];
        let v = v.to_f64();
        mm.min_scalar = mm.min_scalar.min(v);
        mm.max_scalar = mm.max_scalar.max(v);
    }

    // face voxels count as zero gradient
    for mm in stats.iter_mut() {
        mm.min_gradient = mm.min_gradient.min(0.0);
        mm.max_gradient = mm.max_gradient.max(0.0);
    }
    if nx < 3 || ny < 3 || nz < 3 {
        return stats;
    }

    let at = |x: usize, y: usize, z: usize, c: usize| {
        data[((z * ny + y) * nx + x) * components + c].to_f64()
    };
    let norm = 2.0 * dynamic_range;

    for z in 1..nz - 1 {
        for y in 1..ny - 1 {
            for x in 1..nx - 1 {
                for c in 0..components {
                    let gx = (at(x + 1, y, z, c) - at(x - 1, y, z, c)) / norm;
                    let gy = (at(x, y + 1, z, c) - at(x, y - 1, z, c)) / norm;
                    let gz = (at(x, y, z + 1, c) - at(x, y, z - 1, c)) / norm;
                    let mag = (gx * gx + gy * gy + gz * gz).sqrt();
                    if mag.is_finite() {
                        let mm = &mut stats[c];
                        mm.min_gradient = mm.min_gradient.min(mag);
                        mm.max_gradient = mm.max_gradient.max(mag);
                    }
                }
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_extrema() {
        let data: Vec<u8> = vec![5, 200, 17, 42, 0, 255, 9, 9];
        let stats = compute_brick_stats(VoxelType::U8, &data, [2, 2, 2], 1);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].min_scalar, 0.0);
        assert_eq!(stats[0].max_scalar, 255.0);
        // too thin for a central difference: only the edge zero
        assert_eq!(stats[0].min_gradient, 0.0);
        assert_eq!(stats[0].max_gradient, 0.0);
    }

    #[test]
    fn test_per_component() {
        // two components interleaved; component 1 always larger
        let mut data = Vec::new();
        for i in 0..8u8 {
            data.push(i);
            data.push(100 + i);
        }
        let stats = compute_brick_stats(VoxelType::U8, &data, [2, 2, 2], 2);
        assert_eq!(stats[0].max_scalar, 7.0);
        assert_eq!(stats[1].min_scalar, 100.0);
        assert_eq!(stats[1].max_scalar, 107.0);
    }

    #[test]
    fn test_gradient_of_ramp() {
        // 3x3x3 linear ramp along x: inner voxel has |g| = 1/255
        let mut data = vec![0u8; 27];
        for z in 0..3 {
            for y in 0..3 {
                for x in 0..3 {
                    data[(z * 3 + y) * 3 + x] = (x as u8) * 2;
                }
            }
        }
        let stats = compute_brick_stats(VoxelType::U8, &data, [3, 3, 3], 1);
        let expected = 4.0 / (2.0 * 255.0);
        assert!((stats[0].max_gradient - expected).abs() < 1e-12);
        assert_eq!(stats[0].min_gradient, 0.0);
    }
}
