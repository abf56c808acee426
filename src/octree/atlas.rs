//! 2D texture-atlas packing of brick Z-slices
//!
//! An atlased brick body is a `atlas_w x atlas_h` 2D image whose tiles are
//! the brick's Z-slices, laid out row-major left to right. Packing is a
//! post-pass and only applies to uncompressed bricks; readers de-atlas
//! transparently.

use crate::core::error::{Error, Result};

/// Number of slice tiles per atlas row
fn slices_per_row(brick_size: [u64; 3], atlas_size: [u32; 2]) -> u64 {
    atlas_size[0] as u64 / brick_size[0]
}

/// Check that `atlas_size` can hold every Z-slice of a brick
pub fn atlas_fits(brick_size: [u64; 3], atlas_size: [u32; 2]) -> bool {
    if atlas_size[0] < brick_size[0] as u32 || atlas_size[1] < brick_size[1] as u32 {
        return false;
    }
    let per_row = slices_per_row(brick_size, atlas_size);
    let rows = atlas_size[1] as u64 / brick_size[1];
    per_row * rows >= brick_size[2]
}

/// Byte size of an atlas body
pub fn atlas_bytes(atlas_size: [u32; 2], voxel_size: usize) -> usize {
    atlas_size[0] as usize * atlas_size[1] as usize * voxel_size
}

/// Pack a plain 3D brick into atlas form. `dst` must be
/// [`atlas_bytes`] long; padding bytes are zeroed.
pub fn atlasify(
    src: &[u8],
    brick_size: [u64; 3],
    voxel_size: usize,
    atlas_size: [u32; 2],
    dst: &mut [u8],
) -> Result<()> {
    if !atlas_fits(brick_size, atlas_size) {
        return Err(Error::ConfigInvalid(format!(
            "atlas {atlas_size:?} cannot hold a {brick_size:?} brick"
        )));
    }
    debug_assert_eq!(
        src.len(),
        (brick_size[0] * brick_size[1] * brick_size[2]) as usize * voxel_size
    );
    debug_assert_eq!(dst.len(), atlas_bytes(atlas_size, voxel_size));
    dst.fill(0);

    let (nx, ny, nz) = (brick_size[0], brick_size[1], brick_size[2]);
    let per_row = slices_per_row(brick_size, atlas_size);

    for z in 0..nz {
        let tile_x = (z % per_row) * nx;
        let tile_y = (z / per_row) * ny;
        for y in 0..ny {
            let src_off = ((z * ny + y) * nx) as usize * voxel_size;
            let dst_off = ((tile_y + y) * atlas_size[0] as u64 + tile_x) as usize * voxel_size;
            let line = nx as usize * voxel_size;
            dst[dst_off..dst_off + line].copy_from_slice(&src[src_off..src_off + line]);
        }
    }
    Ok(())
}

/// Unpack an atlas body back into a plain 3D brick
pub fn deatlasify(
    src: &[u8],
    brick_size: [u64; 3],
    voxel_size: usize,
    atlas_size: [u32; 2],
    dst: &mut [u8],
) -> Result<()> {
    if !atlas_fits(brick_size, atlas_size) || src.len() != atlas_bytes(atlas_size, voxel_size) {
        return Err(Error::ConfigInvalid(format!(
            "atlas body {} bytes does not match atlas {atlas_size:?} for brick {brick_size:?}",
            src.len()
        )));
    }
    debug_assert_eq!(
        dst.len(),
        (brick_size[0] * brick_size[1] * brick_size[2]) as usize * voxel_size
    );

    let (nx, ny, nz) = (brick_size[0], brick_size[1], brick_size[2]);
    let per_row = slices_per_row(brick_size, atlas_size);

    for z in 0..nz {
        let tile_x = (z % per_row) * nx;
        let tile_y = (z / per_row) * ny;
        for y in 0..ny {
            let dst_off = ((z * ny + y) * nx) as usize * voxel_size;
            let src_off = ((tile_y + y) * atlas_size[0] as u64 + tile_x) as usize * voxel_size;
            let line = nx as usize * voxel_size;
            dst[dst_off..dst_off + line].copy_from_slice(&src[src_off..src_off + line]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let brick_size = [4u64, 3, 5];
        let voxel_size = 2usize;
        let atlas_size = [8u32, 9]; // 2 x 3 tiles, holds 5 slices

        let n = (brick_size[0] * brick_size[1] * brick_size[2]) as usize * voxel_size;
        let src: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();

        let mut packed = vec![0u8; atlas_bytes(atlas_size, voxel_size)];
        atlasify(&src, brick_size, voxel_size, atlas_size, &mut packed).unwrap();

        let mut back = vec![0u8; n];
        deatlasify(&packed, brick_size, voxel_size, atlas_size, &mut back).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn test_too_small_atlas() {
        assert!(!atlas_fits([4, 4, 5], [8, 8])); // 4 tiles < 5 slices
        assert!(atlas_fits([4, 4, 4], [8, 8]));
        let src = vec![0u8; 4 * 4 * 5];
        let mut dst = vec![0u8; 8 * 8];
        assert!(atlasify(&src, [4, 4, 5], 1, [8, 8], &mut dst).is_err());
    }
}
