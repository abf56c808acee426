//! Voxel component types and per-type dispatch

use bytemuck::Pod;

/// Scalar component type of a voxel.
///
/// The discriminants are the on-disk tags of the octree header; do not
/// reorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VoxelType {
    U8 = 0,
    U16 = 1,
    U32 = 2,
    U64 = 3,
    I8 = 4,
    I16 = 5,
    I32 = 6,
    I64 = 7,
    F32 = 8,
    F64 = 9,
}

impl VoxelType {
    /// Size of one component in bytes
    pub fn size_of(self) -> usize {
        match self {
            VoxelType::U8 | VoxelType::I8 => 1,
            VoxelType::U16 | VoxelType::I16 => 2,
            VoxelType::U32 | VoxelType::I32 | VoxelType::F32 => 4,
            VoxelType::U64 | VoxelType::I64 | VoxelType::F64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            VoxelType::I8
                | VoxelType::I16
                | VoxelType::I32
                | VoxelType::I64
                | VoxelType::F32
                | VoxelType::F64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, VoxelType::F32 | VoxelType::F64)
    }

    pub fn bit_width(self) -> u32 {
        self.size_of() as u32 * 8
    }

    /// Width of the representable value range, used to normalize gradients.
    /// Floats are treated as unit range.
    pub fn dynamic_range(self) -> f64 {
        match self {
            VoxelType::U8 | VoxelType::I8 => u8::MAX as f64,
            VoxelType::U16 | VoxelType::I16 => u16::MAX as f64,
            VoxelType::U32 | VoxelType::I32 => u32::MAX as f64,
            VoxelType::U64 | VoxelType::I64 => u64::MAX as f64,
            VoxelType::F32 | VoxelType::F64 => 1.0,
        }
    }

    pub fn tag(self) -> u64 {
        self as u64
    }

    pub fn from_tag(tag: u64) -> Option<Self> {
        Some(match tag {
            0 => VoxelType::U8,
            1 => VoxelType::U16,
            2 => VoxelType::U32,
            3 => VoxelType::U64,
            4 => VoxelType::I8,
            5 => VoxelType::I16,
            6 => VoxelType::I32,
            7 => VoxelType::I64,
            8 => VoxelType::F32,
            9 => VoxelType::F64,
            _ => return None,
        })
    }
}

/// A scalar that can live in a brick body.
///
/// Brick bodies are raw byte buffers; `Pod` lets the typed inner loops view
/// them without copying.
pub trait VoxelScalar: Pod + PartialOrd + Copy + Send + Sync + 'static {
    const TYPE: VoxelType;

    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

/// View a byte buffer as voxel scalars, copying only when the buffer is
/// not aligned for `T` (plain `Vec<u8>` buffers guarantee nothing).
pub fn cast_voxels<T: VoxelScalar>(bytes: &[u8]) -> std::borrow::Cow<'_, [T]> {
    match bytemuck::try_cast_slice(bytes) {
        Ok(slice) => std::borrow::Cow::Borrowed(slice),
        Err(_) => std::borrow::Cow::Owned(bytemuck::pod_collect_to_vec(bytes)),
    }
}

macro_rules! impl_voxel_scalar {
    ($($t:ty => $vt:ident),* $(,)?) => {
        $(impl VoxelScalar for $t {
            const TYPE: VoxelType = VoxelType::$vt;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(v: f64) -> Self {
                v as $t
            }
        })*
    };
}

impl_voxel_scalar!(
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    f32 => F32, f64 => F64,
);

/// Monomorphize a block of code over a [`VoxelType`].
///
/// The converter and the scan loops dispatch once per brick, never per
/// voxel:
///
/// ```ignore
/// dispatch_voxel_type!(tree.voxel_type(), T => scan_brick::<T>(&data));
/// ```
#[macro_export]
macro_rules! dispatch_voxel_type {
    ($vt:expr, $T:ident => $body:expr) => {
        match $vt {
            $crate::core::types::VoxelType::U8 => {
                type $T = u8;
                $body
            }
            $crate::core::types::VoxelType::U16 => {
                type $T = u16;
                $body
            }
            $crate::core::types::VoxelType::U32 => {
                type $T = u32;
                $body
            }
            $crate::core::types::VoxelType::U64 => {
                type $T = u64;
                $body
            }
            $crate::core::types::VoxelType::I8 => {
                type $T = i8;
                $body
            }
            $crate::core::types::VoxelType::I16 => {
                type $T = i16;
                $body
            }
            $crate::core::types::VoxelType::I32 => {
                type $T = i32;
                $body
            }
            $crate::core::types::VoxelType::I64 => {
                type $T = i64;
                $body
            }
            $crate::core::types::VoxelType::F32 => {
                type $T = f32;
                $body
            }
            $crate::core::types::VoxelType::F64 => {
                type $T = f64;
                $body
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        for tag in 0..10u64 {
            let vt = VoxelType::from_tag(tag).unwrap();
            assert_eq!(vt.tag(), tag);
        }
        assert!(VoxelType::from_tag(10).is_none());
    }

    #[test]
    fn test_sizes() {
        assert_eq!(VoxelType::U8.size_of(), 1);
        assert_eq!(VoxelType::I16.size_of(), 2);
        assert_eq!(VoxelType::F32.size_of(), 4);
        assert_eq!(VoxelType::F64.size_of(), 8);
    }

    #[test]
    fn test_dispatch() {
        let size = dispatch_voxel_type!(VoxelType::U16, T => std::mem::size_of::<T>());
        assert_eq!(size, 2);
    }
}
