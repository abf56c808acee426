//! Large-file I/O

pub mod raw_file;
pub mod temp;

pub use raw_file::{Endianness, IoHint, RawFile};
pub use temp::TempRawFile;
