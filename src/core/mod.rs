//! Core types, errors, and logging

pub mod error;
pub mod logging;
pub mod types;

pub use error::{Error, Result};
pub use types::VoxelType;
