//! Scoped temp files for conversion scratch space

use std::path::{Path, PathBuf};

use crate::core::error::Result;

/// Temp file path deleted on drop unless the caller claims it
pub struct TempRawFile {
    path: PathBuf,
    keep: bool,
}

impl TempRawFile {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            keep: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand ownership of the file to the caller
    pub fn into_path(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for TempRawFile {
    fn drop(&mut self) {
        if !self.keep
            && self.path.exists()
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            log::warn!("leaking temp file {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_deleted_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guarded.tmp");
        {
            let guard = TempRawFile::create(&path).unwrap();
            std::fs::write(guard.path(), b"scratch").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_claimed_path_survives() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kept.tmp");
        let kept = {
            let guard = TempRawFile::create(&path).unwrap();
            std::fs::write(guard.path(), b"scratch").unwrap();
            guard.into_path()
        };
        assert!(kept.exists());
    }
}
