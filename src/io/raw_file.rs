//! Random-access large file with endian-aware typed reads and writes
//!
//! `RawFile` wraps a `std::fs::File` with 64-bit offsets, typed scalar and
//! sequence access that transposes to host byte order, advisory access
//! hints, and whole-file copy/compare helpers. Failure is observable through
//! `Result`s and short byte counts; the type panics only on API misuse
//! (I/O on a closed handle).

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::core::error::{Error, Result};

/// Byte order of the data inside a file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    pub fn host() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    pub fn is_big(self) -> bool {
        self == Endianness::Big
    }
}

/// Advisory access-pattern hints
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoHint {
    /// reset back to the default state
    Normal,
    /// going to access this sequentially
    Sequential,
    /// will use this once, then it is useless
    NoReuse,
    /// not needed now, but will be soon
    WillNeed,
    /// no longer need this region
    DontNeed,
}

/// Default block buffer for copy/compare
pub const DEFAULT_COPY_BUFFER: usize = 4 << 20;

pub struct RawFile {
    file: Option<File>,
    path: PathBuf,
    writable: bool,
    endian: Endianness,
}

impl RawFile {
    /// Open an existing file read-only
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| Error::open_failed(&path, e.to_string()))?;
        Ok(Self {
            file: Some(file),
            path,
            writable: false,
            endian: Endianness::default(),
        })
    }

    /// Open an existing file read-write
    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::open_failed(&path, e.to_string()))?;
        Ok(Self {
            file: Some(file),
            path,
            writable: true,
            endian: Endianness::default(),
        })
    }

    /// Create (or truncate) a file for writing
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_size(path, 0)
    }

    /// Create a file and reserve an initial size
    pub fn create_with_size(path: impl AsRef<Path>, initial_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::open_failed(&path, e.to_string()))?;
        if initial_size > 0 {
            file.set_len(initial_size)?;
        }
        Ok(Self {
            file: Some(file),
            path,
            writable: true,
            endian: Endianness::default(),
        })
    }

    /// Open a file read-write positioned at its end
    pub fn append(path: impl AsRef<Path>) -> Result<Self> {
        let mut f = Self::open_rw(path)?;
        f.seek_end()?;
        Ok(f)
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn endianness(&self) -> Endianness {
        self.endian
    }

    pub fn set_endianness(&mut self, endian: Endianness) {
        self.endian = endian;
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    /// Close and delete the file
    pub fn delete(mut self) -> Result<()> {
        self.close();
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Close and reopen read-write, preserving the configured endianness
    pub fn reopen_rw(&mut self) -> Result<()> {
        if self.is_open() && self.writable {
            return Ok(());
        }
        let endian = self.endian;
        let path = self.path.clone();
        *self = Self::open_rw(path)?;
        self.endian = endian;
        Ok(())
    }

    /// Close and reopen read-only, preserving the configured endianness
    pub fn reopen_ro(&mut self) -> Result<()> {
        if self.is_open() && !self.writable {
            return Ok(());
        }
        let endian = self.endian;
        let path = self.path.clone();
        *self = Self::open(path)?;
        self.endian = endian;
        Ok(())
    }

    fn handle(&mut self) -> &mut File {
        self.file.as_mut().expect("I/O on a closed RawFile")
    }

    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.handle().set_len(size)?;
        Ok(())
    }

    pub fn current_size(&self) -> Result<u64> {
        let file = self.file.as_ref().expect("I/O on a closed RawFile");
        Ok(file.metadata()?.len())
    }

    pub fn seek_start(&mut self) -> Result<()> {
        self.handle().seek(SeekFrom::Start(0))?;
        Ok(())
    }

    pub fn seek_end(&mut self) -> Result<u64> {
        Ok(self.handle().seek(SeekFrom::End(0))?)
    }

    pub fn seek_to(&mut self, pos: u64) -> Result<()> {
        self.handle().seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.handle().stream_position()?)
    }

    /// Bulk read; returns the number of bytes actually read, which may be
    /// short at end of file
    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        let file = self.handle();
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Bulk write; returns the number of bytes actually written
    pub fn write_raw(&mut self, buf: &[u8]) -> Result<usize> {
        let file = self.handle();
        let mut total = 0;
        while total < buf.len() {
            match file.write(&buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Read exactly `buf.len()` bytes or fail with `IoShort`
    pub fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        let got = self.read_raw(buf)?;
        if got != buf.len() {
            return Err(Error::IoShort {
                op: "read",
                expected: buf.len() as u64,
                got: got as u64,
            });
        }
        Ok(())
    }

    /// Write all of `buf` or fail with `IoShort`
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let got = self.write_raw(buf)?;
        if got != buf.len() {
            return Err(Error::IoShort {
                op: "write",
                expected: buf.len() as u64,
                got: got as u64,
            });
        }
        Ok(())
    }

    /// Advisory hint about an upcoming access pattern; non-committal
    pub fn hint(&self, hint: IoHint, offset: u64, length: u64) {
        log::trace!(
            "io hint {:?} on {} [{}..+{}]",
            hint,
            self.path.display(),
            offset,
            length
        );
    }

    // --- typed scalar access ---

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.fill(&mut b)?;
        Ok(b[0])
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.fill(&mut b)?;
        Ok(match self.endian {
            Endianness::Little => LittleEndian::read_u16(&b),
            Endianness::Big => BigEndian::read_u16(&b),
        })
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        let mut b = [0u8; 2];
        match self.endian {
            Endianness::Little => LittleEndian::write_u16(&mut b, v),
            Endianness::Big => BigEndian::write_u16(&mut b, v),
        }
        self.write_all(&b)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.fill(&mut b)?;
        Ok(match self.endian {
            Endianness::Little => LittleEndian::read_u32(&b),
            Endianness::Big => BigEndian::read_u32(&b),
        })
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        let mut b = [0u8; 4];
        match self.endian {
            Endianness::Little => LittleEndian::write_u32(&mut b, v),
            Endianness::Big => BigEndian::write_u32(&mut b, v),
        }
        self.write_all(&b)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(match self.endian {
            Endianness::Little => LittleEndian::read_u64(&b),
            Endianness::Big => BigEndian::read_u64(&b),
        })
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        let mut b = [0u8; 8];
        match self.endian {
            Endianness::Little => LittleEndian::write_u64(&mut b, v),
            Endianness::Big => BigEndian::write_u64(&mut b, v),
        }
        self.write_all(&b)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.write_u32(v.to_bits())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        self.write_u64(v.to_bits())
    }

    // --- typed sequence access ---

    pub fn read_u64s(&mut self, count: usize) -> Result<Vec<u64>> {
        let mut v = Vec::with_capacity(count);
        for _ in 0..count {
            v.push(self.read_u64()?);
        }
        Ok(v)
    }

    pub fn write_u64s(&mut self, values: &[u64]) -> Result<()> {
        for &v in values {
            self.write_u64(v)?;
        }
        Ok(())
    }

    pub fn read_f64s(&mut self, count: usize) -> Result<Vec<f64>> {
        let mut v = Vec::with_capacity(count);
        for _ in 0..count {
            v.push(self.read_f64()?);
        }
        Ok(v)
    }

    pub fn write_f64s(&mut self, values: &[f64]) -> Result<()> {
        for &v in values {
            self.write_f64(v)?;
        }
        Ok(())
    }

    pub fn read_u64_triple(&mut self) -> Result<[u64; 3]> {
        Ok([self.read_u64()?, self.read_u64()?, self.read_u64()?])
    }

    pub fn write_u64_triple(&mut self, v: [u64; 3]) -> Result<()> {
        self.write_u64s(&v)
    }

    pub fn read_f64_triple(&mut self) -> Result<[f64; 3]> {
        Ok([self.read_f64()?, self.read_f64()?, self.read_f64()?])
    }

    pub fn write_f64_triple(&mut self, v: [f64; 3]) -> Result<()> {
        self.write_f64s(&v)
    }

    /// Read a string prefixed with a u16 byte length
    pub fn read_string_u16(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let mut bytes = vec![0u8; len];
        self.fill(&mut bytes)?;
        String::from_utf8(bytes)
            .map_err(|_| Error::format_invalid(&self.path, "non-UTF8 string"))
    }

    pub fn write_string_u16(&mut self, s: &str) -> Result<()> {
        debug_assert!(s.len() <= u16::MAX as usize);
        self.write_u16(s.len() as u16)?;
        self.write_all(s.as_bytes())
    }

    /// Read a string prefixed with a u64 byte length
    pub fn read_string_u64(&mut self) -> Result<String> {
        let len = self.read_u64()? as usize;
        let mut bytes = vec![0u8; len];
        self.fill(&mut bytes)?;
        String::from_utf8(bytes)
            .map_err(|_| Error::format_invalid(&self.path, "non-UTF8 string"))
    }

    pub fn write_string_u64(&mut self, s: &str) -> Result<()> {
        self.write_u64(s.len() as u64)?;
        self.write_all(s.as_bytes())
    }

    // --- whole-file helpers ---

    /// Copy `source` to `target`, skipping `source_skip` bytes of the source
    pub fn copy_file(
        source: impl AsRef<Path>,
        target: impl AsRef<Path>,
        source_skip: u64,
        buffer_size: Option<usize>,
    ) -> Result<u64> {
        let mut src = RawFile::open(source)?;
        let mut dst = RawFile::create(target)?;
        src.seek_to(source_skip)?;

        let mut buf = vec![0u8; buffer_size.unwrap_or(DEFAULT_COPY_BUFFER)];
        let mut copied = 0u64;
        loop {
            let got = src.read_raw(&mut buf)?;
            if got == 0 {
                break;
            }
            dst.write_all(&buf[..got])?;
            copied += got as u64;
        }
        Ok(copied)
    }

    /// Byte-compare two files
    pub fn compare_files(
        first: impl AsRef<Path>,
        second: impl AsRef<Path>,
        buffer_size: Option<usize>,
    ) -> Result<bool> {
        let mut a = RawFile::open(first)?;
        let mut b = RawFile::open(second)?;
        if a.current_size()? != b.current_size()? {
            return Ok(false);
        }

        let block = buffer_size.unwrap_or(DEFAULT_COPY_BUFFER);
        let mut buf_a = vec![0u8; block];
        let mut buf_b = vec![0u8; block];
        loop {
            let got_a = a.read_raw(&mut buf_a)?;
            let got_b = b.read_raw(&mut buf_b)?;
            if got_a != got_b || buf_a[..got_a] != buf_b[..got_b] {
                return Ok(false);
            }
            if got_a == 0 {
                return Ok(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_typed_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("typed.bin");

        let mut f = RawFile::create(&path).unwrap();
        f.write_u8(0xAB).unwrap();
        f.write_u16(0x1234).unwrap();
        f.write_u32(0xDEADBEEF).unwrap();
        f.write_u64(0x0102030405060708).unwrap();
        f.write_f32(1.5).unwrap();
        f.write_f64(-2.25).unwrap();
        f.write_string_u16("bricks").unwrap();
        f.close();

        let mut f = RawFile::open(&path).unwrap();
        assert_eq!(f.read_u8().unwrap(), 0xAB);
        assert_eq!(f.read_u16().unwrap(), 0x1234);
        assert_eq!(f.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(f.read_u64().unwrap(), 0x0102030405060708);
        assert_eq!(f.read_f32().unwrap(), 1.5);
        assert_eq!(f.read_f64().unwrap(), -2.25);
        assert_eq!(f.read_string_u16().unwrap(), "bricks");
    }

    #[test]
    fn test_big_endian_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("be.bin");

        let mut f = RawFile::create(&path).unwrap();
        f.set_endianness(Endianness::Big);
        f.write_u32(0x01020304).unwrap();
        f.close();

        let mut f = RawFile::open(&path).unwrap();
        let mut raw = [0u8; 4];
        f.fill(&mut raw).unwrap();
        assert_eq!(raw, [1, 2, 3, 4]);

        f.seek_start().unwrap();
        f.set_endianness(Endianness::Big);
        assert_eq!(f.read_u32().unwrap(), 0x01020304);
    }

    #[test]
    fn test_short_read_is_observable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.bin");

        let mut f = RawFile::create(&path).unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
        f.seek_start().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(f.read_raw(&mut buf).unwrap(), 3);
        f.seek_start().unwrap();
        assert!(matches!(f.read_u64(), Err(Error::IoShort { .. })));
    }

    #[test]
    fn test_truncate_and_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trunc.bin");

        let mut f = RawFile::create_with_size(&path, 1024).unwrap();
        assert_eq!(f.current_size().unwrap(), 1024);
        f.truncate(100).unwrap();
        assert_eq!(f.current_size().unwrap(), 100);
    }

    #[test]
    fn test_copy_and_compare() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let c = dir.path().join("c.bin");

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut f = RawFile::create(&a).unwrap();
        f.write_all(&payload).unwrap();
        f.close();

        RawFile::copy_file(&a, &b, 0, Some(4096)).unwrap();
        assert!(RawFile::compare_files(&a, &b, Some(1024)).unwrap());

        RawFile::copy_file(&a, &c, 16, None).unwrap();
        assert!(!RawFile::compare_files(&a, &c, None).unwrap());
    }

    #[test]
    fn test_reopen_modes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("modes.bin");

        let mut f = RawFile::create(&path).unwrap();
        f.write_u64(42).unwrap();
        assert!(f.is_writable());

        f.reopen_ro().unwrap();
        assert!(!f.is_writable());
        assert_eq!(f.read_u64().unwrap(), 42);

        f.reopen_rw().unwrap();
        assert!(f.is_writable());
    }
}
