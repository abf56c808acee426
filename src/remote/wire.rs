//! Wire framing helpers
//!
//! All multi-byte integers travel little-endian regardless of host order;
//! strings are a u16 byte length followed by the bytes. On connect both
//! sides exchange a 4-byte magic and a one-byte endian probe.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::core::error::{Error, Result};

pub const MAGIC: &[u8; 4] = b"IV3D";

pub fn wr_u8(w: &mut impl Write, v: u8) -> Result<()> {
    w.write_u8(v)?;
    Ok(())
}

pub fn rd_u8(r: &mut impl Read) -> Result<u8> {
    Ok(r.read_u8()?)
}

pub fn wr_u16(w: &mut impl Write, v: u16) -> Result<()> {
    w.write_u16::<LittleEndian>(v)?;
    Ok(())
}

pub fn rd_u16(r: &mut impl Read) -> Result<u16> {
    Ok(r.read_u16::<LittleEndian>()?)
}

pub fn wr_u32(w: &mut impl Write, v: u32) -> Result<()> {
    w.write_u32::<LittleEndian>(v)?;
    Ok(())
}

pub fn rd_u32(r: &mut impl Read) -> Result<u32> {
    Ok(r.read_u32::<LittleEndian>()?)
}

pub fn wr_u64(w: &mut impl Write, v: u64) -> Result<()> {
    w.write_u64::<LittleEndian>(v)?;
    Ok(())
}

pub fn rd_u64(r: &mut impl Read) -> Result<u64> {
    Ok(r.read_u64::<LittleEndian>()?)
}

pub fn wr_f32(w: &mut impl Write, v: f32) -> Result<()> {
    w.write_f32::<LittleEndian>(v)?;
    Ok(())
}

pub fn rd_f32(r: &mut impl Read) -> Result<f32> {
    Ok(r.read_f32::<LittleEndian>()?)
}

pub fn wr_f64(w: &mut impl Write, v: f64) -> Result<()> {
    w.write_f64::<LittleEndian>(v)?;
    Ok(())
}

pub fn rd_f64(r: &mut impl Read) -> Result<f64> {
    Ok(r.read_f64::<LittleEndian>()?)
}

pub fn wr_string(w: &mut impl Write, s: &str) -> Result<()> {
    debug_assert!(s.len() <= u16::MAX as usize);
    wr_u16(w, s.len() as u16)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

pub fn rd_string(r: &mut impl Read) -> Result<String> {
    let len = rd_u16(r)? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| Error::Unsupported("non-UTF8 string on wire".into()))
}

pub fn wr_u64s(w: &mut impl Write, values: &[u64]) -> Result<()> {
    for &v in values {
        wr_u64(w, v)?;
    }
    Ok(())
}

pub fn rd_u64s(r: &mut impl Read, count: usize) -> Result<Vec<u64>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(rd_u64(r)?);
    }
    Ok(out)
}

pub fn wr_f32s(w: &mut impl Write, values: &[f32]) -> Result<()> {
    for &v in values {
        wr_f32(w, v)?;
    }
    Ok(())
}

pub fn rd_f32s(r: &mut impl Read, count: usize) -> Result<Vec<f32>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(rd_f32(r)?);
    }
    Ok(out)
}

pub fn wr_f64s(w: &mut impl Write, values: &[f64]) -> Result<()> {
    for &v in values {
        wr_f64(w, v)?;
    }
    Ok(())
}

pub fn rd_f64s(r: &mut impl Read, count: usize) -> Result<Vec<f64>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(rd_f64(r)?);
    }
    Ok(out)
}

pub fn wr_u32s(w: &mut impl Write, values: &[u32]) -> Result<()> {
    for &v in values {
        wr_u32(w, v)?;
    }
    Ok(())
}

pub fn rd_u32s(r: &mut impl Read, count: usize) -> Result<Vec<u32>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(rd_u32(r)?);
    }
    Ok(out)
}

/// Exchange magic and endian probe with the peer
pub fn handshake(stream: &mut (impl Read + Write)) -> Result<()> {
    stream.write_all(MAGIC)?;
    wr_u8(stream, cfg!(target_endian = "big") as u8)?;
    stream.flush()?;

    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::Unsupported(format!(
            "peer sent bad magic {magic:?}"
        )));
    }
    let _peer_big_endian = rd_u8(stream)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_scalars_are_little_endian() {
        let mut buf = Vec::new();
        wr_u32(&mut buf, 0x01020304).unwrap();
        assert_eq!(buf, [4, 3, 2, 1]);

        let mut c = Cursor::new(buf);
        assert_eq!(rd_u32(&mut c).unwrap(), 0x01020304);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = Vec::new();
        wr_string(&mut buf, "v.uvf").unwrap();
        assert_eq!(buf.len(), 2 + 5);

        let mut c = Cursor::new(buf);
        assert_eq!(rd_string(&mut c).unwrap(), "v.uvf");
    }

    #[test]
    fn test_sequences_roundtrip() {
        let mut buf = Vec::new();
        wr_u64s(&mut buf, &[1, 2, 3]).unwrap();
        wr_f32s(&mut buf, &[0.5, -1.5]).unwrap();

        let mut c = Cursor::new(buf);
        assert_eq!(rd_u64s(&mut c, 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(rd_f32s(&mut c, 2).unwrap(), vec![0.5, -1.5]);
    }
}
