//! Remote brick source client
//!
//! Single-threaded and blocking on the request stream. The batch stream is
//! a second socket kept non-blocking; it is drained into the brick cache
//! before every brick request, so bricks the server pushed proactively are
//! served without touching the network again.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

use super::protocol::{BatchHeader, Command, MinMaxRecord, RemoteMetadata};
use super::wire;
use crate::core::error::{Error, Result};
use crate::dataset::BrickKey;
use crate::rebrick::BrickDataCache;

/// Default byte budget for proactively pushed bricks
pub const DEFAULT_CACHE_BYTES: usize = 256 << 20;

pub struct RemoteBrickSource {
    request: TcpStream,
    batch: TcpStream,
    batch_open: bool,
    metadata: Option<RemoteMetadata>,
    cache: BrickDataCache,
    minmax: Option<Vec<MinMaxRecord>>,
}

impl RemoteBrickSource {
    /// Connect both streams and exchange handshakes. The batch stream is
    /// switched to non-blocking polling.
    pub fn connect(
        request_addr: impl ToSocketAddrs,
        batch_addr: impl ToSocketAddrs,
    ) -> Result<Self> {
        Self::connect_with_cache(request_addr, batch_addr, DEFAULT_CACHE_BYTES)
    }

    pub fn connect_with_cache(
        request_addr: impl ToSocketAddrs,
        batch_addr: impl ToSocketAddrs,
        cache_bytes: usize,
    ) -> Result<Self> {
        let mut request = TcpStream::connect(request_addr)?;
        request.set_nodelay(true).ok();
        wire::handshake(&mut request)?;

        let mut batch = TcpStream::connect(batch_addr)?;
        wire::handshake(&mut batch)?;
        batch.set_nonblocking(true)?;

        Ok(Self {
            request,
            batch,
            batch_open: true,
            metadata: None,
            cache: BrickDataCache::new(cache_bytes),
            minmax: None,
        })
    }

    pub fn metadata(&self) -> Option<&RemoteMetadata> {
        self.metadata.as_ref()
    }

    pub fn cached_brick_count(&self) -> usize {
        self.cache.len()
    }

    /// Open a dataset on the server and receive its full metadata
    pub fn open(
        &mut self,
        filename: &str,
        brick_size: [u64; 3],
        minmax_mode: u64,
        width: u32,
        height: u32,
    ) -> Result<&RemoteMetadata> {
        wire::wr_u8(&mut self.request, Command::Open as u8)?;
        wire::wr_u64s(&mut self.request, &brick_size)?;
        wire::wr_u64(&mut self.request, minmax_mode)?;
        wire::wr_u32(&mut self.request, width)?;
        wire::wr_u32(&mut self.request, height)?;
        wire::wr_string(&mut self.request, filename)?;
        self.request.flush()?;

        let meta = RemoteMetadata::read(&mut self.request, filename.to_string())?;
        self.cache.clear();
        self.minmax = None;
        self.metadata = Some(meta);
        Ok(self.metadata.as_ref().unwrap())
    }

    pub fn close_file(&mut self, filename: &str) -> Result<()> {
        wire::wr_u8(&mut self.request, Command::Close as u8)?;
        wire::wr_string(&mut self.request, filename)?;
        self.request.flush()?;
        self.metadata = None;
        self.minmax = None;
        self.cache.clear();
        Ok(())
    }

    /// Fetch one brick. Pushed batches are drained first; a cached brick
    /// never hits the request stream.
    pub fn get_brick(&mut self, lod: u64, index: u64) -> Result<Vec<u8>> {
        self.drain_batches()?;

        let key = BrickKey::new(0, lod, index);
        if let Some(data) = self.cache.get(&key) {
            return Ok(data.to_vec());
        }

        let bytes = self
            .metadata
            .as_ref()
            .and_then(|m| m.brick_bytes(lod, index))
            .ok_or_else(|| {
                Error::OutOfRange(format!("brick ({lod}, {index}) is not in the metadata"))
            })?;

        wire::wr_u8(&mut self.request, Command::Brick as u8)?;
        wire::wr_u64(&mut self.request, lod)?;
        wire::wr_u64(&mut self.request, index)?;
        self.request.flush()?;

        let mut data = vec![0u8; bytes];
        self.request.read_exact(&mut data)?;
        self.cache.insert(key, data.clone());
        Ok(data)
    }

    /// Non-blocking poll of the batch stream. Once a batch header starts
    /// arriving the rest of the batch is read in blocking mode; within a
    /// batch bricks arrive in header order.
    pub fn drain_batches(&mut self) -> Result<usize> {
        let mut received = 0;
        while self.batch_open {
            let mut first = [0u8; 8];
            match self.batch.peek(&mut first) {
                Ok(0) => {
                    self.batch_open = false;
                    break;
                }
                Ok(n) if n < 8 => break,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }

            self.batch.set_nonblocking(false)?;
            let result = self.read_one_batch();
            self.batch.set_nonblocking(true)?;
            received += result?;
        }
        Ok(received)
    }

    fn read_one_batch(&mut self) -> Result<usize> {
        let batch_size = wire::rd_u64(&mut self.batch)?;
        let header = BatchHeader::read_after_size(&mut self.batch, batch_size)?;
        for &(lod, index, bytes) in &header.bricks {
            let mut data = vec![0u8; bytes as usize];
            self.batch.read_exact(&mut data)?;
            self.cache.insert(BrickKey::new(0, lod, index), data);
        }
        log::debug!(
            "batch of {} bricks received, more coming: {}",
            header.bricks.len(),
            header.more_coming
        );
        Ok(header.bricks.len())
    }

    pub fn list_files(&mut self) -> Result<Vec<String>> {
        wire::wr_u8(&mut self.request, Command::ListFiles as u8)?;
        self.request.flush()?;
        let count = wire::rd_u16(&mut self.request)?;
        let mut files = Vec::with_capacity(count as usize);
        for _ in 0..count {
            files.push(wire::rd_string(&mut self.request)?);
        }
        Ok(files)
    }

    /// Report a new view matrix; the reply names the bricks now needed and
    /// the server starts pushing them on the batch stream.
    pub fn rotate(&mut self, matrix: &[f32; 16]) -> Result<Vec<(u64, u64)>> {
        wire::wr_u8(&mut self.request, Command::Rotation as u8)?;
        wire::wr_f32s(&mut self.request, matrix)?;
        self.request.flush()?;

        let count = wire::rd_u64(&mut self.request)? as usize;
        let lods = wire::rd_u64s(&mut self.request, count)?;
        let idxs = wire::rd_u64s(&mut self.request, count)?;
        Ok(lods.into_iter().zip(idxs).collect())
    }

    pub fn set_batch_size(&mut self, max_batch_size: u64) -> Result<()> {
        wire::wr_u8(&mut self.request, Command::BatchSize as u8)?;
        wire::wr_u64(&mut self.request, max_batch_size)?;
        self.request.flush()?;
        Ok(())
    }

    /// Ask the server for per-brick min/max tables; cached for later reads
    pub fn calc_minmax(&mut self) -> Result<&[MinMaxRecord]> {
        wire::wr_u8(&mut self.request, Command::CalcMinMax as u8)?;
        self.request.flush()?;
        let records = super::protocol::read_minmax_tables(&mut self.request)?;
        self.minmax = Some(records);
        Ok(self.minmax.as_deref().unwrap())
    }

    pub fn minmax_info(&self) -> Option<&[MinMaxRecord]> {
        self.minmax.as_deref()
    }

    pub fn shutdown_server(&mut self) -> Result<()> {
        wire::wr_u8(&mut self.request, Command::Shutdown as u8)?;
        self.request.flush()?;
        Ok(())
    }
}
