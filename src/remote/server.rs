//! Minimal brick server
//!
//! Serves the containers of one directory to a single client over the two
//! protocol streams. The request stream is handled synchronously; batch
//! pushes go out on the second stream after a ROTATION, coarsest-LOD
//! bricks first. Intended for tests and small deployments.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::protocol::{BatchHeader, Command, MinMaxRecord, RemoteMetadata, RemoteBrickInfo};
use super::wire;
use crate::core::error::{Error, Result};
use crate::dataset::{BrickKey, BrickedDataset, DatasetFactory, LinearIndexDataset};
use crate::rebrick::{MinMaxMode, Rebricker};

/// Byte budget of the server-side rebricking cache
const REBRICK_CACHE_BYTES: usize = 256 << 20;

/// Wire encoding of the min/max mode in the OPEN request
fn minmax_mode_from_wire(v: u64) -> MinMaxMode {
    match v {
        1 => MinMaxMode::Precompute,
        2 => MinMaxMode::Dynamic,
        _ => MinMaxMode::Source,
    }
}

pub struct RemoteServer {
    root: PathBuf,
    factory: DatasetFactory,
    batch_size: u64,
    dataset: Option<Box<dyn LinearIndexDataset + Send + Sync>>,
}

/// Handle of a server spawned on ephemeral ports
pub struct RemoteServerHandle {
    pub request_port: u16,
    pub batch_port: u16,
    thread: Option<JoinHandle<()>>,
}

impl RemoteServerHandle {
    /// Wait for the server thread to exit (after SHUTDOWN or disconnect)
    pub fn join(mut self) {
        if let Some(t) = self.thread.take() {
            t.join().ok();
        }
    }
}

impl Drop for RemoteServerHandle {
    fn drop(&mut self) {
        // detach; the thread exits on SHUTDOWN or client disconnect
        self.thread.take();
    }
}

impl RemoteServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            factory: DatasetFactory::with_default_readers(),
            batch_size: 8,
            dataset: None,
        }
    }

    /// Bind ephemeral ports and serve one client on a background thread
    pub fn spawn(root: impl Into<PathBuf>) -> Result<RemoteServerHandle> {
        let request_listener = TcpListener::bind("127.0.0.1:0")?;
        let batch_listener = TcpListener::bind("127.0.0.1:0")?;
        let request_port = request_listener.local_addr()?.port();
        let batch_port = batch_listener.local_addr()?.port();

        let mut server = RemoteServer::new(root);
        let thread = std::thread::spawn(move || {
            let result = (|| -> Result<()> {
                let (mut request, peer) = request_listener.accept()?;
                log::info!("brick client connected from {peer}");
                wire::handshake(&mut request)?;
                let (mut batch, _) = batch_listener.accept()?;
                wire::handshake(&mut batch)?;
                server.serve(&mut request, &mut batch)
            })();
            if let Err(e) = result {
                log::warn!("brick server stopped: {e}");
            }
        });

        Ok(RemoteServerHandle {
            request_port,
            batch_port,
            thread: Some(thread),
        })
    }

    /// Handle requests until SHUTDOWN or disconnect
    pub fn serve(&mut self, request: &mut TcpStream, batch: &mut TcpStream) -> Result<()> {
        loop {
            let code = match wire::rd_u8(request) {
                Ok(c) => c,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::info!("brick client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let command = Command::from_u8(code)
                .ok_or_else(|| Error::Unsupported(format!("unknown command {code}")))?;

            match command {
                Command::Open => self.handle_open(request)?,
                Command::Close => {
                    let name = wire::rd_string(request)?;
                    log::debug!("closing {name}");
                    self.dataset = None;
                }
                Command::Brick => self.handle_brick(request)?,
                Command::ListFiles => self.handle_list_files(request)?,
                Command::Rotation => self.handle_rotation(request, batch)?,
                Command::BatchSize => {
                    self.batch_size = wire::rd_u64(request)?.max(1);
                }
                Command::CalcMinMax => self.handle_calc_minmax(request)?,
                Command::Shutdown => {
                    log::info!("brick server shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn dataset(&self) -> Result<&(dyn LinearIndexDataset + Send + Sync)> {
        self.dataset
            .as_deref()
            .ok_or_else(|| Error::Unsupported("no dataset open".into()))
    }

    fn handle_open(&mut self, request: &mut TcpStream) -> Result<()> {
        let bs = wire::rd_u64s(request, 3)?;
        let brick_size = [bs[0], bs[1], bs[2]];
        let minmax_mode = minmax_mode_from_wire(wire::rd_u64(request)?);
        let _width = wire::rd_u32(request)?;
        let _height = wire::rd_u32(request)?;
        let filename = wire::rd_string(request)?;

        match self.open_dataset(&filename, brick_size, minmax_mode) {
            Ok(ds) => {
                let meta = metadata_of(ds.as_ref(), &filename);
                self.dataset = Some(ds);
                meta.write(request)?;
            }
            Err(e) => {
                log::warn!("cannot serve {filename} at {brick_size:?}: {e}");
                // an OPEN failure is signalled by a zero LOD count
                wire::wr_u64(request, 0)?;
            }
        }
        request.flush()?;
        Ok(())
    }

    /// Open a container and re-brick it to the brick size and min/max mode
    /// the client asked for. The native on-disk view is served only when
    /// both already match the file.
    fn open_dataset(
        &self,
        filename: &str,
        brick_size: [u64; 3],
        minmax_mode: MinMaxMode,
    ) -> Result<Box<dyn LinearIndexDataset + Send + Sync>> {
        let ds = self.factory.open(self.root.join(filename))?;
        if brick_size == ds.max_brick_size() && minmax_mode == MinMaxMode::Source {
            return Ok(ds);
        }
        let rebricked = Rebricker::new(
            Arc::new(ds),
            brick_size,
            REBRICK_CACHE_BYTES,
            minmax_mode,
        )?;
        Ok(Box::new(rebricked))
    }

    fn handle_brick(&mut self, request: &mut TcpStream) -> Result<()> {
        let lod = wire::rd_u64(request)?;
        let index = wire::rd_u64(request)?;
        let ds = self.dataset()?;
        let mut data = Vec::new();
        ds.get_brick(&BrickKey::new(0, lod, index), &mut data)?;
        request.write_all(&data)?;
        request.flush()?;
        Ok(())
    }

    fn handle_list_files(&mut self, request: &mut TcpStream) -> Result<()> {
        let mut files: Vec<String> = std::fs::read_dir(&self.root)?
            .filter_map(|e| e.ok())
            .filter(|e| self.factory.reader_for(&e.path()).is_some())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        files.sort();

        wire::wr_u16(request, files.len().min(u16::MAX as usize) as u16)?;
        for f in files.iter().take(u16::MAX as usize) {
            wire::wr_string(request, f)?;
        }
        request.flush()?;
        Ok(())
    }

    /// The reply names the bricks needed for the new view; without a real
    /// renderer that is the coarsest LOD. The same bricks are then pushed
    /// over the batch stream.
    fn handle_rotation(
        &mut self,
        request: &mut TcpStream,
        batch: &mut TcpStream,
    ) -> Result<()> {
        let _matrix = wire::rd_f32s(request, 16)?;
        let ds = self.dataset()?;

        let lod = ds.lod_count() - 1;
        let layout = ds.brick_layout(lod, 0);
        let count = layout[0] * layout[1] * layout[2];
        let keys: Vec<BrickKey> = (0..count).map(|i| BrickKey::new(0, lod, i)).collect();

        wire::wr_u64(request, keys.len() as u64)?;
        for k in &keys {
            wire::wr_u64(request, k.lod)?;
        }
        for k in &keys {
            wire::wr_u64(request, k.index)?;
        }
        request.flush()?;

        self.push_batches(batch, &keys)
    }

    fn push_batches(&mut self, batch: &mut TcpStream, keys: &[BrickKey]) -> Result<()> {
        let ds = self.dataset()?;
        let chunks: Vec<&[BrickKey]> = keys.chunks(self.batch_size as usize).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let mut bodies = Vec::with_capacity(chunk.len());
            let mut header = BatchHeader {
                more_coming: i + 1 < chunks.len(),
                bricks: Vec::with_capacity(chunk.len()),
            };
            for key in chunk.iter() {
                let mut data = Vec::new();
                ds.get_brick(key, &mut data)?;
                header.bricks.push((key.lod, key.index, data.len() as u64));
                bodies.push(data);
            }
            header.write(batch)?;
            for body in &bodies {
                batch.write_all(body)?;
            }
            batch.flush()?;
        }
        Ok(())
    }

    fn handle_calc_minmax(&mut self, request: &mut TcpStream) -> Result<()> {
        let ds = self.dataset()?;
        let mut keys: Vec<BrickKey> = ds.bricks().keys().copied().collect();
        keys.sort();
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let mm = ds.maxmin_for_key(&key)?;
            records.push(MinMaxRecord {
                lod: key.lod,
                index: key.index,
                min_scalar: mm.min_scalar,
                max_scalar: mm.max_scalar,
                min_gradient: mm.min_gradient,
                max_gradient: mm.max_gradient,
            });
        }
        super::protocol::write_minmax_tables(request, &records)?;
        request.flush()?;
        Ok(())
    }
}

/// Assemble the OPEN reply from an open dataset
fn metadata_of(ds: &(dyn LinearIndexDataset + Send + Sync), filename: &str) -> RemoteMetadata {
    let lod_count = ds.lod_count();
    let layouts = (0..lod_count).map(|l| ds.brick_layout(l, 0)).collect();
    let domain_sizes = (0..lod_count).map(|l| ds.domain_size(l, 0)).collect();

    let mut keys: Vec<BrickKey> = ds.bricks().keys().copied().collect();
    keys.sort();
    let bricks = keys
        .iter()
        .map(|k| {
            let md = ds.brick_metadata(k).expect("table key");
            RemoteBrickInfo {
                lod: k.lod,
                index: k.index,
                center: md.center.to_array(),
                extents: md.extents.to_array(),
                n_voxels: md.n_voxels,
            }
        })
        .collect();

    RemoteMetadata {
        filename: filename.to_string(),
        lod_count,
        voxel_type: ds.voxel_type(),
        component_count: ds.component_count(),
        layouts,
        domain_sizes,
        overlap: ds.overlap(),
        range: ds.range(),
        bricks,
        max_gradient: ds.max_gradient_magnitude(),
    }
}
