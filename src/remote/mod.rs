//! Remote brick source: wire protocol, client, and a minimal server
//!
//! Two ordered byte streams connect client and server: a blocking
//! request/response stream and a second stream on which the server pushes
//! batches of bricks proactively. The client polls the batch stream with
//! non-blocking reads before each brick request.

pub mod client;
pub mod protocol;
pub mod server;
pub mod wire;

pub use client::RemoteBrickSource;
pub use protocol::{BatchHeader, Command, MinMaxRecord, RemoteBrickInfo, RemoteMetadata};
pub use server::{RemoteServer, RemoteServerHandle};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::VoxelType;
    use crate::io::RawFile;
    use crate::octree::ConvertConfig;
    use glam::DVec3;
    use tempfile::tempdir;

    fn make_container(dir: &std::path::Path, name: &str, size: [u64; 3]) -> Vec<u8> {
        let data: Vec<u8> = (0..size[0] * size[1] * size[2])
            .map(|i| (i % 229) as u8)
            .collect();
        let raw = dir.join(format!("{name}.raw"));
        let mut f = RawFile::create(&raw).unwrap();
        f.write_all(&data).unwrap();
        drop(f);
        crate::dataset::VolumeDataset::create(
            &raw,
            0,
            VoxelType::U8,
            1,
            size,
            DVec3::ONE,
            ConvertConfig {
                max_brick_size: [8, 8, 8],
                overlap: 0,
                ..Default::default()
            },
            dir.join(name),
        )
        .unwrap();
        data
    }

    #[test]
    fn test_open_brick_roundtrip_and_cache() {
        let dir = tempdir().unwrap();
        let data = make_container(dir.path(), "v.vxt", [16, 16, 8]);

        let handle = RemoteServer::spawn(dir.path()).unwrap();
        let mut client = RemoteBrickSource::connect(
            ("127.0.0.1", handle.request_port),
            ("127.0.0.1", handle.batch_port),
        )
        .unwrap();

        // the native brick size is served as stored on disk
        let meta = client
            .open("v.vxt", [8, 8, 8], 0, 1920, 1080)
            .unwrap()
            .clone();
        assert_eq!(meta.voxel_type, VoxelType::U8);
        assert_eq!(meta.lod_count, 2);
        assert_eq!(meta.layouts[0], [2, 2, 1]);
        assert_eq!(meta.bricks.len() as u64, 4 + 1);

        // a smaller requested brick size is re-bricked server-side: the
        // served layout follows the request, not the on-disk dicing
        let meta = client
            .open("v.vxt", [4, 4, 8], 2, 1920, 1080)
            .unwrap()
            .clone();
        assert_eq!(meta.lod_count, 2);
        assert_eq!(meta.layouts[0], [4, 4, 1]);
        assert_eq!(meta.layouts[1], [2, 2, 1]);
        assert_eq!(meta.bricks.len(), 16 + 4);
        assert_eq!(meta.brick_info(0, 0).unwrap().n_voxels, [4, 4, 8]);

        // brick (0, 0) is the 4x4x8 region at the origin
        let brick = client.get_brick(0, 0).unwrap();
        assert_eq!(brick.len(), meta.brick_bytes(0, 0).unwrap());
        assert_eq!(brick.len(), 4 * 4 * 8);
        assert_eq!(brick[0], data[0]);
        assert_eq!(brick[1], data[1]);
        assert_eq!(brick[4], data[16]); // next row, x stride 16
        assert_eq!(brick[16], data[256]); // next slice, z stride 256

        // a second fetch is served from the cache: kill the server first
        client.shutdown_server().unwrap();
        handle.join();
        let again = client.get_brick(0, 0).unwrap();
        assert_eq!(again, brick);
    }

    #[test]
    fn test_open_with_unservable_brick_size_fails() {
        let dir = tempdir().unwrap();
        make_container(dir.path(), "v.vxt", [16, 16, 8]);

        let handle = RemoteServer::spawn(dir.path()).unwrap();
        let mut client = RemoteBrickSource::connect(
            ("127.0.0.1", handle.request_port),
            ("127.0.0.1", handle.batch_port),
        )
        .unwrap();

        // bigger than the stored bricks: cannot be carved, open fails
        assert!(client.open("v.vxt", [64, 64, 64], 2, 640, 480).is_err());
        assert!(client.metadata().is_none());

        // the request stream stays usable afterwards
        let files = client.list_files().unwrap();
        assert_eq!(files, vec!["v.vxt".to_string()]);

        client.shutdown_server().unwrap();
        handle.join();
    }

    #[test]
    fn test_list_files(){
        let dir = tempdir().unwrap();
        make_container(dir.path(), "a.vxt", [8, 8, 8]);
        make_container(dir.path(), "b.vxt", [8, 8, 8]);

        let handle = RemoteServer::spawn(dir.path()).unwrap();
        let mut client = RemoteBrickSource::connect(
            ("127.0.0.1", handle.request_port),
            ("127.0.0.1", handle.batch_port),
        )
        .unwrap();

        let files = client.list_files().unwrap();
        assert_eq!(files, vec!["a.vxt".to_string(), "b.vxt".to_string()]);
        client.shutdown_server().unwrap();
        handle.join();
    }

    #[test]
    fn test_rotation_pushes_batches() {
        let dir = tempdir().unwrap();
        make_container(dir.path(), "v.vxt", [32, 32, 8]);

        let handle = RemoteServer::spawn(dir.path()).unwrap();
        let mut client = RemoteBrickSource::connect(
            ("127.0.0.1", handle.request_port),
            ("127.0.0.1", handle.batch_port),
        )
        .unwrap();
        client.open("v.vxt", [8, 8, 8], 2, 800, 600).unwrap();
        client.set_batch_size(2).unwrap();

        let identity = [
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0f32,
        ];
        let needed = client.rotate(&identity).unwrap();
        assert!(!needed.is_empty());
        // the naive server advertises the coarsest LOD
        let coarsest = client.metadata().unwrap().lod_count - 1;
        assert!(needed.iter().all(|&(lod, _)| lod == coarsest));

        // drain until every advertised brick arrived
        let mut drained = 0;
        for _ in 0..200 {
            drained += client.drain_batches().unwrap();
            if drained >= needed.len() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(drained, needed.len());

        // pushed bricks are served from the cache even with the server gone
        client.shutdown_server().unwrap();
        handle.join();
        for &(lod, index) in &needed {
            let brick = client.get_brick(lod, index).unwrap();
            assert_eq!(
                brick.len(),
                client.metadata().unwrap().brick_bytes(lod, index).unwrap()
            );
        }
    }

    #[test]
    fn test_calc_minmax_tables() {
        let dir = tempdir().unwrap();
        make_container(dir.path(), "v.vxt", [16, 16, 8]);

        let handle = RemoteServer::spawn(dir.path()).unwrap();
        let mut client = RemoteBrickSource::connect(
            ("127.0.0.1", handle.request_port),
            ("127.0.0.1", handle.batch_port),
        )
        .unwrap();
        client.open("v.vxt", [4, 4, 8], 2, 640, 480).unwrap();

        // the tables describe the re-bricked view, one record per brick
        let records = client.calc_minmax().unwrap().to_vec();
        assert_eq!(records.len(), 16 + 4);
        assert_eq!(
            records.len(),
            client.metadata().unwrap().bricks.len(),
            "one record per brick"
        );
        for r in &records {
            assert!(r.min_scalar <= r.max_scalar);
            assert!(r.max_scalar <= 255.0);
        }
        assert_eq!(client.minmax_info().unwrap().len(), records.len());

        client.shutdown_server().unwrap();
        handle.join();
    }
}
