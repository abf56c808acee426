use criterion::{Criterion, black_box, criterion_group, criterion_main};

use glam::DVec3;
use voxtree::VoxelType;
use voxtree::io::RawFile;
use voxtree::octree::{CompressionTag, ConvertConfig, Converter};

fn make_raw(dir: &std::path::Path, size: [u64; 3]) -> std::path::PathBuf {
    let path = dir.join("bench.raw");
    let data: Vec<u8> = (0..size[0] * size[1] * size[2])
        .map(|i| (i % 251) as u8)
        .collect();
    let mut f = RawFile::create(&path).unwrap();
    f.write_all(&data).unwrap();
    path
}

fn bench_convert_64(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let size = [64u64, 64, 64];
    let raw = make_raw(dir.path(), size);

    c.bench_function("convert_64_plain", |b| {
        b.iter(|| {
            let mut conv = Converter::new(ConvertConfig {
                max_brick_size: [20, 20, 20],
                overlap: 2,
                ..Default::default()
            })
            .unwrap();
            conv.convert_paths(
                black_box(&raw),
                0,
                VoxelType::U8,
                1,
                size,
                DVec3::ONE,
                dir.path().join("bench.oct"),
                0,
                false,
            )
            .unwrap()
        });
    });
}

fn bench_convert_64_zlib(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let size = [64u64, 64, 64];
    let raw = make_raw(dir.path(), size);

    c.bench_function("convert_64_zlib", |b| {
        b.iter(|| {
            let mut conv = Converter::new(ConvertConfig {
                max_brick_size: [20, 20, 20],
                overlap: 2,
                compression: CompressionTag::Zlib,
                ..Default::default()
            })
            .unwrap();
            conv.convert_paths(
                black_box(&raw),
                0,
                VoxelType::U8,
                1,
                size,
                DVec3::ONE,
                dir.path().join("bench.oct"),
                0,
                false,
            )
            .unwrap()
        });
    });
}

criterion_group!(benches, bench_convert_64, bench_convert_64_zlib);
criterion_main!(benches);
