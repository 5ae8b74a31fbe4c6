//! Volume pipeline benchmarks
//!
//! Measures decode, canonicalization, repack and chunk reassembly for
//! typical volume sizes (no network I/O).

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use seglink::protocol::ArtifactInfo;
use seglink::transfer::{ChunkReassembler, ChunkSplitter};
use seglink::volume::{
    ElementType, LabelTable, LabelVolume, MaskRepacker, MergeMode, OrientationCanonicalizer,
    VolumeBuffer, VolumeDecoder,
};

const SIZES: [([usize; 3], &str); 3] = [
    ([16, 128, 128], "16x128x128"),
    ([40, 256, 256], "40x256x256"),
    ([96, 256, 256], "96x256x256"),
];

fn int16_buffer(dims: [usize; 3]) -> VolumeBuffer {
    let count = dims[0] * dims[1] * dims[2];
    let raw: Vec<u8> = (0..count).flat_map(|i| ((i % 4096) as i16).to_le_bytes()).collect();
    VolumeBuffer::new(dims, [1250.0, 1250.0, 8000.0], [0.0; 3], ElementType::Int16, Bytes::from(raw))
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("volume_decode");

    for (dims, name) in SIZES {
        let buffer = int16_buffer(dims);
        group.throughput(Throughput::Bytes(buffer.raw().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &buffer, |b, buffer| {
            b.iter(|| black_box(VolumeDecoder::decode(buffer).unwrap()));
        });
    }

    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonicalize_merge_repack");
    let canonicalizer = OrientationCanonicalizer::default();
    let table = LabelTable::heart_chambers();

    for (dims, name) in SIZES {
        let decoded = VolumeDecoder::decode(&int16_buffer(dims)).unwrap();
        group.throughput(Throughput::Elements(decoded.volume.len() as u64));

        group.bench_with_input(BenchmarkId::from_parameter(name), &decoded, |b, decoded| {
            b.iter(|| {
                let (canonical, token) = canonicalizer.forward(decoded);
                let outputs: Vec<LabelVolume> = table
                    .entries()
                    .iter()
                    .map(|e| {
                        let id = e.id as f32;
                        LabelVolume::new(&e.name, canonical.volume.map(|v| u8::from(v % 5.0 == id)))
                    })
                    .collect();
                let mut merged = MaskRepacker::merge(&outputs, &table, MergeMode::MultiLabel).unwrap();
                merged.mask =
                    OrientationCanonicalizer::inverse(&merged.mask, &token, decoded.volume.dims()).unwrap();
                black_box(MaskRepacker::repack(&merged, decoded.axis_order, decoded.source_dims).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_reassembly");
    let chunk_size = 1024 * 1024;

    for megabytes in [4usize, 16, 64] {
        let data = Bytes::from(vec![7u8; megabytes * 1024 * 1024]);
        let splitter = ChunkSplitter::new("volume", data.clone(), chunk_size).unwrap();
        let payloads: Vec<Bytes> = splitter
            .chunks()
            .map(|c| c.payload().unwrap())
            .collect();
        let info = ArtifactInfo {
            name: "volume".to_string(),
            size: data.len(),
            total_chunks: payloads.len(),
        };

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}MiB", megabytes)),
            &payloads,
            |b, payloads| {
                b.iter(|| {
                    let mut reassembler = ChunkReassembler::new(info.clone(), chunk_size);
                    for (i, payload) in payloads.iter().enumerate() {
                        reassembler.append(i, payload).unwrap();
                    }
                    black_box(reassembler.finish().unwrap())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_decode, bench_round_trip, bench_reassembly);

criterion_main!(benches);
