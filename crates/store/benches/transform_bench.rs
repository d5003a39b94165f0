//! Throughput benchmarks for streams written through data-space transforms.
//!
//! Measures a full write-close-reopen-read cycle for each standard data
//! space against the in-memory backend, so the numbers reflect transform
//! cost rather than file I/O.

#![allow(clippy::expect_used, missing_docs)]

use std::{
    hint::black_box,
    io::{Read, Write},
};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use dataspace_store::{
    CompressionOption, ContainerConfig, EncryptionOption, InMemoryBackend, StorageRoot, Transform,
    TransformInitialization,
};

const OPTIONS: [(&str, CompressionOption, EncryptionOption); 4] = [
    ("plain", CompressionOption::NotCompressed, EncryptionOption::None),
    ("compressed", CompressionOption::Normal, EncryptionOption::None),
    ("encrypted", CompressionOption::NotCompressed, EncryptionOption::RightsManagement),
    ("encrypted_compressed", CompressionOption::Normal, EncryptionOption::RightsManagement),
];

fn supply_key(init: &mut TransformInitialization<'_>) {
    if let Transform::RightsManagementEncryption(rm) = &mut *init.transform {
        let _ = rm.set_content_key([0x42; 32]);
    }
}

/// Semi-compressible payload: repeated records with a varying counter.
fn payload(len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len);
    let mut counter = 0u32;
    while data.len() < len {
        data.extend_from_slice(format!("record-{counter:08};").as_bytes());
        counter = counter.wrapping_add(1);
    }
    data.truncate(len);
    data
}

fn write_and_read(
    compression: CompressionOption,
    encryption: EncryptionOption,
    data: &[u8],
) -> Vec<u8> {
    let root = StorageRoot::open_in_memory().expect("open");
    root.data_space_manager()
        .expect("manager")
        .set_initialization_handler(supply_key)
        .expect("handler");
    let info = root
        .root_storage()
        .expect("root")
        .create_stream("Body", compression, encryption)
        .expect("create");
    info.open().expect("open stream").write_all(data).expect("write");
    root.close().expect("close");

    let reopened: StorageRoot<InMemoryBackend> =
        StorageRoot::from_backend(root.backend().snapshot(), ContainerConfig::default())
            .expect("reopen");
    reopened
        .data_space_manager()
        .expect("manager")
        .set_initialization_handler(supply_key)
        .expect("handler");
    let mut stream = reopened
        .root_storage()
        .expect("root")
        .get_stream_info("Body")
        .expect("info")
        .open()
        .expect("open stream");
    let mut out = Vec::with_capacity(data.len());
    stream.read_to_end(&mut out).expect("read");
    out
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform/round_trip");
    for size in [4 * 1024, 256 * 1024] {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        for (name, compression, encryption) in OPTIONS {
            group.bench_with_input(BenchmarkId::new(name, size), &data, |b, data| {
                b.iter(|| black_box(write_and_read(compression, encryption, data)));
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_round_trip);
criterion_main!(benches);
