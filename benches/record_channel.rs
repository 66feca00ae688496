//! Record channel hot-path benchmarks.
//!
//! Measures the AEAD seal/open cost per frame and the per-epoch rekey
//! derivation.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use depot::crypto::{derive_epoch_keys, Aead, AeadKey, RecordNonce};

const CHUNK: usize = 1024 * 1024;

fn bench_seal_chunk(c: &mut Criterion) {
    let aead = Aead::new(&AeadKey::from_bytes([0x42u8; 32]));
    let nonce = RecordNonce::new(&[7u8; 16], 1);
    let plaintext = vec![0u8; CHUNK];
    let ad = b"\x11\x01\x00";

    let mut group = c.benchmark_group("seal_chunk");
    group.throughput(Throughput::Bytes(CHUNK as u64));
    group.bench_function("1mib", |b| {
        b.iter(|| black_box(aead.seal(&nonce, &plaintext, ad).unwrap()))
    });
    group.finish();
}

fn bench_open_chunk(c: &mut Criterion) {
    let aead = Aead::new(&AeadKey::from_bytes([0x42u8; 32]));
    let nonce = RecordNonce::new(&[7u8; 16], 1);
    let plaintext = vec![0u8; CHUNK];
    let ad = b"\x11\x01\x00";
    let sealed = aead.seal(&nonce, &plaintext, ad).unwrap();

    let mut group = c.benchmark_group("open_chunk");
    group.throughput(Throughput::Bytes(CHUNK as u64));
    group.bench_function("1mib", |b| {
        b.iter(|| black_box(aead.open(&nonce, &sealed, ad).unwrap()))
    });
    group.finish();
}

fn bench_epoch_derivation(c: &mut Criterion) {
    let traffic_secret = [0x5au8; 32];

    c.bench_function("derive_epoch_keys", |b| {
        b.iter(|| black_box(derive_epoch_keys(&traffic_secret, 3u32.to_le_bytes())))
    });
}

criterion_group!(
    benches,
    bench_seal_chunk,
    bench_open_chunk,
    bench_epoch_derivation
);
criterion_main!(benches);
