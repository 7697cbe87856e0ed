//! Throughput benchmarks for the checksum and Kermit packet layers

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use transferkit::core::kermit::negotiation::KermitParameters;
use transferkit::core::kermit::packet::{encode_data, encode_packet, KermitPacket, PacketType};
use transferkit::core::protocol::checksum;

fn checksum_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();

    let mut group = c.benchmark_group("checksum");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("sum8", |b| {
        b.iter(|| black_box(checksum::sum8(black_box(&data), false)))
    });

    group.bench_function("crc16_xmodem", |b| {
        b.iter(|| black_box(checksum::crc16_xmodem(black_box(&data))))
    });

    group.bench_function("crc16_kermit", |b| {
        b.iter(|| black_box(checksum::crc16_kermit(black_box(&data), false)))
    });

    group.finish();
}

fn kermit_packet_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..90).map(|i| (i % 256) as u8).collect();
    let params = KermitParameters::default();
    let wire = params.wire_params(false, false);

    let mut group = c.benchmark_group("kermit_packet");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("encode_data", |b| {
        b.iter(|| black_box(encode_data(black_box(&data), &wire)))
    });

    group.bench_function("encode_packet", |b| {
        let packet = KermitPacket::new(1, PacketType::Data, data.clone());
        b.iter(|| black_box(encode_packet(&wire, black_box(&packet))))
    });

    group.finish();
}

criterion_group!(benches, checksum_benchmark, kermit_packet_benchmark);
criterion_main!(benches);
