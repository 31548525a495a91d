use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use netpump::PatternBuffer;

fn bench_pattern(c: &mut Criterion) {
    let pattern = PatternBuffer::for_max_buffer(0x10000);
    let mut window = vec![0u8; 0x10000];
    pattern.fill(12_345, &mut window);

    let mut group = c.benchmark_group("pattern");
    group.throughput(Throughput::Bytes(window.len() as u64));

    group.bench_function("verify_64k", |b| {
        b.iter(|| pattern.verify(black_box(&window), black_box(12_345)))
    });

    group.bench_function("fill_64k", |b| {
        b.iter(|| {
            pattern.fill(black_box(98_765), black_box(&mut window));
        })
    });

    group.finish();
}

criterion_group!(benches, bench_pattern);
criterion_main!(benches);
