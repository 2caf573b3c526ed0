use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dpu_atomic::backend::dpu::window::{shrink, ScanDirection, WindowAllocator, WindowMask};

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("WindowAllocator::allocate+release", |b| {
        let allocator = WindowAllocator::new(16);
        b.iter(|| {
            let low = allocator.allocate(black_box(3), ScanDirection::Low);
            let high = allocator.allocate(black_box(5), ScanDirection::High);
            allocator.release(low);
            allocator.release(high);
        })
    });
    c.bench_function("WindowMask::take high", |b| {
        let mask = WindowMask::from_bits(0x5a5a_5a5a);
        b.iter(|| black_box(mask).take(black_box(6), ScanDirection::High))
    });
    c.bench_function("shrink", |b| {
        let reserved = WindowMask::all(12);
        b.iter(|| shrink(black_box(reserved), black_box(4), ScanDirection::Low))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
