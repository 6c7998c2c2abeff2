//! Population engine benchmarks using criterion.
//!
//! Run with: cargo bench --bench engine_bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use pagefill::ranges::{ByteState, RangeTable};
use pagefill::{CalloutChannel, Instance, InstanceConfig, ObjectConfig, PopulateError};

const PAGE: u64 = 4096;

fn bench_range_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_table");

    group.bench_function("paint_sequential_pages", |b| {
        b.iter(|| {
            let mut table = RangeTable::new(256 * PAGE);
            for i in 0..256u64 {
                table.paint(i * PAGE..(i + 1) * PAGE, ByteState::Committed);
            }
            black_box(table.run_count())
        });
    });

    group.bench_function("paint_scattered_then_fill", |b| {
        b.iter(|| {
            let mut table = RangeTable::new(256 * PAGE);
            for i in (0..256u64).step_by(2) {
                table.paint(i * PAGE..(i + 1) * PAGE, ByteState::Resolved);
            }
            table.paint(0..256 * PAGE, ByteState::Committed);
            black_box(table.run_count())
        });
    });

    group.bench_function("query_committed_span", |b| {
        let mut table = RangeTable::new(256 * PAGE);
        for i in (0..256u64).step_by(2) {
            table.paint(i * PAGE..(i + 1) * PAGE, ByteState::Committed);
        }
        b.iter(|| black_box(table.first_rejecting(0..256 * PAGE, ByteState::is_readable)));
    });

    group.finish();
}

fn bench_touch_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("touch");
    group.throughput(Throughput::Elements(1));

    let instance = Instance::new(InstanceConfig::builder().num_workers(1).build().unwrap());
    instance.init().unwrap();

    let config = ObjectConfig::new(8, 1 << 16, 16).unwrap().with_populator(
        |start: u64, _end: u64, chan: &mut CalloutChannel<'_>| -> Result<(), PopulateError> {
            for (i, chunk) in chan.target().chunks_exact_mut(8).enumerate() {
                chunk.copy_from_slice(&(start + i as u64).to_le_bytes());
            }
            Ok(())
        },
    );
    let object = instance.create_object(&config).unwrap();

    // Fast path: the touched range is already committed.
    object.touch(0).unwrap();
    group.bench_function("committed_fast_path", |b| {
        b.iter(|| black_box(object.touch(black_box(0))));
    });

    group.finish();
    instance.shutdown(false);
    instance.await_shutdown().unwrap();
}

criterion_group!(benches, bench_range_table, bench_touch_paths);
criterion_main!(benches);
