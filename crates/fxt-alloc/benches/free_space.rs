//! Benchmark: free-space search with the two walk orders.
//!
//! A search from the group start walks extents largest first; a hinted
//! search walks by offset from the hint.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fxt_alloc::FreeSpaceCtl;

const GROUP: u64 = 1 << 30;
const GROUP_LEN: u64 = 1 << 30;

/// A 1 GiB group fragmented into 64 KiB holes every 1 MiB, with one 8 MiB
/// hole near the end.
fn fragmented() -> FreeSpaceCtl {
    let mut ctl = FreeSpaceCtl::new(GROUP, 4096);
    let mut offset = 0_u64;
    while offset + (1 << 20) < GROUP_LEN - (16 << 20) {
        ctl.add_free_space(GROUP + offset, 64 << 10).expect("hole");
        offset += 1 << 20;
    }
    ctl.add_free_space(GROUP + GROUP_LEN - (8 << 20), 8 << 20)
        .expect("large hole");
    ctl
}

fn bench_find(c: &mut Criterion) {
    let base = fragmented();
    let mut group = c.benchmark_group("find_space_for_alloc");

    group.bench_function("size_order_4k", |b| {
        b.iter(|| {
            let mut ctl = base.clone();
            black_box(ctl.find_space_for_alloc(GROUP, black_box(4096), 0, 4096))
        });
    });

    group.bench_function("offset_order_4k", |b| {
        b.iter(|| {
            let mut ctl = base.clone();
            black_box(ctl.find_space_for_alloc(GROUP + (512 << 20), black_box(4096), 0, 4096))
        });
    });

    group.bench_function("offset_order_miss_to_large", |b| {
        b.iter(|| {
            let mut ctl = base.clone();
            black_box(ctl.find_space_for_alloc(GROUP + 4096, black_box(1 << 20), 0, 4096))
        });
    });

    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    c.bench_function("reserve_return_churn", |b| {
        let mut ctl = fragmented();
        b.iter(|| {
            if let Ok(start) = ctl.find_space_for_alloc(GROUP, 16 << 10, 0, 4096) {
                ctl.add_free_space(start, 16 << 10).expect("return");
            }
        });
    });
}

fn bench_build(c: &mut Criterion) {
    c.bench_function("build_fragmented_group", |b| {
        b.iter(|| black_box(fragmented().extent_count()));
    });
}

criterion_group!(benches, bench_find, bench_churn, bench_build);
criterion_main!(benches);
