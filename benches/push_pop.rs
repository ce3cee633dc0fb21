//! Fast-path throughput: push/pop round trips and batch transfers against a
//! single slab bank. Skips (benchmarking a no-op) when rseq is unavailable.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use rseq_slab::{PerCpuSlab, VirtualCpuMode, sys};

const NUM_CLASSES: usize = 3;
const SHIFT: u32 = 18;
const CLASS: usize = 1;
const CAPACITY: u16 = 1024;

fn caps(size_class: usize) -> u16 {
    [0u16, CAPACITY, CAPACITY][size_class]
}

fn metadata_alloc(size: usize, align: usize) -> *mut u8 {
    let layout = std::alloc::Layout::from_size_align(size, align).unwrap();
    unsafe { std::alloc::alloc_zeroed(layout) }
}

fn setup() -> Option<&'static PerCpuSlab<NUM_CLASSES>> {
    let num_cpus = sys::num_cpus();
    let region = unsafe { sys::page_alloc(num_cpus << SHIFT) };
    assert!(!region.is_null());
    let slab = Box::leak(Box::new(PerCpuSlab::<NUM_CLASSES>::new()));
    unsafe {
        slab.init(metadata_alloc, region, num_cpus, SHIFT, caps, VirtualCpuMode::Physical);
        for cpu in 1..num_cpus {
            slab.init_cpu(cpu, caps);
        }
    }
    let (cpu, _) = slab.cache_cpu_slab()?;
    slab.grow(cpu, CLASS, CAPACITY as usize, |_| CAPACITY as usize);
    Some(slab)
}

fn bench_push_pop(c: &mut Criterion) {
    let Some(slab) = setup() else {
        eprintln!("rseq unavailable; skipping fast-path benchmarks");
        return;
    };

    let mut group = c.benchmark_group("fast_path");
    group.throughput(Throughput::Elements(1));
    group.bench_function("push_pop", |b| {
        let item = 0xA0 as *mut u8;
        b.iter(|| {
            // Capacity was grown up front; a miss only happens on a restart
            // or migration, in which case the pair degrades to a no-op and
            // the next iteration re-caches.
            if black_box(slab.push(CLASS, item)) {
                black_box(slab.pop(CLASS));
            } else if let Some((cpu, _)) = slab.cache_cpu_slab() {
                slab.grow(cpu, CLASS, CAPACITY as usize, |_| CAPACITY as usize);
            }
        });
    });
    group.finish();

    let mut group = c.benchmark_group("batch");
    for batch_size in [8usize, 64, 512] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_function(format!("push_pop_{batch_size}"), |b| {
            let items: Vec<*mut u8> = (0..batch_size).map(|i| (0x1000 + i * 16) as *mut u8).collect();
            let mut out = vec![std::ptr::null_mut(); batch_size];
            b.iter(|| {
                let pushed = black_box(slab.push_batch(CLASS, &items));
                if pushed > 0 {
                    black_box(slab.pop_batch(CLASS, &mut out[..pushed]));
                } else if let Some((cpu, _)) = slab.cache_cpu_slab() {
                    slab.grow(cpu, CLASS, CAPACITY as usize, |_| CAPACITY as usize);
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_push_pop);
criterion_main!(benches);
