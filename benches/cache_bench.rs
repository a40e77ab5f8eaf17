//! Benchmarks for the cache bookkeeping and transfers.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parking_lot::RwLock;

use signal_cache_tier::cache::block::{BlockGeometry, DEVICE_PADDING};
use signal_cache_tier::cache::slots::{FillOutcome, SlotAllocator};
use signal_cache_tier::gpu::device::{Device, DeviceInfo};
use signal_cache_tier::gpu::queue::{CommandQueue, HostBuffer};
use signal_cache_tier::transfer::disk_io::{SampleSource, SyntheticSource};
use signal_cache_tier::transfer::gpu_transfer::BlockTransfer;

fn geometry() -> BlockGeometry {
    BlockGeometry {
        block_size: 3840,
        offset: 256,
        delay: 127,
        padding: DEVICE_PADDING,
        channel_count: 32,
    }
}

fn bench_slot_churn(c: &mut Criterion) {
    c.bench_function("slot_fill_read_release_64_slots", |b| {
        let mut alloc = SlotAllocator::new(64);
        let mut next = 0i64;
        b.iter(|| {
            alloc.request_fill(next);
            if let FillOutcome::Fill { index, .. } = alloc.fill() {
                alloc.release(index).unwrap();
            }
            black_box(alloc.read_any(&[next, next - 1]));
            alloc.release(next).unwrap();
            next += 1;
        })
    });
}

fn bench_synthetic_read(c: &mut Criterion) {
    let g = geometry();
    let source = SyntheticSource::new(g.channel_count, 256.0, 1 << 24);
    let mut dst = vec![0.0f32; g.host_block_len()];

    c.bench_function("synthetic_read_block_32ch", |b| {
        b.iter(|| {
            let range = g.read_range(black_box(100));
            source.read_samples(&mut dst, range.start, range.end).unwrap();
        })
    });
}

fn bench_upload(c: &mut Criterion) {
    let g = geometry();
    let device = Device::new(DeviceInfo {
        name: "bench".into(),
        global_memory: 64 << 20,
        max_allocation: 16 << 20,
    })
    .unwrap();
    let queue = CommandQueue::new(&device, "bench").unwrap();
    let transfer = BlockTransfer::new(&g);
    let host: HostBuffer = Arc::new(RwLock::new(vec![1.0; g.host_block_len()]));
    let dst = device.create_buffer(g.device_block_len()).unwrap();

    c.bench_function("upload_block_32ch", |b| {
        b.iter(|| {
            transfer.upload(&queue, 0, &host, &dst).unwrap().wait().unwrap();
        })
    });
}

criterion_group!(benches, bench_slot_churn, bench_synthetic_read, bench_upload);
criterion_main!(benches);
