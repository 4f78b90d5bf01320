//! Ray integration throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ghana_map::gpu::HostDevice;
use ghana_map::{GpuMap, GpuMapConfig, OccupancyMap, Point3, RayFlags, RegionSize};

fn random_rays(count: usize) -> Vec<Point3> {
    let mut rng = StdRng::seed_from_u64(1234);
    let mut rays = Vec::with_capacity(count * 2);
    for _ in 0..count {
        let origin = Point3::new(rng.gen_range(-0.5..0.5), rng.gen_range(-0.5..0.5), 0.2);
        let range = rng.gen_range(1.0..8.0);
        let azimuth = rng.gen_range(0.0..std::f64::consts::TAU);
        rays.push(origin);
        rays.push(Point3::new(
            origin.x + range * azimuth.cos(),
            origin.y + range * azimuth.sin(),
            origin.z + rng.gen_range(-0.2..0.8),
        ));
    }
    rays
}

fn bench_host_integration(c: &mut Criterion) {
    let rays = random_rays(1024);
    c.bench_function("host_integrate_1k_rays", |b| {
        b.iter(|| {
            let mut map = OccupancyMap::new(0.1, RegionSize::cubic(32)).unwrap();
            map.integrate_rays(black_box(&rays), RayFlags::NONE).unwrap();
            black_box(map.region_count())
        })
    });
}

fn bench_batched_integration(c: &mut Criterion) {
    let rays = random_rays(1024);
    c.bench_function("batched_integrate_1k_rays", |b| {
        b.iter(|| {
            let mut map = OccupancyMap::new(0.1, RegionSize::cubic(32)).unwrap();
            let device = HostDevice::new().unwrap();
            let mut gpu = GpuMap::new(&mut map, Some(device), GpuMapConfig::default()).unwrap();
            for batch in rays.chunks(512) {
                gpu.integrate_rays(black_box(batch), RayFlags::NONE).unwrap();
            }
            gpu.sync_occupancy().unwrap();
            drop(gpu);
            black_box(map.region_count())
        })
    });
}

fn bench_segment_keys(c: &mut Criterion) {
    let map = OccupancyMap::new(0.1, RegionSize::cubic(32)).unwrap();
    let mut keys = ghana_map::KeyList::new();
    c.bench_function("segment_keys_10m", |b| {
        b.iter(|| {
            keys.clear();
            map.calculate_segment_keys(
                &mut keys,
                black_box(Point3::new(0.05, 0.05, 0.05)),
                black_box(Point3::new(7.3, 5.9, 2.1)),
                true,
            );
            black_box(keys.len())
        })
    });
}

criterion_group!(
    benches,
    bench_host_integration,
    bench_batched_integration,
    bench_segment_keys
);
criterion_main!(benches);
