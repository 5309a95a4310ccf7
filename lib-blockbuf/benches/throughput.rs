use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use lib_blockbuf::{
    AlignedBuffer, BufferedProxy, Config, FileDevice, Flags, KIBI, MEBI, MemoryDevice, OpenMode,
};
use tempfile::TempDir;

const BLOCK: usize = 512;
const WINDOW: usize = 64 * KIBI;
const DEVICE_BYTES: usize = 16 * MEBI;
const CHUNK_SIZES: &[usize] = &[100, 4 * KIBI, 64 * KIBI, MEBI];
const MEASUREMENT_TIME: Duration = Duration::from_secs(10);

fn mode_name(flags: Flags) -> &'static str {
    if flags.contains(Flags::NO_DIRECT_IO) { "windowed" } else { "direct" }
}

fn config(flags: Flags) -> Config {
    Config { block_size: BLOCK, sector_align: BLOCK, buffer_align: BLOCK, flags }
}

fn sequential_write(c: &mut Criterion) {
    for flags in [Flags::empty(), Flags::NO_DIRECT_IO] {
        let mut group = c.benchmark_group(format!("write/{}", mode_name(flags)));
        group.sample_size(30);
        group.measurement_time(MEASUREMENT_TIME);
        group.throughput(Throughput::Bytes(DEVICE_BYTES as u64));

        for &chunk in CHUNK_SIZES {
            let mut src = AlignedBuffer::new(chunk, BLOCK).unwrap();
            src.as_mut_slice().fill(0xAB);

            group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, _| {
                b.iter_custom(|iters| {
                    let mut elapsed = Duration::ZERO;
                    for _ in 0..iters {
                        let mut dev = MemoryDevice::new(DEVICE_BYTES / BLOCK, BLOCK);
                        let mut proxy =
                            BufferedProxy::with_capacity(WINDOW, &mut dev, config(flags)).unwrap();

                        let start = Instant::now();
                        let mut left = DEVICE_BYTES;
                        while left > 0 {
                            let n = chunk.min(left);
                            left -= proxy.write(&src.as_slice()[..n]);
                        }
                        proxy.close().unwrap();
                        elapsed += start.elapsed();
                    }
                    elapsed
                });
            });
        }

        group.finish();
    }
}

fn sequential_read(c: &mut Criterion) {
    for flags in [Flags::empty(), Flags::NO_DIRECT_IO] {
        let mut group = c.benchmark_group(format!("read/{}", mode_name(flags)));
        group.sample_size(30);
        group.measurement_time(MEASUREMENT_TIME);
        group.throughput(Throughput::Bytes(DEVICE_BYTES as u64));

        for &chunk in CHUNK_SIZES {
            let mut dst = AlignedBuffer::new(chunk, BLOCK).unwrap();

            group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, _| {
                b.iter_custom(|iters| {
                    let mut dev = MemoryDevice::from_bytes(vec![0x5A; DEVICE_BYTES], BLOCK);
                    let mut elapsed = Duration::ZERO;

                    for _ in 0..iters {
                        let mut proxy =
                            BufferedProxy::with_capacity(WINDOW, &mut dev, config(flags)).unwrap();

                        let start = Instant::now();
                        while proxy.read(dst.as_mut_slice()) > 0 {}
                        elapsed += start.elapsed();
                    }
                    elapsed
                });
            });
        }

        group.finish();
    }
}

fn random_small_reads(c: &mut Criterion) {
    const READS: u64 = 10_000;

    let mut group = c.benchmark_group("read/random");
    group.sample_size(30);
    group.measurement_time(MEASUREMENT_TIME);
    group.throughput(Throughput::Elements(READS));

    group.bench_function("64B", |b| {
        b.iter_custom(|iters| {
            let mut dev = MemoryDevice::from_bytes(vec![0x5A; DEVICE_BYTES], BLOCK);
            let mut proxy = BufferedProxy::with_capacity(
                WINDOW,
                &mut dev,
                config(Flags::RANDOM_ACCESS),
            )
            .unwrap();
            let mut rng = fastrand::Rng::with_seed(7);
            let mut dst = [0; 64];

            let start = Instant::now();
            for _ in 0..iters * READS {
                proxy.seek(rng.u64(0..(DEVICE_BYTES - 64) as u64));
                proxy.read(&mut dst);
            }
            start.elapsed()
        });
    });

    group.finish();
}

fn file_write(c: &mut Criterion) {
    const FILE_BYTES: usize = 4 * MEBI;

    let mut group = c.benchmark_group("write/file");
    group.sample_size(10);
    group.measurement_time(MEASUREMENT_TIME);
    group.throughput(Throughput::Bytes(FILE_BYTES as u64));

    let mut src = AlignedBuffer::new(WINDOW, BLOCK).unwrap();
    src.as_mut_slice().fill(0xAB);

    group.bench_function("sync", |b| {
        b.iter_custom(|iters| {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("bench.img");
            let mut elapsed = Duration::ZERO;

            for _ in 0..iters {
                let dev = FileDevice::open(&path, BLOCK, OpenMode::Create, false).unwrap();
                let mut proxy =
                    BufferedProxy::with_capacity(WINDOW, dev, config(Flags::WRITE_ONLY)).unwrap();

                let start = Instant::now();
                for _ in 0..FILE_BYTES / WINDOW {
                    proxy.write(src.as_slice());
                }
                proxy.flush();
                proxy.device().sync().unwrap();
                elapsed += start.elapsed();
            }
            elapsed
        });
    });

    group.finish();
}

criterion_group!(benches, sequential_write, sequential_read, random_small_reads, file_write);
criterion_main!(benches);
