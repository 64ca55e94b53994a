//! Directory benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use segdb_bench::random_data;
use segdb_storage::{Directory, FsDirectory, MemDirectory};
use tempfile::tempdir;

fn bench_write_read(c: &mut Criterion, name: &str, dir: &dyn Directory) {
    let mut group = c.benchmark_group(name);

    for size in [1024, 64 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("write_file", size), size, |b, &size| {
            let data = random_data(size);
            b.iter(|| dir.write_file("bench.bin", black_box(&data)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("read_file", size), size, |b, &size| {
            dir.write_file("bench.bin", &random_data(size)).unwrap();
            b.iter(|| black_box(dir.read_file("bench.bin").unwrap()));
        });
    }
    group.finish();
}

fn bench_memory_directory(c: &mut Criterion) {
    let dir = MemDirectory::new();
    bench_write_read(c, "mem_directory", &dir);
}

fn bench_fs_directory(c: &mut Criterion) {
    let temp = tempdir().unwrap();
    let dir = FsDirectory::open(temp.path()).unwrap();
    bench_write_read(c, "fs_directory", &dir);
}

criterion_group!(benches, bench_memory_directory, bench_fs_directory);
criterion_main!(benches);
