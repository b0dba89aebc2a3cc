use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fanoutd::{Broker, Options, Subscriber};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;

const KB: usize = 1024;

fn create_broker(dir: &TempDir, mem_queue_size: usize) -> Arc<Broker> {
    Broker::new(Options {
        data_path: dir.path().to_path_buf(),
        mem_queue_size,
        ..Options::default()
    })
    .unwrap()
}

fn publish_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fanout");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));

    for channels in [1usize, 4, 16] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(channels), &channels, |b, &channels| {
            let dir = TempDir::new().unwrap();
            let broker = create_broker(&dir, 1_000_000);
            let topic = broker.get_topic("bench").unwrap();
            for i in 0..channels {
                topic.get_channel(&format!("c{}", i)).unwrap();
            }
            let data = vec![1u8; 64];

            b.iter(|| {
                topic.publish(black_box(data.clone())).unwrap();
            });

            topic.empty().unwrap();
            for channel in topic.channels() {
                channel.empty().unwrap();
            }
        });
    }
    group.finish();
}

fn publish_and_consume(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_and_consume");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));
    let rt = Runtime::new().unwrap();

    for size in [64usize, KB, 16 * KB] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let broker = create_broker(&dir, 10_000);
            let topic = broker.get_topic("bench").unwrap();
            let sub = Subscriber::new(&broker, "bench", "consumer").unwrap();
            let data = vec![1u8; size];

            b.iter(|| {
                topic.publish(black_box(data.clone())).unwrap();
                let msg = rt.block_on(sub.receive()).unwrap();
                sub.finish(&msg.id).unwrap();
            });
        });
    }
    group.finish();
}

fn spill_to_disk(c: &mut Criterion) {
    let mut group = c.benchmark_group("spill_to_disk");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));
    let rt = Runtime::new().unwrap();

    group.bench_function("write_then_read", |b| {
        let dir = TempDir::new().unwrap();
        let broker = create_broker(&dir, 0);
        let topic = broker.get_topic("bench").unwrap();
        let sub = Subscriber::new(&broker, "bench", "consumer").unwrap();
        let data = vec![1u8; 256];

        b.iter(|| {
            topic.publish(black_box(data.clone())).unwrap();
            let msg = rt.block_on(sub.receive()).unwrap();
            sub.finish(&msg.id).unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, publish_fanout, publish_and_consume, spill_to_disk);
criterion_main!(benches);
