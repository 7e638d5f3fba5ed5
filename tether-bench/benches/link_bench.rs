//! End-to-end client-server benchmarks over loopback TCP.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::net::SocketAddr;
use std::sync::Arc;
use tether_link::{ChannelDispatcher, Client, Delivery, Link, LinkConfig, Server, ServerConfig};
use tether_protocol::{Event, EventRegistry, RawEvent};
use tether_transform::ChaChaTransform;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, Mutex};

const EVENT_TYPE: u32 = 100;

struct TestSetup {
    _server: Arc<Server>,
    client: Client,
    echoes: Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

fn registry() -> EventRegistry {
    let mut registry = EventRegistry::new();
    registry.register_raw(EVENT_TYPE).unwrap();
    registry
}

fn setup(rt: &Runtime, config: LinkConfig) -> TestSetup {
    rt.block_on(async {
        let (dispatcher, mut deliveries) = ChannelDispatcher::channel();
        let server_link = Link::new(config.clone(), registry(), Arc::new(dispatcher));
        let server = Arc::new(
            Server::bind(
                ServerConfig::new(SocketAddr::from(([127, 0, 0, 1], 0))),
                server_link.clone(),
            )
            .await
            .unwrap(),
        );
        let addr = server.local_addr();

        let running = server.clone();
        tokio::spawn(async move {
            let _ = running.run().await;
        });
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                if let Delivery::Event(envelope) = delivery {
                    server_link.send(envelope.handle, envelope.event);
                }
            }
        });

        let (dispatcher, mut echoes) = ChannelDispatcher::channel();
        let client_link = Link::new(config, registry(), Arc::new(dispatcher));
        let client = Client::connect(addr, client_link).await.unwrap();
        // Drain the Connected notification.
        echoes.recv().await.unwrap();

        TestSetup {
            _server: server,
            client,
            echoes: Mutex::new(echoes),
        }
    })
}

async fn roundtrip(setup: &TestSetup, event: Arc<dyn Event>, count: usize) {
    for _ in 0..count {
        setup.client.send(event.clone()).unwrap();
    }
    let mut echoes = setup.echoes.lock().await;
    let mut received = 0;
    while received < count {
        if let Some(Delivery::Event(envelope)) = echoes.recv().await {
            black_box(envelope);
            received += 1;
        }
    }
}

fn bench_echo(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let plain = setup(&rt, LinkConfig::new("bench"));
    let sealed = setup(&rt, LinkConfig::new("bench").with_transform(ChaChaTransform::new()));

    let mut group = c.benchmark_group("e2e_echo");
    for size in [64, 4096] {
        let event: Arc<dyn Event> = Arc::new(RawEvent::new(EVENT_TYPE, vec![0x42u8; size]));
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("plain", size), &event, |b, event| {
            b.to_async(&rt).iter(|| roundtrip(&plain, event.clone(), 1));
        });
        group.bench_with_input(BenchmarkId::new("chacha", size), &event, |b, event| {
            b.to_async(&rt).iter(|| roundtrip(&sealed, event.clone(), 1));
        });
    }
    group.finish();
}

fn bench_pipelined(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let plain = setup(&rt, LinkConfig::new("bench"));

    let mut group = c.benchmark_group("e2e_pipelined");
    for count in [10, 100] {
        let event: Arc<dyn Event> = Arc::new(RawEvent::new(EVENT_TYPE, vec![0x42u8; 128]));
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter(|| roundtrip(&plain, event.clone(), count));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_echo, bench_pipelined);
criterion_main!(benches);
