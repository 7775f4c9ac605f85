use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

use twin_connectivity::client::{ClientEvent, ClientMachine, MachineSettings};
use twin_connectivity::config::ClientConfig;
use twin_connectivity::core::{
    Connection, ConnectionType, ConnectivityStatus, DefaultStatusResolver,
    DuplicationReconnectTimeoutStrategy, ReconnectTimeoutStrategy,
};

fn machine(connection: &Connection, config: &ClientConfig) -> ClientMachine {
    let strategy = config
        .reconnect_strategy()
        .unwrap_or_else(|err| panic!("bench config is valid: {err}"));
    let settings = MachineSettings::new(connection, config)
        .unwrap_or_else(|err| panic!("bench connection is valid: {err}"));
    ClientMachine::new(
        settings,
        connection.connection_status,
        Box::new(strategy),
        Arc::new(DefaultStatusResolver::default()),
        Utc::now(),
    )
}

fn bench_connect_cycle(c: &mut Criterion) {
    let connection = Connection::new(
        "bench",
        ConnectionType::Mqtt,
        "tcp://broker.local:1883",
        ConnectivityStatus::Open,
    );
    let config = ClientConfig::default();

    c.bench_function("fsm_open_connect_close_cycle", |b| {
        b.iter(|| {
            let mut m = machine(&connection, &config);
            let now = Utc::now();
            m.handle(ClientEvent::Initialize, now);
            m.handle(ClientEvent::Open { origin: None }, now);
            m.handle(ClientEvent::ClientConnected, now);
            m.handle(ClientEvent::InitializationResult(Ok(())), now);
            m.handle(
                ClientEvent::Close {
                    origin: None,
                    shutdown: false,
                },
                now,
            );
            black_box(m.handle(ClientEvent::ClientDisconnected { shutdown: false }, now))
        })
    });

    c.bench_function("fsm_illegal_signal", |b| {
        let mut m = machine(&connection, &config);
        m.handle(ClientEvent::Initialize, Utc::now());
        b.iter(|| black_box(m.handle(ClientEvent::ClientConnected, Utc::now())))
    });
}

fn bench_backoff(c: &mut Criterion) {
    let ms = Duration::from_millis;
    c.bench_function("backoff_timeout_and_backoff", |b| {
        b.iter(|| {
            let mut strategy =
                DuplicationReconnectTimeoutStrategy::new(ms(100), ms(60_000), ms(50), ms(30_000), 50)
                    .unwrap_or_else(|err| panic!("bench strategy is valid: {err}"));
            let mut total = Duration::ZERO;
            while strategy.can_reconnect() {
                total += strategy.next_timeout();
                total += strategy.next_backoff();
            }
            black_box(total)
        })
    });
}

criterion_group!(benches, bench_connect_cycle, bench_backoff);
criterion_main!(benches);
