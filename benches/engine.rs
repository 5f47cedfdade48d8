use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use tokio::runtime::Runtime;
use transfer_engine::{Amount, Command, Config, Engine, IdempotencyKey, Store, TransferRequest};
use uuid::Uuid;

/// Generates transfer sequences over a ring of accounts.
///
/// Account `n` always sends to `n + 1` (wrapping), so every account both
/// sends and receives and balances stay put over a full lap.
pub struct TransferGenerator {
    num_accounts: i64,
    remaining: u32,
    current: i64,
    keyed: bool,
}

impl TransferGenerator {
    pub fn new(num_accounts: i64, count: u32) -> Self {
        Self {
            num_accounts,
            remaining: count,
            current: 1,
            keyed: false,
        }
    }

    /// Attach a fresh idempotency key to every transfer.
    pub fn keyed(mut self) -> Self {
        self.keyed = true;
        self
    }
}

impl Iterator for TransferGenerator {
    type Item = Command;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let source = self.current;
        let destination = source % self.num_accounts + 1;
        self.current = destination;

        Some(Command::Transfer(TransferRequest {
            source,
            destination,
            amount: Amount::from_int(1),
            idempotency_key: self.keyed.then(|| IdempotencyKey::new(Uuid::new_v4())),
        }))
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn seeded_engine(num_accounts: i64) -> Engine {
    let config = Config::default();
    let engine = Engine::new(Store::in_memory(&config.store), &config);
    for id in 1..=num_accounts {
        engine
            .create_account(id, Amount::from_int(1_000_000))
            .await
            .unwrap();
    }
    engine
}

fn bench_sequential(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("sequential");

    for count in [1_000u32, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    let engine = seeded_engine(100).await;
                    for command in TransferGenerator::new(100, count) {
                        let _ = black_box(engine.apply(command).await);
                    }
                    engine
                })
            });
        });
    }

    group.finish();
}

fn bench_idempotent(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("idempotent");

    group.bench_function("10k_keyed", |b| {
        b.iter(|| {
            rt.block_on(async {
                let engine = seeded_engine(100).await;
                for command in TransferGenerator::new(100, 10_000).keyed() {
                    let _ = black_box(engine.apply(command).await);
                }
                engine
            })
        });
    });

    group.finish();
}

fn bench_concurrent(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("concurrent");
    group.sample_size(10);

    // few accounts means heavy lock contention, many means mostly disjoint pairs
    for (accounts, tasks) in [(2i64, 8u32), (1_000, 8)] {
        let label = format!("{accounts}a_{tasks}t");
        group.bench_with_input(
            BenchmarkId::from_parameter(&label),
            &(accounts, tasks),
            |b, &(accounts, tasks)| {
                b.iter(|| {
                    rt.block_on(async {
                        let engine = Arc::new(seeded_engine(accounts).await);
                        let handles: Vec<_> = (0..tasks)
                            .map(|_| {
                                let engine = Arc::clone(&engine);
                                tokio::spawn(async move {
                                    for command in TransferGenerator::new(accounts, 1_000) {
                                        let _ = black_box(engine.apply(command).await);
                                    }
                                })
                            })
                            .collect();
                        for handle in handles {
                            handle.await.unwrap();
                        }
                        engine
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_sequential, bench_idempotent, bench_concurrent);
criterion_main!(benches);
