use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;
use wallet_eng::{Amount, Engine, EngineConfig, TransactionRequest, TxKind, UserId};

/// Generates valid request sequences for benchmarking.
///
/// Pattern per user (repeating):
/// 1. Deposit 1.00
/// 2. Deposit 0.50
/// 3. Withdrawal 0.30
///
/// This ensures withdrawals never exceed the balance.
pub struct RequestGenerator {
    next_id: u64,
    num_users: UserId,
    reqs_per_user: u32,
    current_user: UserId,
    current_step: u32,
    /// Re-send every Nth request under the previous id (0 = never)
    replay_every: u32,
}

impl RequestGenerator {
    pub fn new(num_users: UserId, reqs_per_user: u32) -> Self {
        Self {
            next_id: 1,
            num_users,
            reqs_per_user,
            current_user: 1,
            current_step: 0,
            replay_every: 0,
        }
    }

    pub fn with_replays(mut self, every: u32) -> Self {
        self.replay_every = every;
        self
    }
}

impl Iterator for RequestGenerator {
    type Item = TransactionRequest;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_user > self.num_users {
            return None;
        }

        let replay = self.replay_every > 0
            && self.current_step > 0
            && self.current_step % self.replay_every == 0;
        let id = if replay { self.next_id - 1 } else { self.next_id };
        if !replay {
            self.next_id += 1;
        }

        let (kind, minor) = match self.current_step % 3 {
            0 => (TxKind::Deposit, 100),
            1 => (TxKind::Deposit, 50),
            _ => (TxKind::Withdrawal, -30),
        };
        let req = TransactionRequest::new(
            self.current_user,
            Amount::from_minor(minor),
            kind,
            format!("req-{id}"),
        );

        self.current_step += 1;

        // Move to next user after reqs_per_user requests
        if self.current_step >= self.reqs_per_user {
            self.current_step = 0;
            self.current_user += 1;
        }

        Some(req)
    }
}

fn runtime() -> Runtime {
    Runtime::new().expect("failed to build tokio runtime")
}

fn bench_sequential(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("sequential");

    for count in [1_000u32, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                rt.block_on(async {
                    let engine = Engine::in_memory(EngineConfig::default());
                    for req in RequestGenerator::new(1, count) {
                        let _ = black_box(engine.submit_request(req).await);
                    }
                    engine
                })
            });
        });
    }

    group.finish();
}

fn bench_with_replays(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("with_replays");

    // 10k requests, every 10th one a retry of its predecessor
    group.bench_function("10k_replay_10pct", |b| {
        b.iter(|| {
            rt.block_on(async {
                let engine = Engine::in_memory(EngineConfig::default());
                for req in RequestGenerator::new(10, 1_000).with_replays(10) {
                    let _ = black_box(engine.submit_request(req).await);
                }
                engine
            })
        });
    });

    group.finish();
}

fn bench_concurrent_users(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("concurrent_users");
    group.sample_size(10);

    for users in [4u64, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(users), &users, |b, &users| {
            b.iter(|| {
                rt.block_on(async {
                    let engine = Engine::in_memory(EngineConfig::default());
                    let handles: Vec<_> = (1..=users)
                        .map(|user| {
                            let engine = engine.clone();
                            tokio::spawn(async move {
                                for n in 0..500 {
                                    let req = TransactionRequest::new(
                                        user,
                                        Amount::from_minor(10),
                                        TxKind::Deposit,
                                        format!("{user}-{n}"),
                                    );
                                    let _ = black_box(engine.submit_request(req).await);
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        let _ = handle.await;
                    }
                    engine
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_sequential,
    bench_with_replays,
    bench_concurrent_users,
);

criterion_main!(benches);
