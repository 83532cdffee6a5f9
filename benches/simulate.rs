//! Race simulator throughput.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use duel_race::{simulate, Contestant, ContestantId, RaceConfig, StatVector};

fn bench_simulate(c: &mut Criterion) {
    let first = Contestant::new(ContestantId(5), "Bolt", StatVector::new(30, 20, 30, 20));
    let second = Contestant::new(ContestantId(7), "Dash", StatVector::new(20, 30, 20, 30));
    let config = RaceConfig::default();

    c.bench_function("simulate_full_race", |b| {
        b.iter(|| simulate(black_box(&first), black_box(&second), black_box("race_1000_5_7"), &config))
    });

    c.bench_function("result_fingerprint", |b| {
        let result = simulate(&first, &second, "race_1000_5_7", &config).unwrap();
        b.iter(|| black_box(&result).fingerprint())
    });
}

criterion_group!(benches, bench_simulate);
criterion_main!(benches);
