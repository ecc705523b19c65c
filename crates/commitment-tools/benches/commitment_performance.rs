use criterion::{Criterion, criterion_group, criterion_main};
use openvm_commitment::InMemoryState;
use openvm_commitment_tools::{ACCOUNT_KEY_LEN, Workload, commit_batch, engine};
use std::hint::black_box;

fn benchmark_commitment_operations(c: &mut Criterion) {
    // ACCOUNTS overrides the workload size
    let accounts = std::env::var("ACCOUNTS")
        .ok()
        .and_then(|accounts| accounts.parse().ok())
        .unwrap_or(2_000);
    let workload = Workload::generate(accounts, 2, 1).unwrap();
    let update = Workload::generate(accounts / 10, 1, 2).unwrap();
    println!("Generated workload: {} keys", workload.len());

    // Committed state the incremental benchmarks start from (not timed)
    let base_state = InMemoryState::new(ACCOUNT_KEY_LEN);
    let mut base = engine(&base_state).unwrap();
    commit_batch(&mut base, &base_state, &workload).unwrap();
    let checkpoint = base.encode_current_state(Vec::new()).unwrap();

    c.bench_function("process_updates from empty", |b| {
        b.iter_with_setup(
            || {
                let state = InMemoryState::new(ACCOUNT_KEY_LEN);
                (engine(&state).unwrap(), state)
            },
            |(mut hph, _state)| {
                let (root, branch_updates) =
                    hph.process_updates(black_box(&workload.keys), &workload.updates).unwrap();
                black_box((root, branch_updates))
            },
        )
    });

    c.bench_function("process_updates incremental", |b| {
        b.iter_with_setup(
            || {
                let mut hph = engine(&base_state).unwrap();
                hph.set_state(&checkpoint).unwrap();
                hph
            },
            |mut hph| {
                let (root, branch_updates) =
                    hph.process_updates(black_box(&update.keys), &update.updates).unwrap();
                black_box((root, branch_updates))
            },
        )
    });

    c.bench_function("process_keys from empty", |b| {
        b.iter_with_setup(
            || {
                let state = InMemoryState::new(ACCOUNT_KEY_LEN);
                state.apply_plain_updates(&workload.keys, &workload.updates).unwrap();
                (engine(&state).unwrap(), state)
            },
            |(mut hph, _state)| {
                let (root, branch_updates) = hph.process_keys(black_box(&workload.keys)).unwrap();
                black_box((root, branch_updates))
            },
        )
    });

    c.bench_function("encode state", |b| {
        b.iter(|| black_box(base.encode_current_state(Vec::new()).unwrap()))
    });

    c.bench_function("restore state", |b| {
        b.iter_with_setup(
            || engine(&base_state).unwrap(),
            |mut hph| {
                hph.set_state(black_box(&checkpoint)).unwrap();
                black_box(hph.root_hash())
            },
        )
    });
}

criterion_group!(benches, benchmark_commitment_operations);
criterion_main!(benches);
