//! Benchmark: store hot paths.
//!
//! - Cached reads
//! - Write followed by a read at the end of a derived chain
//! - Write fanning out to many subscribed derived atoms

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use molecule_core::{Atom, Store, Subscription};

fn chain(len: usize) -> (Atom<u64>, Atom<u64>) {
    let source = Atom::new(0u64);
    let mut tip = source.clone();
    for _ in 0..len {
        let prev = tip.clone();
        tip = Atom::derived(move |get| Ok(get.get(&prev)? + 1));
    }
    (source, tip)
}

fn benchmark_cached_get(c: &mut Criterion) {
    let store = Store::new();
    let (_, tip) = chain(8);
    store.get(&tip).unwrap();

    c.bench_function("cached_get", |b| {
        b.iter(|| black_box(store.get(&tip).unwrap()))
    });
}

fn benchmark_chain_set_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_set_get");

    for len in [1usize, 10, 50] {
        let store = Store::new();
        let (source, tip) = chain(len);
        let mut n = 0u64;

        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                n += 1;
                store.set(&source, n).unwrap();
                black_box(store.get(&tip).unwrap())
            })
        });
    }

    group.finish();
}

fn benchmark_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for width in [10usize, 100] {
        let store = Store::new();
        let source = Atom::new(0u64);
        let subs: Vec<Subscription> = (0..width as u64)
            .map(|i| {
                let source = source.clone();
                let derived = Atom::derived(move |get| Ok(get.get(&source)? + i));
                store.subscribe(&derived, || {}).unwrap()
            })
            .collect();
        let mut n = 0u64;

        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                n += 1;
                store.set(&source, n).unwrap();
            })
        });

        drop(subs);
    }

    group.finish();
}

fn benchmark_batch(c: &mut Criterion) {
    let store = Store::new();
    let atoms: Vec<Atom<u64>> = (0..20).map(|_| Atom::new(0)).collect();
    let _subs: Vec<Subscription> = atoms
        .iter()
        .map(|atom| store.subscribe(atom, || {}).unwrap())
        .collect();
    let mut n = 0u64;

    c.bench_function("batch_20_sets", |b| {
        b.iter(|| {
            n += 1;
            store.batch(|| {
                for atom in &atoms {
                    store.set(atom, n).unwrap();
                }
            })
        })
    });
}

criterion_group!(
    benches,
    benchmark_cached_get,
    benchmark_chain_set_get,
    benchmark_fan_out,
    benchmark_batch
);
criterion_main!(benches);
