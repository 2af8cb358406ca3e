//! Criterion benchmarks for the hot paths of the calculation graph
//!
//! Longest-prefix lookups back route pool matching and the network set
//! cache; endpoint churn exercises the full update path through the
//! sequencer.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ipnet::{IpNet, Ipv4Net};
use rand::prelude::*;

use strata_calc::labels::PassiveLabelIndex;
use strata_calc::lookups::EndpointLookupsCache;
use strata_calc::lpm::LpmTrie;
use strata_calc::{CalcGraph, DataplaneMessage, GraphConfig};
use strata_common::config::{Config, Params};
use strata_common::model::{Endpoint, EndpointKey, Update, WorkloadEndpoint, WorkloadEndpointKey};
use strata_common::selector::NormalizingParser;

// =============================================================================
// Test Fixtures
// =============================================================================

fn net(i: usize, prefix: u8) -> IpNet {
    let addr = Ipv4Addr::from(0x0a00_0000u32 + ((i as u32) << 8));
    IpNet::V4(Ipv4Net::new(addr, prefix).expect("valid prefix"))
}

fn populated_trie(size: usize) -> LpmTrie<usize> {
    let mut trie = LpmTrie::new();
    for i in 0..size {
        trie.insert(&net(i, 24), i);
    }
    trie
}

fn wep_key(i: usize) -> WorkloadEndpointKey {
    WorkloadEndpointKey {
        hostname: if i % 2 == 0 { "node-a" } else { "node-b" }.to_string(),
        orchestrator_id: "k8s".to_string(),
        workload_id: format!("default/pod-{i}"),
        endpoint_id: "eth0".to_string(),
    }
}

fn wep(i: usize) -> WorkloadEndpoint {
    WorkloadEndpoint {
        state: "active".to_string(),
        name: format!("cali{i:08}"),
        ipv4_nets: vec![net(i, 32)],
        profile_ids: vec!["kns.default".to_string()],
        ..Default::default()
    }
}

fn graph() -> CalcGraph {
    CalcGraph::with_config(
        GraphConfig {
            hostname: "node-a".to_string(),
            params: Params::default(),
        },
        Box::new(PassiveLabelIndex),
        Arc::new(NormalizingParser),
        Config::new(),
    )
    .expect("graph builds")
}

// =============================================================================
// Benchmarks: LPM trie
// =============================================================================

fn bench_trie_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lpm_lookup");

    for size in [10usize, 1000, 10000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("addr", size), &size, |b, &size| {
            let trie = populated_trie(size);
            let mut rng = rand::thread_rng();
            b.iter(|| {
                let i = rng.gen_range(0..size);
                let addr = IpAddr::V4(Ipv4Addr::from(0x0a00_0001u32 + ((i as u32) << 8)));
                black_box(trie.lookup(addr));
            });
        });
    }

    group.finish();
}

fn bench_trie_insert_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("lpm_insert_remove");

    for size in [10usize, 1000, 10000] {
        group.throughput(Throughput::Elements(2));
        group.bench_with_input(BenchmarkId::new("churn", size), &size, |b, &size| {
            let mut trie = populated_trie(size);
            let extra = net(size + 1, 24);
            b.iter(|| {
                trie.insert(black_box(&extra), usize::MAX);
                trie.remove(black_box(&extra), &usize::MAX);
            });
        });
    }

    group.finish();
}

// =============================================================================
// Benchmarks: Graph
// =============================================================================

fn bench_endpoint_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("endpoint_churn");

    for size in [100usize, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("add_flush", size), &size, |b, &size| {
            b.iter_batched(
                graph,
                |mut graph| {
                    for i in 0..size {
                        graph
                            .on_update(Update::WorkloadEndpoint {
                                key: wep_key(i),
                                value: Some(wep(i)),
                            })
                            .expect("update applies");
                    }
                    graph.on_datastore_in_sync();
                    let mut out: Vec<DataplaneMessage> = Vec::new();
                    graph.flush(&mut out).expect("flush succeeds");
                    black_box(out)
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_concurrent_lookups(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_lookups");
    let size = 1000usize;
    let cache = EndpointLookupsCache::new();
    for i in 0..size {
        let ep = Endpoint::Workload(wep(i));
        cache.on_endpoint_update(&EndpointKey::Workload(wep_key(i)), Some(&ep));
    }

    for readers in [1usize, 4] {
        group.throughput(Throughput::Elements((readers * 100) as u64));
        group.bench_with_input(BenchmarkId::new("readers", readers), &readers, |b, &readers| {
            b.iter(|| {
                let handles: Vec<_> = (0..readers)
                    .map(|r| {
                        let cache = cache.clone();
                        thread::spawn(move || {
                            for i in 0..100 {
                                let idx = (r * 100 + i) % size;
                                let addr =
                                    IpAddr::V4(Ipv4Addr::from(0x0a00_0000u32 + ((idx as u32) << 8)));
                                black_box(cache.get_endpoint(addr));
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().expect("reader thread");
                }
            });
        });
    }

    group.finish();
}

// =============================================================================
// Criterion Groups
// =============================================================================

criterion_group!(
    benches,
    bench_trie_lookup,
    bench_trie_insert_remove,
    bench_endpoint_churn,
    bench_concurrent_lookups,
);

criterion_main!(benches);
