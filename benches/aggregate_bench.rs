use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shard_stream::aggregator::{merge_states, StreamTotals};
use shard_stream::report;
use shard_stream::streaming::{
    Direction, PlanId, ProgressInfo, SessionInfo, SessionState, StreamState, StreamSummary, TableId,
};
use std::net::SocketAddr;

fn make_state(plan: u128, sessions: usize, files: usize) -> StreamState {
    let sessions = (0..sessions)
        .map(|i| {
            let peer = SocketAddr::from(([10, 0, (i / 250) as u8, (i % 250 + 1) as u8], 7000));
            let mut info = SessionInfo::new(peer, peer, 0);
            info.state = SessionState::Streaming;
            info.sending_summaries = vec![StreamSummary::new(
                TableId::from_u128(1),
                files as u32,
                files as u64 * 4096,
            )];
            for f in 0..files {
                let name = format!("me-{}-big-Data.db", f);
                let mut progress = ProgressInfo::new(peer, 0, name.clone(), Direction::Send, 4096);
                progress.advance(1024).unwrap();
                info.sending_files.insert(name, progress);
            }
            info
        })
        .collect();

    StreamState {
        plan_id: PlanId::from_u128(plan),
        description: format!("plan {}", plan),
        sessions,
    }
}

fn make_shards(shards: usize, plans_per_shard: usize) -> Vec<Vec<StreamState>> {
    (0..shards)
        .map(|s| {
            (0..plans_per_shard)
                .map(|p| make_state((s * plans_per_shard + p) as u128, 3, 8))
                .collect()
        })
        .collect()
}

fn bench_merge_states(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_states");

    for shard_count in [4, 16, 64].iter() {
        let shards = make_shards(*shard_count, 8);
        group.bench_with_input(
            BenchmarkId::from_parameter(shard_count),
            shard_count,
            |b, _| {
                b.iter(|| {
                    black_box(shards.clone())
                        .into_iter()
                        .fold(Vec::new(), merge_states)
                });
            },
        );
    }
    group.finish();
}

fn bench_totals(c: &mut Criterion) {
    let mut group = c.benchmark_group("progress_totals");

    for plan_count in [10, 100, 1000].iter() {
        let states: Vec<StreamState> = (0..*plan_count)
            .map(|p| make_state(p as u128, 3, 8))
            .collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(plan_count),
            plan_count,
            |b, _| {
                b.iter(|| black_box(&states).iter().sum::<StreamTotals>());
            },
        );
    }
    group.finish();
}

fn bench_report_json(c: &mut Criterion) {
    let mut group = c.benchmark_group("report_to_json");

    for plan_count in [10, 100].iter() {
        let states: Vec<StreamState> = (0..*plan_count)
            .map(|p| make_state(p as u128, 3, 16))
            .collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(plan_count),
            plan_count,
            |b, _| {
                b.iter(|| report::to_json(black_box(&states)).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_merge_states, bench_totals, bench_report_json);
criterion_main!(benches);
